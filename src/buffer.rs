//! Dynamically typed multi-dimensional buffers
//!
//! A `Buffer` pairs a `TypeTag` and a `Shape` with optional host storage.
//! Buffers without storage are bounds-query placeholders: the filter fills
//! in their shape constraints instead of writing data.

use crate::error::{Result, RunGenError};
use crate::scalar::{ScalarKind, ScalarValue};
use crate::shape::{Dimension, Shape};
use crate::types::TypeTag;

/// Alignment of host storage handed to compiled filters.
pub const HOST_ALIGNMENT: usize = 64;

#[repr(C, align(64))]
#[derive(Debug, Clone, Copy)]
struct Chunk([u8; HOST_ALIGNMENT]);

#[derive(Debug, Clone)]
struct Storage {
    chunks: Vec<Chunk>,
    len: usize,
    /// Element index of the element at the shape's minimum coordinate.
    origin: usize,
}

impl Storage {
    fn zeroed(len: usize) -> Self {
        Self {
            chunks: vec![Chunk([0; HOST_ALIGNMENT]); len.div_ceil(HOST_ALIGNMENT)],
            len,
            origin: 0,
        }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: `Chunk` is a padding-free byte array and `len` never
        // exceeds the chunks' total size.
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bytes`, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.chunks.as_mut_ptr().cast::<u8>(), self.len) }
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    type_tag: TypeTag,
    shape: Shape,
    storage: Option<Storage>,
}

impl Buffer {
    /// Create a placeholder with no storage, for a bounds query.
    pub fn unallocated(type_tag: TypeTag, shape: Shape) -> Self {
        Self {
            type_tag,
            shape,
            storage: None,
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dimensions(&self) -> usize {
        self.shape.len()
    }

    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    /// Mutable access to the shape of a bounds-query placeholder.
    ///
    /// Returns `None` once the buffer has storage, since changing the shape
    /// would invalidate the data layout.
    pub fn query_shape_mut(&mut self) -> Option<&mut Shape> {
        if self.storage.is_some() {
            None
        } else {
            Some(&mut self.shape)
        }
    }

    /// Pointer to the element at the minimum coordinate, or null for a
    /// placeholder.
    pub fn host_ptr(&mut self) -> *mut u8 {
        let elem = self.type_tag.bytes();
        match self.storage.as_mut() {
            Some(storage) => {
                let start = storage.origin * elem;
                storage.bytes_mut()[start..].as_mut_ptr()
            }
            None => std::ptr::null_mut(),
        }
    }

    fn element_offset(&self, coords: &[i64]) -> Option<usize> {
        let storage = self.storage.as_ref()?;
        if coords.len() != self.shape.len() {
            return None;
        }
        let mut offset = storage.origin as i64;
        for (&c, d) in coords.iter().zip(self.shape.iter()) {
            if c < d.min || c >= d.end() {
                return None;
            }
            offset += (c - d.min) * d.stride;
        }
        let offset = usize::try_from(offset).ok()?;
        Some(offset * self.type_tag.bytes())
    }

    /// Read the element at `coords` (absolute coordinates, one per axis).
    ///
    /// Returns `None` for placeholders, out-of-range coordinates, or element
    /// types outside the supported scalar set. Vector types read lane 0.
    pub fn get(&self, coords: &[i64]) -> Option<ScalarValue> {
        let kind = ScalarKind::of(self.type_tag).ok()?;
        let offset = self.element_offset(coords)?;
        let storage = self.storage.as_ref()?;
        Some(kind.read_ne(&storage.bytes()[offset..]))
    }

    /// Write the element at `coords`.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::UnsupportedType` if the value's type does not
    /// match the buffer's element type, and `RunGenError::Shape` if the
    /// coordinates are outside the buffer or it has no storage.
    pub fn set(&mut self, coords: &[i64], value: ScalarValue) -> Result<()> {
        let kind = ScalarKind::of(self.type_tag)?;
        if value.kind() != kind {
            return Err(RunGenError::UnsupportedType(value.tag()));
        }
        let offset = self.element_offset(coords).ok_or_else(|| {
            RunGenError::Shape(format!("coordinate {:?} outside buffer {}", coords, self.shape))
        })?;
        if let Some(storage) = self.storage.as_mut() {
            value.write_ne(&mut storage.bytes_mut()[offset..]);
        }
        Ok(())
    }

    pub fn fill_zero(&mut self) {
        if let Some(storage) = self.storage.as_mut() {
            storage.bytes_mut().fill(0);
        }
    }

    /// Iterate over every coordinate of the buffer, axis 0 fastest.
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(&self.shape)
    }

    /// Remove axis `d`, keeping the plane at coordinate `pos`.
    pub fn sliced(mut self, d: usize, pos: i64) -> Self {
        let dim = self.shape.remove(d);
        if let Some(storage) = self.storage.as_mut() {
            let shift = (pos - dim.min) * dim.stride;
            storage.origin = (storage.origin as i64 + shift) as usize;
        }
        self
    }

    /// Insert an axis of extent 1 at position `d`.
    pub fn embedded(mut self, d: usize) -> Self {
        let stride = match d.checked_sub(1).and_then(|p| self.shape.get(p)) {
            Some(prev) => prev.extent.saturating_mul(prev.stride).saturating_abs().max(1),
            None => 1,
        };
        self.shape.insert(d, Dimension::new(0, 1, stride));
        self
    }

    /// Convert to another element type with the same extents and mins.
    ///
    /// Values go through `ScalarValue::convert`: unsigned narrowing keeps
    /// the high bits, other integer types are rescaled to the destination
    /// range (uint8 255 becomes uint16 65535), and floats are treated as
    /// [0, 1] intensities.
    ///
    /// # Errors
    ///
    /// Returns `RunGenError::UnsupportedType` for handle types or types
    /// outside the scalar set, and `RunGenError::Shape` for placeholders.
    pub fn convert(&self, type_tag: TypeTag) -> Result<Buffer> {
        if !self.is_allocated() {
            return Err(RunGenError::Shape(
                "cannot convert a buffer with no storage".to_string(),
            ));
        }
        for tag in [self.type_tag, type_tag] {
            if tag.is_handle() {
                return Err(RunGenError::UnsupportedType(tag));
            }
        }
        let dst_kind = ScalarKind::of(type_tag)?;
        ScalarKind::of(self.type_tag)?;

        let dense: Vec<Dimension> = self
            .shape
            .iter()
            .map(|d| Dimension::new(d.min, d.extent, 0))
            .collect();
        let mut out = allocate_buffer(type_tag, &Shape::new(dense))?;
        for coords in self.coordinates() {
            if let Some(v) = self.get(&coords) {
                out.set(&coords, v.convert(dst_kind))?;
            }
        }
        Ok(out)
    }
}

/// Allocate zeroed storage for a buffer of the given type and shape.
///
/// If every stride is zero the buffer gets dense planar strides. Otherwise
/// the strides are used as given and must all be non-zero.
///
/// # Errors
///
/// Returns `RunGenError::Shape` for non-positive extents, a mix of zero and
/// non-zero strides, or a byte size that overflows the address space.
pub fn allocate_buffer(type_tag: TypeTag, shape: &Shape) -> Result<Buffer> {
    let overflow = || RunGenError::Shape(format!("buffer of shape {} is too large", shape));

    let mut shape = shape.clone();
    for (i, d) in shape.iter().enumerate() {
        if d.extent <= 0 {
            return Err(RunGenError::Shape(format!(
                "dimension {} has non-positive extent {}",
                i, d.extent
            )));
        }
    }

    if shape.iter().all(|d| d.stride == 0) {
        let mut stride = 1i64;
        for d in shape.iter_mut() {
            d.stride = stride;
            stride = stride.checked_mul(d.extent).ok_or_else(overflow)?;
        }
    } else if let Some(i) = shape.iter().position(|d| d.stride == 0) {
        return Err(RunGenError::Shape(format!(
            "dimension {} of {} has zero stride",
            i, shape
        )));
    }

    // Element span, allowing negative strides.
    let (mut lo, mut hi) = (0i64, 0i64);
    for d in shape.iter() {
        let reach = (d.extent - 1).checked_mul(d.stride).ok_or_else(overflow)?;
        if reach < 0 {
            lo = lo.checked_add(reach).ok_or_else(overflow)?;
        } else {
            hi = hi.checked_add(reach).ok_or_else(overflow)?;
        }
    }
    let count = hi
        .checked_sub(lo)
        .and_then(|s| s.checked_add(1))
        .ok_or_else(overflow)?;
    let bytes = count
        .checked_mul(type_tag.bytes() as i64)
        .filter(|&b| b <= isize::MAX as i64)
        .ok_or_else(overflow)?;

    log::debug!("Allocating {} bytes for {} buffer {}", bytes, type_tag, shape);

    Ok(Buffer {
        type_tag,
        shape,
        storage: Some(Storage {
            origin: (-lo) as usize,
            ..Storage::zeroed(bytes as usize)
        }),
    })
}

/// Odometer over all coordinates of a shape.
pub struct Coordinates {
    dims: Vec<Dimension>,
    next: Option<Vec<i64>>,
}

impl Coordinates {
    fn new(shape: &Shape) -> Self {
        let empty = shape.iter().any(|d| d.extent <= 0);
        Self {
            dims: shape.to_vec(),
            next: if empty {
                None
            } else {
                Some(shape.iter().map(|d| d.min).collect())
            },
        }
    }
}

impl Iterator for Coordinates {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        for (i, d) in self.dims.iter().enumerate() {
            advanced[i] += 1;
            if advanced[i] < d.end() {
                self.next = Some(advanced);
                return Some(current);
            }
            advanced[i] = d.min;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_host_storage_alignment() {
        let mut b = allocate_buffer(TypeTag::FLOAT64, &Shape::from_extents(&[3, 7])).unwrap();
        assert_eq!(b.host_ptr() as usize % HOST_ALIGNMENT, 0);
        b.set(&[2, 6], ScalarValue::Float64(1.5)).unwrap();
        assert_eq!(b.get(&[2, 6]), Some(ScalarValue::Float64(1.5)));
    }

    #[test]
    fn test_allocate_assigns_planar_strides() {
        let b = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[10, 5, 3])).unwrap();
        assert_eq!(b.shape().strides(), vec![1, 10, 50]);
        assert!(b.is_allocated());
        assert_eq!(b.get(&[9, 4, 2]), Some(ScalarValue::UInt8(0)));
        assert_eq!(b.get(&[10, 0, 0]), None);
    }

    #[test]
    fn test_allocate_rejects_bad_shapes() {
        assert!(allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[0, 5])).is_err());
        let mixed = Shape::new(vec![Dimension::new(0, 4, 1), Dimension::new(0, 4, 0)]);
        assert!(allocate_buffer(TypeTag::UINT8, &mixed).is_err());
    }

    #[test]
    fn test_allocate_overflow() {
        let huge = Shape::from_extents(&[i64::MAX / 2, 4]);
        let err = allocate_buffer(TypeTag::FLOAT32, &huge).unwrap_err();
        assert!(matches!(err, RunGenError::Shape(_)), "got {:?}", err);
    }

    #[test]
    fn test_embed_saturates_stride() {
        let huge = 1i64 << 40;
        let b = Buffer::unallocated(TypeTag::UINT8, Shape::new(vec![Dimension::new(0, huge, huge)]));
        let b = b.embedded(1);
        assert_eq!(b.shape()[1], Dimension::new(0, 1, i64::MAX));
    }

    #[test]
    fn test_chunky_layout_addressing() {
        let shape = Shape::new(vec![
            Dimension::new(0, 4, 3),
            Dimension::new(0, 2, 12),
            Dimension::new(0, 3, 1),
        ]);
        let mut b = allocate_buffer(TypeTag::UINT16, &shape).unwrap();
        b.set(&[1, 1, 2], ScalarValue::UInt16(77)).unwrap();
        assert_eq!(b.get(&[1, 1, 2]), Some(ScalarValue::UInt16(77)));
        assert_eq!(b.get(&[1, 1, 1]), Some(ScalarValue::UInt16(0)));
    }

    #[test]
    fn test_nonzero_mins() {
        let shape = Shape::new(vec![Dimension::new(-2, 4, 1), Dimension::new(10, 2, 4)]);
        let mut b = allocate_buffer(TypeTag::INT32, &shape).unwrap();
        b.set(&[-2, 11], ScalarValue::Int32(-9)).unwrap();
        assert_eq!(b.get(&[-2, 11]), Some(ScalarValue::Int32(-9)));
        assert!(b.set(&[2, 10], ScalarValue::Int32(1)).is_err());
    }

    #[test]
    fn test_set_type_mismatch() {
        let mut b = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[2])).unwrap();
        assert!(b.set(&[0], ScalarValue::Float32(1.0)).is_err());
    }

    #[test]
    fn test_coordinates_order() {
        let b = Buffer::unallocated(TypeTag::UINT8, Shape::from_extents(&[2, 2]));
        let coords: Vec<Vec<i64>> = b.coordinates().collect();
        assert_eq!(coords, vec![vec![0, 0], vec![1, 0], vec![0, 1], vec![1, 1]]);
    }

    #[test]
    fn test_slice_and_embed() {
        let mut b = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[3, 2, 2])).unwrap();
        b.set(&[2, 1, 0], ScalarValue::UInt8(5)).unwrap();
        let b = b.sliced(2, 0);
        assert_eq!(b.shape().extents(), vec![3, 2]);
        assert_eq!(b.get(&[2, 1]), Some(ScalarValue::UInt8(5)));

        let b = b.embedded(2);
        assert_eq!(b.shape().extents(), vec![3, 2, 1]);
        assert_eq!(b.get(&[2, 1, 0]), Some(ScalarValue::UInt8(5)));
    }

    #[test]
    fn test_convert_rescales() {
        let mut b = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[2])).unwrap();
        b.set(&[0], ScalarValue::UInt8(255)).unwrap();
        b.set(&[1], ScalarValue::UInt8(0)).unwrap();
        let c = b.convert(TypeTag::FLOAT32).unwrap();
        assert_eq!(c.get(&[0]), Some(ScalarValue::Float32(1.0)));
        assert_eq!(c.get(&[1]), Some(ScalarValue::Float32(0.0)));
        assert!(b.convert(TypeTag::HANDLE).is_err());
    }

    #[test]
    fn test_convert_narrows_by_high_byte() {
        let mut b = allocate_buffer(TypeTag::UINT16, &Shape::from_extents(&[2])).unwrap();
        b.set(&[0], ScalarValue::UInt16(129)).unwrap();
        b.set(&[1], ScalarValue::UInt16(0x80ff)).unwrap();
        let c = b.convert(TypeTag::UINT8).unwrap();
        assert_eq!(c.get(&[0]), Some(ScalarValue::UInt8(0)));
        assert_eq!(c.get(&[1]), Some(ScalarValue::UInt8(0x80)));
    }

    #[test]
    fn test_placeholder_shape_is_mutable() {
        let mut b = Buffer::unallocated(TypeTag::UINT8, Shape::from_extents(&[4]));
        assert!(b.host_ptr().is_null());
        b.query_shape_mut().unwrap()[0].stride = 3;
        assert_eq!(b.shape()[0].stride, 3);

        let mut a = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[4])).unwrap();
        assert!(a.query_shape_mut().is_none());
        assert!(!a.host_ptr().is_null());
    }
}
