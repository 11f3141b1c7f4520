//! Shape utilities
//!
//! Extent-list parsing, default output shapes for the bounds query, the
//! stride-repair heuristic applied to bounds-query results, and
//! dimensionality reconciliation between user data and filter arguments.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::buffer::Buffer;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, RunGenError};

/// Extent used for the first two output axes when nothing better is known.
pub const DEFAULT_SPATIAL_EXTENT: i64 = 1000;

/// Extent used for trailing (channel-like) output axes.
pub const DEFAULT_CHANNEL_EXTENT: i64 = 4;

/// One axis of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dimension {
    pub min: i64,
    pub extent: i64,
    pub stride: i64,
}

impl Dimension {
    pub fn new(min: i64, extent: i64, stride: i64) -> Self {
        Self { min, extent, stride }
    }

    /// One past the largest valid coordinate.
    pub fn end(&self) -> i64 {
        self.min + self.extent
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.min, self.extent, self.stride)
    }
}

/// Ordered list of dimensions; index 0 varies fastest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shape(Vec<Dimension>);

impl Shape {
    pub fn new(dims: Vec<Dimension>) -> Self {
        Self(dims)
    }

    /// Shape with the given extents, zero mins and zero strides.
    pub fn from_extents(extents: &[i64]) -> Self {
        Self(extents.iter().map(|&e| Dimension::new(0, e, 0)).collect())
    }

    pub fn extents(&self) -> Vec<i64> {
        self.0.iter().map(|d| d.extent).collect()
    }

    pub fn strides(&self) -> Vec<i64> {
        self.0.iter().map(|d| d.stride).collect()
    }
}

impl Deref for Shape {
    type Target = Vec<Dimension>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Shape {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Dimension>> for Shape {
    fn from(dims: Vec<Dimension>) -> Self {
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Parse an extent list of the form `[extent0,extent1,...]`.
///
/// Each entry becomes a dimension with the given extent and a min and
/// stride of zero.
///
/// # Errors
///
/// Returns `RunGenError::Shape` if the brackets are missing or unbalanced,
/// or if any entry is not an integer.
pub fn parse_extent_list(text: &str) -> Result<Shape> {
    let inner = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| RunGenError::Shape(format!("Invalid format for extents: {}", text)))?;

    let mut dims = Vec::new();
    for entry in inner.split(',') {
        let extent: i64 = entry.trim().parse().map_err(|_| {
            RunGenError::Shape(format!("Invalid value for extents: {} ({})", entry, text))
        })?;
        dims.push(Dimension::new(0, extent, 0));
    }
    Ok(Shape(dims))
}

/// Choose the shape of an output placeholder for the bounds query.
///
/// Axes covered by `defaults` are copied from it (min, extent and stride).
/// The rest get an extent of 1000 for axes 0 and 1 and 4 beyond that, on
/// the assumption that outputs are image-like.
pub fn default_output_shape(dimensions: usize, defaults: &Shape) -> Shape {
    let dims = (0..dimensions)
        .map(|i| match defaults.get(i) {
            Some(d) => *d,
            None => {
                let extent = if i < 2 {
                    DEFAULT_SPATIAL_EXTENT
                } else {
                    DEFAULT_CHANNEL_EXTENT
                };
                Dimension::new(0, extent, 0)
            }
        })
        .collect();
    Shape(dims)
}

/// Turns a partially constrained bounds-query shape into one that can be
/// allocated.
///
/// A bounds query leaves unconstrained extents and strides at zero; a policy
/// decides what to fill in.
pub trait ShapeRepairPolicy {
    fn repair(&self, constrained: &Shape) -> Shape;
}

/// Best-effort repair for image-like layouts, planar or interleaved.
///
/// This is not a solver for general stride/extent constraints. It assumes
/// axis 2, when present, is the channel axis, and recognises the interleaved
/// ("chunky") layout from `stride[2] == 1`. Filters with other axis orders
/// get a shape that allocates fine but may not be what they meant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageLayoutHeuristic;

impl ShapeRepairPolicy for ImageLayoutHeuristic {
    fn repair(&self, constrained: &Shape) -> Shape {
        let mut shape = constrained.clone();
        if shape.is_empty() {
            return shape;
        }

        // Unconstrained extents become 1, except the channel axis: it
        // matches the interleave factor when the layout is chunky, and is
        // 4 otherwise.
        for i in 0..shape.len() {
            if shape[i].extent != 0 {
                continue;
            }
            shape[i].extent = if i == 2 {
                if constrained[0].stride >= 1 && constrained[2].stride == 1 {
                    constrained[0].stride
                } else {
                    DEFAULT_CHANNEL_EXTENT
                }
            } else {
                1
            };
        }

        // Chunky filters usually pin stride[0] and stride[2] and leave
        // stride[1] free. Make stride[0] and extent[2] agree, then derive
        // stride[1] from axis 0.
        if shape.len() >= 3 && constrained[2].stride == 1 {
            if constrained[0].stride >= 1 {
                shape[2].extent = constrained[0].stride;
            } else {
                shape[0].stride = shape[2].extent;
            }
            shape[1].stride = shape[0].extent.saturating_mul(shape[0].stride);
        }

        // Anything still unset: fall back to planar. Strides saturate so an
        // oversized shape fails in `allocate_buffer` instead of here.
        if shape.iter().any(|d| d.stride == 0) {
            shape[0].stride = 1;
            for i in 1..shape.len() {
                shape[i].stride = shape[i - 1].stride.saturating_mul(shape[i - 1].extent);
            }
        }
        shape
    }
}

/// Repair a bounds-query shape with the default `ImageLayoutHeuristic`.
pub fn repair_bounds_query_shape(constrained: &Shape) -> Shape {
    ImageLayoutHeuristic.repair(constrained)
}

/// Add or remove trailing dimensions so `buffer` has exactly `needed` axes.
///
/// Dropping axes warns unless every dropped axis has extent <= 1; adding
/// axes (of extent 1) always warns. `title` and `name` identify the
/// argument in messages, e.g. `"Input"` and `"input"`.
pub fn adjust_buffer_dimensions(
    buffer: Buffer,
    needed: usize,
    title: &str,
    name: &str,
    diagnostics: &mut Diagnostics,
) -> Buffer {
    let actual = buffer.dimensions();
    if actual == needed {
        return buffer;
    }

    let old_shape = buffer.shape().clone();
    let mut buffer = buffer;
    if actual > needed {
        let trivial = old_shape[needed..].iter().all(|d| d.extent <= 1);
        if !trivial {
            diagnostics.warn(format!(
                "Image for {} \"{}\" has {} dimensions, but only the first {} were used; \
                 data loss may have occurred.",
                title, name, actual, needed
            ));
        }
        while buffer.dimensions() > needed {
            let min = buffer.shape()[needed].min;
            buffer = buffer.sliced(needed, min);
        }
    } else {
        diagnostics.warn(format!(
            "Image for {} \"{}\" has {} dimensions, but this argument requires at least {} \
             dimensions: adding dummy dimensions of extent 1.",
            title, name, actual, needed
        ));
        while buffer.dimensions() < needed {
            let d = buffer.dimensions();
            buffer = buffer.embedded(d);
        }
    }
    log::info!("Shape for {} changed: {} -> {}", name, old_shape, buffer.shape());
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::allocate_buffer;
    use crate::types::TypeTag;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_extent_list() {
        let shape = parse_extent_list("[4,5,6]").unwrap();
        assert_eq!(shape.extents(), vec![4, 5, 6]);
        assert!(shape.iter().all(|d| d.min == 0 && d.stride == 0));
    }

    #[test]
    fn test_parse_extent_list_rejects_malformed() {
        assert!(parse_extent_list("[4,5").is_err());
        assert!(parse_extent_list("4,5]").is_err());
        assert!(parse_extent_list("").is_err());
        assert!(parse_extent_list("[4,x]").is_err());
        assert!(parse_extent_list("[]").is_err());
    }

    #[test]
    fn test_shape_display() {
        let shape = Shape::new(vec![Dimension::new(0, 10, 1), Dimension::new(2, 5, 10)]);
        assert_eq!(shape.to_string(), "[[0,10,1],[2,5,10]]");
    }

    #[test]
    fn test_default_output_shape() {
        let shape = default_output_shape(4, &Shape::default());
        assert_eq!(shape.extents(), vec![1000, 1000, 4, 4]);

        let hint = Shape::new(vec![Dimension::new(0, 10, 1), Dimension::new(0, 20, 10)]);
        let shape = default_output_shape(3, &hint);
        assert_eq!(shape[0], Dimension::new(0, 10, 1));
        assert_eq!(shape[1], Dimension::new(0, 20, 10));
        assert_eq!(shape[2], Dimension::new(0, 4, 0));

        assert_eq!(default_output_shape(1, &hint).len(), 1);
    }

    #[test]
    fn test_repair_chunky_channel_inference() {
        let constrained = Shape::new(vec![
            Dimension::new(0, 0, 4),
            Dimension::new(0, 0, 0),
            Dimension::new(0, 0, 1),
        ]);
        let repaired = repair_bounds_query_shape(&constrained);
        assert_eq!(repaired[2].extent, 4);
        assert_eq!(repaired[1].stride, repaired[0].extent * repaired[0].stride);
        assert_eq!(repaired.strides(), vec![4, 4, 1]);
        assert!(repaired.iter().all(|d| d.extent != 0 && d.stride != 0));
    }

    #[test]
    fn test_repair_chunky_forces_stride_from_channels() {
        let constrained = Shape::new(vec![
            Dimension::new(0, 640, 0),
            Dimension::new(0, 480, 0),
            Dimension::new(0, 3, 1),
        ]);
        let repaired = repair_bounds_query_shape(&constrained);
        assert_eq!(repaired.extents(), vec![640, 480, 3]);
        assert_eq!(repaired.strides(), vec![3, 1920, 1]);
    }

    #[test]
    fn test_repair_planar_fallback() {
        let constrained = Shape::from_extents(&[1000, 1000, 0]);
        let repaired = repair_bounds_query_shape(&constrained);
        assert_eq!(repaired.extents(), vec![1000, 1000, 4]);
        assert_eq!(repaired.strides(), vec![1, 1000, 1_000_000]);
    }

    #[test]
    fn test_repair_huge_extents_fail_at_allocation() {
        let huge = 1i64 << 40;
        let repaired = repair_bounds_query_shape(&Shape::from_extents(&[huge, huge, huge]));
        assert_eq!(repaired.strides(), vec![1, huge, i64::MAX]);
        let err = allocate_buffer(TypeTag::UINT8, &repaired).unwrap_err();
        assert!(matches!(err, RunGenError::Shape(_)), "got {:?}", err);

        let chunky = Shape::new(vec![
            Dimension::new(0, huge, huge),
            Dimension::new(0, huge, 0),
            Dimension::new(0, 0, 1),
        ]);
        let repaired = repair_bounds_query_shape(&chunky);
        assert_eq!(repaired[1].stride, i64::MAX);
        assert!(allocate_buffer(TypeTag::UINT8, &repaired).is_err());
    }

    #[test]
    fn test_repair_keeps_fully_constrained_shape() {
        let constrained = Shape::new(vec![Dimension::new(5, 10, 1), Dimension::new(0, 7, 10)]);
        assert_eq!(repair_bounds_query_shape(&constrained), constrained);
    }

    #[test]
    fn test_repair_empty_shape() {
        assert!(repair_bounds_query_shape(&Shape::default()).is_empty());
    }

    #[test]
    fn test_drop_trivial_axis_is_silent() {
        let buffer = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[4, 4, 1])).unwrap();
        let mut diagnostics = Diagnostics::new();
        let adjusted = adjust_buffer_dimensions(buffer, 2, "Input", "in", &mut diagnostics);
        assert_eq!(adjusted.dimensions(), 2);
        assert!(diagnostics.warnings().is_empty());
    }

    #[test]
    fn test_drop_nontrivial_axis_warns_once() {
        let buffer = allocate_buffer(TypeTag::UINT8, &Shape::from_extents(&[4, 4, 3])).unwrap();
        let mut diagnostics = Diagnostics::new();
        let adjusted = adjust_buffer_dimensions(buffer, 2, "Output", "out", &mut diagnostics);
        assert_eq!(adjusted.shape().extents(), vec![4, 4]);
        assert_eq!(diagnostics.warnings().len(), 1);
        assert!(diagnostics.warnings()[0].contains("data loss"));
    }

    #[test]
    fn test_add_axes_always_warns() {
        let buffer = allocate_buffer(TypeTag::FLOAT32, &Shape::from_extents(&[8])).unwrap();
        let mut diagnostics = Diagnostics::new();
        let adjusted = adjust_buffer_dimensions(buffer, 3, "Input", "in", &mut diagnostics);
        assert_eq!(adjusted.shape().extents(), vec![8, 1, 1]);
        assert_eq!(diagnostics.warnings().len(), 1);
    }
}
