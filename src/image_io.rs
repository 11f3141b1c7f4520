//! Image I/O capability
//!
//! The runner loads buffer inputs and saves outputs through the `ImageIo`
//! trait. `ImageFileIo` is the file-backed implementation on top of the
//! `image` crate; tests substitute in-memory implementations.
//!
//! Loaded images are planar: axis 0 is x, axis 1 is y and axis 2 (absent
//! for single-channel images) is the channel.

use std::collections::BTreeSet;
use std::path::Path;

use image::{DynamicImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};

use crate::buffer::{allocate_buffer, Buffer};
use crate::error::{Result, RunGenError};
use crate::scalar::ScalarValue;
use crate::shape::Shape;
use crate::types::TypeTag;

/// A buffer type/dimensionality combination a file format can store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatInfo {
    pub type_tag: TypeTag,
    pub dimensions: usize,
}

impl FormatInfo {
    pub fn new(type_tag: TypeTag, dimensions: usize) -> Self {
        Self {
            type_tag,
            dimensions,
        }
    }
}

/// Load, save and capability queries for buffer files.
pub trait ImageIo {
    /// Decode the file at `path` into an allocated buffer.
    fn load(&self, path: &Path) -> Result<Buffer>;

    /// Encode `buffer` to `path`. The buffer already matches one of the
    /// formats returned by `query_savable_formats`.
    fn save(&self, buffer: &Buffer, path: &Path) -> Result<()>;

    /// Formats that can be written to `path` (usually decided by its
    /// extension).
    fn query_savable_formats(&self, path: &Path) -> Result<BTreeSet<FormatInfo>>;
}

/// Pick the savable format closest to `buffer`.
///
/// A dimension mismatch costs 128 per axis, a bit-width mismatch 1 per bit,
/// and a different type code 1. The lowest score wins; ties go to the first
/// format in set order.
///
/// # Errors
///
/// Returns `RunGenError::Io` if `formats` is empty.
pub fn best_save_format(buffer: &Buffer, formats: &BTreeSet<FormatInfo>) -> Result<FormatInfo> {
    let tag = buffer.type_tag();
    let dimensions = buffer.dimensions() as i64;

    let mut best: Option<(i64, FormatInfo)> = None;
    for format in formats {
        let mut score = (format.dimensions as i64 - dimensions).abs() * 128;
        score += (i64::from(format.type_tag.bits) - i64::from(tag.bits)).abs();
        if format.type_tag.code != tag.code {
            score += 1;
        }
        if best.map_or(true, |(best_score, _)| score < best_score) {
            best = Some((score, *format));
        }
    }
    best.map(|(_, format)| format)
        .ok_or_else(|| RunGenError::Io("no savable formats available".to_string()))
}

/// `ImageIo` backed by image files on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileIo;

impl ImageFileIo {
    pub fn new() -> Self {
        Self
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> RunGenError {
    RunGenError::Io(format!("{}: {}", path.display(), e))
}

/// Copy interleaved samples into a planar `[x, y, c]` buffer.
fn planar_from_interleaved<T: Copy>(
    type_tag: TypeTag,
    width: u32,
    height: u32,
    channels: usize,
    samples: &[T],
    to_value: impl Fn(T) -> ScalarValue,
) -> Result<Buffer> {
    let (w, h) = (i64::from(width), i64::from(height));
    let extents: Vec<i64> = if channels == 1 {
        vec![w, h]
    } else {
        vec![w, h, channels as i64]
    };
    let mut buffer = allocate_buffer(type_tag, &Shape::from_extents(&extents))?;

    for (i, &sample) in samples.iter().enumerate() {
        let c = (i % channels) as i64;
        let pixel = (i / channels) as i64;
        let (x, y) = (pixel % w, pixel / w);
        if channels == 1 {
            buffer.set(&[x, y], to_value(sample))?;
        } else {
            buffer.set(&[x, y, c], to_value(sample))?;
        }
    }
    Ok(buffer)
}

/// Gather a planar buffer into interleaved samples, in row-major order.
fn interleaved_from_planar<T>(
    buffer: &Buffer,
    from_value: impl Fn(ScalarValue) -> Option<T>,
) -> Result<(u32, u32, usize, Vec<T>)> {
    let shape = buffer.shape();
    let channels = if shape.len() == 3 { shape[2].extent } else { 1 };
    if !(1..=4).contains(&channels) {
        return Err(RunGenError::Io(format!(
            "cannot save an image with {} channels",
            channels
        )));
    }
    let (x0, y0) = (shape[0].min, shape[1].min);
    let width = u32::try_from(shape[0].extent)
        .map_err(|_| RunGenError::Io(format!("image width {} out of range", shape[0].extent)))?;
    let height = u32::try_from(shape[1].extent)
        .map_err(|_| RunGenError::Io(format!("image height {} out of range", shape[1].extent)))?;
    let c0 = if shape.len() == 3 { shape[2].min } else { 0 };

    let mut samples = Vec::with_capacity(width as usize * height as usize * channels as usize);
    for y in 0..i64::from(height) {
        for x in 0..i64::from(width) {
            for c in 0..channels {
                let value = if shape.len() == 3 {
                    buffer.get(&[x0 + x, y0 + y, c0 + c])
                } else {
                    buffer.get(&[x0 + x, y0 + y])
                };
                let sample = value.and_then(&from_value).ok_or_else(|| {
                    RunGenError::Io(format!("cannot save buffer of type {}", buffer.type_tag()))
                })?;
                samples.push(sample);
            }
        }
    }
    Ok((width, height, channels as usize, samples))
}

fn image_from_u8(width: u32, height: u32, channels: usize, data: Vec<u8>) -> Option<DynamicImage> {
    Some(match channels {
        1 => DynamicImage::ImageLuma8(ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data)?),
        2 => DynamicImage::ImageLumaA8(ImageBuffer::<LumaA<u8>, _>::from_raw(width, height, data)?),
        3 => DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data)?),
        _ => DynamicImage::ImageRgba8(ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data)?),
    })
}

fn image_from_u16(width: u32, height: u32, channels: usize, data: Vec<u16>) -> Option<DynamicImage> {
    Some(match channels {
        1 => DynamicImage::ImageLuma16(ImageBuffer::<Luma<u16>, _>::from_raw(width, height, data)?),
        2 => DynamicImage::ImageLumaA16(ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, data)?),
        3 => DynamicImage::ImageRgb16(ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, data)?),
        _ => DynamicImage::ImageRgba16(ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, data)?),
    })
}

impl ImageIo for ImageFileIo {
    fn load(&self, path: &Path) -> Result<Buffer> {
        let img = image::open(path).map_err(|e| io_error(path, e))?;
        let (w, h) = (img.width(), img.height());
        log::debug!("Decoded {} ({}x{}, {:?})", path.display(), w, h, img.color());

        let u8s = |v: u8| ScalarValue::UInt8(v);
        let u16s = |v: u16| ScalarValue::UInt16(v);
        let f32s = |v: f32| ScalarValue::Float32(v);
        match &img {
            DynamicImage::ImageLuma8(b) => planar_from_interleaved(TypeTag::UINT8, w, h, 1, b.as_raw(), u8s),
            DynamicImage::ImageLumaA8(b) => planar_from_interleaved(TypeTag::UINT8, w, h, 2, b.as_raw(), u8s),
            DynamicImage::ImageRgb8(b) => planar_from_interleaved(TypeTag::UINT8, w, h, 3, b.as_raw(), u8s),
            DynamicImage::ImageRgba8(b) => planar_from_interleaved(TypeTag::UINT8, w, h, 4, b.as_raw(), u8s),
            DynamicImage::ImageLuma16(b) => planar_from_interleaved(TypeTag::UINT16, w, h, 1, b.as_raw(), u16s),
            DynamicImage::ImageLumaA16(b) => planar_from_interleaved(TypeTag::UINT16, w, h, 2, b.as_raw(), u16s),
            DynamicImage::ImageRgb16(b) => planar_from_interleaved(TypeTag::UINT16, w, h, 3, b.as_raw(), u16s),
            DynamicImage::ImageRgba16(b) => planar_from_interleaved(TypeTag::UINT16, w, h, 4, b.as_raw(), u16s),
            DynamicImage::ImageRgb32F(b) => planar_from_interleaved(TypeTag::FLOAT32, w, h, 3, b.as_raw(), f32s),
            DynamicImage::ImageRgba32F(b) => planar_from_interleaved(TypeTag::FLOAT32, w, h, 4, b.as_raw(), f32s),
            other => {
                let rgba = other.to_rgba32f();
                planar_from_interleaved(TypeTag::FLOAT32, w, h, 4, rgba.as_raw(), f32s)
            }
        }
    }

    fn save(&self, buffer: &Buffer, path: &Path) -> Result<()> {
        if !(2..=3).contains(&buffer.dimensions()) {
            return Err(io_error(
                path,
                format!("cannot save a buffer with {} dimensions", buffer.dimensions()),
            ));
        }
        let tag = buffer.type_tag();
        let image = if tag == TypeTag::UINT8 {
            let (w, h, c, data) = interleaved_from_planar(buffer, |v| match v {
                ScalarValue::UInt8(x) => Some(x),
                _ => None,
            })?;
            image_from_u8(w, h, c, data)
        } else if tag == TypeTag::UINT16 {
            let (w, h, c, data) = interleaved_from_planar(buffer, |v| match v {
                ScalarValue::UInt16(x) => Some(x),
                _ => None,
            })?;
            image_from_u16(w, h, c, data)
        } else {
            return Err(io_error(path, format!("cannot save buffer of type {}", tag)));
        };

        let image = image.ok_or_else(|| io_error(path, "image size does not match pixel data"))?;
        image.save(path).map_err(|e| io_error(path, e))?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }

    fn query_savable_formats(&self, path: &Path) -> Result<BTreeSet<FormatInfo>> {
        let (types, dims): (&[TypeTag], &[usize]) = match extension(path).as_str() {
            "png" => (&[TypeTag::UINT8, TypeTag::UINT16], &[2, 3]),
            "jpg" | "jpeg" => (&[TypeTag::UINT8], &[2, 3]),
            "pgm" => (&[TypeTag::UINT8, TypeTag::UINT16], &[2]),
            "ppm" => (&[TypeTag::UINT8, TypeTag::UINT16], &[3]),
            other => {
                return Err(io_error(
                    path,
                    format!("unsupported image format \"{}\"", other),
                ))
            }
        };
        Ok(types
            .iter()
            .flat_map(|&t| dims.iter().map(move |&d| FormatInfo::new(t, d)))
            .collect())
    }
}
