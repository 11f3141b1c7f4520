//! Scalar codec
//!
//! Converts between text and typed scalar values for every element type a
//! filter can declare. Dispatch goes through `ScalarKind`, a closed enum
//! selected from a `TypeTag`; supporting a new type means adding a variant,
//! and the compiler then points at every match that needs a new arm.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RunGenError};
use crate::types::{TypeCode, TypeTag};

/// A typed scalar value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    /// Opaque handle; the only representable value is null.
    Handle,
}

/// The closed set of scalar types the runner can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Handle,
}

impl ScalarKind {
    /// Select the handler for a type tag. Lanes are not part of the
    /// selection; vector types are handled as their element type.
    pub fn of(tag: TypeTag) -> Result<Self> {
        let kind = match (tag.code, tag.bits) {
            (TypeCode::Int, 8) => ScalarKind::Int8,
            (TypeCode::Int, 16) => ScalarKind::Int16,
            (TypeCode::Int, 32) => ScalarKind::Int32,
            (TypeCode::Int, 64) => ScalarKind::Int64,
            (TypeCode::UInt, 1) => ScalarKind::Bool,
            (TypeCode::UInt, 8) => ScalarKind::UInt8,
            (TypeCode::UInt, 16) => ScalarKind::UInt16,
            (TypeCode::UInt, 32) => ScalarKind::UInt32,
            (TypeCode::UInt, 64) => ScalarKind::UInt64,
            (TypeCode::Float, 32) => ScalarKind::Float32,
            (TypeCode::Float, 64) => ScalarKind::Float64,
            (TypeCode::Handle, 64) => ScalarKind::Handle,
            _ => return Err(RunGenError::UnsupportedType(tag)),
        };
        Ok(kind)
    }

    /// Size of one value in memory, in bytes.
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Int8 | ScalarKind::UInt8 | ScalarKind::Bool => 1,
            ScalarKind::Int16 | ScalarKind::UInt16 => 2,
            ScalarKind::Int32 | ScalarKind::UInt32 | ScalarKind::Float32 => 4,
            ScalarKind::Int64 | ScalarKind::UInt64 | ScalarKind::Float64 | ScalarKind::Handle => 8,
        }
    }

    pub fn zero(self) -> ScalarValue {
        match self {
            ScalarKind::Int8 => ScalarValue::Int8(0),
            ScalarKind::Int16 => ScalarValue::Int16(0),
            ScalarKind::Int32 => ScalarValue::Int32(0),
            ScalarKind::Int64 => ScalarValue::Int64(0),
            ScalarKind::UInt8 => ScalarValue::UInt8(0),
            ScalarKind::UInt16 => ScalarValue::UInt16(0),
            ScalarKind::UInt32 => ScalarValue::UInt32(0),
            ScalarKind::UInt64 => ScalarValue::UInt64(0),
            ScalarKind::Float32 => ScalarValue::Float32(0.0),
            ScalarKind::Float64 => ScalarValue::Float64(0.0),
            ScalarKind::Bool => ScalarValue::Bool(false),
            ScalarKind::Handle => ScalarValue::Handle,
        }
    }

    /// Parse `text` as this kind. The whole input must be consumed.
    pub fn parse(self, text: &str) -> Option<ScalarValue> {
        match self {
            ScalarKind::Int8 => parse_number(text).map(ScalarValue::Int8),
            ScalarKind::Int16 => parse_number(text).map(ScalarValue::Int16),
            ScalarKind::Int32 => parse_number(text).map(ScalarValue::Int32),
            ScalarKind::Int64 => parse_number(text).map(ScalarValue::Int64),
            ScalarKind::UInt8 => parse_number(text).map(ScalarValue::UInt8),
            ScalarKind::UInt16 => parse_number(text).map(ScalarValue::UInt16),
            ScalarKind::UInt32 => parse_number(text).map(ScalarValue::UInt32),
            ScalarKind::UInt64 => parse_number(text).map(ScalarValue::UInt64),
            ScalarKind::Float32 => parse_number(text)
                .filter(|v: &f32| v.is_finite())
                .map(ScalarValue::Float32),
            ScalarKind::Float64 => parse_number(text)
                .filter(|v: &f64| v.is_finite())
                .map(ScalarValue::Float64),
            // Only the literal spellings; "1"/"0" are rejected.
            ScalarKind::Bool => match text {
                "true" => Some(ScalarValue::Bool(true)),
                "false" => Some(ScalarValue::Bool(false)),
                _ => None,
            },
            ScalarKind::Handle => (text == "nullptr").then_some(ScalarValue::Handle),
        }
    }

    /// Decode a native-endian value from the front of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than `self.size()`.
    pub fn read_ne(self, bytes: &[u8]) -> ScalarValue {
        fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(&bytes[..N]);
            out
        }
        match self {
            ScalarKind::Int8 => ScalarValue::Int8(i8::from_ne_bytes(arr(bytes))),
            ScalarKind::Int16 => ScalarValue::Int16(i16::from_ne_bytes(arr(bytes))),
            ScalarKind::Int32 => ScalarValue::Int32(i32::from_ne_bytes(arr(bytes))),
            ScalarKind::Int64 => ScalarValue::Int64(i64::from_ne_bytes(arr(bytes))),
            ScalarKind::UInt8 => ScalarValue::UInt8(bytes[0]),
            ScalarKind::UInt16 => ScalarValue::UInt16(u16::from_ne_bytes(arr(bytes))),
            ScalarKind::UInt32 => ScalarValue::UInt32(u32::from_ne_bytes(arr(bytes))),
            ScalarKind::UInt64 => ScalarValue::UInt64(u64::from_ne_bytes(arr(bytes))),
            ScalarKind::Float32 => ScalarValue::Float32(f32::from_ne_bytes(arr(bytes))),
            ScalarKind::Float64 => ScalarValue::Float64(f64::from_ne_bytes(arr(bytes))),
            ScalarKind::Bool => ScalarValue::Bool(bytes[0] != 0),
            ScalarKind::Handle => ScalarValue::Handle,
        }
    }

    fn unsigned_bits(self) -> Option<u32> {
        match self {
            ScalarKind::UInt8 => Some(8),
            ScalarKind::UInt16 => Some(16),
            ScalarKind::UInt32 => Some(32),
            ScalarKind::UInt64 => Some(64),
            _ => None,
        }
    }

    /// Build a value from a normalized number (see `ScalarValue::to_normalized`).
    /// Integer destinations are rounded and clamped to their range.
    pub fn from_normalized(self, n: f64) -> ScalarValue {
        fn unsigned(n: f64, max: f64) -> f64 {
            (n.clamp(0.0, 1.0) * max).round()
        }
        fn signed(n: f64, max: f64) -> f64 {
            (n.clamp(-1.0, 1.0) * max).round()
        }
        match self {
            ScalarKind::Int8 => ScalarValue::Int8(signed(n, i8::MAX as f64) as i8),
            ScalarKind::Int16 => ScalarValue::Int16(signed(n, i16::MAX as f64) as i16),
            ScalarKind::Int32 => ScalarValue::Int32(signed(n, i32::MAX as f64) as i32),
            ScalarKind::Int64 => ScalarValue::Int64(signed(n, i64::MAX as f64) as i64),
            ScalarKind::UInt8 => ScalarValue::UInt8(unsigned(n, u8::MAX as f64) as u8),
            ScalarKind::UInt16 => ScalarValue::UInt16(unsigned(n, u16::MAX as f64) as u16),
            ScalarKind::UInt32 => ScalarValue::UInt32(unsigned(n, u32::MAX as f64) as u32),
            ScalarKind::UInt64 => ScalarValue::UInt64(unsigned(n, u64::MAX as f64) as u64),
            ScalarKind::Float32 => ScalarValue::Float32(n as f32),
            ScalarKind::Float64 => ScalarValue::Float64(n),
            ScalarKind::Bool => ScalarValue::Bool(n != 0.0),
            ScalarKind::Handle => ScalarValue::Handle,
        }
    }
}

/// Leading whitespace is skipped, trailing characters are not. Floats must
/// come out finite, so `inf`, `nan` and out-of-range exponents fail.
fn parse_number<T: FromStr>(text: &str) -> Option<T> {
    text.trim_start().parse::<T>().ok()
}

/// Parse `text` as a scalar of type `tag`.
///
/// # Errors
///
/// Returns `RunGenError::UnsupportedType` if `tag` is not one of the twelve
/// supported types, and `RunGenError::Parse` if the text does not match.
pub fn parse(text: &str, tag: TypeTag) -> Result<ScalarValue> {
    let kind = ScalarKind::of(tag)?;
    kind.parse(text).ok_or_else(|| RunGenError::Parse {
        text: text.to_string(),
        expected: tag,
    })
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::Int8(_) => ScalarKind::Int8,
            ScalarValue::Int16(_) => ScalarKind::Int16,
            ScalarValue::Int32(_) => ScalarKind::Int32,
            ScalarValue::Int64(_) => ScalarKind::Int64,
            ScalarValue::UInt8(_) => ScalarKind::UInt8,
            ScalarValue::UInt16(_) => ScalarKind::UInt16,
            ScalarValue::UInt32(_) => ScalarKind::UInt32,
            ScalarValue::UInt64(_) => ScalarKind::UInt64,
            ScalarValue::Float32(_) => ScalarKind::Float32,
            ScalarValue::Float64(_) => ScalarKind::Float64,
            ScalarValue::Bool(_) => ScalarKind::Bool,
            ScalarValue::Handle => ScalarKind::Handle,
        }
    }

    fn as_unsigned(&self) -> Option<u64> {
        match *self {
            ScalarValue::UInt8(v) => Some(v.into()),
            ScalarValue::UInt16(v) => Some(v.into()),
            ScalarValue::UInt32(v) => Some(v.into()),
            ScalarValue::UInt64(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to another element kind.
    ///
    /// Narrowing between unsigned integers keeps the high bits (uint16
    /// 0x8180 becomes uint8 0x81). Everything else goes through
    /// `to_normalized` and `ScalarKind::from_normalized`, so widening
    /// unsigned integers replicates bits (uint8 0xab becomes uint16 0xabab).
    pub fn convert(&self, kind: ScalarKind) -> ScalarValue {
        let from_bits = self.kind().unsigned_bits();
        if let (Some(v), Some(from), Some(to)) = (self.as_unsigned(), from_bits, kind.unsigned_bits()) {
            if to < from {
                let high = v >> (from - to);
                return match kind {
                    ScalarKind::UInt8 => ScalarValue::UInt8(high as u8),
                    ScalarKind::UInt16 => ScalarValue::UInt16(high as u16),
                    _ => ScalarValue::UInt32(high as u32),
                };
            }
        }
        kind.from_normalized(self.to_normalized())
    }

    pub fn tag(&self) -> TypeTag {
        match self {
            ScalarValue::Int8(_) => TypeTag::INT8,
            ScalarValue::Int16(_) => TypeTag::INT16,
            ScalarValue::Int32(_) => TypeTag::INT32,
            ScalarValue::Int64(_) => TypeTag::INT64,
            ScalarValue::UInt8(_) => TypeTag::UINT8,
            ScalarValue::UInt16(_) => TypeTag::UINT16,
            ScalarValue::UInt32(_) => TypeTag::UINT32,
            ScalarValue::UInt64(_) => TypeTag::UINT64,
            ScalarValue::Float32(_) => TypeTag::FLOAT32,
            ScalarValue::Float64(_) => TypeTag::FLOAT64,
            ScalarValue::Bool(_) => TypeTag::BOOL,
            ScalarValue::Handle => TypeTag::HANDLE,
        }
    }

    /// Write the value in native byte order to the front of `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than `self.kind().size()`.
    pub fn write_ne(&self, out: &mut [u8]) {
        match *self {
            ScalarValue::Int8(v) => out[..1].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Int16(v) => out[..2].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Int32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Int64(v) => out[..8].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::UInt8(v) => out[0] = v,
            ScalarValue::UInt16(v) => out[..2].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::UInt32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::UInt64(v) => out[..8].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Float32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Float64(v) => out[..8].copy_from_slice(&v.to_ne_bytes()),
            ScalarValue::Bool(v) => out[0] = v as u8,
            ScalarValue::Handle => out[..8].fill(0),
        }
    }

    /// Map the value onto a common scale for type conversion: unsigned
    /// integers to [0, 1], signed integers to about [-1, 1], floats as-is,
    /// bool to 0 or 1.
    pub fn to_normalized(&self) -> f64 {
        match *self {
            ScalarValue::Int8(v) => v as f64 / i8::MAX as f64,
            ScalarValue::Int16(v) => v as f64 / i16::MAX as f64,
            ScalarValue::Int32(v) => v as f64 / i32::MAX as f64,
            ScalarValue::Int64(v) => v as f64 / i64::MAX as f64,
            ScalarValue::UInt8(v) => v as f64 / u8::MAX as f64,
            ScalarValue::UInt16(v) => v as f64 / u16::MAX as f64,
            ScalarValue::UInt32(v) => v as f64 / u32::MAX as f64,
            ScalarValue::UInt64(v) => v as f64 / u64::MAX as f64,
            ScalarValue::Float32(v) => v as f64,
            ScalarValue::Float64(v) => v,
            ScalarValue::Bool(v) => v as u8 as f64,
            ScalarValue::Handle => 0.0,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Int8(v) => write!(f, "{}", v),
            ScalarValue::Int16(v) => write!(f, "{}", v),
            ScalarValue::Int32(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::UInt8(v) => write!(f, "{}", v),
            ScalarValue::UInt16(v) => write!(f, "{}", v),
            ScalarValue::UInt32(v) => write!(f, "{}", v),
            ScalarValue::UInt64(v) => write!(f, "{}", v),
            ScalarValue::Float32(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Handle => write!(f, "nullptr"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_text() {
        let values = [
            ScalarValue::Int8(-128),
            ScalarValue::Int16(i16::MAX),
            ScalarValue::Int32(-42),
            ScalarValue::Int64(i64::MIN),
            ScalarValue::UInt8(255),
            ScalarValue::UInt16(0),
            ScalarValue::UInt32(4_000_000_000),
            ScalarValue::UInt64(u64::MAX),
            ScalarValue::Float32(0.1),
            ScalarValue::Float64(-3.1415926535),
            ScalarValue::Bool(true),
            ScalarValue::Handle,
        ];
        for v in values {
            let text = v.to_string();
            assert_eq!(parse(&text, v.tag()).unwrap(), v, "roundtrip of {}", text);
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let err = parse("42x", TypeTag::INT32).unwrap_err();
        assert!(matches!(err, RunGenError::Parse { .. }), "got {:?}", err);
        assert!(parse("1.5f", TypeTag::FLOAT32).is_err());
        assert!(parse("", TypeTag::UINT8).is_err());
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(parse("256", TypeTag::UINT8).is_err());
        assert!(parse("-1", TypeTag::UINT32).is_err());
        assert_eq!(parse("127", TypeTag::INT8).unwrap(), ScalarValue::Int8(127));
    }

    #[test]
    fn test_bool_literals_only() {
        assert_eq!(parse("false", TypeTag::BOOL).unwrap(), ScalarValue::Bool(false));
        assert!(parse("1", TypeTag::BOOL).is_err());
        assert!(parse("True", TypeTag::BOOL).is_err());
    }

    #[test]
    fn test_float_syntax() {
        assert_eq!(parse(" 2.5", TypeTag::FLOAT32).unwrap(), ScalarValue::Float32(2.5));
        assert_eq!(parse("\t-7", TypeTag::INT16).unwrap(), ScalarValue::Int16(-7));
        assert_eq!(parse("1e3", TypeTag::FLOAT64).unwrap(), ScalarValue::Float64(1000.0));
        for text in ["inf", "-infinity", "NaN", "nan", "1e999", "2.5 "] {
            assert!(parse(text, TypeTag::FLOAT64).is_err(), "accepted {:?}", text);
        }
        assert!(parse("1e39", TypeTag::FLOAT32).is_err());
    }

    #[test]
    fn test_handle_accepts_only_nullptr() {
        assert_eq!(parse("nullptr", TypeTag::HANDLE).unwrap(), ScalarValue::Handle);
        assert!(parse("0", TypeTag::HANDLE).is_err());
    }

    #[test]
    fn test_unsupported_tag() {
        let half = TypeTag::new(TypeCode::Float, 16);
        assert!(matches!(
            parse("1.0", half),
            Err(RunGenError::UnsupportedType(t)) if t == half
        ));
    }

    #[test]
    fn test_vector_tag_dispatches_on_element() {
        let v = parse("7", TypeTag::UINT8.with_lanes(4)).unwrap();
        assert_eq!(v, ScalarValue::UInt8(7));
    }

    #[test]
    fn test_native_bytes() {
        let mut buf = [0u8; 8];
        ScalarValue::Int32(-5).write_ne(&mut buf);
        assert_eq!(ScalarKind::Int32.read_ne(&buf), ScalarValue::Int32(-5));
        ScalarValue::Float64(2.5).write_ne(&mut buf);
        assert_eq!(ScalarKind::Float64.read_ne(&buf), ScalarValue::Float64(2.5));
    }

    #[test]
    fn test_normalized_conversion() {
        let full = ScalarValue::UInt8(255).to_normalized();
        assert_eq!(ScalarKind::UInt16.from_normalized(full), ScalarValue::UInt16(65535));
        let one = ScalarValue::UInt8(1).to_normalized();
        assert_eq!(ScalarKind::UInt16.from_normalized(one), ScalarValue::UInt16(257));
        assert_eq!(ScalarKind::UInt8.from_normalized(2.0), ScalarValue::UInt8(255));
        assert_eq!(ScalarKind::UInt8.from_normalized(-1.0), ScalarValue::UInt8(0));
        assert_eq!(ScalarKind::Float32.from_normalized(0.5), ScalarValue::Float32(0.5));
    }

    #[test]
    fn test_unsigned_narrowing_keeps_high_bits() {
        assert_eq!(ScalarValue::UInt16(129).convert(ScalarKind::UInt8), ScalarValue::UInt8(0));
        assert_eq!(ScalarValue::UInt16(0x8180).convert(ScalarKind::UInt8), ScalarValue::UInt8(0x81));
        assert_eq!(ScalarValue::UInt16(0xffff).convert(ScalarKind::UInt8), ScalarValue::UInt8(0xff));
        assert_eq!(
            ScalarValue::UInt64(0x1234_5678_9abc_def0).convert(ScalarKind::UInt32),
            ScalarValue::UInt32(0x1234_5678)
        );
        assert_eq!(ScalarValue::UInt8(0xab).convert(ScalarKind::UInt16), ScalarValue::UInt16(0xabab));
        assert_eq!(ScalarValue::UInt8(255).convert(ScalarKind::Float32), ScalarValue::Float32(1.0));
    }
}
