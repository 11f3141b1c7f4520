//! Runtime scalar type descriptors
//!
//! A `TypeTag` is the only thing the runner knows about the element type of
//! a filter argument. It mirrors the `{code, bits, lanes}` triple that
//! compiled filters publish in their metadata.

use std::fmt;

/// Type code of a scalar element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeCode {
    Int,
    UInt,
    Float,
    Handle,
}

impl TypeCode {
    /// Numeric code used on the C ABI boundary.
    pub fn to_raw(self) -> u8 {
        match self {
            TypeCode::Int => 0,
            TypeCode::UInt => 1,
            TypeCode::Float => 2,
            TypeCode::Handle => 3,
        }
    }

    pub fn from_raw(code: u8) -> Option<Self> {
        match code {
            0 => Some(TypeCode::Int),
            1 => Some(TypeCode::UInt),
            2 => Some(TypeCode::Float),
            3 => Some(TypeCode::Handle),
            _ => None,
        }
    }
}

/// Element type of a scalar or buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag {
    pub code: TypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl TypeTag {
    pub const BOOL: TypeTag = TypeTag::new(TypeCode::UInt, 1);
    pub const UINT8: TypeTag = TypeTag::new(TypeCode::UInt, 8);
    pub const UINT16: TypeTag = TypeTag::new(TypeCode::UInt, 16);
    pub const UINT32: TypeTag = TypeTag::new(TypeCode::UInt, 32);
    pub const UINT64: TypeTag = TypeTag::new(TypeCode::UInt, 64);
    pub const INT8: TypeTag = TypeTag::new(TypeCode::Int, 8);
    pub const INT16: TypeTag = TypeTag::new(TypeCode::Int, 16);
    pub const INT32: TypeTag = TypeTag::new(TypeCode::Int, 32);
    pub const INT64: TypeTag = TypeTag::new(TypeCode::Int, 64);
    pub const FLOAT32: TypeTag = TypeTag::new(TypeCode::Float, 32);
    pub const FLOAT64: TypeTag = TypeTag::new(TypeCode::Float, 64);
    pub const HANDLE: TypeTag = TypeTag::new(TypeCode::Handle, 64);

    /// Single-lane type with the given code and bit width.
    pub const fn new(code: TypeCode, bits: u8) -> Self {
        Self { code, bits, lanes: 1 }
    }

    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self { lanes, ..self }
    }

    pub fn is_handle(&self) -> bool {
        self.code == TypeCode::Handle
    }

    /// Storage size of one element, in bytes (bool occupies a full byte).
    pub fn bytes(&self) -> usize {
        (self.bits as usize).div_ceil(8) * self.lanes.max(1) as usize
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == TypeCode::UInt && self.bits == 1 {
            write!(f, "bool")?;
        } else {
            let prefix = match self.code {
                TypeCode::Int => "int",
                TypeCode::UInt => "uint",
                TypeCode::Float => "float",
                TypeCode::Handle => "handle",
            };
            write!(f, "{}{}", prefix, self.bits)?;
        }
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}
