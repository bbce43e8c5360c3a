//! DataType - TensorFlow element type codes

use std::fmt;

/// Element types as numbered in `types.proto`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Double,
    Int32,
    UInt8,
    Int16,
    Int8,
    String,
    Int64,
    Bool,
    BFloat16,
    UInt16,
    Half,
    Resource,
    Variant,
    UInt32,
    UInt64,
    /// Any code this crate does not decode (complex, quantized, ref types...)
    Other(i32),
}

impl DataType {
    pub fn from_i32(code: i32) -> Self {
        match code {
            1 => DataType::Float,
            2 => DataType::Double,
            3 => DataType::Int32,
            4 => DataType::UInt8,
            5 => DataType::Int16,
            6 => DataType::Int8,
            7 => DataType::String,
            9 => DataType::Int64,
            10 => DataType::Bool,
            14 => DataType::BFloat16,
            17 => DataType::UInt16,
            19 => DataType::Half,
            20 => DataType::Resource,
            21 => DataType::Variant,
            22 => DataType::UInt32,
            23 => DataType::UInt64,
            other => DataType::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DataType::Float => 1,
            DataType::Double => 2,
            DataType::Int32 => 3,
            DataType::UInt8 => 4,
            DataType::Int16 => 5,
            DataType::Int8 => 6,
            DataType::String => 7,
            DataType::Int64 => 9,
            DataType::Bool => 10,
            DataType::BFloat16 => 14,
            DataType::UInt16 => 17,
            DataType::Half => 19,
            DataType::Resource => 20,
            DataType::Variant => 21,
            DataType::UInt32 => 22,
            DataType::UInt64 => 23,
            DataType::Other(code) => *code,
        }
    }

    /// Fixed element width in bytes, `None` for variable-length types.
    pub fn size_in_bytes(&self) -> Option<usize> {
        match self {
            DataType::Float | DataType::Int32 | DataType::UInt32 => Some(4),
            DataType::Double | DataType::Int64 | DataType::UInt64 => Some(8),
            DataType::Half | DataType::BFloat16 | DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::UInt8 | DataType::Int8 | DataType::Bool => Some(1),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.size_in_bytes().is_some()
    }

    pub fn name(&self) -> String {
        let s = match self {
            DataType::Float => "float32",
            DataType::Double => "float64",
            DataType::Int32 => "int32",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::Int8 => "int8",
            DataType::String => "string",
            DataType::Int64 => "int64",
            DataType::Bool => "bool",
            DataType::BFloat16 => "bfloat16",
            DataType::UInt16 => "uint16",
            DataType::Half => "float16",
            DataType::Resource => "resource",
            DataType::Variant => "variant",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Other(code) => return format!("dtype({})", code),
        };
        s.to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
