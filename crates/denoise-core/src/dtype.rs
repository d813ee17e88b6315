use std::fmt;

// DataType — element types a tensor may hold
//
//   Float32 — the default for weights and activations
//   Float16 — half precision, used by GPU backends for activations/weights
//   UInt8   — raw bytes (scratch tensors, native-descriptor-only tensors)
//
// Whether a backend can actually compute with a given type is decided when
// the backend builds its native descriptor, not here.

/// Element data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Float16,
    UInt8,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn byte_size(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
            DataType::UInt8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float16)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Float32 => "f32",
            DataType::Float16 => "f16",
            DataType::UInt8 => "u8",
        };
        write!(f, "{}", s)
    }
}

// Element — bridge between Rust scalar types and DataType
//
// Host-side kernels and tests read and write tensor memory through this
// trait so that a single generic routine covers every element type.

/// Rust scalar types that can be stored in a tensor.
pub trait Element: Copy + Send + Sync + 'static + fmt::Debug {
    /// The corresponding DataType variant.
    const DATA_TYPE: DataType;

    fn to_f32(self) -> f32;

    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for half::f16 {
    const DATA_TYPE: DataType = DataType::Float16;
    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }
    fn from_f32(v: f32) -> Self {
        half::f16::from_f32(v)
    }
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::UInt8;
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v.round().clamp(0.0, 255.0) as u8
    }
}
