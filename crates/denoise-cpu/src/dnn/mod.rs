// dnn — the CPU primitive layer
//
// Operators never touch TensorDesc layouts directly when computing a
// convolution. They translate every operand into a native MemoryDesc,
// build a primitive from those descriptors at finalization, and execute it
// with raw handles. Tensors whose descriptor cannot be translated are
// reported as unsupported by the operators that receive them.

pub mod conv;
pub mod memory;

pub use conv::{ConvAlgorithm, ConvArgs, ConvPrimitive};
pub use memory::{Format, Memory, MemoryDesc};
