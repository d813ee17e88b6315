//! # denoise-core
//!
//! Backend-independent contracts of the denoise inference engine.
//!
//! This crate provides:
//! - [`Buffer`] / [`Allocator`] — raw allocations of one storage class
//! - [`TensorDesc`] / [`Tensor`] — shaped views bound through native descriptors
//! - [`Image`] — interleaved pixel data exchanged with the caller
//! - [`Op`] and the operator traits with their [`Lifecycle`] state machine
//! - [`Device`] — the factory/queue trait every backend implements
//! - [`Error`] / [`ErrorCode`] — the failure taxonomy

// - Storage, DataType, TensorLayout: what memory holds and how it is laid out
// - Buffer + MemoryBinding: owned, viewed or external memory
// - Tensor / Image: bound data with pointer refresh (update_ptr)
// - Op / op_desc: operator descriptors, traits and lifecycle
// - transfer / exposure: numeric helpers shared by the image operators
// - kernel: work dimensions for element kernels
// - Device + DeviceConfig: backend entry point and its settings

pub mod buffer;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod exposure;
pub mod image;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod op;
pub mod op_desc;
pub mod storage;
pub mod tensor;
pub mod tensor_desc;
pub mod transfer;

pub use buffer::{Allocator, Buffer};
pub use config::DeviceConfig;
pub use device::{Device, HostFn};
pub use dtype::{DataType, Element};
pub use error::{Error, ErrorCode, Result};
pub use image::{Image, ImageDesc, ImageFormat};
pub use kernel::{ceil_div, WorkDim};
pub use layout::TensorLayout;
pub use memory::MemoryBinding;
pub use op::{
    Autoexposure, Conv, ImageCopy, InputImages, InputProcess, Lifecycle, Op, OpState,
    OutputProcess, Pool, Upsample,
};
pub use op_desc::{
    Activation, ConvDesc, InputProcessDesc, OutputProcessDesc, PoolDesc, UpsampleDesc,
};
pub use storage::Storage;
pub use tensor::Tensor;
pub use tensor_desc::TensorDesc;
pub use transfer::{Tile, TransferFunction, TransferKind};
