//! Weight loading and management.
//!
//! Model artifacts are single safetensors files, memory-mapped at startup.

pub mod mmap;
pub mod safetensors;

pub use self::mmap::MappedFile;
pub use self::safetensors::{write_f32, F32Tensor, SafetensorsFile, TensorInfo};
