//! Execution of a graph on the CPU with `ndarray` tensors.
//!
//! The executor here serves architecture validation and smoke-test
//! inference, not training: structural operations (pooling, upsampling,
//! concatenation, gating arithmetic) are computed for real, while
//! convolution kernels are stand-ins that emit correctly shaped zero
//! feature maps. Kernel arithmetic belongs to the training engine.

pub mod executor;

pub use executor::{Executor, RuntimeError};
