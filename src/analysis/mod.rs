//! # Graph Analysis Module
//!
//! This module contains analysis passes that process a
//! [`GraphModel`](crate::graph::GraphModel) before it is executed.
//!
//! ## Available Passes
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): Propagates
//!   per-sample tensor shapes through the graph, detecting geometry
//!   mismatches before any tensor is allocated.
//!
//! ## How It Works
//!
//! Analysis passes traverse the graph in topological order and compute
//! metadata on the nodes:
//!
//! ```text
//! GraphModel (unshaped) -> Shape Inference -> GraphModel (with shapes)
//! ```
//!
//! This enables:
//! - **Early error detection**: Merge-point mismatches caught statically
//! - **Cheap dry runs**: Buffer sizes are known before allocation
//! - **Summaries**: Parameter counts need the per-node shapes
//!
//! ## Example
//!
//! ```ignore
//! use segarch::analysis::shape_inference::ShapeInference;
//! use segarch::graph::TensorShape;
//!
//! let mut graph = assembler.assemble_full(&request)?;
//!
//! // Propagate shapes from the declared input
//! let output = ShapeInference::run(&mut graph, TensorShape::new(256, 256, 3))?;
//!
//! // Now every node carries its output shape
//! assert_eq!(output.channels, 2);
//! ```

pub mod shape_inference;

pub use shape_inference::{ShapeInference, ShapeInferenceError};
