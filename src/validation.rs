//! Three-phase validation of an assembled graph.
//!
//! Validation is the only gate between "a graph was assembled" and "this
//! architecture exists": it checks the structure, propagates static
//! shapes and instantiates the network once on a synthetic sample. Only a
//! graph that passes all three phases is frozen into a
//! [`CompiledNetwork`]; anything else is reported as a typed error and
//! the graph is dropped.
//!
//! The phases are ordered from cheapest to most expensive and each one
//! assumes the previous passed:
//!
//! 1. **Structural**: the graph is acyclic, fully wired and every node is
//!    reachable from the declared input.
//! 2. **Shape**: per-sample shapes propagate from the input to the head
//!    without a merge-point disagreement.
//! 3. **Instantiation**: a one-sample zero batch flows through the
//!    executor and the produced tensor matches the statically computed
//!    output shape.

use crate::analysis::{ShapeInference, ShapeInferenceError};
use crate::graph::{GraphError, GraphModel, TensorShape};
use crate::network::CompiledNetwork;
use crate::nn::assembler::InputSpec;
use crate::runtime::{Executor, RuntimeError};
use ndarray::{ArrayD, IxDyn};
use thiserror::Error;
use tracing::debug;

/// Errors raised by validation, one variant per phase.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("structural validation failed: {0}")]
    Structural(GraphError),

    #[error("shape validation failed: {0}")]
    ShapeMismatch(ShapeInferenceError),

    #[error("instantiation dry run failed: {0}")]
    Instantiation(RuntimeError),
}

/// Runs the three validation phases over an assembled graph.
pub struct ArchitectureValidator;

impl ArchitectureValidator {
    /// Validates `graph` against the input geometry it was assembled for
    /// and freezes it into a [`CompiledNetwork`] on success.
    ///
    /// The graph is consumed either way: a failed candidate has no
    /// further use and is dropped with the error.
    pub fn validate(
        mut graph: GraphModel,
        input: InputSpec,
    ) -> Result<CompiledNetwork, ValidationError> {
        let order = graph
            .topological_order()
            .map_err(ValidationError::Structural)?;
        debug!(nodes = order.len(), "structural validation passed");

        let output_shape =
            ShapeInference::run(&mut graph, input.shape()).map_err(|e| match e {
                // Graph-level problems surfacing inside the pass are still
                // structural findings, not shape findings.
                ShapeInferenceError::Graph(g) => ValidationError::Structural(g),
                other => ValidationError::ShapeMismatch(other),
            })?;
        debug!(%output_shape, "shape validation passed");

        let sample = ArrayD::zeros(IxDyn(&[1, input.height, input.width, input.channels]));
        let produced = Executor::run(&graph, &sample).map_err(ValidationError::Instantiation)?;
        let produced_shape = Self::per_sample_shape(&graph, &produced)
            .map_err(ValidationError::Instantiation)?;
        if produced_shape != output_shape {
            return Err(ValidationError::Instantiation(RuntimeError::ShapeError {
                node: Self::output_name(&graph),
                message: format!(
                    "dry run produced {} where static inference expected {}",
                    produced_shape, output_shape
                ),
            }));
        }
        debug!(%produced_shape, "instantiation dry run passed");

        Ok(CompiledNetwork::freeze(graph, input, output_shape))
    }

    fn per_sample_shape(
        graph: &GraphModel,
        produced: &ArrayD<f32>,
    ) -> Result<TensorShape, RuntimeError> {
        if produced.ndim() != 4 {
            return Err(RuntimeError::ShapeError {
                node: Self::output_name(graph),
                message: format!(
                    "dry run produced a rank-{} tensor instead of rank 4",
                    produced.ndim()
                ),
            });
        }
        let dims = produced.shape();
        Ok(TensorShape::new(dims[1], dims[2], dims[3]))
    }

    fn output_name(graph: &GraphModel) -> String {
        graph
            .output()
            .and_then(|id| graph.node(id).map(|n| n.name.clone()))
            .unwrap_or_default()
    }
}
