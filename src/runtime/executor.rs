//! CPU executor over a shaped graph.
//!
//! Walks the graph in topological order and materializes one `ndarray`
//! tensor per node. Tensors are NHWC: `[batch, height, width, channels]`.
//! The batch size is taken from the tensor fed by the caller; the graph
//! itself never fixes it.
//!
//! Intermediate results are cached in a memo keyed by node id and evicted
//! as soon as their last consumer has run, so a dry run over a large
//! architecture only holds the live slice of the network in memory.

use crate::graph::{Activation, GraphError, GraphModel, Node, NodeId, NodeKind, TensorShape};
use ndarray::{concatenate, s, ArrayD, Axis, Ix4, IxDyn};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Errors raised while executing a graph on the CPU.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("the input batch has rank {rank}, but the executor expects rank 4 in [batch, height, width, channels] layout")]
    BatchRank { rank: usize },

    #[error("the input batch has per-sample shape {got}, but the graph input expects {expected}. \
             Feed tensors matching the declared input specification.")]
    BatchShapeMismatch {
        expected: TensorShape,
        got: TensorShape,
    },

    #[error("tensor shape error at node '{node}': {message}")]
    ShapeError { node: String, message: String },

    #[error("value of node '{node}' was evicted or never computed. \
             The execution order is inconsistent with the graph edges.")]
    MissingOperandValue { node: String },
}

type Result<T> = std::result::Result<T, RuntimeError>;

/// Forward executor for validation dry runs and smoke-test inference.
pub struct Executor;

impl Executor {
    /// Executes `graph` on `batch` and returns the output node's tensor.
    ///
    /// Convolution and classifier nodes emit zero-filled tensors of their
    /// computed output shape; every structural operation runs for real,
    /// so geometry violations that static inference cannot see (or that a
    /// caller-provided tensor introduces) still surface as errors here.
    pub fn run(graph: &GraphModel, batch: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let output = graph.output()?;
        let order = graph.topological_order()?;
        debug!(nodes = order.len(), "executing graph");

        // Remaining consumer count per node, for memo eviction.
        let mut remaining = vec![0usize; graph.node_count()];
        for edge in graph.edges() {
            remaining[edge.src] += 1;
        }

        let mut memo: HashMap<NodeId, ArrayD<f32>> = HashMap::new();
        for id in order {
            let operand_ids = graph.operands(id)?;
            let node = graph.node(id)?;

            let result = {
                let mut operands = Vec::with_capacity(operand_ids.len());
                for op_id in &operand_ids {
                    let value =
                        memo.get(op_id)
                            .ok_or_else(|| RuntimeError::MissingOperandValue {
                                node: node.name.clone(),
                            })?;
                    operands.push(value);
                }
                Self::evaluate_node(node, &operands, batch)?
            };

            for op_id in &operand_ids {
                remaining[*op_id] -= 1;
                if remaining[*op_id] == 0 && *op_id != output {
                    memo.remove(op_id);
                }
            }
            memo.insert(id, result);
        }

        memo.remove(&output)
            .ok_or_else(|| RuntimeError::MissingOperandValue {
                node: graph
                    .node(output)
                    .map(|n| n.name.clone())
                    .unwrap_or_default(),
            })
    }

    /// Evaluates a single node given its operand tensors.
    fn evaluate_node(
        node: &Node,
        operands: &[&ArrayD<f32>],
        batch: &ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        match &node.kind {
            NodeKind::Input => {
                if batch.ndim() != 4 {
                    return Err(RuntimeError::BatchRank { rank: batch.ndim() });
                }
                let dims = batch.shape();
                let got = TensorShape::new(dims[1], dims[2], dims[3]);
                if let Some(expected) = node.shape {
                    if got != expected {
                        return Err(RuntimeError::BatchShapeMismatch { expected, got });
                    }
                }
                Ok(batch.clone())
            }

            NodeKind::Conv {
                filters,
                kernel,
                stride,
                padding,
                ..
            } => {
                let (b, h, w, _) = Self::dims4(node, operands[0])?;
                let padded = (h + 2 * padding.0, w + 2 * padding.1);
                let (oh, ow) = Self::windowed_extent(node, *kernel, *stride, padded)?;
                Ok(ArrayD::zeros(IxDyn(&[b, oh, ow, *filters])))
            }

            NodeKind::ClassifierHead { classes } => {
                let (b, h, w, _) = Self::dims4(node, operands[0])?;
                Ok(ArrayD::zeros(IxDyn(&[b, h, w, *classes])))
            }

            NodeKind::Norm => Ok(operands[0].clone()),

            NodeKind::Activation(Activation::Relu) => Ok(operands[0].mapv(|v| v.max(0.0))),

            NodeKind::Sigmoid => Ok(operands[0].mapv(|x| 1.0 / (1.0 + (-x).exp()))),

            NodeKind::Pool { kernel, stride } => Self::max_pool(node, operands[0], *kernel, *stride),

            NodeKind::Upsample { factor } => Self::upsample_nearest(node, operands[0], *factor),

            NodeKind::Concat => {
                let (left, right) = (operands[0], operands[1]);
                Self::dims4(node, left)?;
                Self::dims4(node, right)?;
                concatenate(Axis(3), &[left.view(), right.view()]).map_err(|e| {
                    RuntimeError::ShapeError {
                        node: node.name.clone(),
                        message: e.to_string(),
                    }
                })
            }

            NodeKind::Add => {
                let (left, right) = (operands[0], operands[1]);
                if left.shape() != right.shape() {
                    return Err(RuntimeError::ShapeError {
                        node: node.name.clone(),
                        message: format!(
                            "cannot add tensors of shapes {:?} and {:?}",
                            left.shape(),
                            right.shape()
                        ),
                    });
                }
                Ok(left + right)
            }

            NodeKind::Multiply => {
                let (left, right) = (operands[0], operands[1]);
                if left.shape() == right.shape() {
                    return Ok(left * right);
                }
                // Channel broadcast: a single-channel map scales every
                // channel of the other operand.
                let (wide, narrow) = if right.ndim() == 4 && right.shape()[3] == 1 {
                    (left, right)
                } else if left.ndim() == 4 && left.shape()[3] == 1 {
                    (right, left)
                } else {
                    return Err(RuntimeError::ShapeError {
                        node: node.name.clone(),
                        message: format!(
                            "cannot multiply tensors of shapes {:?} and {:?}",
                            left.shape(),
                            right.shape()
                        ),
                    });
                };
                let (b, h, w, _) = Self::dims4(node, wide)?;
                let (nb, nh, nw, _) = Self::dims4(node, narrow)?;
                if (b, h, w) != (nb, nh, nw) {
                    return Err(RuntimeError::ShapeError {
                        node: node.name.clone(),
                        message: format!(
                            "cannot broadcast {:?} across {:?}",
                            narrow.shape(),
                            wide.shape()
                        ),
                    });
                }
                Ok(ArrayD::from_shape_fn(wide.raw_dim(), |idx| {
                    wide[&idx] * narrow[[idx[0], idx[1], idx[2], 0]]
                }))
            }
        }
    }

    /// Max pooling over NHWC with no padding.
    fn max_pool(
        node: &Node,
        input: &ArrayD<f32>,
        kernel: (usize, usize),
        stride: (usize, usize),
    ) -> Result<ArrayD<f32>> {
        let arr = input
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| RuntimeError::ShapeError {
                node: node.name.clone(),
                message: e.to_string(),
            })?;
        let (b, h, w, c) = arr.dim();
        let (kh, kw) = kernel;
        let (oh, ow) = Self::windowed_extent(node, kernel, stride, (h, w))?;

        let mut out = ArrayD::zeros(IxDyn(&[b, oh, ow, c]));
        for b_idx in 0..b {
            for oh_idx in 0..oh {
                for ow_idx in 0..ow {
                    let h_start = oh_idx * stride.0;
                    let w_start = ow_idx * stride.1;
                    for c_idx in 0..c {
                        let window = arr.slice(s![
                            b_idx,
                            h_start..h_start + kh,
                            w_start..w_start + kw,
                            c_idx
                        ]);
                        let max_val = window
                            .iter()
                            .fold(f32::NEG_INFINITY, |max, &val| max.max(val));
                        out[[b_idx, oh_idx, ow_idx, c_idx]] = max_val;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Nearest-neighbor upsampling: every source pixel becomes an
    /// `fh` by `fw` block in the output.
    fn upsample_nearest(
        node: &Node,
        input: &ArrayD<f32>,
        factor: (usize, usize),
    ) -> Result<ArrayD<f32>> {
        if factor.0 == 0 || factor.1 == 0 {
            return Err(RuntimeError::ShapeError {
                node: node.name.clone(),
                message: "upsample factor components must be positive".to_string(),
            });
        }
        let (b, h, w, c) = Self::dims4(node, input)?;
        let (fh, fw) = factor;
        Ok(ArrayD::from_shape_fn(
            IxDyn(&[b, h * fh, w * fw, c]),
            |idx| input[[idx[0], idx[1] / fh, idx[2] / fw, idx[3]]],
        ))
    }

    fn dims4(node: &Node, tensor: &ArrayD<f32>) -> Result<(usize, usize, usize, usize)> {
        if tensor.ndim() != 4 {
            return Err(RuntimeError::ShapeError {
                node: node.name.clone(),
                message: format!(
                    "expected a rank-4 NHWC tensor, got rank {}",
                    tensor.ndim()
                ),
            });
        }
        let dims = tensor.shape();
        Ok((dims[0], dims[1], dims[2], dims[3]))
    }

    fn windowed_extent(
        node: &Node,
        kernel: (usize, usize),
        stride: (usize, usize),
        extent: (usize, usize),
    ) -> Result<(usize, usize)> {
        if kernel.0 == 0 || kernel.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(RuntimeError::ShapeError {
                node: node.name.clone(),
                message: "kernel and stride components must be positive".to_string(),
            });
        }
        if extent.0 < kernel.0 || extent.1 < kernel.1 {
            return Err(RuntimeError::ShapeError {
                node: node.name.clone(),
                message: format!(
                    "a {}x{} window does not fit a {}x{} feature map",
                    kernel.0, kernel.1, extent.0, extent.1
                ),
            });
        }
        Ok((
            (extent.0 - kernel.0) / stride.0 + 1,
            (extent.1 - kernel.1) / stride.1 + 1,
        ))
    }
}
