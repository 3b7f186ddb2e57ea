//! # Shape Inference
//!
//! Propagates per-sample tensor shapes through a graph in topological
//! order. Each node's output shape is derived from its operand shapes and
//! its geometry parameters, then stored on the node itself.
//!
//! Shapes here are batch-agnostic: a [`TensorShape`] describes a single
//! sample in height/width/channels layout. The executor re-derives the
//! batched form by prepending whatever batch size the caller feeds.
//!
//! The pass fails on the first node whose shape cannot be computed, which
//! is the failure a misconfigured architecture should produce before any
//! memory is committed. Typical causes are merge points whose operands
//! disagree (a concatenation fed by feature maps of different spatial
//! size) and windows that no longer fit a feature map that was pooled
//! too far down.

use crate::graph::{Activation, GraphError, GraphModel, Node, NodeKind, TensorShape};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("operands of '{node}' have incompatible shapes for {op}: left {left}, right {right}. \
             Merge points require matching spatial extents.")]
    IncompatibleShapes {
        node: String,
        op: &'static str,
        left: TensorShape,
        right: TensorShape,
    },

    #[error("the {window_h}x{window_w} window of '{node}' does not fit its {input} input. \
             The feature map has been reduced below the window size.")]
    WindowTooLarge {
        node: String,
        window_h: usize,
        window_w: usize,
        input: TensorShape,
    },

    #[error("node '{node}' declares a zero kernel, stride or upsample component")]
    DegenerateGeometry { node: String },

    #[error("node '{node}' would produce an empty feature map ({shape}). \
             Check filter counts, the class count and the input dimensions.")]
    EmptyFeatureMap { node: String, shape: TensorShape },

    #[error("operand shape of '{node}' was not computed before use. \
             The traversal order is inconsistent with the graph edges.")]
    MissingOperandShape { node: String },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Static shape propagation pass.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the pass, annotating every node of `graph` with its output
    /// shape and returning the shape of the declared output node.
    ///
    /// `input` is the per-sample shape fed to the graph's input node.
    pub fn run(graph: &mut GraphModel, input: TensorShape) -> Result<TensorShape> {
        let order = graph.topological_order()?;
        for id in order {
            let operand_ids = graph.operands(id)?;
            let mut operand_shapes = Vec::with_capacity(operand_ids.len());
            for op_id in operand_ids {
                let shape = graph.node(op_id)?.shape.ok_or_else(|| {
                    ShapeInferenceError::MissingOperandShape {
                        node: graph.node(id).map(|n| n.name.clone()).unwrap_or_default(),
                    }
                })?;
                operand_shapes.push(shape);
            }
            let node = graph.node(id)?;
            let shape = Self::infer_node_shape(node, &operand_shapes, input)?;
            trace!(node = %node.name, %shape, "inferred output shape");
            graph.node_mut(id)?.shape = Some(shape);
        }

        let output = graph.output()?;
        graph
            .node(output)?
            .shape
            .ok_or_else(|| ShapeInferenceError::MissingOperandShape {
                node: graph
                    .node(output)
                    .map(|n| n.name.clone())
                    .unwrap_or_default(),
            })
    }

    /// Computes the output shape of a single node from its operand shapes.
    fn infer_node_shape(
        node: &Node,
        operands: &[TensorShape],
        input: TensorShape,
    ) -> Result<TensorShape> {
        let shape = match &node.kind {
            NodeKind::Input => input,

            NodeKind::Conv {
                filters,
                kernel,
                stride,
                padding,
                ..
            } => {
                let src = operands[0];
                let padded = (src.height + 2 * padding.0, src.width + 2 * padding.1);
                let (h, w) = Self::windowed_extent(node, src, *kernel, *stride, padded)?;
                TensorShape::new(h, w, *filters)
            }

            NodeKind::ClassifierHead { classes } => {
                let src = operands[0];
                TensorShape::new(src.height, src.width, *classes)
            }

            NodeKind::Norm | NodeKind::Activation(Activation::Relu) | NodeKind::Sigmoid => {
                operands[0]
            }

            NodeKind::Pool { kernel, stride } => {
                let src = operands[0];
                let raw = (src.height, src.width);
                let (h, w) = Self::windowed_extent(node, src, *kernel, *stride, raw)?;
                TensorShape::new(h, w, src.channels)
            }

            NodeKind::Upsample { factor } => {
                if factor.0 == 0 || factor.1 == 0 {
                    return Err(ShapeInferenceError::DegenerateGeometry {
                        node: node.name.clone(),
                    });
                }
                let src = operands[0];
                TensorShape::new(src.height * factor.0, src.width * factor.1, src.channels)
            }

            NodeKind::Concat => {
                let (left, right) = (operands[0], operands[1]);
                if !left.same_spatial(&right) {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        node: node.name.clone(),
                        op: "Concat",
                        left,
                        right,
                    });
                }
                TensorShape::new(left.height, left.width, left.channels + right.channels)
            }

            NodeKind::Add => {
                let (left, right) = (operands[0], operands[1]);
                if left != right {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        node: node.name.clone(),
                        op: "Add",
                        left,
                        right,
                    });
                }
                left
            }

            NodeKind::Multiply => {
                let (left, right) = (operands[0], operands[1]);
                let broadcastable = left.same_spatial(&right)
                    && (left.channels == right.channels
                        || left.channels == 1
                        || right.channels == 1);
                if !broadcastable {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        node: node.name.clone(),
                        op: "Multiply",
                        left,
                        right,
                    });
                }
                TensorShape::new(left.height, left.width, left.channels.max(right.channels))
            }
        };

        if shape.height == 0 || shape.width == 0 || shape.channels == 0 {
            return Err(ShapeInferenceError::EmptyFeatureMap {
                node: node.name.clone(),
                shape,
            });
        }
        Ok(shape)
    }

    /// Output extent of a sliding window over a (possibly padded) input.
    ///
    /// `padded` carries the effective height and width after any padding
    /// was applied; pooling passes the raw extent.
    fn windowed_extent(
        node: &Node,
        src: TensorShape,
        kernel: (usize, usize),
        stride: (usize, usize),
        padded: (usize, usize),
    ) -> Result<(usize, usize)> {
        if kernel.0 == 0 || kernel.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(ShapeInferenceError::DegenerateGeometry {
                node: node.name.clone(),
            });
        }
        if padded.0 < kernel.0 || padded.1 < kernel.1 {
            return Err(ShapeInferenceError::WindowTooLarge {
                node: node.name.clone(),
                window_h: kernel.0,
                window_w: kernel.1,
                input: src,
            });
        }
        Ok((
            (padded.0 - kernel.0) / stride.0 + 1,
            (padded.1 - kernel.1) / stride.1 + 1,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Port, Role};

    fn conv(filters: usize, kernel: usize, padding: usize) -> NodeKind {
        NodeKind::Conv {
            filters,
            kernel: (kernel, kernel),
            stride: (1, 1),
            padding: (padding, padding),
            l2: 0.0,
        }
    }

    fn single_node_graph(kind: NodeKind) -> (GraphModel, Port) {
        let mut g = GraphModel::new();
        let input = g.add_node("input", NodeKind::Input, Role::Stem).unwrap();
        let out = g
            .append("node", kind, Role::Encoder, &[input.into()])
            .unwrap();
        (g, out)
    }

    fn run_single(kind: NodeKind, input: TensorShape) -> Result<TensorShape> {
        let (mut g, out) = single_node_graph(kind);
        g.set_output(out).unwrap();
        ShapeInference::run(&mut g, input)
    }

    #[test]
    fn test_same_padded_conv_keeps_spatial_extent() {
        let out = run_single(conv(64, 3, 1), TensorShape::new(256, 256, 3)).unwrap();
        assert_eq!(out, TensorShape::new(256, 256, 64));
    }

    #[test]
    fn test_pool_halves_even_extent() {
        let kind = NodeKind::Pool {
            kernel: (2, 2),
            stride: (2, 2),
        };
        let out = run_single(kind, TensorShape::new(64, 64, 16)).unwrap();
        assert_eq!(out, TensorShape::new(32, 32, 16));
    }

    #[test]
    fn test_pool_floors_odd_extent() {
        let kind = NodeKind::Pool {
            kernel: (2, 2),
            stride: (2, 2),
        };
        // (25 - 2) / 2 + 1 = 12: the lost row is what later breaks the
        // mirrored concatenation.
        let out = run_single(kind, TensorShape::new(25, 25, 16)).unwrap();
        assert_eq!(out, TensorShape::new(12, 12, 16));
    }

    #[test]
    fn test_upsample_doubles_extent() {
        let kind = NodeKind::Upsample { factor: (2, 2) };
        let out = run_single(kind, TensorShape::new(12, 12, 16)).unwrap();
        assert_eq!(out, TensorShape::new(24, 24, 16));
    }

    #[test]
    fn test_pool_window_must_fit() {
        let kind = NodeKind::Pool {
            kernel: (2, 2),
            stride: (2, 2),
        };
        let err = run_single(kind, TensorShape::new(1, 1, 16)).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::WindowTooLarge { .. }));
    }

    #[test]
    fn test_zero_filter_conv_rejected() {
        let err = run_single(conv(0, 3, 1), TensorShape::new(8, 8, 3)).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::EmptyFeatureMap { .. }));
    }

    #[test]
    fn test_zero_stride_rejected() {
        let kind = NodeKind::Conv {
            filters: 8,
            kernel: (3, 3),
            stride: (0, 1),
            padding: (1, 1),
            l2: 0.0,
        };
        let err = run_single(kind, TensorShape::new(8, 8, 3)).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::DegenerateGeometry { .. }));
    }

    fn two_branch_graph(merge: NodeKind, right_kind: NodeKind) -> GraphModel {
        let mut g = GraphModel::new();
        let input = g.add_node("input", NodeKind::Input, Role::Stem).unwrap();
        let left = g
            .append("left", NodeKind::Norm, Role::Encoder, &[input.into()])
            .unwrap();
        let right = g
            .append("right", right_kind, Role::Encoder, &[input.into()])
            .unwrap();
        let merged = g
            .append("merge", merge, Role::Decoder, &[left, right])
            .unwrap();
        g.set_output(merged).unwrap();
        g
    }

    #[test]
    fn test_concat_sums_channels() {
        let mut g = two_branch_graph(NodeKind::Concat, conv(24, 1, 0));
        let out = ShapeInference::run(&mut g, TensorShape::new(16, 16, 8)).unwrap();
        assert_eq!(out, TensorShape::new(16, 16, 32));
    }

    #[test]
    fn test_concat_spatial_mismatch_rejected() {
        let pool = NodeKind::Pool {
            kernel: (2, 2),
            stride: (2, 2),
        };
        let mut g = two_branch_graph(NodeKind::Concat, pool);
        let err = ShapeInference::run(&mut g, TensorShape::new(16, 16, 8)).unwrap_err();
        assert!(matches!(
            err,
            ShapeInferenceError::IncompatibleShapes { op: "Concat", .. }
        ));
    }

    #[test]
    fn test_add_requires_equal_shapes() {
        let mut g = two_branch_graph(NodeKind::Add, conv(24, 1, 0));
        let err = ShapeInference::run(&mut g, TensorShape::new(16, 16, 8)).unwrap_err();
        assert!(matches!(
            err,
            ShapeInferenceError::IncompatibleShapes { op: "Add", .. }
        ));
    }

    #[test]
    fn test_multiply_broadcasts_single_channel() {
        // The right branch collapses to one channel, as an attention map does.
        let mut g = two_branch_graph(NodeKind::Multiply, conv(1, 1, 0));
        let out = ShapeInference::run(&mut g, TensorShape::new(16, 16, 8)).unwrap();
        assert_eq!(out, TensorShape::new(16, 16, 8));
    }

    #[test]
    fn test_multiply_rejects_mismatched_channels() {
        let mut g = two_branch_graph(NodeKind::Multiply, conv(3, 1, 0));
        let err = ShapeInference::run(&mut g, TensorShape::new(16, 16, 8)).unwrap_err();
        assert!(matches!(
            err,
            ShapeInferenceError::IncompatibleShapes { op: "Multiply", .. }
        ));
    }

    #[test]
    fn test_classifier_head_sets_class_channels() {
        let kind = NodeKind::ClassifierHead { classes: 3 };
        let out = run_single(kind, TensorShape::new(64, 64, 32)).unwrap();
        assert_eq!(out, TensorShape::new(64, 64, 3));
    }

    #[test]
    fn test_strided_conv_downsamples() {
        let kind = NodeKind::Conv {
            filters: 16,
            kernel: (3, 3),
            stride: (2, 2),
            padding: (1, 1),
            l2: 0.0,
        };
        // (32 + 2 - 3) / 2 + 1 = 16
        let out = run_single(kind, TensorShape::new(32, 32, 8)).unwrap();
        assert_eq!(out, TensorShape::new(16, 16, 16));
    }
}
