//! The validated, frozen form of an architecture.
//!
//! A [`CompiledNetwork`] is only ever produced by the validator, so
//! holding one is proof that the underlying graph is structurally sound,
//! fully shaped and instantiable. The graph inside is immutable from
//! here on; downstream consumers read it, summarize it or run forward
//! passes, but never grow it.

use crate::graph::{GraphModel, Node, NodeId, NodeKind, Role, TensorShape};
use crate::nn::assembler::InputSpec;
use crate::runtime::{Executor, RuntimeError};
use ndarray::ArrayD;
use std::fmt;

/// A validated architecture, ready for inspection and forward passes.
#[derive(Debug, Clone)]
pub struct CompiledNetwork {
    graph: GraphModel,
    input: InputSpec,
    output_shape: TensorShape,
}

impl CompiledNetwork {
    /// Freezes a fully validated graph. Only the validator calls this;
    /// every node is guaranteed to carry its inferred shape.
    pub(crate) fn freeze(graph: GraphModel, input: InputSpec, output_shape: TensorShape) -> Self {
        Self {
            graph,
            input,
            output_shape,
        }
    }

    /// Runs a forward pass over `batch`, shaped
    /// `[batch, height, width, channels]` to match the input
    /// specification.
    ///
    /// Structural operations compute real values; convolution stand-ins
    /// emit zero feature maps of the correct shape. The pass is meant for
    /// smoke tests and shape assertions, not for trained inference.
    pub fn predict(&self, batch: &ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
        Executor::run(&self.graph, batch)
    }

    /// Read-only access to the underlying graph.
    pub fn graph(&self) -> &GraphModel {
        &self.graph
    }

    pub fn input_spec(&self) -> InputSpec {
        self.input
    }

    /// Per-sample shape of the classifier output.
    pub fn output_shape(&self) -> TensorShape {
        self.output_shape
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of attention gates, counted by their gating product nodes.
    pub fn attention_gate_count(&self) -> usize {
        self.graph
            .nodes_with_role(Role::Attention)
            .filter(|n| matches!(n.kind, NodeKind::Multiply))
            .count()
    }

    /// Encoder levels including the bottleneck.
    pub fn encoder_stage_count(&self) -> usize {
        let pools = self
            .graph
            .nodes()
            .filter(|n| matches!(n.kind, NodeKind::Pool { .. }))
            .count();
        pools + 1
    }

    /// Decoder levels, one per upsampling step.
    pub fn decoder_stage_count(&self) -> usize {
        self.graph
            .nodes()
            .filter(|n| matches!(n.kind, NodeKind::Upsample { .. }))
            .count()
    }

    /// All nodes carrying `role`, in insertion order.
    pub fn nodes_with_role(&self, role: Role) -> Vec<&Node> {
        self.graph.nodes_with_role(role).collect()
    }

    /// Estimated trainable parameter count of the architecture.
    ///
    /// Convolutions count kernel weights plus biases, normalizations four
    /// values per channel; structural nodes hold no parameters.
    pub fn parameter_estimate(&self) -> usize {
        self.graph
            .nodes()
            .map(|node| self.node_parameters(node))
            .sum()
    }

    fn node_parameters(&self, node: &Node) -> usize {
        let in_channels = |id: NodeId| -> usize {
            self.graph
                .operands(id)
                .ok()
                .and_then(|ops| ops.first().copied())
                .and_then(|src| self.graph.node(src).ok())
                .and_then(|n| n.shape)
                .map(|s| s.channels)
                .unwrap_or(0)
        };
        match &node.kind {
            NodeKind::Conv {
                filters, kernel, ..
            } => kernel.0 * kernel.1 * in_channels(node.id) * filters + filters,
            NodeKind::ClassifierHead { classes } => in_channels(node.id) * classes + classes,
            NodeKind::Norm => node.shape.map(|s| 4 * s.channels).unwrap_or(0),
            _ => 0,
        }
    }
}

impl fmt::Display for CompiledNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CompiledNetwork: {} nodes, {} attention gates, input {}, output {}",
            self.node_count(),
            self.attention_gate_count(),
            self.input,
            self.output_shape
        )?;
        writeln!(
            f,
            "{:>4}  {:<24}{:<16}{:<14}{:>10}",
            "id", "name", "op", "output", "params"
        )?;
        for node in self.graph.nodes() {
            let shape = node
                .shape
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".to_string());
            writeln!(
                f,
                "{:>4}  {:<24}{:<16}{:<14}{:>10}",
                node.id,
                node.name,
                node.kind.label(),
                shape,
                self.node_parameters(node)
            )?;
        }
        write!(f, "total parameters: {}", self.parameter_estimate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::assembler::{ArchitectureAssembler, BuildRequest};
    use crate::validation::ArchitectureValidator;
    use ndarray::IxDyn;

    fn compiled(depth: usize) -> CompiledNetwork {
        let request = BuildRequest::new(InputSpec::new(64, 64, 3), 2, depth);
        let graph = ArchitectureAssembler::new()
            .assemble_full(&request)
            .unwrap();
        ArchitectureValidator::validate(graph, request.input).unwrap()
    }

    #[test]
    fn test_stage_and_gate_counts() {
        let network = compiled(4);
        assert_eq!(network.encoder_stage_count(), 4);
        assert_eq!(network.decoder_stage_count(), 3);
        assert_eq!(network.attention_gate_count(), 3);
    }

    #[test]
    fn test_predict_keeps_batch_and_sets_classes() {
        let network = compiled(2);
        let batch = ArrayD::zeros(IxDyn(&[3, 64, 64, 3]));
        let out = network.predict(&batch).unwrap();
        assert_eq!(out.shape(), &[3, 64, 64, 2]);
    }

    #[test]
    fn test_predict_rejects_wrong_geometry() {
        let network = compiled(2);
        let batch = ArrayD::zeros(IxDyn(&[1, 32, 64, 3]));
        let err = network.predict(&batch).unwrap_err();
        assert!(matches!(err, RuntimeError::BatchShapeMismatch { .. }));
    }

    #[test]
    fn test_first_conv_parameter_count() {
        let network = compiled(2);
        let conv = network
            .graph()
            .nodes()
            .find(|n| n.name == "enc1.conv1")
            .unwrap();
        // 3x3 kernel over 3 input channels into 64 filters, plus biases.
        assert_eq!(network.node_parameters(conv), 3 * 3 * 3 * 64 + 64);
        assert!(network.parameter_estimate() > 100_000);
    }

    #[test]
    fn test_summary_lists_every_node() {
        let network = compiled(2);
        let summary = network.to_string();
        assert!(summary.contains("enc1.conv1"));
        assert!(summary.contains("dec1.att.mask"));
        assert!(summary.contains("total parameters:"));
        assert_eq!(summary.lines().count(), 2 + network.node_count() + 1);
    }
}
