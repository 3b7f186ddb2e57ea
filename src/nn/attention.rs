//! Module implementing the additive attention gate used on skip
//! connections of the segmentation network.
//!
//! The gate learns where the skip connection carries relevant detail: a
//! coarse gating signal from the decoder and the fine skip features are
//! both projected to a reduced channel space, added, rectified and
//! collapsed to a single-channel sigmoid mask that rescales the skip
//! features pixel by pixel. The output always has the skip connection's
//! shape, so gating never disturbs the downstream concatenation.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use segarch::nn::{AttentionGateBuilder, AttentionGateConfig};
//!
//! let builder = AttentionGateBuilder::new();
//!
//! // gating: upsampled decoder features, skip: encoder features
//! let gated = builder.build(&mut graph, "dec2.att", gating, skip, 128)?;
//! ```

use crate::graph::{Activation, GraphError, GraphModel, NodeKind, Port, Role};

/// Attention gate configuration.
#[derive(Debug, Clone, Copy)]
pub struct AttentionGateConfig {
    /// Channel reduction applied inside the gate: both signals are
    /// projected to `filters / reduction_factor` channels (at least one)
    /// before being compared.
    pub reduction_factor: usize,
}

impl Default for AttentionGateConfig {
    fn default() -> Self {
        Self {
            reduction_factor: 8,
        }
    }
}

impl AttentionGateConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reduction_factor(mut self, reduction_factor: usize) -> Self {
        self.reduction_factor = reduction_factor;
        self
    }

    /// Channels of the reduced comparison space for a stage of `filters`
    /// channels. Clamped so tiny stages still get a one-channel gate.
    pub fn inter_channels(&self, filters: usize) -> usize {
        if self.reduction_factor == 0 {
            return 1;
        }
        (filters / self.reduction_factor).max(1)
    }
}

/// Builder that appends one attention gate to a graph.
#[derive(Debug, Clone, Default)]
pub struct AttentionGateBuilder {
    config: AttentionGateConfig,
}

impl AttentionGateBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: AttentionGateConfig) -> Self {
        Self { config }
    }

    /// Appends the gate's nodes under the `name` prefix and returns the
    /// port of the gated skip connection.
    ///
    /// `gating` is the coarse decoder signal (already upsampled to the
    /// skip's spatial extent), `skip` the encoder features to be gated,
    /// and `filters` the channel count of the stage the gate serves.
    pub fn build(
        &self,
        graph: &mut GraphModel,
        name: &str,
        gating: Port,
        skip: Port,
        filters: usize,
    ) -> Result<Port, GraphError> {
        let inter = self.config.inter_channels(filters);
        let project = |filters: usize| NodeKind::Conv {
            filters,
            kernel: (1, 1),
            stride: (1, 1),
            padding: (0, 0),
            l2: 0.0,
        };

        let gating_proj = graph.append(
            format!("{}.gating_proj", name),
            project(inter),
            Role::Attention,
            &[gating],
        )?;
        let gating_norm = graph.append(
            format!("{}.gating_norm", name),
            NodeKind::Norm,
            Role::Attention,
            &[gating_proj],
        )?;
        let skip_proj = graph.append(
            format!("{}.skip_proj", name),
            project(inter),
            Role::Attention,
            &[skip],
        )?;
        let skip_norm = graph.append(
            format!("{}.skip_norm", name),
            NodeKind::Norm,
            Role::Attention,
            &[skip_proj],
        )?;
        let sum = graph.append(
            format!("{}.add", name),
            NodeKind::Add,
            Role::Attention,
            &[gating_norm, skip_norm],
        )?;
        let act = graph.append(
            format!("{}.relu", name),
            NodeKind::Activation(Activation::Relu),
            Role::Attention,
            &[sum],
        )?;
        let score = graph.append(
            format!("{}.score", name),
            project(1),
            Role::Attention,
            &[act],
        )?;
        let mask = graph.append(
            format!("{}.mask", name),
            NodeKind::Sigmoid,
            Role::Attention,
            &[score],
        )?;
        graph.append(
            format!("{}.gated", name),
            NodeKind::Multiply,
            Role::Attention,
            &[skip, mask],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ShapeInference;
    use crate::graph::TensorShape;

    fn gate_fixture(reduction: usize, filters: usize) -> (GraphModel, Port) {
        let mut graph = GraphModel::new();
        let input = graph
            .add_node("input", NodeKind::Input, Role::Stem)
            .unwrap();
        let skip = graph
            .append(
                "skip",
                NodeKind::Conv {
                    filters,
                    kernel: (3, 3),
                    stride: (1, 1),
                    padding: (1, 1),
                    l2: 0.0,
                },
                Role::Encoder,
                &[input.into()],
            )
            .unwrap();
        let gating = graph
            .append(
                "gating",
                NodeKind::Conv {
                    filters: filters * 2,
                    kernel: (1, 1),
                    stride: (1, 1),
                    padding: (0, 0),
                    l2: 0.0,
                },
                Role::Decoder,
                &[input.into()],
            )
            .unwrap();

        let builder =
            AttentionGateBuilder::from_config(AttentionGateConfig::new().with_reduction_factor(reduction));
        let gated = builder
            .build(&mut graph, "att", gating, skip, filters)
            .unwrap();
        graph.set_output(gated).unwrap();
        (graph, gated)
    }

    #[test]
    fn test_gate_appends_nine_nodes() {
        let (graph, _) = gate_fixture(8, 64);
        // input + skip conv + gating conv + the gate itself
        assert_eq!(graph.node_count(), 3 + 9);
        assert_eq!(graph.nodes_with_role(Role::Attention).count(), 9);
    }

    #[test]
    fn test_gate_preserves_skip_shape() {
        for filters in [8, 48, 64, 512] {
            let (mut graph, gated) = gate_fixture(8, filters);
            let out = ShapeInference::run(&mut graph, TensorShape::new(32, 32, 3)).unwrap();
            assert_eq!(out, TensorShape::new(32, 32, filters));
            assert_eq!(graph.node(gated.node).unwrap().shape, Some(out));
        }
    }

    #[test]
    fn test_reduction_clamps_to_one_channel() {
        let config = AttentionGateConfig::new().with_reduction_factor(8);
        assert_eq!(config.inter_channels(64), 8);
        assert_eq!(config.inter_channels(4), 1);
        assert_eq!(config.inter_channels(1), 1);
    }

    #[test]
    fn test_projection_channels_follow_reduction() {
        let (mut graph, _) = gate_fixture(4, 64);
        ShapeInference::run(&mut graph, TensorShape::new(32, 32, 3)).unwrap();
        let proj = graph
            .nodes()
            .find(|n| n.name == "att.gating_proj")
            .unwrap();
        assert_eq!(proj.shape.unwrap().channels, 16);
        let mask = graph.nodes().find(|n| n.name == "att.mask").unwrap();
        assert_eq!(mask.shape.unwrap().channels, 1);
    }

    #[test]
    fn test_gate_names_are_prefixed() {
        let (graph, _) = gate_fixture(8, 64);
        let gate_names: Vec<_> = graph
            .nodes_with_role(Role::Attention)
            .map(|n| n.name.as_str())
            .collect();
        assert!(gate_names.iter().all(|n| n.starts_with("att.")));
    }
}
