//! Encoder and decoder stage construction.
//!
//! A stage is the repeating unit of the U-shaped network. Encoder stages
//! refine features with two convolution blocks and hand a pooled copy to
//! the next level; decoder stages upsample, optionally gate the matching
//! skip connection, merge and refine. The factory owns the filter
//! schedule and regularization settings so every stage of a network is
//! built from one consistent set of options.

use crate::graph::{Activation, GraphError, GraphModel, NodeKind, Port, Role};
use crate::nn::attention::{AttentionGateBuilder, AttentionGateConfig};

/// Options shared by every stage of one architecture.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Filters of the first encoder stage; deeper stages double it.
    pub base_filters: usize,
    /// Weight decay factor recorded on encoder convolutions.
    pub encoder_l2: f32,
    /// Weight decay factor recorded on decoder convolutions.
    pub decoder_l2: f32,
    /// Attention gate settings, or `None` for plain skip connections.
    pub attention: Option<AttentionGateConfig>,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            base_filters: 64,
            encoder_l2: 1e-4,
            decoder_l2: 1e-5,
            attention: Some(AttentionGateConfig::default()),
        }
    }
}

impl StageOptions {
    /// Creates the default options.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_filters(mut self, base_filters: usize) -> Self {
        self.base_filters = base_filters;
        self
    }

    pub fn with_encoder_l2(mut self, encoder_l2: f32) -> Self {
        self.encoder_l2 = encoder_l2;
        self
    }

    pub fn with_decoder_l2(mut self, decoder_l2: f32) -> Self {
        self.decoder_l2 = decoder_l2;
        self
    }

    pub fn with_attention(mut self, attention: Option<AttentionGateConfig>) -> Self {
        self.attention = attention;
        self
    }

    /// Filter count of the stage at `index`, doubling level by level and
    /// saturating instead of overflowing for absurd depths.
    pub fn filters_at(&self, index: usize) -> usize {
        (0..index).fold(self.base_filters, |f, _| f.saturating_mul(2))
    }

    /// Derives the reduced-capacity variant of these options: half the
    /// filters (but at least 8) and half the weight decay. Attention
    /// settings are kept as they are.
    pub fn simplified(&self) -> Self {
        Self {
            base_filters: (self.base_filters / 2).max(8),
            encoder_l2: self.encoder_l2 * 0.5,
            decoder_l2: self.decoder_l2 * 0.5,
            attention: self.attention,
        }
    }
}

/// Ports produced by one encoder stage.
#[derive(Debug, Clone, Copy)]
pub struct EncoderStage {
    /// Refined features at this level, kept for the mirrored decoder.
    pub skip: Port,
    /// Pooled features feeding the next level, absent on the bottleneck.
    pub down: Option<Port>,
}

/// Builds encoder and decoder stages onto a graph.
#[derive(Debug, Clone, Default)]
pub struct StageFactory {
    options: StageOptions,
}

impl StageFactory {
    /// Creates a factory with the default options.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(options: StageOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// Appends one `conv -> norm -> relu` block under `prefix` with the
    /// given block ordinal and returns the activation port.
    fn conv_block(
        &self,
        graph: &mut GraphModel,
        prefix: &str,
        ordinal: usize,
        input: Port,
        filters: usize,
        l2: f32,
        role: Role,
    ) -> Result<Port, GraphError> {
        let conv = graph.append(
            format!("{}.conv{}", prefix, ordinal),
            NodeKind::Conv {
                filters,
                kernel: (3, 3),
                stride: (1, 1),
                padding: (1, 1),
                l2,
            },
            role,
            &[input],
        )?;
        let norm = graph.append(
            format!("{}.norm{}", prefix, ordinal),
            NodeKind::Norm,
            role,
            &[conv],
        )?;
        graph.append(
            format!("{}.relu{}", prefix, ordinal),
            NodeKind::Activation(Activation::Relu),
            role,
            &[norm],
        )
    }

    /// Builds encoder stage `index` of a network `depth` levels deep.
    ///
    /// Every stage refines its input with two convolution blocks. All
    /// stages except the last also pool the result down for the next
    /// level; the last stage is the bottleneck and returns no `down`
    /// port.
    pub fn encoder_stage(
        &self,
        graph: &mut GraphModel,
        input: Port,
        index: usize,
        depth: usize,
    ) -> Result<EncoderStage, GraphError> {
        let filters = self.options.filters_at(index);
        let prefix = format!("enc{}", index + 1);
        let l2 = self.options.encoder_l2;

        let refined = self.conv_block(graph, &prefix, 1, input, filters, l2, Role::Encoder)?;
        let skip = self.conv_block(graph, &prefix, 2, refined, filters, l2, Role::Encoder)?;

        let down = if index + 1 < depth {
            Some(graph.append(
                format!("{}.pool", prefix),
                NodeKind::Pool {
                    kernel: (2, 2),
                    stride: (2, 2),
                },
                Role::Encoder,
                &[skip],
            )?)
        } else {
            None
        };
        Ok(EncoderStage { skip, down })
    }

    /// Builds the decoder stage mirroring encoder stage `index`.
    ///
    /// The stage upsamples `input` back to the skip connection's spatial
    /// extent, gates the skip if attention is enabled, concatenates both
    /// and refines the merge with two convolution blocks.
    pub fn decoder_stage(
        &self,
        graph: &mut GraphModel,
        input: Port,
        skip: Port,
        index: usize,
    ) -> Result<Port, GraphError> {
        let filters = self.options.filters_at(index);
        let prefix = format!("dec{}", index + 1);
        let l2 = self.options.decoder_l2;

        let up = graph.append(
            format!("{}.up", prefix),
            NodeKind::Upsample { factor: (2, 2) },
            Role::Decoder,
            &[input],
        )?;
        let skip = match self.options.attention {
            Some(config) => AttentionGateBuilder::from_config(config).build(
                graph,
                &format!("{}.att", prefix),
                up,
                skip,
                filters,
            )?,
            None => skip,
        };
        let merged = graph.append(
            format!("{}.concat", prefix),
            NodeKind::Concat,
            Role::Decoder,
            &[up, skip],
        )?;
        let refined = self.conv_block(graph, &prefix, 1, merged, filters, l2, Role::Decoder)?;
        self.conv_block(graph, &prefix, 2, refined, filters, l2, Role::Decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ShapeInference;
    use crate::graph::TensorShape;

    #[test]
    fn test_filter_schedule_doubles() {
        let options = StageOptions::new();
        assert_eq!(options.filters_at(0), 64);
        assert_eq!(options.filters_at(1), 128);
        assert_eq!(options.filters_at(2), 256);
        assert_eq!(options.filters_at(3), 512);
    }

    #[test]
    fn test_filter_schedule_saturates() {
        let options = StageOptions::new();
        // Deep enough to overflow a shift; must saturate, not panic.
        assert_eq!(options.filters_at(200), usize::MAX);
    }

    #[test]
    fn test_simplified_options_halve_capacity() {
        let simplified = StageOptions::new().simplified();
        assert_eq!(simplified.base_filters, 32);
        assert!((simplified.encoder_l2 - 5e-5).abs() < 1e-12);
        assert!(simplified.attention.is_some());
        // Tiny schedules keep a usable minimum width.
        let floor = StageOptions::new().with_base_filters(10).simplified();
        assert_eq!(floor.base_filters, 8);
    }

    #[test]
    fn test_encoder_stage_pools_until_bottleneck() {
        let factory = StageFactory::new();
        let mut graph = GraphModel::new();
        let input = graph
            .add_node("input", NodeKind::Input, Role::Stem)
            .unwrap();

        let first = factory
            .encoder_stage(&mut graph, input.into(), 0, 2)
            .unwrap();
        assert!(first.down.is_some());
        let bottleneck = factory
            .encoder_stage(&mut graph, first.down.unwrap(), 1, 2)
            .unwrap();
        assert!(bottleneck.down.is_none());

        // conv/norm/relu twice per stage, one pool on the first.
        assert_eq!(graph.node_count(), 1 + 7 + 6);
    }

    #[test]
    fn test_encoder_stage_shapes() {
        let factory = StageFactory::new();
        let mut graph = GraphModel::new();
        let input = graph
            .add_node("input", NodeKind::Input, Role::Stem)
            .unwrap();
        let stage = factory
            .encoder_stage(&mut graph, input.into(), 0, 2)
            .unwrap();
        let down = stage.down.unwrap();
        graph.set_output(down).unwrap();

        ShapeInference::run(&mut graph, TensorShape::new(64, 64, 3)).unwrap();
        let skip_shape = graph.node(stage.skip.node).unwrap().shape.unwrap();
        let down_shape = graph.node(down.node).unwrap().shape.unwrap();
        assert_eq!(skip_shape, TensorShape::new(64, 64, 64));
        assert_eq!(down_shape, TensorShape::new(32, 32, 64));
    }

    #[test]
    fn test_decoder_stage_with_attention_counts() {
        let factory = StageFactory::new();
        let mut graph = GraphModel::new();
        let input = graph
            .add_node("input", NodeKind::Input, Role::Stem)
            .unwrap();
        let enc = factory
            .encoder_stage(&mut graph, input.into(), 0, 2)
            .unwrap();
        let bottleneck = factory
            .encoder_stage(&mut graph, enc.down.unwrap(), 1, 2)
            .unwrap();
        let before = graph.node_count();

        let out = factory
            .decoder_stage(&mut graph, bottleneck.skip, enc.skip, 0)
            .unwrap();
        // up + 9 gate nodes + concat + two conv blocks
        assert_eq!(graph.node_count() - before, 1 + 9 + 1 + 6);
        assert_eq!(graph.nodes_with_role(Role::Attention).count(), 9);

        graph.set_output(out).unwrap();
        let shape = ShapeInference::run(&mut graph, TensorShape::new(64, 64, 3)).unwrap();
        assert_eq!(shape, TensorShape::new(64, 64, 64));
    }

    #[test]
    fn test_decoder_stage_plain_has_no_attention() {
        let factory = StageFactory::from_options(StageOptions::new().with_attention(None));
        let mut graph = GraphModel::new();
        let input = graph
            .add_node("input", NodeKind::Input, Role::Stem)
            .unwrap();
        let enc = factory
            .encoder_stage(&mut graph, input.into(), 0, 2)
            .unwrap();
        let bottleneck = factory
            .encoder_stage(&mut graph, enc.down.unwrap(), 1, 2)
            .unwrap();
        let before = graph.node_count();

        factory
            .decoder_stage(&mut graph, bottleneck.skip, enc.skip, 0)
            .unwrap();
        assert_eq!(graph.node_count() - before, 1 + 1 + 6);
        assert_eq!(graph.nodes_with_role(Role::Attention).count(), 0);
    }
}
