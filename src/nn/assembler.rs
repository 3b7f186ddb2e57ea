//! Whole-network assembly in three capacity tiers.
//!
//! The assembler turns a [`BuildRequest`] into a complete graph: an input
//! node, `depth` encoder stages ending in the bottleneck, the mirrored
//! decoder stages and a classifier head. Three tiers of the same skeleton
//! are offered:
//!
//! - **Full**: attention-gated skips at the configured capacity.
//! - **Simplified**: one level shallower with halved filters and weight
//!   decay, for inputs or budgets the full network cannot accommodate.
//! - **Plain**: the full-capacity skeleton with ungated skip connections.
//!
//! Assembly is purely structural. Whether the resulting graph is sound
//! for the requested input geometry is the validator's question, and a
//! graph that fails validation is simply dropped.

use crate::graph::{GraphError, GraphModel, NodeKind, Port, Role, TensorShape};
use crate::nn::stage::{StageFactory, StageOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Per-sample input geometry of a network, height/width/channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputSpec {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// The equivalent tensor shape fed to shape inference.
    pub fn shape(&self) -> TensorShape {
        TensorShape::new(self.height, self.width, self.channels)
    }
}

impl fmt::Display for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Capacity tier of an assembled architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Full,
    Simplified,
    Plain,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Full => "full",
            Tier::Simplified => "simplified",
            Tier::Plain => "plain",
        };
        write!(f, "{}", name)
    }
}

/// Everything needed to assemble one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub input: InputSpec,
    /// Score channels emitted by the classifier head.
    pub num_classes: usize,
    /// Encoder levels including the bottleneck.
    pub depth: usize,
    /// Tier to try first; `None` starts from the full network.
    pub preference: Option<Tier>,
}

impl BuildRequest {
    pub fn new(input: InputSpec, num_classes: usize, depth: usize) -> Self {
        Self {
            input,
            num_classes,
            depth,
            preference: None,
        }
    }

    pub fn with_preference(mut self, tier: Tier) -> Self {
        self.preference = Some(tier);
        self
    }
}

/// Errors raised while assembling a network.
///
/// The configuration variants describe requests no tier can satisfy;
/// [`BuildError::Graph`] wraps structural problems of one particular
/// assembly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("network depth must be at least 2, got {0}. \
             A U-shaped network needs an encoder and a decoder level around the bottleneck.")]
    DepthTooSmall(usize),

    #[error("input specification {0} has a zero dimension. \
             Height, width and channel count must all be positive.")]
    EmptyInput(InputSpec),

    #[error("the class count must be positive. \
             The classifier head cannot emit zero score channels.")]
    ZeroClasses,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl BuildError {
    /// True for request-level errors that no alternative tier can fix.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, BuildError::Graph(_))
    }
}

/// Assembles complete segmentation architectures.
#[derive(Debug, Clone, Default)]
pub struct ArchitectureAssembler {
    options: StageOptions,
}

impl ArchitectureAssembler {
    /// Creates an assembler with the default stage options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an assembler whose full tier uses `options`; the other
    /// tiers derive their settings from them.
    pub fn with_options(options: StageOptions) -> Self {
        Self { options }
    }

    /// Assembles the attention-gated network at full capacity.
    pub fn assemble_full(&self, request: &BuildRequest) -> Result<GraphModel, BuildError> {
        Self::check_request(request)?;
        self.assemble(request, request.depth, self.options.clone())
    }

    /// Assembles the reduced network: one level shallower (never below
    /// two) with halved filters and weight decay.
    pub fn assemble_simplified(&self, request: &BuildRequest) -> Result<GraphModel, BuildError> {
        Self::check_request(request)?;
        let depth = (request.depth - 1).max(2);
        self.assemble(request, depth, self.options.simplified())
    }

    /// Assembles the full-capacity skeleton with plain skip connections.
    pub fn assemble_plain(&self, request: &BuildRequest) -> Result<GraphModel, BuildError> {
        Self::check_request(request)?;
        self.assemble(request, request.depth, self.options.clone().with_attention(None))
    }

    /// Rejects requests no tier could ever satisfy: the depth must allow
    /// at least one encoder/decoder pair, and the input geometry and
    /// class count must be positive.
    pub fn check_request(request: &BuildRequest) -> Result<(), BuildError> {
        if request.depth < 2 {
            return Err(BuildError::DepthTooSmall(request.depth));
        }
        let input = request.input;
        if input.height == 0 || input.width == 0 || input.channels == 0 {
            return Err(BuildError::EmptyInput(input));
        }
        if request.num_classes == 0 {
            return Err(BuildError::ZeroClasses);
        }
        Ok(())
    }

    /// Shared skeleton: encoder chain, mirrored decoder chain, head.
    fn assemble(
        &self,
        request: &BuildRequest,
        depth: usize,
        options: StageOptions,
    ) -> Result<GraphModel, BuildError> {
        let factory = StageFactory::from_options(options);
        let mut graph = GraphModel::new();

        let input = graph.add_node("input", NodeKind::Input, Role::Stem)?;
        let mut cursor: Port = input.into();
        let mut skips = Vec::with_capacity(depth - 1);

        for index in 0..depth {
            let stage = factory.encoder_stage(&mut graph, cursor, index, depth)?;
            cursor = match stage.down {
                Some(down) => {
                    skips.push(stage.skip);
                    down
                }
                None => stage.skip,
            };
        }

        for index in (0..skips.len()).rev() {
            cursor = factory.decoder_stage(&mut graph, cursor, skips[index], index)?;
        }

        let head = graph.append(
            "head",
            NodeKind::ClassifierHead {
                classes: request.num_classes,
            },
            Role::Head,
            &[cursor],
        )?;
        graph.set_output(head)?;
        Ok(graph)
    }
}
