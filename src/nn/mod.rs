//! # Architecture Builders Module
//!
//! This module contains the building blocks for constructing segmentation
//! networks.
//!
//! In the graph-based architecture, each "builder" is a constructor that
//! adds a specific pattern of nodes to a
//! [`GraphModel`](crate::graph::GraphModel) and hands back the ports the
//! next builder should wire against.
//!
//! ## Available Builders
//!
//! ### Stages
//! - [`StageFactory`]: Encoder and decoder stages of the U-shaped network
//! - [`StageOptions`]: Filter schedule and regularization knobs
//!
//! ### Attention
//! - [`AttentionGateBuilder`]: Additive attention gate over a skip
//!   connection
//! - [`AttentionGateConfig`]: Channel reduction inside the gate
//!
//! ### Whole networks
//! - [`ArchitectureAssembler`]: Complete architectures in three tiers,
//!   from the fully gated network down to a plain encoder/decoder
//! - [`BuildRequest`]: Input geometry, class count and depth of a build
//!
//! ## Example
//!
//! ```ignore
//! use segarch::nn::{ArchitectureAssembler, BuildRequest, InputSpec};
//!
//! let assembler = ArchitectureAssembler::new();
//! let request = BuildRequest::new(InputSpec::new(256, 256, 3), 2, 4);
//!
//! let graph = assembler.assemble_full(&request)?;
//! ```

// Declare all submodules
pub mod assembler;
pub mod attention;
pub mod stage;

// Re-export structures for convenience
pub use assembler::{ArchitectureAssembler, BuildError, BuildRequest, InputSpec, Tier};
pub use attention::{AttentionGateBuilder, AttentionGateConfig};
pub use stage::{EncoderStage, StageFactory, StageOptions};
