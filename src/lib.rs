//! # segarch: Segmentation Architecture Construction with Validated Fallback
//!
//! **segarch** builds attention-gated U-shaped segmentation networks as
//! explicit computation graphs, validates them before any training system
//! sees them, and degrades gracefully through simpler variants when the
//! preferred architecture cannot be realized.
//!
//! The crate separates three concerns that are usually tangled together:
//!
//! - **Construction** ([`nn`]): stage factories and the assembler append
//!   nodes to an immutable-by-convention [`graph::GraphModel`].
//! - **Validation** ([`validation`]): structural checks, static shape
//!   propagation and a one-sample dry run gate every architecture.
//! - **Fallback** ([`fallback`]): a small state machine walks the tier
//!   ladder (full, simplified, plain) and reports every failed tier when
//!   it gives up.
//!
//! ## Usage Example
//!
//! ```no_run
//! use segarch::fallback::FallbackOrchestrator;
//! use segarch::nn::{BuildRequest, InputSpec};
//!
//! // 1. Describe the network: 256x256 RGB in, 2 classes, 4 levels deep
//! let request = BuildRequest::new(InputSpec::new(256, 256, 3), 2, 4);
//!
//! // 2. Construct with fallback
//! let built = FallbackOrchestrator::new().construct(&request).unwrap();
//!
//! // 3. The result is validated and ready for inspection
//! println!("{}", built.network);
//! ```

// Declare public modules that constitute the core library API.
pub mod analysis;
pub mod fallback;
pub mod graph;
pub mod network;
pub mod nn;
pub mod runtime;
pub mod validation;
