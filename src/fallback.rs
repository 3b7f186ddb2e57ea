//! Tiered construction with explicit fallback.
//!
//! Building the preferred architecture can fail for reasons that a less
//! demanding variant survives, so construction walks a fixed ladder of
//! tiers: the full attention-gated network, then the simplified reduced
//! network, then the plain ungated one. The walk is modeled as a small
//! state machine rather than nested retries, which keeps the tier order
//! and the termination conditions visible and testable on their own.
//!
//! Two rules shape the machine:
//!
//! - A request-level configuration error is fatal wherever it surfaces;
//!   no other tier is tried, because no other tier could satisfy the
//!   request either.
//! - Every other failure (structural, shape, instantiation) advances to
//!   the next tier. Each tier is attempted at most once, and when the
//!   ladder runs out the caller gets every attempted tier with the
//!   reason it failed.

use crate::graph::GraphModel;
use crate::network::CompiledNetwork;
use crate::nn::assembler::{ArchitectureAssembler, BuildError, BuildRequest, Tier};
use crate::validation::ArchitectureValidator;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

/// One failed tier and the reason it was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: Tier,
    pub reason: String,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.reason)
    }
}

fn describe_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors with which construction gives up entirely.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionError {
    /// The request itself is unsatisfiable; no tier was or will be tried.
    #[error("architecture request rejected: {0}")]
    Configuration(BuildError),

    /// Every tier on the ladder was attempted and failed.
    #[error("all {} attempted tier(s) failed: {}", .attempted.len(), describe_failures(.failures))]
    FallbackExhausted {
        attempted: Vec<Tier>,
        failures: Vec<TierFailure>,
    },
}

/// States of the construction ladder.
///
/// The machine starts at the preferred tier's `Try` state, moves through
/// [`OrchestratorState::next`] on tier failure, and terminates in
/// `Succeeded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    TryFull,
    TrySimplified,
    TryPlain,
    Succeeded,
    Failed,
}

impl OrchestratorState {
    /// Initial state for a request, honoring its tier preference.
    pub fn starting(preference: Option<Tier>) -> Self {
        match preference {
            None | Some(Tier::Full) => OrchestratorState::TryFull,
            Some(Tier::Simplified) => OrchestratorState::TrySimplified,
            Some(Tier::Plain) => OrchestratorState::TryPlain,
        }
    }

    /// Tier attempted in this state, if it is not terminal.
    pub fn tier(self) -> Option<Tier> {
        match self {
            OrchestratorState::TryFull => Some(Tier::Full),
            OrchestratorState::TrySimplified => Some(Tier::Simplified),
            OrchestratorState::TryPlain => Some(Tier::Plain),
            OrchestratorState::Succeeded | OrchestratorState::Failed => None,
        }
    }

    /// State after the current tier failed. Terminal states are absorbing.
    pub fn next(self) -> Self {
        match self {
            OrchestratorState::TryFull => OrchestratorState::TrySimplified,
            OrchestratorState::TrySimplified => OrchestratorState::TryPlain,
            OrchestratorState::TryPlain => OrchestratorState::Failed,
            terminal => terminal,
        }
    }
}

/// One rung of the construction ladder: a tier tag and the function that
/// assembles its graph.
pub struct ArchitectureVariant {
    tier: Tier,
    build: Box<dyn Fn(&BuildRequest) -> Result<GraphModel, BuildError> + Send + Sync>,
}

impl ArchitectureVariant {
    pub fn new(
        tier: Tier,
        build: impl Fn(&BuildRequest) -> Result<GraphModel, BuildError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            tier,
            build: Box::new(build),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The standard ladder over one assembler: full, simplified, plain.
    fn standard(assembler: &ArchitectureAssembler) -> Vec<Self> {
        let full = assembler.clone();
        let simplified = assembler.clone();
        let plain = assembler.clone();
        vec![
            Self::new(Tier::Full, move |request| full.assemble_full(request)),
            Self::new(Tier::Simplified, move |request| {
                simplified.assemble_simplified(request)
            }),
            Self::new(Tier::Plain, move |request| plain.assemble_plain(request)),
        ]
    }
}

impl fmt::Debug for ArchitectureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchitectureVariant")
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

/// Walks the tier ladder until a variant validates or the ladder ends.
pub struct FallbackOrchestrator {
    variants: Vec<ArchitectureVariant>,
}

impl Default for FallbackOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackOrchestrator {
    /// Creates the orchestrator with the standard three-tier ladder.
    pub fn new() -> Self {
        Self::with_assembler(ArchitectureAssembler::new())
    }

    /// Standard ladder over a customized assembler.
    pub fn with_assembler(assembler: ArchitectureAssembler) -> Self {
        Self {
            variants: ArchitectureVariant::standard(&assembler),
        }
    }

    /// Replaces the ladder with caller-provided variants. Intended for
    /// tests and experiments; tiers missing from the list simply fail
    /// their attempt.
    pub fn with_variants(variants: Vec<ArchitectureVariant>) -> Self {
        Self { variants }
    }

    /// Constructs a validated network for `request`, falling back through
    /// the tiers on non-fatal failures.
    pub fn construct(&self, request: &BuildRequest) -> Result<BuiltArchitecture, ConstructionError> {
        ArchitectureAssembler::check_request(request).map_err(ConstructionError::Configuration)?;

        let mut state = OrchestratorState::starting(request.preference);
        let mut attempted = Vec::new();
        let mut failures = Vec::new();

        while let Some(tier) = state.tier() {
            attempted.push(tier);
            match self.attempt(tier, request) {
                Ok(network) => {
                    state = OrchestratorState::Succeeded;
                    info!(
                        %tier,
                        ?state,
                        nodes = network.node_count(),
                        gates = network.attention_gate_count(),
                        "architecture constructed"
                    );
                    return Ok(BuiltArchitecture { tier, network });
                }
                Err(AttemptError::Configuration(error)) => {
                    warn!(%tier, %error, "request rejected as unsatisfiable");
                    return Err(ConstructionError::Configuration(error));
                }
                Err(AttemptError::TierFailed(reason)) => {
                    warn!(%tier, %reason, "tier failed, advancing");
                    failures.push(TierFailure { tier, reason });
                    state = state.next();
                }
            }
        }

        warn!(attempts = attempted.len(), "all tiers exhausted");
        Err(ConstructionError::FallbackExhausted {
            attempted,
            failures,
        })
    }

    /// Assembles and validates one tier.
    fn attempt(&self, tier: Tier, request: &BuildRequest) -> Result<CompiledNetwork, AttemptError> {
        let variant = self
            .variants
            .iter()
            .find(|v| v.tier() == tier)
            .ok_or_else(|| {
                AttemptError::TierFailed(format!("no variant registered for the {} tier", tier))
            })?;
        let graph = (variant.build)(request).map_err(|error| {
            if error.is_configuration() {
                AttemptError::Configuration(error)
            } else {
                AttemptError::TierFailed(error.to_string())
            }
        })?;
        ArchitectureValidator::validate(graph, request.input)
            .map_err(|error| AttemptError::TierFailed(error.to_string()))
    }
}

/// Outcome of a successful construction.
#[derive(Debug, Clone)]
pub struct BuiltArchitecture {
    /// Tier whose variant validated.
    pub tier: Tier,
    /// The validated network.
    pub network: CompiledNetwork,
}

impl BuiltArchitecture {
    pub fn node_count(&self) -> usize {
        self.network.node_count()
    }

    pub fn attention_gate_count(&self) -> usize {
        self.network.attention_gate_count()
    }
}

enum AttemptError {
    Configuration(BuildError),
    TierFailed(String),
}
