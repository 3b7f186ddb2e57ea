//! Corrosion Segmentation Network Example
//!
//! This example demonstrates the full construction cycle: building the
//! attention-gated segmentation network for 256x256 RGB patches, printing
//! its summary, running a smoke-test forward pass, and showing how awkward
//! input geometry degrades the architecture through the tier ladder.
//!
//! Run with: `cargo run --example corrosion_net`

use ndarray::{ArrayD, IxDyn};
use segarch::fallback::{ConstructionError, FallbackOrchestrator};
use segarch::nn::{BuildRequest, InputSpec};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Corrosion Segmentation Network ===\n");

    // 256x256 RGB patches, three severity classes, four levels deep.
    let request = BuildRequest::new(InputSpec::new(256, 256, 3), 3, 4);
    let orchestrator = FallbackOrchestrator::new();

    let built = orchestrator
        .construct(&request)
        .expect("construction failed for the reference request");
    println!("Constructed at the {} tier.\n", built.tier);
    println!("{}", built.network);

    // Smoke-test forward pass on a single zero patch.
    let batch = ArrayD::zeros(IxDyn(&[1, 256, 256, 3]));
    let scores = built
        .network
        .predict(&batch)
        .expect("forward pass failed on the validated network");
    println!("\nForward pass produced scores of shape {:?}.", scores.shape());

    println!("\n=== Degradation: 100x100 input ===\n");

    // 100 pixels do not survive four halvings; the ladder answers with
    // the shallower simplified network instead of an error.
    let awkward = BuildRequest::new(InputSpec::new(100, 100, 3), 3, 4);
    let degraded = orchestrator
        .construct(&awkward)
        .expect("no tier survived the 100x100 request");
    println!(
        "Degraded to the {} tier with {} encoder stages and {} attention gates.",
        degraded.tier,
        degraded.network.encoder_stage_count(),
        degraded.attention_gate_count()
    );

    println!("\n=== Exhaustion: 9x9 input at depth 5 ===\n");

    // Impossible geometry exhausts every tier and reports each reason.
    let impossible = BuildRequest::new(InputSpec::new(9, 9, 3), 3, 5);
    match orchestrator.construct(&impossible) {
        Err(ConstructionError::FallbackExhausted { attempted, failures }) => {
            println!("All {} tiers failed:", attempted.len());
            for failure in failures {
                println!("  {}", failure);
            }
        }
        Ok(built) => println!("unexpectedly constructed at the {} tier", built.tier),
        Err(other) => println!("unexpected error: {}", other),
    }

    println!("\n=== Done ===");
}
