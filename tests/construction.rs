//! Integration test for full-tier construction: the canonical corrosion
//! segmentation request must assemble, validate and freeze with exactly
//! the structure its depth implies.

use segarch::fallback::FallbackOrchestrator;
use segarch::graph::{NodeKind, Role, TensorShape};
use segarch::nn::{ArchitectureAssembler, BuildRequest, InputSpec, Tier};
use segarch::validation::ArchitectureValidator;

use ndarray::{ArrayD, IxDyn};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// 256x256 RGB input, two classes, four levels: the reference request.
fn reference_request() -> BuildRequest {
    BuildRequest::new(InputSpec::new(256, 256, 3), 2, 4)
}

/// Expected node count of a full-tier network of the given depth:
/// the input, six nodes per encoder stage plus one pool per non-bottom
/// stage, seventeen nodes per gated decoder stage, and the head.
fn full_tier_node_count(depth: usize) -> usize {
    1 + 6 * depth + (depth - 1) + 17 * (depth - 1) + 1
}

#[test]
fn reference_request_builds_full_tier() {
    init_tracing();
    let built = FallbackOrchestrator::new()
        .construct(&reference_request())
        .expect("the reference request must construct at the full tier");

    assert_eq!(built.tier, Tier::Full);
    assert_eq!(built.node_count(), full_tier_node_count(4));
    assert_eq!(built.attention_gate_count(), 3);
    assert_eq!(built.network.encoder_stage_count(), 4);
    assert_eq!(built.network.decoder_stage_count(), 3);
    assert_eq!(built.network.output_shape(), TensorShape::new(256, 256, 2));
}

#[test]
fn every_node_is_shaped_after_validation() {
    let request = reference_request();
    let graph = ArchitectureAssembler::new()
        .assemble_full(&request)
        .unwrap();
    let network = ArchitectureValidator::validate(graph, request.input).unwrap();

    assert!(network.graph().nodes().all(|n| n.shape.is_some()));

    // The head must see full-resolution features again.
    let head = network.nodes_with_role(Role::Head)[0];
    assert_eq!(head.shape.unwrap(), TensorShape::new(256, 256, 2));
}

#[test]
fn filter_schedule_doubles_down_the_encoder() {
    let request = reference_request();
    let graph = ArchitectureAssembler::new()
        .assemble_full(&request)
        .unwrap();

    let filters_of = |name: &str| {
        graph
            .nodes()
            .find(|n| n.name == name)
            .map(|n| match n.kind {
                NodeKind::Conv { filters, .. } => filters,
                _ => 0,
            })
            .unwrap()
    };
    assert_eq!(filters_of("enc1.conv1"), 64);
    assert_eq!(filters_of("enc2.conv1"), 128);
    assert_eq!(filters_of("enc3.conv1"), 256);
    assert_eq!(filters_of("enc4.conv1"), 512);
}

#[test]
fn construction_is_deterministic() {
    let orchestrator = FallbackOrchestrator::new();
    let first = orchestrator.construct(&reference_request()).unwrap();
    let second = orchestrator.construct(&reference_request()).unwrap();
    assert_eq!(first.network.graph(), second.network.graph());
}

#[test]
fn predict_carries_the_batch_dimension() {
    init_tracing();
    // Smaller geometry keeps the smoke test cheap.
    let request = BuildRequest::new(InputSpec::new(64, 64, 3), 3, 3);
    let built = FallbackOrchestrator::new().construct(&request).unwrap();

    let batch = ArrayD::zeros(IxDyn(&[2, 64, 64, 3]));
    let scores = built.network.predict(&batch).unwrap();
    assert_eq!(scores.shape(), &[2, 64, 64, 3]);
}

#[test]
fn power_of_two_inputs_always_validate_at_full_tier() {
    // Spatial extents divisible by 2^depth reconstruct exactly, so the
    // full tier must succeed for every supported depth.
    for depth in 2..=5 {
        let request = BuildRequest::new(InputSpec::new(64, 64, 3), 2, depth);
        let built = FallbackOrchestrator::new()
            .construct(&request)
            .unwrap_or_else(|e| panic!("depth {} must validate: {}", depth, e));
        assert_eq!(built.tier, Tier::Full, "depth {}", depth);
        assert_eq!(built.attention_gate_count(), depth - 1, "depth {}", depth);
    }
}

#[test]
fn summary_reports_structure_and_parameters() {
    let request = BuildRequest::new(InputSpec::new(64, 64, 3), 2, 2);
    let built = FallbackOrchestrator::new().construct(&request).unwrap();

    let summary = built.network.to_string();
    assert!(summary.starts_with("CompiledNetwork:"));
    assert!(summary.contains("attention gates"));
    assert!(summary.contains("total parameters:"));
    assert!(built.network.parameter_estimate() > 100_000);
}
