//! BDD Tests for Warden Core

use cucumber::gherkin::Step;
use cucumber::{given, then, when, World};
use warden_core::*;

#[derive(Debug, World)]
#[world(init = Self::new)]
struct ValidationWorld {
    manifests: Vec<Manifest>,
    report: Option<ValidationReport>,
}

impl ValidationWorld {
    fn new() -> Self {
        Self {
            manifests: Vec::new(),
            report: None,
        }
    }

    fn report(&self) -> &ValidationReport {
        self.report.as_ref().expect("fleet was not validated")
    }
}

fn issue_kind(error: &FleetError) -> &'static str {
    match error {
        FleetError::Config { .. } => "config",
        FleetError::DuplicateAgent { .. } => "duplicate agent",
        FleetError::PortConflict { .. } => "port conflict",
        FleetError::PortOutOfRange { .. } => "port out of range",
        FleetError::UnknownDependency { .. } => "unknown dependency",
        FleetError::CyclicDependency { .. } => "cyclic dependency",
        _ => "other",
    }
}

#[given(expr = "a manifest {string}:")]
async fn given_manifest(world: &mut ValidationWorld, origin: String, step: &Step) {
    let contents = step.docstring.as_ref().expect("manifest body");
    let manifest =
        Manifest::parse(origin, contents, ManifestFormat::Yaml).expect("manifest should parse");
    world.manifests.push(manifest);
}

#[when("I validate the fleet")]
async fn when_validate(world: &mut ValidationWorld) {
    let loader = world
        .manifests
        .drain(..)
        .fold(ConfigLoader::new(), ConfigLoader::with_manifest);
    world.report = Some(validate(&loader));
}

#[then("the fleet should be valid")]
async fn then_valid(world: &mut ValidationWorld) {
    let report = world.report();
    assert!(report.is_valid(), "unexpected issues: {:?}", report.errors);
}

#[then("the fleet should be invalid")]
async fn then_invalid(world: &mut ValidationWorld) {
    assert!(!world.report().is_valid());
    assert!(world.report().launch_plan().is_none());
}

#[then(expr = "launch batch {int} should be {string}")]
async fn then_batch(world: &mut ValidationWorld, index: usize, expected: String) {
    let plan = world.report().launch_plan().expect("valid fleet has a plan");
    let batch = &plan.batches()[index - 1];
    let actual: Vec<&str> = batch.iter().map(AgentId::as_str).collect();
    assert_eq!(actual.join(", "), expected);
}

#[then(expr = "agent {string} should resolve to service port {int}")]
async fn then_service_port(world: &mut ValidationWorld, agent: String, port: u16) {
    let resolved = world.report().ports.get(&agent).expect("agent resolved");
    assert_eq!(resolved.service, port);
}

#[then(expr = "the report should list {int} {string} issues")]
async fn then_issue_count(world: &mut ValidationWorld, count: usize, kind: String) {
    let found = world
        .report()
        .errors
        .iter()
        .filter(|error| issue_kind(error) == kind)
        .count();
    assert_eq!(found, count, "issues: {:?}", world.report().errors);
}

#[then(expr = "the validation should warn that host {string} has no port offset")]
async fn then_offset_warning(world: &mut ValidationWorld, host: String) {
    let warned = world.report().warnings().iter().any(|warning| {
        matches!(warning, PortWarning::OffsetDefaulted { host: h } if h.as_str() == host)
    });
    assert!(warned, "warnings: {:?}", world.report().warnings());
}

#[tokio::main]
async fn main() {
    ValidationWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/features")
        .await;
}
