//! BDD Tests for the Warden CLI

use cucumber::gherkin::Step;
use cucumber::{given, then, when, World};
use serde_json::Value;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

#[derive(Debug, World)]
#[world(init = Self::new)]
struct CliWorld {
    dir: TempDir,
    manifests: Vec<PathBuf>,
    output: Option<Output>,
}

impl CliWorld {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            manifests: Vec::new(),
            output: None,
        }
    }

    fn run(&mut self, args: &str, manifests: &[PathBuf]) {
        let mut command = Command::new(env!("CARGO_BIN_EXE_warden"));
        command.args(args.split_whitespace());
        for manifest in manifests {
            command.arg("--manifest").arg(manifest);
        }
        self.output = Some(command.output().expect("warden binary runs"));
    }

    fn output(&self) -> &Output {
        self.output.as_ref().expect("no command was run")
    }

    fn combined(&self) -> String {
        let output = self.output();
        format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

#[given(expr = "a manifest {string}:")]
async fn given_manifest(world: &mut CliWorld, name: String, step: &Step) {
    let contents = step.docstring.as_ref().expect("manifest body");
    let path = world.dir.path().join(name);
    std::fs::write(&path, contents).expect("manifest written");
    world.manifests.push(path);
}

#[when(expr = "I run {string}")]
async fn when_run(world: &mut CliWorld, args: String) {
    let manifests = world.manifests.clone();
    world.run(&args, &manifests);
}

#[when(expr = "I run {string} with manifest {string}")]
async fn when_run_with(world: &mut CliWorld, args: String, name: String) {
    let path = world.dir.path().join(name);
    world.run(&args, &[path]);
}

#[then("the command should succeed")]
async fn then_success(world: &mut CliWorld) {
    assert!(world.output().status.success(), "output: {}", world.combined());
}

#[then("the command should fail")]
async fn then_failure(world: &mut CliWorld) {
    assert!(!world.output().status.success(), "output: {}", world.combined());
}

#[then(expr = "the output should contain {string}")]
async fn then_contains(world: &mut CliWorld, expected: String) {
    let combined = world.combined();
    assert!(combined.contains(&expected), "output: {combined}");
}

#[then(expr = "the output should not contain {string}")]
async fn then_not_contains(world: &mut CliWorld, unexpected: String) {
    let combined = world.combined();
    assert!(!combined.contains(&unexpected), "output: {combined}");
}

#[then(expr = "the JSON plan should have {int} batches")]
async fn then_json_batches(world: &mut CliWorld, count: usize) {
    let plan: Value = serde_json::from_slice(&world.output().stdout).expect("plan is JSON");
    let batches = plan["batches"].as_array().expect("batches array");
    assert_eq!(batches.len(), count);
}

#[tokio::main]
async fn main() {
    CliWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/features")
        .await;
}
