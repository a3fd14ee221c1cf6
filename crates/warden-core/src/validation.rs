//! Dry-run validation
//!
//! Runs manifest loading, port resolution and dependency validation without
//! launching anything, and gathers every issue in a single pass.

use crate::error::FleetError;
use crate::graph::{DependencyGraph, LaunchPlan};
use crate::manifest::{ConfigLoader, Fleet};
use crate::ports::{PortAssignments, PortResolver, PortWarning};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(Debug)]
pub struct ValidationReport {
    pub fleet: Fleet,
    pub ports: PortAssignments,
    pub graph: DependencyGraph,
    pub errors: Vec<FleetError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn warnings(&self) -> &[PortWarning] {
        self.ports.warnings()
    }

    /// Plan only when the topology is fully valid.
    pub fn launch_plan(&self) -> Option<LaunchPlan> {
        self.is_valid().then(|| self.graph.launch_plan())
    }

    /// Everything validated, handed over for a real run.
    pub fn into_validated(self) -> Result<ValidatedFleet, FleetError> {
        if !self.errors.is_empty() {
            return Err(FleetError::Validation(self.errors));
        }
        let plan = self.graph.launch_plan();
        Ok(ValidatedFleet {
            fleet: self.fleet,
            ports: self.ports,
            graph: self.graph,
            plan,
        })
    }
}

/// A fleet that passed every pre-launch check.
#[derive(Debug, Clone)]
pub struct ValidatedFleet {
    pub fleet: Fleet,
    pub ports: PortAssignments,
    pub graph: DependencyGraph,
    pub plan: LaunchPlan,
}

impl ValidatedFleet {
    /// Validate a fleet assembled in memory rather than from manifests.
    pub fn from_fleet(fleet: Fleet) -> Result<Self, FleetError> {
        let (ports, mut errors) = PortResolver::resolve_all(&fleet);
        let (graph, graph_errors) = DependencyGraph::build_all(&fleet);
        errors.extend(graph_errors);
        ValidationReport {
            fleet,
            ports,
            graph,
            errors,
        }
        .into_validated()
    }
}

/// Validate an in-memory loader.
#[instrument(skip(loader))]
pub fn validate(loader: &ConfigLoader) -> ValidationReport {
    let (fleet, mut errors) = loader.load_lenient();
    let (ports, port_errors) = PortResolver::resolve_all(&fleet);
    let (graph, graph_errors) = DependencyGraph::build_all(&fleet);
    errors.extend(port_errors);
    errors.extend(graph_errors);

    if errors.is_empty() {
        info!("Fleet of {} agents is valid", fleet.len());
    } else {
        warn!("Fleet validation found {} issue(s)", errors.len());
    }

    ValidationReport {
        fleet,
        ports,
        graph,
        errors,
    }
}

/// Validate manifests on disk, including files that fail to parse.
pub fn validate_paths<P: AsRef<Path>>(paths: &[P]) -> ValidationReport {
    let (loader, parse_errors) = ConfigLoader::from_paths(paths);
    let mut report = validate(&loader);
    let mut errors = parse_errors;
    errors.append(&mut report.errors);
    report.errors = errors;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, ManifestFormat};

    #[test]
    fn test_all_categories_reported_in_one_pass() {
        let yaml = r#"
host: primary
agents:
  - name: a
    service_port: 7000
    health_port: 7001
    dependencies: [b]
  - name: b
    service_port: 7000
    health_port: 7003
    dependencies: [a, ghost]
  - name: ""
    service_port: 7100
    health_port: 7101
"#;
        let loader = ConfigLoader::new()
            .with_manifest(Manifest::parse("primary.yaml", yaml, ManifestFormat::Yaml).unwrap());
        let report = validate(&loader);

        assert!(!report.is_valid());
        assert!(report.launch_plan().is_none());
        let has = |pred: fn(&FleetError) -> bool| report.errors.iter().any(pred);
        assert!(has(|e| matches!(e, FleetError::Config { .. })));
        assert!(has(|e| matches!(e, FleetError::PortConflict { .. })));
        assert!(has(|e| matches!(e, FleetError::UnknownDependency { .. })));
        assert!(has(|e| matches!(e, FleetError::CyclicDependency { .. })));
        assert_eq!(report.warnings().len(), 1);
    }

    #[test]
    fn test_malformed_dependency_is_not_reported_as_unknown() {
        let yaml = r#"
host: primary
port_offset: 0
agents:
  - name: vision
    service_port: 0
    health_port: 7201
  - name: planner
    service_port: 7300
    health_port: 7301
    dependencies: [vision, ghost]
"#;
        let loader = ConfigLoader::new()
            .with_manifest(Manifest::parse("primary.yaml", yaml, ManifestFormat::Yaml).unwrap());
        let report = validate(&loader);

        let unknown: Vec<&FleetError> = report
            .errors
            .iter()
            .filter(|e| matches!(e, FleetError::UnknownDependency { .. }))
            .collect();
        assert_eq!(unknown.len(), 1, "issues: {:?}", report.errors);
        assert!(unknown[0].to_string().contains("'ghost'"));
        assert!(report.errors.iter().any(|e| matches!(
            e,
            FleetError::Config { entry: Some(name), .. } if name == "vision"
        )));
    }

    #[test]
    fn test_unreadable_manifest_is_reported() {
        let report = validate_paths(&["/definitely/missing.yaml"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.into_validated().is_err());
    }

    #[test]
    fn test_in_memory_fleet_is_validated() {
        use crate::agent::{AgentSpec, Host};

        let fleet = Fleet::from_specs([
            AgentSpec::new("a", Host::Primary, 7000, 7001),
            AgentSpec::new("b", Host::Primary, 7002, 7003).with_dependencies(["a"]),
        ]);
        let validated = ValidatedFleet::from_fleet(fleet).unwrap();
        assert_eq!(validated.plan.batches().len(), 2);

        let looping = Fleet::from_specs([
            AgentSpec::new("a", Host::Primary, 7000, 7001).with_dependencies(["a"]),
        ]);
        assert!(matches!(
            ValidatedFleet::from_fleet(looping),
            Err(FleetError::Validation(_))
        ));
    }
}
