//! Manifest loading
//!
//! One manifest per host declares that host's agents and its port offset.
//! [`ConfigLoader`] merges them into a single [`Fleet`], reporting every
//! malformed or duplicate entry it finds rather than stopping at the first.

use crate::agent::{
    AgentId, AgentSpec, CommandSpec, HealthCheckSpec, Host, ResourceHints, RestartPolicy,
};
use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, instrument};

/// Serialized form of a per-host manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestDocument {
    pub host: Host,
    /// Added to every declared port on this host. Absent means 0, which the
    /// port resolver reports as a warning.
    pub port_offset: Option<i32>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

/// One agent as written in a manifest; the host comes from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEntry {
    pub name: String,
    pub service_port: u16,
    pub health_port: u16,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub health: HealthCheckSpec,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub resources: ResourceHints,
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub replica: bool,
}

/// A parsed manifest together with where it came from.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub origin: String,
    pub document: ManifestDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Yaml,
    Json,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

impl Manifest {
    pub fn parse(
        origin: impl Into<String>,
        contents: &str,
        format: ManifestFormat,
    ) -> Result<Self> {
        let origin = origin.into();
        let document = match format {
            ManifestFormat::Yaml => serde_yaml::from_str(contents)
                .map_err(|e| FleetError::config(origin.clone(), e.to_string()))?,
            ManifestFormat::Json => serde_json::from_str(contents)
                .map_err(|e| FleetError::config(origin.clone(), e.to_string()))?,
        };
        Ok(Self { origin, document })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let format = ManifestFormat::from_path(path).ok_or_else(|| {
            FleetError::config(
                origin.clone(),
                "unsupported extension, expected .yaml, .yml or .json",
            )
        })?;
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FleetError::config(origin.clone(), e.to_string()))?;
        Self::parse(origin, &contents, format)
    }
}

/// Validated, immutable agent set for one deployment cycle.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    agents: BTreeMap<AgentId, AgentSpec>,
    offsets: BTreeMap<Host, Option<i32>>,
    /// Names declared in a manifest whose entry was rejected by a lenient load.
    rejected: BTreeSet<String>,
}

impl Fleet {
    /// Build a fleet directly from specs, bypassing manifest validation.
    pub fn from_specs(specs: impl IntoIterator<Item = AgentSpec>) -> Self {
        let agents: BTreeMap<_, _> = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        let offsets = agents.values().map(|spec| (spec.host, Some(0))).collect();
        Self {
            agents,
            offsets,
            rejected: BTreeSet::new(),
        }
    }

    pub fn with_offset(mut self, host: Host, offset: Option<i32>) -> Self {
        self.offsets.insert(host, offset);
        self
    }

    pub fn get(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.get(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &AgentId> {
        self.agents.keys()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Declared offset per host; `None` when the manifest omitted it.
    pub fn offsets(&self) -> &BTreeMap<Host, Option<i32>> {
        &self.offsets
    }

    /// Whether `name` was declared but dropped because its entry was invalid.
    pub fn is_rejected(&self, name: &str) -> bool {
        self.rejected.contains(name)
    }

    /// Resolve a dependency reference: an exact id first, otherwise every
    /// replica carrying that name.
    pub fn resolve_reference(&self, reference: &str) -> Vec<AgentId> {
        if self.agents.contains_key(reference) {
            return vec![AgentId::new(reference)];
        }
        self.agents
            .values()
            .filter(|spec| spec.name == reference)
            .map(|spec| spec.id.clone())
            .collect()
    }
}

/// Merges per-host manifests into a [`Fleet`].
#[derive(Debug, Default)]
pub struct ConfigLoader {
    manifests: Vec<Manifest>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifests.push(manifest);
        self
    }

    pub fn add_manifest(&mut self, manifest: Manifest) -> &mut Self {
        self.manifests.push(manifest);
        self
    }

    /// Load every path, collecting parse failures instead of stopping early.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> (Self, Vec<FleetError>) {
        let mut loader = Self::new();
        let mut errors = Vec::new();
        for path in paths {
            match Manifest::from_path(path) {
                Ok(manifest) => {
                    loader.add_manifest(manifest);
                }
                Err(e) => errors.push(e),
            }
        }
        (loader, errors)
    }

    /// Strict load: any issue fails the whole set.
    #[instrument(skip(self), fields(manifests = self.manifests.len()))]
    pub fn load(&self) -> Result<Fleet> {
        let (fleet, errors) = self.load_lenient();
        if errors.is_empty() {
            info!("Loaded {} agents from {} manifests", fleet.len(), self.manifests.len());
            Ok(fleet)
        } else {
            Err(FleetError::Validation(errors))
        }
    }

    /// Load everything that is valid and return the issues alongside, so a
    /// dry run can keep validating ports and dependencies of the valid part.
    pub fn load_lenient(&self) -> (Fleet, Vec<FleetError>) {
        let mut errors = Vec::new();
        let mut offsets = BTreeMap::new();
        let mut accepted_manifests: Vec<&Manifest> = Vec::new();

        for manifest in &self.manifests {
            let host = manifest.document.host;
            if let Some(first) = accepted_manifests.iter().find(|m| m.document.host == host) {
                errors.push(FleetError::config(
                    manifest.origin.clone(),
                    format!("host {} already declared by {}", host, first.origin),
                ));
                continue;
            }
            offsets.insert(host, manifest.document.port_offset);
            accepted_manifests.push(manifest);
        }

        let mut candidates: Vec<AgentSpec> = Vec::new();
        let mut rejected = BTreeSet::new();
        for manifest in accepted_manifests {
            for entry in &manifest.document.agents {
                let issues = validate_entry(entry);
                if issues.is_empty() {
                    candidates.push(normalize(entry, manifest.document.host));
                } else {
                    rejected.insert(entry.name.clone());
                    errors.extend(issues.into_iter().map(|reason| {
                        FleetError::config_entry(
                            manifest.origin.clone(),
                            entry.name.clone(),
                            reason,
                        )
                    }));
                }
            }
        }

        let mut by_name: BTreeMap<String, Vec<AgentSpec>> = BTreeMap::new();
        for spec in candidates {
            by_name.entry(spec.name.clone()).or_default().push(spec);
        }

        let mut agents = BTreeMap::new();
        for (name, specs) in by_name {
            for spec in accept_occurrences(&name, specs, &mut errors) {
                debug!(agent = %spec.id, host = %spec.host, "Accepted agent");
                agents.insert(spec.id.clone(), spec);
            }
        }

        (
            Fleet {
                agents,
                offsets,
                rejected,
            },
            errors,
        )
    }
}

/// Apply the replica rule to every occurrence of one name.
fn accept_occurrences(
    name: &str,
    specs: Vec<AgentSpec>,
    errors: &mut Vec<FleetError>,
) -> Vec<AgentSpec> {
    if specs.len() == 1 {
        return specs;
    }

    let mut accepted: Vec<AgentSpec> = Vec::new();
    for spec in specs {
        let clash = accepted
            .iter()
            .find(|kept| !(kept.replica && spec.replica) || kept.host == spec.host);
        match clash {
            Some(kept) => errors.push(FleetError::DuplicateAgent {
                name: name.to_string(),
                first: kept.host,
                second: spec.host,
            }),
            None => accepted.push(spec),
        }
    }
    accepted
}

fn validate_entry(entry: &AgentEntry) -> Vec<String> {
    let mut issues = Vec::new();

    if entry.name.trim().is_empty() {
        issues.push("name must not be empty".to_string());
    } else if entry.name.contains('@') || entry.name.chars().any(char::is_whitespace) {
        issues.push("name must not contain '@' or whitespace".to_string());
    }
    if entry.service_port == 0 {
        issues.push("service_port must be non-zero".to_string());
    }
    if entry.health_port == 0 {
        issues.push("health_port must be non-zero".to_string());
    }

    let mut seen = BTreeSet::new();
    for dependency in &entry.dependencies {
        if !seen.insert(dependency.as_str()) {
            issues.push(format!("dependency '{}' listed twice", dependency));
        }
    }

    if entry.health.timeout.is_zero() {
        issues.push("health.timeout must be non-zero".to_string());
    }
    if entry.restart.max_backoff < entry.restart.base_backoff {
        issues.push("restart.max_backoff must not be below restart.base_backoff".to_string());
    }
    if entry.restart.max_retries == 0 && entry.restart.base_backoff.is_zero() {
        issues.push(
            "restart policy with max_retries 0 must keep a non-zero base_backoff".to_string(),
        );
    }
    if entry.restart.window.is_zero() {
        issues.push("restart.window must be non-zero".to_string());
    }
    if let Some(share) = entry.resources.cpu_share {
        if !(share > 0.0 && share <= 1.0) {
            issues.push(format!("resources.cpu_share {} must be in (0, 1]", share));
        }
    }
    if let Some(command) = &entry.command {
        if command.program.trim().is_empty() {
            issues.push("command.program must not be empty".to_string());
        }
    }

    issues
}

fn normalize(entry: &AgentEntry, host: Host) -> AgentSpec {
    let id = if entry.replica {
        AgentId::replica(&entry.name, host)
    } else {
        AgentId::new(entry.name.clone())
    };
    AgentSpec {
        id,
        name: entry.name.clone(),
        host,
        service_port: entry.service_port,
        health_port: entry.health_port,
        dependencies: entry.dependencies.clone(),
        health: entry.health.clone(),
        restart: entry.restart.clone(),
        resources: entry.resources.clone(),
        command: entry.command.clone(),
        replica: entry.replica,
    }
}
