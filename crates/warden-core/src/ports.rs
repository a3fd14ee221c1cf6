//! Effective port resolution
//!
//! Every declared port is shifted by its host's offset. Two different agents
//! on the same host may not end up on the same effective port, whichever of
//! their service or health ports collide. Hosts never conflict with each other.

use crate::agent::{AgentId, Host};
use crate::error::{FleetError, Result};
use crate::manifest::Fleet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Service,
    Health,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => f.write_str("service"),
            Self::Health => f.write_str("health"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPorts {
    pub host: Host,
    pub service: u16,
    pub health: u16,
}

/// Non-fatal findings that still deserve an operator's attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortWarning {
    /// The host's manifest did not set `port_offset`; 0 was used.
    OffsetDefaulted { host: Host },
    /// Some hosts set an offset and others rely on the default.
    OffsetMismatch { explicit: Vec<Host>, defaulted: Vec<Host> },
}

impl fmt::Display for PortWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OffsetDefaulted { host } => {
                write!(f, "port_offset not set for host {}, defaulting to 0", host)
            }
            Self::OffsetMismatch {
                explicit,
                defaulted,
            } => write!(
                f,
                "port_offset set explicitly on {:?} but defaulted on {:?}",
                explicit, defaulted
            ),
        }
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignments {
    ports: BTreeMap<AgentId, ResolvedPorts>,
    warnings: Vec<PortWarning>,
}

impl PortAssignments {
    pub fn get(&self, id: &str) -> Option<&ResolvedPorts> {
        self.ports.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &ResolvedPorts)> {
        self.ports.iter()
    }

    pub fn warnings(&self) -> &[PortWarning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

pub struct PortResolver;

impl PortResolver {
    /// Resolve using the offsets declared in the fleet's manifests.
    pub fn resolve(fleet: &Fleet) -> Result<PortAssignments> {
        let (assignments, errors) = Self::resolve_all(fleet);
        if errors.is_empty() {
            Ok(assignments)
        } else {
            Err(FleetError::Validation(errors))
        }
    }

    /// Resolve every agent that can be resolved and report every conflict.
    #[instrument(skip(fleet), fields(agents = fleet.len()))]
    pub fn resolve_all(fleet: &Fleet) -> (PortAssignments, Vec<FleetError>) {
        let warnings = offset_warnings(fleet);
        for warning in &warnings {
            warn!("{}", warning);
        }

        let mut errors = Vec::new();
        let mut ports = BTreeMap::new();
        let mut claims: BTreeMap<(Host, u16), (AgentId, PortKind)> = BTreeMap::new();

        for spec in fleet.agents() {
            let offset = fleet
                .offsets()
                .get(&spec.host)
                .copied()
                .flatten()
                .unwrap_or(0);

            let service = shift(spec.service_port, offset);
            let health = shift(spec.health_port, offset);
            if service.is_none() {
                errors.push(out_of_range(&spec.id, PortKind::Service, spec.service_port, offset));
            }
            if health.is_none() {
                errors.push(out_of_range(&spec.id, PortKind::Health, spec.health_port, offset));
            }
            let (Some(service), Some(health)) = (service, health) else {
                continue;
            };

            let mut wanted = vec![(service, PortKind::Service)];
            if health != service {
                wanted.push((health, PortKind::Health));
            }
            for (port, kind) in wanted {
                match claims.get(&(spec.host, port)) {
                    Some((owner, owner_kind)) => errors.push(FleetError::PortConflict {
                        host: spec.host,
                        port,
                        first: owner.clone(),
                        first_kind: *owner_kind,
                        second: spec.id.clone(),
                        second_kind: kind,
                    }),
                    None => {
                        claims.insert((spec.host, port), (spec.id.clone(), kind));
                    }
                }
            }

            ports.insert(
                spec.id.clone(),
                ResolvedPorts {
                    host: spec.host,
                    service,
                    health,
                },
            );
        }

        (PortAssignments { ports, warnings }, errors)
    }
}

fn shift(declared: u16, offset: i32) -> Option<u16> {
    let effective = i32::from(declared).checked_add(offset)?;
    u16::try_from(effective).ok().filter(|port| *port != 0)
}

fn out_of_range(agent: &AgentId, kind: PortKind, declared: u16, offset: i32) -> FleetError {
    FleetError::PortOutOfRange {
        agent: agent.clone(),
        kind,
        declared,
        offset,
    }
}

fn offset_warnings(fleet: &Fleet) -> Vec<PortWarning> {
    let (explicit, defaulted): (Vec<_>, Vec<_>) = fleet
        .offsets()
        .iter()
        .partition(|(_, offset)| offset.is_some());
    let explicit: Vec<Host> = explicit.into_iter().map(|(host, _)| *host).collect();
    let defaulted: Vec<Host> = defaulted.into_iter().map(|(host, _)| *host).collect();

    let mut warnings: Vec<PortWarning> = defaulted
        .iter()
        .map(|host| PortWarning::OffsetDefaulted { host: *host })
        .collect();
    if !explicit.is_empty() && !defaulted.is_empty() {
        warnings.push(PortWarning::OffsetMismatch {
            explicit,
            defaulted,
        });
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentSpec;

    fn fleet(specs: Vec<AgentSpec>) -> Fleet {
        Fleet::from_specs(specs)
    }

    #[test]
    fn test_offset_applies_per_host() {
        let fleet = fleet(vec![
            AgentSpec::new("asr", Host::Primary, 7000, 7001),
            AgentSpec::new("tts", Host::Secondary, 7000, 7001),
        ])
        .with_offset(Host::Secondary, Some(100));

        let ports = PortResolver::resolve(&fleet).unwrap();
        assert_eq!(ports.get("asr").unwrap().service, 7000);
        assert_eq!(ports.get("tts").unwrap().service, 7100);
        assert_eq!(ports.get("tts").unwrap().health, 7101);
        assert!(ports.warnings().is_empty());
    }

    #[test]
    fn test_same_host_service_collision_conflicts() {
        let fleet = fleet(vec![
            AgentSpec::new("asr", Host::Primary, 7000, 7001),
            AgentSpec::new("nlu", Host::Primary, 7000, 7101),
        ]);

        let issues = PortResolver::resolve(&fleet).unwrap_err().into_issues();
        assert_eq!(issues.len(), 1);
        assert!(matches!(
            &issues[0],
            FleetError::PortConflict { host: Host::Primary, port: 7000, first, second, .. }
                if first.as_str() == "asr" && second.as_str() == "nlu"
        ));
    }

    #[test]
    fn test_cross_host_same_port_is_allowed() {
        let fleet = fleet(vec![
            AgentSpec::new("asr", Host::Primary, 7000, 7001),
            AgentSpec::new("nlu", Host::Secondary, 7000, 7001),
        ]);
        assert!(PortResolver::resolve(&fleet).is_ok());
    }

    #[test]
    fn test_service_vs_health_cross_comparison() {
        let fleet = fleet(vec![
            AgentSpec::new("asr", Host::Primary, 7000, 7001),
            AgentSpec::new("nlu", Host::Primary, 7001, 7002),
        ]);

        let issues = PortResolver::resolve(&fleet).unwrap_err().into_issues();
        assert!(matches!(
            &issues[0],
            FleetError::PortConflict {
                port: 7001,
                first_kind: PortKind::Health,
                second_kind: PortKind::Service,
                ..
            }
        ));
    }

    fn fleet_with_sane_offsets() -> Fleet {
        fleet(vec![
            AgentSpec::new("asr", Host::Primary, 7000, 7001),
            AgentSpec::new("ocr", Host::Primary, 7100, 7101),
        ])
        .with_offset(Host::Primary, Some(100))
    }

    #[test]
    fn test_shared_service_and_health_port_on_one_agent() {
        let fleet = fleet(vec![AgentSpec::new("memory", Host::Primary, 5555, 5555)]);
        let ports = PortResolver::resolve(&fleet).unwrap();
        assert_eq!(ports.get("memory").unwrap().health, 5555);
    }

    #[test]
    fn test_every_conflict_reported() {
        let fleet = fleet(vec![
            AgentSpec::new("a", Host::Primary, 7000, 7001),
            AgentSpec::new("b", Host::Primary, 7000, 7001),
            AgentSpec::new("c", Host::Primary, 7001, 7000),
        ]);
        let issues = PortResolver::resolve(&fleet).unwrap_err().into_issues();
        assert_eq!(issues.len(), 4);
    }

    #[test]
    fn test_out_of_range_after_offset() {
        let fleet = fleet(vec![AgentSpec::new("a", Host::Secondary, 65500, 65501)])
            .with_offset(Host::Secondary, Some(100));
        let issues = PortResolver::resolve(&fleet).unwrap_err().into_issues();
        assert_eq!(issues.len(), 2);
        assert!(issues
            .iter()
            .all(|issue| matches!(issue, FleetError::PortOutOfRange { .. })));
    }

    #[test]
    fn test_defaulted_offset_is_loud() {
        let fleet = fleet(vec![
            AgentSpec::new("a", Host::Primary, 7000, 7001),
            AgentSpec::new("b", Host::Secondary, 7000, 7001),
        ])
        .with_offset(Host::Primary, Some(0))
        .with_offset(Host::Secondary, None);

        let ports = PortResolver::resolve(&fleet).unwrap();
        assert!(ports
            .warnings()
            .contains(&PortWarning::OffsetDefaulted { host: Host::Secondary }));
        assert!(ports.warnings().iter().any(|w| matches!(w, PortWarning::OffsetMismatch { .. })));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let fleet = fleet_with_sane_offsets();
        let first = PortResolver::resolve(&fleet).unwrap();
        let second = PortResolver::resolve(&fleet).unwrap();
        assert_eq!(first, second);
    }
}
