//! Cluster-wide service-port assignment.
//!
//! On group submission every declared `0` service port gets a concrete
//! port from the configured range, unique across the whole tree.
//! Literal (non-zero) declared ports are the user's business and pass
//! through verbatim. Allocation iterates apps sorted by id and picks
//! the smallest free port, so results are reproducible.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::debug;

use crate::group::Group;

/// The configured `[min, max]` service-port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePortRange {
    pub min: u32,
    pub max: u32,
}

impl ServicePortRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u32) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// Service-port assignment failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("service port range exhausted: [{min}, {max}]")]
    RangeExhausted { min: u32, max: u32 },
}

/// Assign concrete service ports to every dynamic slot in `target`.
///
/// Ports already assigned in `original` are kept for apps whose slot
/// is still dynamic, so an unchanged app keeps its ports across
/// submissions.
pub fn assign_service_ports(
    original: Option<&Group>,
    target: &mut Group,
    range: &ServicePortRange,
) -> Result<(), PortError> {
    // Every port already claimed by a literal declaration anywhere in
    // the tree. Dynamic assignments must stay clear of these.
    let mut taken: BTreeSet<u32> = target
        .transitive_apps()
        .iter()
        .flat_map(|a| a.declared_service_ports())
        .filter(|&p| p != 0)
        .collect();

    // Deterministic iteration: apps sorted by id.
    let mut app_ids: Vec<_> = target
        .transitive_apps()
        .iter()
        .map(|a| a.id.clone())
        .collect();
    app_ids.sort();

    let mut next_free = range.min;
    for app_id in app_ids {
        let app = target.find_app(&app_id).expect("app listed above");
        let declared = app.declared_service_ports();
        if declared.iter().all(|&p| p != 0) {
            continue;
        }

        let previous = original
            .and_then(|g| g.find_app(&app_id))
            .map(|a| a.assigned_service_ports())
            .unwrap_or_default();

        let mut assigned = Vec::with_capacity(declared.len());
        for (index, &port) in declared.iter().enumerate() {
            if port != 0 {
                assigned.push(port);
                continue;
            }
            // Keep the previous assignment when it is still free.
            let reuse = previous
                .get(index)
                .copied()
                .filter(|p| *p != 0 && range.contains(*p) && !taken.contains(p));
            let port = match reuse {
                Some(p) => p,
                None => {
                    while taken.contains(&next_free) {
                        next_free += 1;
                    }
                    if next_free > range.max {
                        return Err(PortError::RangeExhausted {
                            min: range.min,
                            max: range.max,
                        });
                    }
                    next_free
                }
            };
            taken.insert(port);
            assigned.push(port);
        }

        debug!(app = %app_id, ports = ?assigned, "assigned service ports");
        let updated = app.clone().with_assigned_service_ports(assigned);
        let version = target.version;
        target
            .put_app(updated, version)
            .expect("app already lives in the tree");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppDefinition;
    use crate::clock::Timestamp;
    use crate::path::PathId;

    fn app(id: &str, ports: Vec<u32>) -> AppDefinition {
        let mut app = AppDefinition::new(PathId::parse(id).unwrap());
        app.cmd = Some("sleep 3600".to_string());
        app.ports = ports;
        app
    }

    fn group_of(apps: Vec<AppDefinition>) -> Group {
        let mut root = Group::empty_root();
        for a in apps {
            root.put_app(a, Timestamp::from_millis(1)).unwrap();
        }
        root
    }

    fn ports_of(group: &Group, id: &str) -> Vec<u32> {
        group
            .find_app(&PathId::parse(id).unwrap())
            .unwrap()
            .assigned_service_ports()
    }

    #[test]
    fn assigns_dynamic_ports_and_keeps_literals() {
        let range = ServicePortRange::new(10, 20);
        let mut target = group_of(vec![
            app("/app1", vec![0, 0, 0]),
            app("/app2", vec![1, 2, 3]),
            app("/app3", vec![0, 2, 0]),
        ]);

        assign_service_ports(None, &mut target, &range).unwrap();

        let all: Vec<u32> = target
            .transitive_apps()
            .iter()
            .flat_map(|a| a.assigned_service_ports())
            .collect();
        assert!(all.iter().all(|&p| p != 0), "no zero port survives");

        let in_range: Vec<u32> = all.iter().copied().filter(|p| range.contains(*p)).collect();
        assert_eq!(in_range.len(), 5, "five dynamic slots were filled");
        let distinct: BTreeSet<u32> = in_range.iter().copied().collect();
        assert_eq!(distinct.len(), 5, "assigned ports are pairwise distinct");

        assert_eq!(ports_of(&target, "/app2"), vec![1, 2, 3]);
        assert_eq!(ports_of(&target, "/app3")[1], 2);
    }

    #[test]
    fn exhaustion_reports_the_range() {
        let range = ServicePortRange::new(10, 15);
        // Six dynamic ports fit exactly.
        let mut ok = group_of(vec![app("/a", vec![0, 0, 0]), app("/b", vec![0, 0, 0])]);
        assign_service_ports(None, &mut ok, &range).unwrap();

        // Seven do not.
        let mut over = group_of(vec![
            app("/a", vec![0, 0, 0]),
            app("/b", vec![0, 0, 0, 0]),
        ]);
        let err = assign_service_ports(None, &mut over, &range).unwrap_err();
        assert_eq!(err, PortError::RangeExhausted { min: 10, max: 15 });
    }

    #[test]
    fn dynamic_ports_avoid_in_range_literals() {
        let range = ServicePortRange::new(10, 12);
        let mut target = group_of(vec![app("/a", vec![10]), app("/b", vec![0, 0])]);
        assign_service_ports(None, &mut target, &range).unwrap();
        assert_eq!(ports_of(&target, "/b"), vec![11, 12]);
    }

    #[test]
    fn previous_assignments_are_kept() {
        let range = ServicePortRange::new(10, 20);
        let mut first = group_of(vec![app("/a", vec![0, 0])]);
        assign_service_ports(None, &mut first, &range).unwrap();
        let before = ports_of(&first, "/a");

        // Resubmit the same tree plus a new app; /a keeps its ports.
        let mut second = group_of(vec![app("/a", vec![0, 0]), app("/b", vec![0])]);
        assign_service_ports(Some(&first), &mut second, &range).unwrap();
        assert_eq!(ports_of(&second, "/a"), before);
    }

    #[test]
    fn deterministic_across_runs() {
        let range = ServicePortRange::new(10, 20);
        let build = || group_of(vec![app("/b", vec![0]), app("/a", vec![0, 0])]);

        let mut one = build();
        let mut two = build();
        assign_service_ports(None, &mut one, &range).unwrap();
        assign_service_ports(None, &mut two, &range).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn container_mapping_service_ports_are_assigned_too() {
        use crate::app::{Container, ContainerEngine, PortMapping};

        let range = ServicePortRange::new(10, 20);
        let mut a = app("/a", vec![]);
        a.container = Some(Container {
            engine: ContainerEngine::Docker,
            image: "nginx".to_string(),
            network: Some("BRIDGE".to_string()),
            port_mappings: vec![PortMapping {
                container_port: 80,
                host_port: 0,
                service_port: 0,
                protocol: "tcp".to_string(),
            }],
            volumes: Vec::new(),
            parameters: Vec::new(),
        });
        let mut target = group_of(vec![a]);
        assign_service_ports(None, &mut target, &range).unwrap();
        assert_eq!(ports_of(&target, "/a"), vec![10]);
    }
}
