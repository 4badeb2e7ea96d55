//! Placement constraint evaluation.
//!
//! Constraints are conjunctive and evaluated in declared order against
//! the offer and the app's already-placed tasks. `hostname` reads the
//! offer's host; any other field reads an agent attribute.

use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use flotilla_core::{AppDefinition, Constraint, ConstraintOp};
use flotilla_master::Offer;
use flotilla_tracker::Task;

/// Whether the offer satisfies every constraint of the app.
pub fn meets_constraints(app: &AppDefinition, offer: &Offer, placed: &[Task]) -> bool {
    app.constraints.iter().all(|constraint| {
        let ok = meets_constraint(constraint, offer, placed);
        if !ok {
            debug!(
                app = %app.id,
                field = %constraint.field,
                op = ?constraint.op,
                offer = %offer.id,
                "constraint rejected offer"
            );
        }
        ok
    })
}

fn meets_constraint(constraint: &Constraint, offer: &Offer, placed: &[Task]) -> bool {
    let offer_value = offer.field_value(&constraint.field);
    match constraint.op {
        ConstraintOp::Unique => {
            let Some(value) = offer_value else {
                return false;
            };
            !placed
                .iter()
                .any(|t| t.field_value(&constraint.field).as_deref() == Some(value.as_str()))
        }
        ConstraintOp::Cluster => {
            let Some(value) = offer_value else {
                return false;
            };
            match &constraint.value {
                // Pinned: the offer must carry exactly this value.
                Some(pinned) => &value == pinned,
                // Unpinned: the first placement sets the cluster value.
                None => match placed
                    .iter()
                    .find_map(|t| t.field_value(&constraint.field))
                {
                    Some(chosen) => value == chosen,
                    None => true,
                },
            }
        }
        ConstraintOp::GroupBy => {
            let Some(value) = offer_value else {
                return false;
            };
            let mut counts: HashMap<String, usize> = HashMap::new();
            for task in placed {
                if let Some(v) = task.field_value(&constraint.field) {
                    *counts.entry(v).or_insert(0) += 1;
                }
            }
            let group_count: Option<usize> =
                constraint.value.as_deref().and_then(|v| v.parse().ok());
            if let Some(expected) = group_count {
                // While fewer than N groups are used, only new groups
                // may take tasks.
                if counts.len() < expected {
                    return !counts.contains_key(&value);
                }
            }
            match counts.get(&value) {
                None => true,
                Some(count) => {
                    let min = counts.values().copied().min().unwrap_or(0);
                    *count <= min
                }
            }
        }
        ConstraintOp::Like => match (offer_value, full_match_regex(constraint)) {
            (Some(value), Some(re)) => re.is_match(&value),
            _ => false,
        },
        ConstraintOp::Unlike => match offer_value {
            None => true,
            Some(value) => match full_match_regex(constraint) {
                Some(re) => !re.is_match(&value),
                None => false,
            },
        },
    }
}

fn full_match_regex(constraint: &Constraint) -> Option<Regex> {
    let pattern = constraint.value.as_deref()?;
    Regex::new(&format!("^(?:{pattern})$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use flotilla_core::{PathId, Timestamp};
    use flotilla_master::TaskState;

    fn app_with(constraints: Vec<Constraint>) -> AppDefinition {
        let mut app = AppDefinition::new(PathId::parse("/web").unwrap());
        app.cmd = Some("serve".to_string());
        app.constraints = constraints;
        app
    }

    fn constraint(field: &str, op: ConstraintOp, value: Option<&str>) -> Constraint {
        Constraint {
            field: field.to_string(),
            op,
            value: value.map(str::to_string),
        }
    }

    fn offer_on(host: &str, attributes: &[(&str, &str)]) -> Offer {
        Offer {
            id: format!("offer-{host}"),
            agent_id: format!("agent-{host}"),
            hostname: host.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            resources: Vec::new(),
        }
    }

    fn task_on(host: &str, attributes: &[(&str, &str)]) -> Task {
        let app_id = PathId::parse("/web").unwrap();
        Task {
            id: flotilla_tracker::TaskId::generate(&app_id),
            app_id,
            app_version: Timestamp::from_millis(1),
            host: host.to_string(),
            agent_id: format!("agent-{host}"),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            host_ports: Vec::new(),
            staged_at: Timestamp::from_millis(1),
            started_at: None,
            status: TaskState::Running,
            health_results: Vec::new(),
        }
    }

    #[test]
    fn unique_hostname_rejects_reuse() {
        let app = app_with(vec![constraint("hostname", ConstraintOp::Unique, None)]);
        let placed = vec![task_on("node-1", &[])];

        assert!(!meets_constraints(&app, &offer_on("node-1", &[]), &placed));
        assert!(meets_constraints(&app, &offer_on("node-2", &[]), &placed));
    }

    #[test]
    fn unique_attribute_uses_task_attributes() {
        let app = app_with(vec![constraint("rack", ConstraintOp::Unique, None)]);
        let placed = vec![task_on("node-1", &[("rack", "r1")])];

        assert!(!meets_constraints(&app, &offer_on("node-2", &[("rack", "r1")]), &placed));
        assert!(meets_constraints(&app, &offer_on("node-3", &[("rack", "r2")]), &placed));
        // Offers without the attribute cannot prove uniqueness.
        assert!(!meets_constraints(&app, &offer_on("node-4", &[]), &placed));
    }

    #[test]
    fn cluster_pinned_value() {
        let app = app_with(vec![constraint(
            "rack",
            ConstraintOp::Cluster,
            Some("r1"),
        )]);
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r1")]), &[]));
        assert!(!meets_constraints(&app, &offer_on("n", &[("rack", "r2")]), &[]));
    }

    #[test]
    fn cluster_unpinned_follows_first_placement() {
        let app = app_with(vec![constraint("rack", ConstraintOp::Cluster, None)]);

        // Nothing placed: anything goes.
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r2")]), &[]));

        let placed = vec![task_on("node-1", &[("rack", "r1")])];
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r1")]), &placed));
        assert!(!meets_constraints(&app, &offer_on("n", &[("rack", "r2")]), &placed));
    }

    #[test]
    fn group_by_prefers_the_smallest_group() {
        let app = app_with(vec![constraint("rack", ConstraintOp::GroupBy, None)]);
        let placed = vec![
            task_on("a", &[("rack", "r1")]),
            task_on("b", &[("rack", "r1")]),
            task_on("c", &[("rack", "r2")]),
        ];

        // r1 has 2, r2 has 1: only r2 (or an unseen rack) may take more.
        assert!(!meets_constraints(&app, &offer_on("n", &[("rack", "r1")]), &placed));
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r2")]), &placed));
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r3")]), &placed));
    }

    #[test]
    fn group_by_with_count_fills_new_groups_first() {
        let app = app_with(vec![constraint(
            "rack",
            ConstraintOp::GroupBy,
            Some("3"),
        )]);
        let placed = vec![task_on("a", &[("rack", "r1")])];

        // Only 1 of 3 groups used: a second task on r1 must wait.
        assert!(!meets_constraints(&app, &offer_on("n", &[("rack", "r1")]), &placed));
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r2")]), &placed));
    }

    #[test]
    fn like_and_unlike_match_whole_values() {
        let like = app_with(vec![constraint(
            "rack",
            ConstraintOp::Like,
            Some("r-[0-9]+"),
        )]);
        assert!(meets_constraints(&like, &offer_on("n", &[("rack", "r-17")]), &[]));
        assert!(!meets_constraints(&like, &offer_on("n", &[("rack", "r-17-b")]), &[]));
        assert!(!meets_constraints(&like, &offer_on("n", &[]), &[]));

        let unlike = app_with(vec![constraint(
            "rack",
            ConstraintOp::Unlike,
            Some("r-1.*"),
        )]);
        assert!(!meets_constraints(&unlike, &offer_on("n", &[("rack", "r-17")]), &[]));
        assert!(meets_constraints(&unlike, &offer_on("n", &[("rack", "r-20")]), &[]));
        // A missing attribute cannot be "like" the pattern.
        assert!(meets_constraints(&unlike, &offer_on("n", &[]), &[]));
    }

    #[test]
    fn constraints_are_conjunctive() {
        let app = app_with(vec![
            constraint("rack", ConstraintOp::GroupBy, None),
            constraint("rack", ConstraintOp::Unique, None),
        ]);
        let placed = vec![task_on("a", &[("rack", "r1")])];

        // GROUP_BY alone would allow r2; UNIQUE alone would too; both
        // together still do. r1 fails UNIQUE regardless of order.
        assert!(meets_constraints(&app, &offer_on("n", &[("rack", "r2")]), &placed));
        assert!(!meets_constraints(&app, &offer_on("n", &[("rack", "r1")]), &placed));
    }
}
