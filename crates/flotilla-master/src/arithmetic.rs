//! Resource arithmetic — subtracting consumed resources from an offer.
//!
//! Resources are grouped by `(role, name)`. Scalars are consumed by
//! value and dropped at zero; ranges are split around the consumed
//! sub-ranges; sets use set difference. Mismatched kinds for the same
//! `(role, name)` consume the base entirely, which errs on the side of
//! never double-spending.

use std::collections::BTreeSet;

use crate::offer::{Resource, ResourceValue, ValueRange};

const EPSILON: f64 = 1e-9;

/// Subtract `used` from `base`, returning the residual resources.
pub fn consume(base: &[Resource], used: &[Resource]) -> Vec<Resource> {
    let mut residual = Vec::new();
    for resource in base {
        let consumed: Vec<&Resource> = used
            .iter()
            .filter(|u| u.name == resource.name && u.role == resource.role)
            .collect();
        if consumed.is_empty() {
            residual.push(resource.clone());
            continue;
        }
        if let Some(rest) = subtract(resource, &consumed) {
            residual.push(rest);
        }
    }
    residual
}

fn subtract(base: &Resource, consumed: &[&Resource]) -> Option<Resource> {
    match &base.value {
        ResourceValue::Scalar { value } => {
            let used: f64 = consumed.iter().map(|r| r.scalar_value()).sum();
            let remaining = value - used;
            if remaining <= EPSILON {
                return None;
            }
            Some(Resource {
                name: base.name.clone(),
                role: base.role.clone(),
                value: ResourceValue::Scalar { value: remaining },
            })
        }
        ResourceValue::Ranges { ranges } => {
            let mut remaining: Vec<ValueRange> = ranges.clone();
            for resource in consumed {
                match &resource.value {
                    ResourceValue::Ranges { ranges: used } => {
                        remaining = subtract_ranges(&remaining, used);
                    }
                    // Kind mismatch: consume the base entirely.
                    _ => return None,
                }
            }
            if remaining.is_empty() {
                return None;
            }
            Some(Resource {
                name: base.name.clone(),
                role: base.role.clone(),
                value: ResourceValue::Ranges { ranges: remaining },
            })
        }
        ResourceValue::Set { items } => {
            let mut remaining: BTreeSet<String> = items.clone();
            for resource in consumed {
                match &resource.value {
                    ResourceValue::Set { items: used } => {
                        remaining = remaining.difference(used).cloned().collect();
                    }
                    _ => return None,
                }
            }
            if remaining.is_empty() {
                return None;
            }
            Some(Resource {
                name: base.name.clone(),
                role: base.role.clone(),
                value: ResourceValue::Set { items: remaining },
            })
        }
    }
}

/// Subtract every used range from every base range. Each overlap
/// leaves at most two surviving sub-ranges.
fn subtract_ranges(base: &[ValueRange], used: &[ValueRange]) -> Vec<ValueRange> {
    let mut remaining: Vec<ValueRange> = base.to_vec();
    for cut in used {
        let mut next = Vec::with_capacity(remaining.len() + 1);
        for range in &remaining {
            if cut.end < range.begin || cut.begin > range.end {
                next.push(*range);
                continue;
            }
            if cut.begin > range.begin {
                next.push(ValueRange::new(range.begin, cut.begin - 1));
            }
            if cut.end < range.end {
                next.push(ValueRange::new(cut.end + 1, range.end));
            }
        }
        remaining = next;
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(resource: &Resource) -> Vec<ValueRange> {
        match &resource.value {
            ResourceValue::Ranges { ranges } => ranges.clone(),
            _ => panic!("expected ranges"),
        }
    }

    #[test]
    fn scalar_consumption_drops_at_zero() {
        let base = vec![Resource::scalar("cpus", "*", 4.0)];
        let used = vec![Resource::scalar("cpus", "*", 1.5)];
        let rest = consume(&base, &used);
        assert_eq!(rest.len(), 1);
        assert!((rest[0].scalar_value() - 2.5).abs() < 1e-9);

        let all = vec![Resource::scalar("cpus", "*", 2.5)];
        assert!(consume(&rest, &all).is_empty());
    }

    #[test]
    fn roles_are_independent() {
        let base = vec![
            Resource::scalar("cpus", "*", 4.0),
            Resource::scalar("cpus", "prod", 2.0),
        ];
        let used = vec![Resource::scalar("cpus", "prod", 2.0)];
        let rest = consume(&base, &used);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].role, "*");
        assert_eq!(rest[0].scalar_value(), 4.0);
    }

    #[test]
    fn range_subtraction_splits_overlap() {
        let base = vec![Resource::ranges(
            "ports",
            "*",
            vec![ValueRange::new(100, 200)],
        )];
        let used = vec![Resource::ranges(
            "ports",
            "*",
            vec![ValueRange::new(150, 160)],
        )];
        let rest = consume(&base, &used);
        assert_eq!(
            ranges(&rest[0]),
            vec![ValueRange::new(100, 149), ValueRange::new(161, 200)]
        );
    }

    #[test]
    fn range_subtraction_at_the_edges() {
        let base = vec![ValueRange::new(100, 200)];
        assert_eq!(
            subtract_ranges(&base, &[ValueRange::new(100, 150)]),
            vec![ValueRange::new(151, 200)]
        );
        assert_eq!(
            subtract_ranges(&base, &[ValueRange::new(150, 200)]),
            vec![ValueRange::new(100, 149)]
        );
        assert!(subtract_ranges(&base, &[ValueRange::new(100, 200)]).is_empty());
        assert_eq!(
            subtract_ranges(&base, &[ValueRange::new(300, 400)]),
            base
        );
    }

    #[test]
    fn set_difference() {
        let base = vec![Resource::set(
            "disks",
            "*",
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect(),
        )];
        let used = vec![Resource::set(
            "disks",
            "*",
            ["b"].iter().map(|s| s.to_string()).collect(),
        )];
        let rest = consume(&base, &used);
        match &rest[0].value {
            ResourceValue::Set { items } => {
                assert_eq!(items.len(), 2);
                assert!(!items.contains("b"));
            }
            _ => panic!("expected set"),
        }
    }

    #[test]
    fn kind_mismatch_consumes_entirely() {
        let base = vec![Resource::ranges(
            "ports",
            "*",
            vec![ValueRange::new(1, 10)],
        )];
        let used = vec![Resource::scalar("ports", "*", 1.0)];
        assert!(consume(&base, &used).is_empty());
    }

    #[test]
    fn consume_is_idempotent_on_empty_residuals() {
        let base = vec![Resource::scalar("cpus", "*", 1.0)];
        let used = vec![Resource::scalar("cpus", "*", 1.0)];
        let rest = consume(&base, &used);
        assert!(rest.is_empty());
        assert!(consume(&rest, &used).is_empty());
    }

    #[test]
    fn quantity_is_conserved() {
        // sum(used) + sum(residual) == sum(base) for scalars and ranges.
        let base = vec![
            Resource::scalar("cpus", "*", 4.0),
            Resource::ranges("ports", "*", vec![ValueRange::new(100, 199)]),
        ];
        let used = vec![
            Resource::scalar("cpus", "*", 1.25),
            Resource::ranges("ports", "*", vec![ValueRange::new(120, 129)]),
        ];
        let rest = consume(&base, &used);

        let scalar_rest: f64 = rest
            .iter()
            .filter(|r| r.name == "cpus")
            .map(Resource::scalar_value)
            .sum();
        assert!((1.25 + scalar_rest - 4.0).abs() < 1e-9);

        let port_count = |resources: &[Resource]| -> u64 {
            resources
                .iter()
                .filter(|r| r.name == "ports")
                .map(|r| match &r.value {
                    ResourceValue::Ranges { ranges } => ranges.iter().map(ValueRange::len).sum(),
                    _ => 0,
                })
                .sum()
        };
        assert_eq!(port_count(&used) + port_count(&rest), port_count(&base));
    }
}
