//! Composition validation and instance-count resolution.

use thiserror::Error;

use super::{Composition, Group};

/// Validation failures for a composition.
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("plan must not be empty")]
    MissingPlan,

    #[error("case must not be empty")]
    MissingCase,

    #[error("runner must not be empty")]
    MissingRunner,

    #[error("composition has no groups")]
    NoGroups,

    #[error("group ids not unique; found duplicate: {0}")]
    DuplicateGroupId(String),

    #[error("group {0} is missing a builder")]
    MissingBuilder(String),

    #[error("group {0} must set either count or percentage, not both")]
    CountAndPercentage(String),

    #[error("group {0} has neither count nor percentage")]
    NoInstances(String),

    #[error("group {0} count percentage requires a total_instances configuration")]
    PercentageWithoutTotal(String),

    #[error(
        "sum of calculated instances per group doesn't match total; total={total}, calculated={calculated}"
    )]
    TotalMismatch { total: u32, calculated: u32 },

    #[error("run ids not unique; found duplicate: {0}")]
    DuplicateRunId(String),

    #[error("run {run}:{entry} references non-existent group {group}")]
    UnknownRunGroup {
        run: String,
        entry: String,
        group: String,
    },

    #[error("run {0} group references not unique; found duplicate: {1}")]
    DuplicateRunGroup(String, String),
}

impl Composition {
    /// Validates the composition for a build: groups must be well-formed
    /// and every group must have a builder. Runner, case and instance
    /// totals are not required yet.
    pub fn validate_for_build(&self) -> Result<(), CompositionError> {
        if self.global.plan.is_empty() {
            return Err(CompositionError::MissingPlan);
        }
        self.validate_groups()
    }

    /// Validates the composition for a run and returns the resolved
    /// per-group instance counts, in group order.
    ///
    /// Percentage groups resolve by rounding against `total_instances`;
    /// the resolved counts must sum to the declared total.
    pub fn validate_for_run(&self) -> Result<Vec<u32>, CompositionError> {
        if self.global.plan.is_empty() {
            return Err(CompositionError::MissingPlan);
        }
        if self.global.case.is_empty() {
            return Err(CompositionError::MissingCase);
        }
        if self.global.runner.is_empty() {
            return Err(CompositionError::MissingRunner);
        }

        self.validate_groups()?;
        self.validate_runs()?;

        let total = self.global.total_instances;
        let mut resolved = Vec::with_capacity(self.groups.len());
        let mut calculated: u32 = 0;

        for g in &self.groups {
            let n = resolve_instances(g, total)?;
            calculated += n;
            resolved.push(n);
        }

        if total > 0 && calculated != total {
            return Err(CompositionError::TotalMismatch { total, calculated });
        }

        Ok(resolved)
    }

    fn validate_groups(&self) -> Result<(), CompositionError> {
        if self.groups.is_empty() {
            return Err(CompositionError::NoGroups);
        }

        let mut seen = std::collections::HashSet::with_capacity(self.groups.len());
        for g in &self.groups {
            if !seen.insert(g.id.as_str()) {
                return Err(CompositionError::DuplicateGroupId(g.id.clone()));
            }
        }

        for g in &self.groups {
            if self.builder_for(g).is_empty() {
                return Err(CompositionError::MissingBuilder(g.id.clone()));
            }
        }

        Ok(())
    }

    fn validate_runs(&self) -> Result<(), CompositionError> {
        let mut seen = std::collections::HashSet::with_capacity(self.runs.len());
        for r in &self.runs {
            if !seen.insert(r.id.as_str()) {
                return Err(CompositionError::DuplicateRunId(r.id.clone()));
            }

            let mut entry_seen = std::collections::HashSet::with_capacity(r.groups.len());
            for e in &r.groups {
                if self.group(e.effective_group_id()).is_none() {
                    return Err(CompositionError::UnknownRunGroup {
                        run: r.id.clone(),
                        entry: e.id.clone(),
                        group: e.effective_group_id().to_string(),
                    });
                }
                if !entry_seen.insert(e.id.as_str()) {
                    return Err(CompositionError::DuplicateRunGroup(
                        r.id.clone(),
                        e.id.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn resolve_instances(g: &Group, total: u32) -> Result<u32, CompositionError> {
    let has_count = g.instances.count > 0;
    let has_pct = g.instances.percentage > 0.0;

    match (has_count, has_pct) {
        (true, true) => Err(CompositionError::CountAndPercentage(g.id.clone())),
        (false, false) => Err(CompositionError::NoInstances(g.id.clone())),
        (true, false) => Ok(g.instances.count),
        (false, true) => {
            if total == 0 {
                return Err(CompositionError::PercentageWithoutTotal(g.id.clone()));
            }
            Ok((g.instances.percentage * f64::from(total)).round() as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Global, Instances};
    use super::*;

    fn base() -> Composition {
        Composition {
            global: Global {
                plan: "network/ping-pong".to_string(),
                case: "ping-pong".to_string(),
                builder: "docker:generic".to_string(),
                runner: "local:docker".to_string(),
                total_instances: 10,
                ..Default::default()
            },
            groups: vec![],
            runs: vec![],
        }
    }

    fn group(id: &str, count: u32, percentage: f64) -> Group {
        Group {
            id: id.to_string(),
            instances: Instances { count, percentage },
            ..Default::default()
        }
    }

    #[test]
    fn test_resolves_counts_and_percentages() {
        let mut c = base();
        c.groups.push(group("a", 3, 0.0));
        c.groups.push(group("b", 0, 0.7));

        let resolved = c.validate_for_run().unwrap();
        assert_eq!(resolved, vec![3, 7]);
    }

    #[test]
    fn test_rejects_duplicate_group_ids() {
        let mut c = base();
        c.groups.push(group("a", 5, 0.0));
        c.groups.push(group("a", 5, 0.0));

        assert!(matches!(
            c.validate_for_run(),
            Err(CompositionError::DuplicateGroupId(id)) if id == "a"
        ));
    }

    #[test]
    fn test_rejects_count_and_percentage() {
        let mut c = base();
        c.groups.push(group("a", 5, 0.5));
        c.groups.push(group("b", 5, 0.0));

        assert!(matches!(
            c.validate_for_run(),
            Err(CompositionError::CountAndPercentage(id)) if id == "a"
        ));
    }

    #[test]
    fn test_rejects_percentage_without_total() {
        let mut c = base();
        c.global.total_instances = 0;
        c.groups.push(group("a", 0, 0.5));

        assert!(matches!(
            c.validate_for_run(),
            Err(CompositionError::PercentageWithoutTotal(id)) if id == "a"
        ));
    }

    #[test]
    fn test_rejects_total_mismatch() {
        // Groups A(count=3) and B(percentage=0.5) against total=10:
        // 3 + 5 != 10, so validation must reject.
        let mut c = base();
        c.groups.push(group("a", 3, 0.0));
        c.groups.push(group("b", 0, 0.5));

        assert!(matches!(
            c.validate_for_run(),
            Err(CompositionError::TotalMismatch {
                total: 10,
                calculated: 8
            })
        ));
    }

    #[test]
    fn test_rejects_missing_builder() {
        let mut c = base();
        c.global.builder = String::new();
        c.groups.push(group("a", 10, 0.0));

        assert!(matches!(
            c.validate_for_run(),
            Err(CompositionError::MissingBuilder(id)) if id == "a"
        ));
    }

    #[test]
    fn test_rejects_unknown_run_group_reference() {
        let mut c = base();
        c.groups.push(group("a", 10, 0.0));
        c.runs.push(crate::composition::RunEntry {
            id: "r1".to_string(),
            groups: vec![crate::composition::RunEntryGroup {
                id: "missing".to_string(),
                ..Default::default()
            }],
        });

        assert!(matches!(
            c.validate_for_run(),
            Err(CompositionError::UnknownRunGroup { .. })
        ));
    }

    #[test]
    fn test_build_validation_skips_run_fields() {
        let mut c = base();
        c.global.case = String::new();
        c.global.runner = String::new();
        c.global.total_instances = 0;
        c.groups.push(group("a", 1, 0.0));

        c.validate_for_build().unwrap();
    }
}
