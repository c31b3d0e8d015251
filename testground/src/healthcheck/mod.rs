//! Runner healthchecks.
//!
//! A runner publishes an ordered list of *checks* — preconditions its
//! environment must satisfy — each optionally paired with a *fix*. When
//! the caller asks for fixing, a failing check runs its fix and is then
//! re-checked; a fix never runs unless its check failed first, which also
//! makes `healthcheck(fix=true)` idempotent: a second invocation finds
//! everything already fixed and applies nothing.

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::rpc::OutputWriter;

/// Result of a single check or fix step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The step ran and passed.
    Ok,
    /// The step ran and failed.
    Failed,
    /// The step was not attempted.
    Omitted,
    /// A preceding failure prevented the step from running.
    Aborted,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Failed => "failed",
            CheckStatus::Omitted => "omitted",
            CheckStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one named step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

/// Full report: one entry per enlisted check, plus one per fix attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckReport {
    pub checks: Vec<CheckReport>,
    pub fixes: Vec<CheckReport>,
}

impl HealthcheckReport {
    /// True when every check passed (after fixes, when requested).
    pub fn checks_ok(&self) -> bool {
        self.checks.iter().all(|c| c.status == CheckStatus::Ok)
    }

    /// True when no fix was attempted or every attempted fix succeeded.
    pub fn fixes_ok(&self) -> bool {
        self.fixes
            .iter()
            .all(|f| matches!(f.status, CheckStatus::Ok | CheckStatus::Omitted))
    }

    /// Number of fixes that actually ran.
    pub fn fixes_applied(&self) -> usize {
        self.fixes
            .iter()
            .filter(|f| f.status != CheckStatus::Omitted)
            .count()
    }
}

/// Async step returning Ok(message) on success, Err(message) on failure.
pub type Step = Box<dyn Fn() -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

struct Item {
    name: String,
    check: Step,
    fix: Option<Step>,
}

/// Collects checks and runs them in order.
#[derive(Default)]
pub struct Helper {
    items: Vec<Item>,
}

impl Helper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enlists a check with a fix.
    pub fn enlist(&mut self, name: impl Into<String>, check: Step, fix: Step) {
        self.items.push(Item {
            name: name.into(),
            check,
            fix: Some(fix),
        });
    }

    /// Enlists a check with no fix (the fix column reports `omitted`).
    pub fn enlist_unfixable(&mut self, name: impl Into<String>, check: Step) {
        self.items.push(Item {
            name: name.into(),
            check,
            fix: None,
        });
    }

    /// Runs every check in order. When `fix` is set, a failing check runs
    /// its fix and is re-checked; the re-check result is what the report
    /// carries.
    pub async fn run_checks(&self, fix: bool, ow: &OutputWriter) -> HealthcheckReport {
        let mut report = HealthcheckReport::default();

        for item in &self.items {
            let result = (item.check)().await;

            match result {
                Ok(msg) => {
                    report.checks.push(CheckReport {
                        name: item.name.clone(),
                        status: CheckStatus::Ok,
                        message: msg,
                    });
                    report.fixes.push(CheckReport {
                        name: item.name.clone(),
                        status: CheckStatus::Omitted,
                        message: String::new(),
                    });
                }
                Err(check_msg) => {
                    if !fix {
                        report.checks.push(CheckReport {
                            name: item.name.clone(),
                            status: CheckStatus::Failed,
                            message: check_msg,
                        });
                        report.fixes.push(CheckReport {
                            name: item.name.clone(),
                            status: CheckStatus::Omitted,
                            message: String::new(),
                        });
                        continue;
                    }

                    let Some(fix_fn) = &item.fix else {
                        report.checks.push(CheckReport {
                            name: item.name.clone(),
                            status: CheckStatus::Failed,
                            message: check_msg,
                        });
                        report.fixes.push(CheckReport {
                            name: item.name.clone(),
                            status: CheckStatus::Omitted,
                            message: "no fix available".to_string(),
                        });
                        continue;
                    };

                    ow.info("applying fix", &[("check", &item.name)]);
                    match fix_fn().await {
                        Ok(fix_msg) => {
                            report.fixes.push(CheckReport {
                                name: item.name.clone(),
                                status: CheckStatus::Ok,
                                message: fix_msg,
                            });
                            // Re-check after a successful fix.
                            let recheck = (item.check)().await;
                            report.checks.push(match recheck {
                                Ok(msg) => CheckReport {
                                    name: item.name.clone(),
                                    status: CheckStatus::Ok,
                                    message: msg,
                                },
                                Err(msg) => CheckReport {
                                    name: item.name.clone(),
                                    status: CheckStatus::Failed,
                                    message: msg,
                                },
                            });
                        }
                        Err(fix_msg) => {
                            ow.warn("fix failed", &[("check", &item.name), ("err", &fix_msg)]);
                            report.checks.push(CheckReport {
                                name: item.name.clone(),
                                status: CheckStatus::Failed,
                                message: check_msg,
                            });
                            report.fixes.push(CheckReport {
                                name: item.name.clone(),
                                status: CheckStatus::Failed,
                                message: fix_msg,
                            });
                        }
                    }
                }
            }
        }

        report
    }
}

/// Convenience: wraps an async closure into a [`Step`].
pub fn step<F, Fut>(f: F) -> Step
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// A step that always fails with "not implemented"; used as the fix for
/// checks that can only be repaired by the operator.
pub fn not_implemented() -> Step {
    step(|| async { Err("not implemented".to_string()) })
}

/// Check that a directory exists, with a fix that creates it.
pub fn dir_exists_check(path: std::path::PathBuf) -> Step {
    step(move || {
        let path = path.clone();
        async move {
            if path.is_dir() {
                Ok(format!("directory {} exists", path.display()))
            } else {
                Err(format!("directory {} does not exist", path.display()))
            }
        }
    })
}

/// Fix step that creates a directory tree.
pub fn create_dir_fix(path: std::path::PathBuf) -> Step {
    step(move || {
        let path = path.clone();
        async move {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
            Ok(format!("created directory {}", path.display()))
        }
    })
}
