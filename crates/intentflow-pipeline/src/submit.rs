use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What happened when a manifest was handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Submitted { stdout: String },
    ToolMissing { command: String },
    Rejected { exit_code: i32, stderr: String },
    TimedOut { timeout_ms: u64 },
    Skipped,
}

impl SubmissionOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, SubmissionOutcome::Submitted { .. })
    }
}

/// Hands a written manifest to an external orchestrator.
///
/// Failures are reported as outcomes rather than errors; the round
/// controller logs them and carries on.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, manifest: &Path, namespace: &str) -> SubmissionOutcome;
}

/// Runs `<command> submit <manifest> -n <namespace>`.
pub struct ArgoSubmitter {
    command: String,
    timeout: Duration,
}

impl ArgoSubmitter {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl Default for ArgoSubmitter {
    fn default() -> Self {
        Self::new("argo", Duration::from_secs(60))
    }
}

#[async_trait]
impl Submitter for ArgoSubmitter {
    async fn submit(&self, manifest: &Path, namespace: &str) -> SubmissionOutcome {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("submit")
            .arg(manifest)
            .arg("-n")
            .arg(namespace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(command = %self.command, "Submission tool not found on PATH");
                return SubmissionOutcome::ToolMissing {
                    command: self.command.clone(),
                };
            }
            Err(e) => {
                tracing::error!(command = %self.command, error = %e, "Failed to spawn submission tool");
                return SubmissionOutcome::Rejected {
                    exit_code: -1,
                    stderr: e.to_string(),
                };
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return SubmissionOutcome::Rejected {
                    exit_code: -1,
                    stderr: e.to_string(),
                }
            }
            Err(_) => {
                let timeout_ms = saturating_millis(self.timeout);
                tracing::error!(timeout_ms, "Submission timed out");
                return SubmissionOutcome::TimedOut { timeout_ms };
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            tracing::info!(manifest = %manifest.display(), namespace, "Workflow submitted");
            SubmissionOutcome::Submitted { stdout }
        } else {
            let exit_code = output.status.code().unwrap_or(-1);
            tracing::error!(exit_code, stderr = %stderr.trim(), "Submission rejected");
            SubmissionOutcome::Rejected { exit_code, stderr }
        }
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
