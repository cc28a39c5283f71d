//! Verification port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Individual check inside a verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
}

/// Result of verifying a task's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub checks: Vec<Check>,
}

impl VerificationReport {
    pub fn passed(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
            checks: Vec::new(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, name: impl Into<String>, passed: bool) -> Self {
        self.checks.push(Check {
            name: name.into(),
            passed,
        });
        self
    }
}

/// The verification procedure itself broke. Distinct from a report with
/// `passed == false`.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Verifier unavailable: {0}")]
    Unavailable(String),

    #[error("Verifier timed out after {0}s")]
    Timeout(u64),

    #[error("Verifier produced unreadable output: {0}")]
    BadOutput(String),
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, task_id: Uuid) -> Result<VerificationReport, VerificationError>;
}
