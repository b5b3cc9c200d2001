//! Collaborator contracts: stage agents and the monitor.
//!
//! Agent internals are out of scope for the orchestration core; these traits
//! define only the contract a collaborator must satisfy to participate.
//! Agents are wired in through [`StageAgents`], a static table with one slot
//! per stage — there is no runtime registry and no name-based lookup, so an
//! unknown capability cannot be expressed at all.

use super::run::Stage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a collaborator reported about its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The stage's work succeeded.
    Success,
    /// The stage's work failed.
    Error,
}

/// The result contract every stage collaborator returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    /// Success or error.
    pub status: ReportStatus,
    /// Stage-specific result fields (e.g., `chapters`, `pdf_path`).
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Failure description when `status` is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    /// A success report with no data.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: ReportStatus::Success,
            data: HashMap::new(),
            error: None,
        }
    }

    /// A success report carrying data.
    #[must_use]
    pub fn success_with(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            status: ReportStatus::Success,
            data,
            error: None,
        }
    }

    /// An error report.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            data: HashMap::new(),
            error: Some(message.into()),
        }
    }

    /// Returns true if the report is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}

/// The request handed to a stage collaborator.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// The project being built.
    pub project: String,
    /// The owning run's id.
    pub run_id: String,
    /// Which stage is being invoked.
    pub stage: Stage,
    /// Invocation attempt (grows when the quality loop re-invokes).
    pub attempt: u32,
    /// Data returned by previously completed stages, keyed by stage name.
    pub prior: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// One stage's external collaborator.
///
/// Returning `Err` and returning a report with `status: error` are
/// equivalent: the controller treats both as the same stage failure.
#[async_trait]
pub trait StageAgent: Send + Sync {
    /// Performs the stage's domain work.
    async fn execute(&self, request: StageRequest) -> anyhow::Result<StageReport>;
}

/// Status values reported to the monitor for each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    /// The stage started executing.
    Running,
    /// The stage finished successfully.
    Completed,
    /// The stage failed.
    Error,
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// The progress-observing collaborator.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Reports a stage transition, optionally with details.
    async fn update(&self, stage: Stage, status: MonitorStatus, data: Option<serde_json::Value>);

    /// Reports the terminal outcome of the run.
    async fn complete(&self, success: bool);
}

/// The static capability table: one collaborator per stage.
#[derive(Clone)]
pub struct StageAgents {
    /// Content preparation collaborator.
    pub content: Arc<dyn StageAgent>,
    /// Format rendering collaborator.
    pub format: Arc<dyn StageAgent>,
    /// Quality validation collaborator.
    pub quality: Arc<dyn StageAgent>,
    /// Publishing collaborator.
    pub publish: Arc<dyn StageAgent>,
}

impl StageAgents {
    /// Builds the table from one collaborator per stage.
    #[must_use]
    pub fn new(
        content: Arc<dyn StageAgent>,
        format: Arc<dyn StageAgent>,
        quality: Arc<dyn StageAgent>,
        publish: Arc<dyn StageAgent>,
    ) -> Self {
        Self {
            content,
            format,
            quality,
            publish,
        }
    }

    /// Returns the collaborator for a stage.
    #[must_use]
    pub fn for_stage(&self, stage: Stage) -> &Arc<dyn StageAgent> {
        match stage {
            Stage::Content => &self.content,
            Stage::Format => &self.format,
            Stage::Quality => &self.quality,
            Stage::Publish => &self.publish,
        }
    }
}
