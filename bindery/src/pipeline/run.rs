//! Run and metrics model for pipeline executions.

use crate::utils::short_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One of the four fixed pipeline stages, always executed in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Chapter preparation.
    Content,
    /// Rendering into distributable formats.
    Format,
    /// Validation of the rendered artifacts.
    Quality,
    /// Distribution to publishing targets.
    Publish,
}

impl Stage {
    /// The fixed execution order.
    pub const ALL: [Self; 4] = [Self::Content, Self::Format, Self::Quality, Self::Publish];

    /// Returns the stage's wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Format => "format",
            Self::Quality => "quality",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run exists but has not started a stage yet.
    Initializing,
    /// A stage is executing.
    Running,
    /// All four stages succeeded.
    Completed,
    /// A stage failed; the run stopped.
    Failed,
}

/// Execution status of one stage's collaborator within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Not yet invoked.
    Idle,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
}

/// A timestamped event recorded into a stage's metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    /// When the event was recorded (ISO 8601).
    pub timestamp: String,
    /// Short event label (e.g., "completed", "retry").
    pub label: String,
    /// Event details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

/// Per-stage execution statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// The stage name.
    pub name: String,
    /// Current execution status.
    pub status: AgentState,
    /// When the last invocation started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the last invocation ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock duration of the last invocation.
    pub duration_seconds: f64,
    /// Recorded events, oldest first.
    #[serde(default)]
    pub events: Vec<MetricEvent>,
    /// Errors encountered across invocations.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl AgentMetrics {
    /// Creates idle metrics for a stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AgentState::Idle,
            start_time: None,
            end_time: None,
            duration_seconds: 0.0,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Marks the start of an invocation.
    pub fn begin(&mut self) {
        self.status = AgentState::Running;
        self.start_time = Some(Utc::now());
        self.end_time = None;
    }

    /// Marks the end of an invocation with the given terminal status.
    pub fn finish(&mut self, status: AgentState) {
        let now = Utc::now();
        if let Some(start) = self.start_time {
            self.duration_seconds = (now - start).num_milliseconds() as f64 / 1000.0;
        }
        self.end_time = Some(now);
        self.status = status;
    }

    /// Records a labelled event.
    pub fn record_event(&mut self, label: impl Into<String>, data: HashMap<String, serde_json::Value>) {
        self.events.push(MetricEvent {
            timestamp: crate::utils::iso_timestamp(),
            label: label.into(),
            data,
        });
    }

    /// Records an error message.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// The mutable record of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id.
    pub id: String,
    /// The project being built.
    pub project_name: String,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended, once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// The stage currently (or last) executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    /// Per-stage metrics keyed by stage name.
    #[serde(default)]
    pub stages: HashMap<String, AgentMetrics>,
}

impl PipelineRun {
    /// Creates a new run for a project.
    #[must_use]
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            id: short_id("run"),
            project_name: project_name.into(),
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Initializing,
            current_stage: None,
            stages: HashMap::new(),
        }
    }

    /// Returns the metrics entry for a stage, creating it on first access.
    pub fn metrics_mut(&mut self, stage: Stage) -> &mut AgentMetrics {
        self.stages
            .entry(stage.as_str().to_string())
            .or_insert_with(|| AgentMetrics::new(stage.as_str()))
    }

    /// Marks the run terminal with the given status.
    pub fn finalize(&mut self, status: RunStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    /// Total wall-clock duration so far.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// All stages completed.
    Success,
    /// A stage failed or the run was halted.
    Failed,
}

/// The value returned by every run, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Terminal outcome.
    pub status: RunOutcome,
    /// The run id.
    pub run_id: String,
    /// The project name.
    pub project_name: String,
    /// Stages that completed, in execution order.
    pub stages_completed: Vec<Stage>,
    /// The stage that failed, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_failed: Option<Stage>,
    /// The failure description, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Quality validation attempts made.
    pub quality_attempts: u32,
    /// Total run duration.
    pub duration_seconds: f64,
    /// Final artifact location, when publish reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Data returned by each completed stage (partial on failure).
    pub stage_data: HashMap<String, HashMap<String, serde_json::Value>>,
    /// Full per-stage metrics.
    pub metrics: PipelineRun,
}

impl RunSummary {
    /// Returns true if the run completed all stages.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunOutcome::Success
    }
}
