//! Scripted collaborators for exercising the controller in tests.

use crate::pipeline::{Monitor, MonitorStatus, Stage, StageAgent, StageReport, StageRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One scripted step for a [`ScriptedAgent`].
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Return this report.
    Report(StageReport),
    /// Raise an error instead of reporting.
    Raise(String),
}

/// A stage collaborator that replays a fixed script, then a fallback.
///
/// Records every call so tests can assert invocation counts and request
/// contents.
pub struct ScriptedAgent {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: StageReport,
    requests: Mutex<Vec<StageRequest>>,
}

impl ScriptedAgent {
    /// An agent that always reports success with no data.
    #[must_use]
    pub fn always_success() -> Self {
        Self::with_script(Vec::new())
    }

    /// An agent that always reports success with the given data.
    #[must_use]
    pub fn success_with(data: HashMap<String, serde_json::Value>) -> Self {
        Self::with_script(Vec::new()).with_fallback(StageReport::success_with(data))
    }

    /// An agent that fails `times` times, then succeeds.
    #[must_use]
    pub fn fails_times(times: usize, message: impl Into<String>) -> Self {
        let message = message.into();
        let script = (0..times)
            .map(|_| ScriptedOutcome::Report(StageReport::failure(message.clone())))
            .collect();
        Self::with_script(script)
    }

    /// An agent whose first call raises instead of reporting.
    #[must_use]
    pub fn raises(message: impl Into<String>) -> Self {
        Self::with_script(vec![ScriptedOutcome::Raise(message.into())])
    }

    /// An agent that replays `script`, then falls back to plain success.
    #[must_use]
    pub fn with_script(script: Vec<ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: StageReport::success(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the fallback report used once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, report: StageReport) -> Self {
        self.fallback = report;
        self
    }

    /// Wraps the agent for injection into a `StageAgents` table.
    #[must_use]
    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Returns how many times the agent was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the recorded requests, oldest first.
    #[must_use]
    pub fn recorded_requests(&self) -> Vec<StageRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StageAgent for ScriptedAgent {
    async fn execute(&self, request: StageRequest) -> anyhow::Result<StageReport> {
        self.requests.lock().push(request);
        match self.script.lock().pop_front() {
            Some(ScriptedOutcome::Report(report)) => Ok(report),
            Some(ScriptedOutcome::Raise(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// One recorded monitor notification.
#[derive(Debug, Clone)]
pub struct MonitorUpdate {
    /// The stage reported on.
    pub stage: Stage,
    /// The reported status.
    pub status: MonitorStatus,
    /// Accompanying details, if any.
    pub data: Option<serde_json::Value>,
}

/// A monitor that records every notification for assertions.
#[derive(Default)]
pub struct CollectingMonitor {
    updates: Mutex<Vec<MonitorUpdate>>,
    completions: Mutex<Vec<bool>>,
}

impl CollectingMonitor {
    /// Creates an empty collecting monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded updates, oldest first.
    #[must_use]
    pub fn updates(&self) -> Vec<MonitorUpdate> {
        self.updates.lock().clone()
    }

    /// Returns the `(stage, status)` sequence, oldest first.
    #[must_use]
    pub fn statuses(&self) -> Vec<(Stage, MonitorStatus)> {
        self.updates
            .lock()
            .iter()
            .map(|u| (u.stage, u.status))
            .collect()
    }

    /// Returns how many `error` updates a stage received.
    #[must_use]
    pub fn error_count_for(&self, stage: Stage) -> usize {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.stage == stage && u.status == MonitorStatus::Error)
            .count()
    }

    /// Returns the recorded terminal outcomes.
    #[must_use]
    pub fn completions(&self) -> Vec<bool> {
        self.completions.lock().clone()
    }
}

#[async_trait]
impl Monitor for CollectingMonitor {
    async fn update(&self, stage: Stage, status: MonitorStatus, data: Option<serde_json::Value>) {
        self.updates.lock().push(MonitorUpdate {
            stage,
            status,
            data,
        });
    }

    async fn complete(&self, success: bool) {
        self.completions.lock().push(success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(stage: Stage) -> StageRequest {
        StageRequest {
            project: "demo".to_string(),
            run_id: "run_1".to_string(),
            stage,
            attempt: 1,
            prior: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_agent_replays_then_falls_back() {
        let agent = ScriptedAgent::fails_times(1, "bad kerning");

        let first = agent.execute(request(Stage::Quality)).await.unwrap();
        assert!(!first.is_success());

        let second = agent.execute(request(Stage::Quality)).await.unwrap();
        assert!(second.is_success());
        assert_eq!(agent.call_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_agent_raises() {
        let agent = ScriptedAgent::raises("generator crashed");
        let err = agent.execute(request(Stage::Content)).await.unwrap_err();
        assert_eq!(err.to_string(), "generator crashed");
    }

    #[tokio::test]
    async fn test_collecting_monitor_records_in_order() {
        let monitor = CollectingMonitor::new();
        monitor
            .update(Stage::Content, MonitorStatus::Running, None)
            .await;
        monitor
            .update(Stage::Content, MonitorStatus::Completed, None)
            .await;
        monitor.complete(true).await;

        assert_eq!(
            monitor.statuses(),
            vec![
                (Stage::Content, MonitorStatus::Running),
                (Stage::Content, MonitorStatus::Completed),
            ]
        );
        assert_eq!(monitor.completions(), vec![true]);
        assert_eq!(monitor.error_count_for(Stage::Content), 0);
    }
}
