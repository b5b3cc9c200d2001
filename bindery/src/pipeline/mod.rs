//! Pipeline controller: drives one run through the four fixed stages.
//!
//! The controller owns no domain logic. It invokes each stage's external
//! collaborator in order, reports progress to the monitor and the message
//! bus, tolerates quality failures through a bounded re-format loop, and
//! optionally persists run state through a checkpoint store. `run()` never
//! raises: every outcome, including collaborator panics' nearest equivalent
//! (an `Err` from the agent), is folded into the returned summary.

mod agents;
mod halt;
mod run;

mod integration_tests;

pub use agents::{
    Monitor, MonitorStatus, ReportStatus, StageAgent, StageAgents, StageReport, StageRequest,
};
pub use halt::HaltToken;
pub use run::{
    AgentMetrics, AgentState, MetricEvent, PipelineRun, RunOutcome, RunStatus, RunSummary, Stage,
};

use crate::bus::MessageBus;
use crate::checkpoint::{atomic_write, CheckpointStore};
use crate::errors::CheckpointError;
use crate::protocol::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default bound on quality validation attempts.
pub const DEFAULT_MAX_QUALITY_ATTEMPTS: u32 = 3;

/// Configuration for a [`PipelineController`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum quality validation attempts per run.
    pub max_quality_attempts: u32,
    /// Whether a failed validation re-invokes the format stage before the
    /// next attempt.
    pub auto_fix: bool,
    /// Where to write the finalized run metrics artifact, if anywhere.
    pub output_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_quality_attempts: DEFAULT_MAX_QUALITY_ATTEMPTS,
            auto_fix: true,
            output_dir: None,
        }
    }
}

impl RunConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the quality attempt bound.
    #[must_use]
    pub fn with_max_quality_attempts(mut self, attempts: u32) -> Self {
        self.max_quality_attempts = attempts.max(1);
        self
    }

    /// Enables or disables auto-fix.
    #[must_use]
    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }

    /// Sets the metrics artifact directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// No run in progress.
    Idle,
    /// The given stage is executing.
    Running(Stage),
    /// The last run completed all stages.
    Completed,
    /// The last run failed.
    Failed,
}

/// Accumulated per-run working state.
struct RunProgress {
    stage_data: HashMap<String, HashMap<String, serde_json::Value>>,
    stages_completed: Vec<Stage>,
    quality_attempts: u32,
}

/// Drives one run at a time through content, format, quality, publish.
///
/// Stages run strictly sequentially; every collaborator call is an awaited
/// suspension point. Multiple independent controllers may share one bus and
/// one checkpoint store root provided each store uses a distinct state
/// subdirectory.
pub struct PipelineController {
    config: RunConfig,
    agents: StageAgents,
    monitor: Arc<dyn Monitor>,
    bus: Arc<MessageBus>,
    checkpoints: Option<Arc<CheckpointStore>>,
    halt: HaltToken,
    status: Mutex<ControllerStatus>,
    run_gate: tokio::sync::Mutex<()>,
}

impl PipelineController {
    /// Creates a controller with explicitly injected collaborators.
    #[must_use]
    pub fn new(
        config: RunConfig,
        agents: StageAgents,
        monitor: Arc<dyn Monitor>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            config,
            agents,
            monitor,
            bus,
            checkpoints: None,
            halt: HaltToken::new(),
            status: Mutex::new(ControllerStatus::Idle),
            run_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Attaches a checkpoint store for run-state persistence.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Returns a token that halts the run at the next stage boundary.
    #[must_use]
    pub fn halt_token(&self) -> HaltToken {
        self.halt.clone()
    }

    /// Returns the observable controller state.
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        *self.status.lock()
    }

    /// Executes one full run for `project`.
    ///
    /// Never returns an error: failures are captured into the summary along
    /// with whatever partial stage results were already accumulated.
    pub async fn run(&self, project: &str) -> RunSummary {
        let _gate = self.run_gate.lock().await;

        let mut run = PipelineRun::new(project);
        run.status = RunStatus::Running;
        let mut progress = RunProgress {
            stage_data: HashMap::new(),
            stages_completed: Vec::new(),
            quality_attempts: 0,
        };

        info!(run_id = %run.id, project = %project, "Pipeline run started");
        self.emit_event(
            "pipeline_started",
            HashMap::from([
                ("run_id".to_string(), serde_json::json!(run.id)),
                ("project".to_string(), serde_json::json!(project)),
            ]),
        );

        for stage in Stage::ALL {
            if self.halt.is_halted() {
                let reason = self
                    .halt
                    .reason()
                    .unwrap_or_else(|| "halt requested".to_string());
                return self
                    .fail_run(run, progress, stage, format!("run halted: {reason}"))
                    .await;
            }

            *self.status.lock() = ControllerStatus::Running(stage);
            run.current_stage = Some(stage);

            let outcome = if stage == Stage::Quality {
                self.quality_loop(&mut run, &mut progress).await
            } else {
                self.run_stage(&mut run, stage, 1, &progress.stage_data)
                    .await
                    .map_err(|message| (stage, message))
            };

            match outcome {
                Ok(data) => {
                    progress.stage_data.insert(stage.as_str().to_string(), data);
                    progress.stages_completed.push(stage);
                    if let Err(err) = self.checkpoint_stage(&run, stage, &progress.stage_data) {
                        error!(stage = %stage, error = %err, "Failed to checkpoint run state");
                        run.metrics_mut(stage)
                            .record_error(format!("checkpoint failed: {err}"));
                    }
                }
                Err((failed_stage, message)) => {
                    return self.fail_run(run, progress, failed_stage, message).await;
                }
            }
        }

        run.current_stage = None;
        run.finalize(RunStatus::Completed);
        *self.status.lock() = ControllerStatus::Completed;
        self.monitor.complete(true).await;

        let artifact = Self::artifact_location(&progress.stage_data);
        self.emit_event(
            "pipeline_completed",
            HashMap::from([
                ("run_id".to_string(), serde_json::json!(run.id)),
                (
                    "duration_seconds".to_string(),
                    serde_json::json!(run.duration_seconds()),
                ),
                ("artifact".to_string(), serde_json::json!(artifact)),
            ]),
        );
        self.persist_metrics(&run);
        info!(run_id = %run.id, "Pipeline run completed");

        RunSummary {
            status: RunOutcome::Success,
            run_id: run.id.clone(),
            project_name: run.project_name.clone(),
            stages_completed: progress.stages_completed,
            stage_failed: None,
            error: None,
            quality_attempts: progress.quality_attempts,
            duration_seconds: run.duration_seconds(),
            artifact,
            stage_data: progress.stage_data,
            metrics: run,
        }
    }

    /// Runs one stage invocation through its collaborator.
    ///
    /// Returns the stage's data on success, or the failure message. Monitor
    /// `error` notifications are left to the terminal failure path so each
    /// failing run produces exactly one.
    async fn run_stage(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        attempt: u32,
        prior: &HashMap<String, HashMap<String, serde_json::Value>>,
    ) -> Result<HashMap<String, serde_json::Value>, String> {
        run.metrics_mut(stage).begin();
        self.monitor.update(stage, MonitorStatus::Running, None).await;
        self.emit_status(stage, "running", attempt);
        debug!(stage = %stage, attempt, "Stage started");

        let request = StageRequest {
            project: run.project_name.clone(),
            run_id: run.id.clone(),
            stage,
            attempt,
            prior: prior.clone(),
        };
        let outcome = self.agents.for_stage(stage).execute(request).await;

        let report = match outcome {
            Ok(report) if report.is_success() => report,
            Ok(report) => {
                let message = report
                    .error
                    .unwrap_or_else(|| "stage reported failure".to_string());
                let metrics = run.metrics_mut(stage);
                metrics.finish(AgentState::Error);
                metrics.record_error(message.clone());
                return Err(message);
            }
            Err(err) => {
                let message = err.to_string();
                let metrics = run.metrics_mut(stage);
                metrics.finish(AgentState::Error);
                metrics.record_error(message.clone());
                return Err(message);
            }
        };

        let metrics = run.metrics_mut(stage);
        metrics.finish(AgentState::Completed);
        metrics.record_event("completed", report.data.clone());
        let duration = metrics.duration_seconds;

        let mut stats = report.data.clone();
        stats.insert(
            "duration_seconds".to_string(),
            serde_json::json!(duration),
        );
        self.monitor
            .update(
                stage,
                MonitorStatus::Completed,
                Some(serde_json::json!(stats)),
            )
            .await;
        self.emit_status(stage, "completed", attempt);
        debug!(stage = %stage, attempt, "Stage completed");

        Ok(report.data)
    }

    /// Quality validation with the bounded auto-fix loop.
    ///
    /// On a failed attempt with auto-fix enabled and attempts remaining, the
    /// format stage is re-invoked before re-validating. Distinct from the
    /// generic retry executor: the corrective action is another stage, not
    /// the same call again.
    async fn quality_loop(
        &self,
        run: &mut PipelineRun,
        progress: &mut RunProgress,
    ) -> Result<HashMap<String, serde_json::Value>, (Stage, String)> {
        let max_attempts = self.config.max_quality_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            progress.quality_attempts = attempt;
            match self
                .run_stage(run, Stage::Quality, attempt, &progress.stage_data)
                .await
            {
                Ok(data) => return Ok(data),
                Err(message) => {
                    debug!(attempt, error = %message, "Quality validation failed");
                    last_error = message;
                    run.metrics_mut(Stage::Quality).record_event(
                        "validation_failed",
                        HashMap::from([(
                            "attempt".to_string(),
                            serde_json::json!(attempt),
                        )]),
                    );

                    if self.config.auto_fix && attempt < max_attempts {
                        self.emit_event(
                            "quality_retry",
                            HashMap::from([
                                ("run_id".to_string(), serde_json::json!(run.id)),
                                ("attempt".to_string(), serde_json::json!(attempt)),
                            ]),
                        );
                        let format_data = self
                            .run_stage(run, Stage::Format, attempt + 1, &progress.stage_data)
                            .await
                            .map_err(|message| (Stage::Format, message))?;
                        progress
                            .stage_data
                            .insert(Stage::Format.as_str().to_string(), format_data);
                    }
                }
            }
        }

        Err((
            Stage::Quality,
            format!("quality validation failed after {max_attempts} attempts: {last_error}"),
        ))
    }

    /// Terminal failure path: one monitor `error` notification, a bus event,
    /// finalized metrics, and a failure summary.
    async fn fail_run(
        &self,
        mut run: PipelineRun,
        progress: RunProgress,
        stage: Stage,
        message: String,
    ) -> RunSummary {
        self.monitor
            .update(
                stage,
                MonitorStatus::Error,
                Some(serde_json::json!({ "error": message })),
            )
            .await;
        self.emit_event(
            "pipeline_failed",
            HashMap::from([
                ("run_id".to_string(), serde_json::json!(run.id)),
                ("stage".to_string(), serde_json::json!(stage)),
                ("error".to_string(), serde_json::json!(message)),
            ]),
        );

        run.finalize(RunStatus::Failed);
        *self.status.lock() = ControllerStatus::Failed;
        self.monitor.complete(false).await;
        self.persist_metrics(&run);
        error!(run_id = %run.id, stage = %stage, error = %message, "Pipeline run failed");

        RunSummary {
            status: RunOutcome::Failed,
            run_id: run.id.clone(),
            project_name: run.project_name.clone(),
            stages_completed: progress.stages_completed,
            stage_failed: Some(stage),
            error: Some(message),
            quality_attempts: progress.quality_attempts,
            duration_seconds: run.duration_seconds(),
            artifact: None,
            stage_data: progress.stage_data,
            metrics: run,
        }
    }

    fn checkpoint_stage(
        &self,
        run: &PipelineRun,
        stage: Stage,
        stage_data: &HashMap<String, HashMap<String, serde_json::Value>>,
    ) -> Result<(), CheckpointError> {
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };
        store.update(HashMap::from([
            ("run_id".to_string(), serde_json::json!(run.id)),
            (
                "project".to_string(),
                serde_json::json!(run.project_name),
            ),
            (
                "last_completed_stage".to_string(),
                serde_json::json!(stage),
            ),
            (
                "stage_data".to_string(),
                serde_json::to_value(stage_data)?,
            ),
        ]))?;
        store.create_checkpoint(
            stage.as_str(),
            Some(HashMap::from([(
                "run_id".to_string(),
                serde_json::json!(run.id),
            )])),
        )?;
        Ok(())
    }

    fn persist_metrics(&self, run: &PipelineRun) {
        let Some(dir) = &self.config.output_dir else {
            return;
        };
        let write = || -> Result<(), CheckpointError> {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(format!("{}_metrics.json", run.id));
            let bytes = serde_json::to_vec_pretty(run)?;
            atomic_write(&path, &bytes)?;
            Ok(())
        };
        if let Err(err) = write() {
            error!(run_id = %run.id, error = %err, "Failed to persist run metrics");
        }
    }

    fn emit_event(&self, name: &str, fields: HashMap<String, serde_json::Value>) {
        self.bus
            .route(Message::event(name, fields).with_source("controller"));
    }

    fn emit_status(&self, stage: Stage, status: &str, attempt: u32) {
        self.bus.route(
            Message::status(
                status,
                Some(stage.as_str().to_string()),
                HashMap::from([("attempt".to_string(), serde_json::json!(attempt))]),
            )
            .with_source("controller"),
        );
    }

    /// Pulls the final artifact location out of accumulated stage data.
    fn artifact_location(
        stage_data: &HashMap<String, HashMap<String, serde_json::Value>>,
    ) -> Option<String> {
        for (stage, keys) in [
            (Stage::Publish, &["artifact", "output_path"][..]),
            (Stage::Format, &["pdf_path", "epub_path"][..]),
        ] {
            if let Some(data) = stage_data.get(stage.as_str()) {
                for key in keys {
                    if let Some(value) = data.get(*key).and_then(|v| v.as_str()) {
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    }
}
