//! End-to-end tests driving the controller with scripted collaborators.

#[cfg(test)]
mod tests {
    use crate::bus::MessageBus;
    use crate::checkpoint::{CheckpointConfig, CheckpointStore};
    use crate::pipeline::{
        MonitorStatus, PipelineController, PipelineRun, RunConfig, RunStatus, Stage, StageAgents,
    };
    use crate::protocol::{Message, Payload};
    use crate::testing::{CollectingMonitor, ScriptedAgent};
    use futures::future::join_all;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Harness {
        content: Arc<ScriptedAgent>,
        format: Arc<ScriptedAgent>,
        quality: Arc<ScriptedAgent>,
        publish: Arc<ScriptedAgent>,
        monitor: Arc<CollectingMonitor>,
        bus: Arc<MessageBus>,
    }

    impl Harness {
        fn new(
            content: ScriptedAgent,
            format: ScriptedAgent,
            quality: ScriptedAgent,
            publish: ScriptedAgent,
        ) -> Self {
            Self {
                content: content.into_arc(),
                format: format.into_arc(),
                quality: quality.into_arc(),
                publish: publish.into_arc(),
                monitor: Arc::new(CollectingMonitor::new()),
                bus: Arc::new(MessageBus::default()),
            }
        }

        fn all_success() -> Self {
            Self::new(
                ScriptedAgent::always_success(),
                ScriptedAgent::always_success(),
                ScriptedAgent::always_success(),
                ScriptedAgent::always_success(),
            )
        }

        fn controller(&self, config: RunConfig) -> PipelineController {
            PipelineController::new(
                config,
                StageAgents::new(
                    self.content.clone(),
                    self.format.clone(),
                    self.quality.clone(),
                    self.publish.clone(),
                ),
                self.monitor.clone(),
                self.bus.clone(),
            )
        }
    }

    fn drain(receiver: &mut tokio::sync::mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_stage_ordering_with_all_successes() {
        let harness = Harness::all_success();
        let controller = harness.controller(RunConfig::new());

        let summary = controller.run("demo").await;
        assert!(summary.is_success());

        let expected: Vec<(Stage, MonitorStatus)> = Stage::ALL
            .iter()
            .flat_map(|&stage| {
                [
                    (stage, MonitorStatus::Running),
                    (stage, MonitorStatus::Completed),
                ]
            })
            .collect();
        assert_eq!(harness.monitor.statuses(), expected);
        assert_eq!(harness.monitor.completions(), vec![true]);
    }

    #[tokio::test]
    async fn test_quality_loop_reinvokes_format() {
        let harness = Harness::new(
            ScriptedAgent::always_success(),
            ScriptedAgent::always_success(),
            ScriptedAgent::fails_times(2, "widows and orphans"),
            ScriptedAgent::always_success(),
        );
        let controller = harness.controller(RunConfig::new().with_max_quality_attempts(3));

        let summary = controller.run("demo").await;

        assert!(summary.is_success());
        assert_eq!(summary.quality_attempts, 3);
        // Initial format invocation plus exactly two auto-fix re-invocations.
        assert_eq!(harness.format.call_count(), 3);
        assert_eq!(harness.quality.call_count(), 3);
    }

    #[tokio::test]
    async fn test_demo_scenario() {
        let harness = Harness::new(
            ScriptedAgent::success_with(HashMap::from([(
                "chapters".to_string(),
                serde_json::json!(5),
            )])),
            ScriptedAgent::success_with(HashMap::from([(
                "pdf_path".to_string(),
                serde_json::json!("/x.pdf"),
            )])),
            ScriptedAgent::fails_times(1, "low readability score"),
            ScriptedAgent::success_with(HashMap::from([(
                "platforms".to_string(),
                serde_json::json!(["local"]),
            )])),
        );
        let controller = harness.controller(RunConfig::new());

        let summary = controller.run("demo").await;

        assert!(summary.is_success());
        assert_eq!(
            summary.stages_completed,
            vec![Stage::Content, Stage::Format, Stage::Quality, Stage::Publish]
        );
        assert_eq!(summary.quality_attempts, 2);
        assert_eq!(
            summary.stage_data["content"]["chapters"],
            serde_json::json!(5)
        );
        assert_eq!(
            summary.stage_data["publish"]["platforms"],
            serde_json::json!(["local"])
        );
        assert_eq!(summary.artifact.as_deref(), Some("/x.pdf"));
    }

    #[tokio::test]
    async fn test_content_failure_stops_the_run() {
        let harness = Harness::new(
            ScriptedAgent::raises("chapter source missing"),
            ScriptedAgent::always_success(),
            ScriptedAgent::always_success(),
            ScriptedAgent::always_success(),
        );
        let controller = harness.controller(RunConfig::new());

        let summary = controller.run("demo").await;

        assert!(!summary.is_success());
        assert_eq!(summary.stage_failed, Some(Stage::Content));
        assert!(summary.error.unwrap().contains("chapter source missing"));
        assert!(summary.stages_completed.is_empty());

        // Exactly one error notification, and only for content.
        assert_eq!(harness.monitor.error_count_for(Stage::Content), 1);
        assert_eq!(harness.monitor.error_count_for(Stage::Format), 0);
        assert_eq!(harness.monitor.completions(), vec![false]);

        // Later stages were never invoked.
        assert_eq!(harness.format.call_count(), 0);
        assert_eq!(harness.quality.call_count(), 0);
        assert_eq!(harness.publish.call_count(), 0);
    }

    #[tokio::test]
    async fn test_quality_exhaustion_fails_the_run() {
        let harness = Harness::new(
            ScriptedAgent::always_success(),
            ScriptedAgent::always_success(),
            ScriptedAgent::fails_times(10, "still unreadable"),
            ScriptedAgent::always_success(),
        );
        let controller = harness.controller(RunConfig::new().with_max_quality_attempts(3));

        let summary = controller.run("demo").await;

        assert!(!summary.is_success());
        assert_eq!(summary.stage_failed, Some(Stage::Quality));
        assert_eq!(summary.quality_attempts, 3);
        // Initial invocation plus a re-invocation after each of the first
        // two failed attempts.
        assert_eq!(harness.format.call_count(), 3);
        assert_eq!(harness.publish.call_count(), 0);
        assert_eq!(harness.monitor.error_count_for(Stage::Quality), 1);
    }

    #[tokio::test]
    async fn test_auto_fix_disabled_revalidates_without_format() {
        let harness = Harness::new(
            ScriptedAgent::always_success(),
            ScriptedAgent::always_success(),
            ScriptedAgent::fails_times(2, "flagged"),
            ScriptedAgent::always_success(),
        );
        let controller = harness.controller(
            RunConfig::new()
                .with_max_quality_attempts(3)
                .with_auto_fix(false),
        );

        let summary = controller.run("demo").await;

        assert!(summary.is_success());
        assert_eq!(summary.quality_attempts, 3);
        assert_eq!(harness.format.call_count(), 1);
    }

    #[tokio::test]
    async fn test_dashboard_observes_run_over_the_bus() {
        let harness = Harness::all_success();
        let mut dashboard = harness.bus.connect();
        drain(&mut dashboard.receiver);

        let controller = harness.controller(RunConfig::new());
        let summary = controller.run("demo").await;
        assert!(summary.is_success());

        let inbox = drain(&mut dashboard.receiver);
        let events: Vec<&str> = inbox
            .iter()
            .filter_map(Message::event_name)
            .collect();
        assert_eq!(events.first(), Some(&"pipeline_started"));
        assert_eq!(events.last(), Some(&"pipeline_completed"));

        let statuses: Vec<(String, String)> = inbox
            .iter()
            .filter_map(|message| match &message.payload {
                Payload::Status(status) => Some((
                    status.stage.clone().unwrap_or_default(),
                    status.status.clone(),
                )),
                _ => None,
            })
            .collect();
        let expected: Vec<(String, String)> = Stage::ALL
            .iter()
            .flat_map(|stage| {
                [
                    (stage.as_str().to_string(), "running".to_string()),
                    (stage.as_str().to_string(), "completed".to_string()),
                ]
            })
            .collect();
        assert_eq!(statuses, expected);
    }

    #[tokio::test]
    async fn test_run_state_checkpointed_per_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            CheckpointStore::open(CheckpointConfig::new(dir.path())).unwrap(),
        );

        let harness = Harness::all_success();
        let controller = harness
            .controller(RunConfig::new())
            .with_checkpoints(store.clone());

        let summary = controller.run("demo").await;
        assert!(summary.is_success());

        for stage in Stage::ALL {
            assert_eq!(
                store.list_checkpoints(Some(stage.as_str())).len(),
                1,
                "missing checkpoint for {stage}"
            );
        }
        assert_eq!(
            store.get("run_id"),
            Some(serde_json::json!(summary.run_id))
        );
        assert_eq!(
            store.get("last_completed_stage"),
            Some(serde_json::json!("publish"))
        );
    }

    #[tokio::test]
    async fn test_metrics_artifact_written_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::all_success();
        let controller = harness.controller(RunConfig::new().with_output_dir(dir.path()));

        let summary = controller.run("demo").await;
        assert!(summary.is_success());

        let path = dir.path().join(format!("{}_metrics.json", summary.run_id));
        let bytes = std::fs::read(path).unwrap();
        let run: PipelineRun = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stages.len(), 4);
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_stage_results() {
        let harness = Harness::new(
            ScriptedAgent::success_with(HashMap::from([(
                "chapters".to_string(),
                serde_json::json!(12),
            )])),
            ScriptedAgent::raises("renderer out of memory"),
            ScriptedAgent::always_success(),
            ScriptedAgent::always_success(),
        );
        let controller = harness.controller(RunConfig::new());

        let summary = controller.run("demo").await;

        assert!(!summary.is_success());
        assert_eq!(summary.stage_failed, Some(Stage::Format));
        assert_eq!(summary.stages_completed, vec![Stage::Content]);
        assert_eq!(
            summary.stage_data["content"]["chapters"],
            serde_json::json!(12)
        );
        assert!(!summary.stage_data.contains_key("format"));
    }

    #[tokio::test]
    async fn test_independent_controllers_share_one_bus() {
        let bus = Arc::new(MessageBus::default());
        let make_controller = || {
            PipelineController::new(
                RunConfig::new(),
                StageAgents::new(
                    ScriptedAgent::always_success().into_arc(),
                    ScriptedAgent::always_success().into_arc(),
                    ScriptedAgent::always_success().into_arc(),
                    ScriptedAgent::always_success().into_arc(),
                ),
                Arc::new(CollectingMonitor::new()),
                bus.clone(),
            )
        };
        let first = make_controller();
        let second = make_controller();

        let summaries = join_all([first.run("alpha"), second.run("beta")]).await;
        assert!(summaries.iter().all(|summary| summary.is_success()));
        assert_ne!(summaries[0].run_id, summaries[1].run_id);
    }
}
