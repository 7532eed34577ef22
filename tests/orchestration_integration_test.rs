//! 编排集成测试：构建器 + 持久化账本 + 受监管 Worker

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use autopilot::config::{ActionLogBackend, AppConfig, GoalSeed, LedgerBackend};
    use autopilot::core::{
        handler_fn, ActionLog, ActionResult, ChannelNotifier, GoalCategory, GoalSource, HandlerOutcome, OrchestratorBuilder,
        ShutdownManager, ShutdownReason, Task, TaskError,
    };

    fn config(data_dir: &std::path::Path) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = data_dir.to_path_buf();
        cfg.ledger.backend = LedgerBackend::Json;
        cfg.action_log.backend = ActionLogBackend::Sqlite;
        cfg.dispatch.inter_task_delay_ms = 0;
        cfg.supervisor.planner_cadence_secs = 1;
        cfg.supervisor.dispatch_cadence_secs = 1;
        cfg.supervisor.shutdown_grace_secs = 1;
        cfg.goals.push(GoalSeed {
            title: "Earn $1,000".to_string(),
            description: String::new(),
            category: GoalCategory::Income,
            target_value: 1000.0,
            current_value: 0.0,
            unit: "USD".to_string(),
            deadline: None,
            priority: 9,
            parent: None,
        });
        cfg
    }

    fn counting_apply(calls: Arc<AtomicUsize>) -> impl autopilot::core::TaskHandler {
        handler_fn(move |_task: Task| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(HandlerOutcome::done("applied").with_progress(10.0))
            }
        })
    }

    #[tokio::test]
    async fn test_idempotency_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let orch = OrchestratorBuilder::new(config(dir.path()))
                .register_handler("freelance", counting_apply(calls.clone()))
                .build()
                .unwrap();
            let mut task = Task::new("freelance_apply_to_jobs_0", "freelance", "apply_to_jobs")
                .with_rate_action("apply")
                .with_idempotency("applied_targets", "upwork:job-7");
            assert!(orch.dispatcher().dispatch(&mut task).await);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("ledger").join("applied_targets.json").exists());
    }

    #[tokio::test]
    async fn test_supervised_run_makes_goal_progress_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (notifier, _notes) = ChannelNotifier::new();
        let shutdown = Arc::new(ShutdownManager::new());

        let orch = Arc::new(
            OrchestratorBuilder::new(config(dir.path()))
                .register_handler("freelance", counting_apply(calls.clone()))
                .with_notifier(Arc::new(notifier))
                .with_cancel(shutdown.token())
                .build()
                .unwrap(),
        );

        let runner = {
            let orch = orch.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { orch.run(&shutdown).await })
        };

        // 派发 Worker 可能先于规划 Worker 跑完第一轮，等到第二轮
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.shutdown(ShutdownReason::UserInitiated);
        let aborted = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("shutdown is bounded")
            .unwrap();
        assert!(aborted.is_empty());

        // income 领域的 Worker 独立于其他领域派发申请任务
        assert!(calls.load(Ordering::SeqCst) >= 1);
        let goal = orch.goals().snapshot().into_iter().next().unwrap();
        assert!(goal.current_value >= 10.0);

        let log = orch.action_log().recent(100).unwrap();
        assert!(log.iter().any(|e| e.result == ActionResult::Success));
        // trading / email / learning 没有 Handler，被跳过
        assert!(log.iter().any(|e| e.result == ActionResult::Skipped));
    }
}
