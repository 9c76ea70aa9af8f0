mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::{harness, harness_with, params, HarnessOptions};
use scheduler_config::HostPolicyConfig;
use scheduler_dispatcher::{
    HostPolicyRegistry, PlacementOutcome, PlacementRequest, TaskEngine, TaskEngineConfig,
};
use scheduler_domain::{
    CalculationResult, Calculator, Entity, JobRepository, JobState, Parameters, TaskRepository,
    TaskState,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::InMemoryTaskRepository;
use scheduler_observability::MetricsCollector;
use scheduler_testing_utils::{
    AccountBuilder, AllocationBuilder, EntityBuilder, HostBuilder, MockCalculator,
    ProjectBuilder, SequenceChooser, TestEnv, QUEST_TEMPLATE,
};

#[tokio::test]
async fn test_create_is_idempotent_with_project_union() {
    let h = harness().await;
    h.env.registry.add_project(ProjectBuilder::new(2, "alloys").build()).await;

    let first = h
        .task_engine
        .create(42, "static", params(json!({"encut": 520})), None, Some(BTreeSet::from([1])))
        .await
        .unwrap();
    let second = h
        .task_engine
        .create(42, "static", params(json!({"encut": 520})), None, Some(BTreeSet::from([2])))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.project_ids, BTreeSet::from([1, 2]));
    assert_eq!(h.env.tasks.count().await, 1);
    assert_eq!(h.reload(first.id).await.project_ids, BTreeSet::from([1, 2]));

    // 参数不同则是另一个任务
    let other = h
        .task_engine
        .create(42, "static", params(json!({"encut": 600})), None, None)
        .await
        .unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn test_create_defaults() {
    let h = harness().await;
    h.env
        .entities
        .insert(EntityBuilder::new(7).with_workload(30).with_projects([1, 3]).build())
        .await;

    let task = h.static_task(json!({})).await;
    assert_eq!(task.priority, 40);
    assert_eq!(task.project_ids, BTreeSet::from([1]));
    assert_eq!(task.state, TaskState::Ready);

    let big = h
        .task_engine
        .create(7, "relaxation", params(json!({})), None, None)
        .await
        .unwrap();
    assert_eq!(big.priority, 50);
    assert_eq!(big.project_ids, BTreeSet::from([1, 3]));
}

#[tokio::test]
async fn test_explicit_priority_updates_existing_task() {
    let h = harness().await;
    let task = h.static_task(json!({})).await;
    let again = h
        .task_engine
        .create(42, "static", params(json!({})), Some(5), None)
        .await
        .unwrap();
    assert_eq!(again.id, task.id);
    assert_eq!(h.reload(task.id).await.priority, 5);

    let unchanged = h.static_task(json!({})).await;
    assert_eq!(unchanged.priority, 5);
}

#[tokio::test]
async fn test_create_unknown_entity() {
    let h = harness().await;
    let err = h
        .task_engine
        .create(999, "static", params(json!({})), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::EntityNotFound { id: 999 }));
}

#[tokio::test]
async fn test_held_entity_is_not_eligible() {
    let h = harness().await;
    let mut task = h.static_task(json!({})).await;
    assert!(h.task_engine.is_eligible(&task).await.unwrap());

    h.env.entities.set_holds(42, vec!["manual".to_string()]).await;
    assert!(!h.task_engine.is_eligible(&task).await.unwrap());

    let outcome = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Skipped(_)));
    assert_eq!(h.env.calculator.call_count(), 0);
    assert_eq!(h.reload(task.id).await.state, TaskState::Ready);
}

#[tokio::test]
async fn test_place_creates_job_and_runs_task() {
    let h = harness().await;
    let mut task = h.static_task(json!({"encut": 520})).await;

    let outcome = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();
    let PlacementOutcome::Placed(job) = outcome else {
        panic!("expected a job, got {outcome:?}");
    };

    assert_eq!(job.state, JobState::Ready);
    assert_eq!(job.allocation_id, 1);
    assert_eq!(job.account_id, 1);
    assert_eq!(job.nodes, 1);
    assert_eq!(job.ncpus, 8);
    assert_eq!(job.walltime_seconds, 14_400);
    assert_eq!(job.description, "42_static_encut:520");
    assert_eq!(job.run_path, "/scratch/oqmd/42_static_encut:520");

    assert_eq!(task.state, TaskState::Running);
    assert_eq!(h.reload(task.id).await.state, TaskState::Running);
    assert_eq!(h.env.registry.in_use(1).await, Some(1));

    // 放置参数只传给计算函数，不写回任务
    let calls = h.env.calculator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].parameters["node_count"], json!(1));
    assert_eq!(calls[0].parameters["walltime_hours"], json!(4.0));
    assert_eq!(
        calls[0].parameters["parallelization"],
        json!({"ncore": 8, "kpar": 4})
    );
    assert!(!h.reload(task.id).await.parameters.contains_key("node_count"));
}

#[tokio::test]
async fn test_converged_calculation_completes_task() {
    let env = TestEnv::new().await;
    env.calculator.set_fallback(CalculationResult {
        kind: "static".to_string(),
        converged: true,
        instructions: Parameters::new(),
    });
    let h = harness_with(env, HarnessOptions::default());
    let mut task = h.static_task(json!({})).await;

    let outcome = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();
    assert_eq!(outcome, PlacementOutcome::Completed);

    let stored = h.reload(task.id).await;
    assert_eq!(stored.state, TaskState::Completed);
    assert!(stored.finished_at.is_some());
    assert_eq!(h.env.registry.in_use(1).await, Some(0));
}

#[tokio::test]
async fn test_unconverged_without_instructions_fails_task() {
    let env = TestEnv::new().await;
    env.calculator.set_fallback(CalculationResult {
        kind: "static".to_string(),
        converged: false,
        instructions: Parameters::new(),
    });
    let h = harness_with(env, HarnessOptions::default());
    let mut task = h.static_task(json!({})).await;

    let outcome = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();
    assert_eq!(outcome, PlacementOutcome::Failed);
    assert_eq!(h.reload(task.id).await.state, TaskState::Failed);
    assert!(h.env.jobs.all().await.is_empty());
}

#[tokio::test]
async fn test_explicit_project_without_allocations_is_unavailable() {
    let h = harness().await;
    h.env
        .registry
        .add_project(ProjectBuilder::new(2, "empty").with_users([1]).build())
        .await;
    let mut task = h
        .task_engine
        .create(42, "static", params(json!({})), None, Some(BTreeSet::from([1, 2])))
        .await
        .unwrap();
    let before = h.reload(task.id).await;

    let err = h
        .task_engine
        .place(&mut task, PlacementRequest::for_project(2))
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::ResourceUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(task, before);
    assert_eq!(h.reload(task.id).await, before);
    assert_eq!(h.env.calculator.call_count(), 0);
    assert!(h.env.jobs.all().await.is_empty());
}

#[tokio::test]
async fn test_full_allocation_is_unavailable_for_explicit_project() {
    let h = harness().await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(1, "b1004", 1).with_capacity(0).build())
        .await;
    let mut task = h.static_task(json!({})).await;

    let err = h
        .task_engine
        .place(&mut task, PlacementRequest::for_project(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceUnavailable(_)));
    assert_eq!(h.reload(task.id).await.state, TaskState::Ready);
}

#[tokio::test]
async fn test_no_schedulable_project_skips_placement() {
    let h = harness().await;
    h.env
        .registry
        .add_project(
            ProjectBuilder::new(1, "chem")
                .with_users([1])
                .with_allocations([1])
                .held()
                .build(),
        )
        .await;
    let mut task = h.static_task(json!({})).await;

    let outcome = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Skipped(_)));
    assert_eq!(h.reload(task.id).await.state, TaskState::Ready);
}

#[tokio::test]
async fn test_host_request_selects_allocation_on_host() {
    let h = harness().await;
    h.env.registry.add_host(HostBuilder::new(2, "edison").build()).await;
    h.env
        .registry
        .add_account(AccountBuilder::new(2, 1, 2).build())
        .await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(2, "m1234", 2).build())
        .await;
    h.env.templates.insert("edison", QUEST_TEMPLATE).await;
    h.env
        .registry
        .add_project(
            ProjectBuilder::new(1, "chem")
                .with_users([1])
                .with_allocations([1, 2])
                .build(),
        )
        .await;

    let jobs = {
        let task = h.static_task(json!({})).await;
        h.task_engine
            .get_jobs(task.id, PlacementRequest::on_host(2))
            .await
            .unwrap()
    };
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].allocation_id, 2);
    assert_eq!(jobs[0].account_id, 2);
}

#[tokio::test]
async fn test_host_without_projects_is_unavailable() {
    let h = harness().await;
    h.env.registry.add_host(HostBuilder::new(2, "edison").build()).await;
    let task = h.static_task(json!({})).await;

    let err = h
        .task_engine
        .get_jobs(task.id, PlacementRequest::on_host(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceUnavailable(_)));
}

#[tokio::test]
async fn test_missing_binary_fails_task_and_releases_slot() {
    let h = harness().await;
    h.env
        .registry
        .add_host(HostBuilder::new(1, "quest").without_binaries().build())
        .await;
    let mut task = h.static_task(json!({})).await;

    let err = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::AllocationMisconfigured(_)));
    assert!(err.is_fatal());
    assert_eq!(h.reload(task.id).await.state, TaskState::Failed);
    assert_eq!(h.env.registry.in_use(1).await, Some(0));
    assert!(h.env.jobs.all().await.is_empty());
}

#[tokio::test]
async fn test_missing_template_is_fatal() {
    let h = harness().await;
    h.env
        .registry
        .add_host(HostBuilder::new(1, "quest").with_template("unknown").build())
        .await;
    let mut task = h.static_task(json!({})).await;

    let err = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(h.reload(task.id).await.state, TaskState::Failed);
    assert_eq!(h.env.registry.in_use(1).await, Some(0));
}

#[tokio::test]
async fn test_capacity_is_never_exceeded_under_concurrent_placement() {
    let h = harness().await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(1, "b1004", 1).with_capacity(3).build())
        .await;

    let mut tasks = Vec::new();
    for i in 0..12 {
        tasks.push(h.static_task(json!({"encut": 400 + i})).await);
    }

    let mut handles = Vec::new();
    for mut task in tasks {
        let engine = Arc::clone(&h.task_engine);
        handles.push(tokio::spawn(async move {
            engine.place(&mut task, PlacementRequest::for_project(1)).await
        }));
    }

    let mut placed = 0;
    for result in futures::future::join_all(handles).await {
        match result.unwrap() {
            Ok(PlacementOutcome::Placed(_)) => placed += 1,
            Ok(other) => panic!("unexpected outcome {other:?}"),
            Err(e) => assert!(e.is_retryable(), "unexpected error {e}"),
        }
    }

    assert_eq!(placed, 3);
    assert_eq!(h.env.registry.in_use(1).await, Some(3));
    assert_eq!(h.env.jobs.find_active().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_task_with_active_job_is_skipped() {
    let h = harness().await;
    let mut task = h.static_task(json!({})).await;
    h.task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();

    // 人工把任务放回就绪状态，已有活跃作业时不再放置
    let mut stored = h.reload(task.id).await;
    stored.requeue().unwrap();
    h.env.tasks.update(&stored).await.unwrap();

    let outcome = h
        .task_engine
        .place(&mut stored, PlacementRequest::default())
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Skipped(_)));
    assert_eq!(h.env.jobs.find_by_task(task.id).await.unwrap().len(), 1);
    assert_eq!(h.env.registry.in_use(1).await, Some(1));
}

#[tokio::test]
async fn test_task_helpers() {
    let h = harness().await;
    let task = h.static_task(json!({})).await;
    assert_eq!(h.task_engine.last_job_state(task.id).await.unwrap(), None);

    let held = h.task_engine.hold(task.id).await.unwrap();
    assert_eq!(held.state, TaskState::Held);
    assert!(h.task_engine.retry(task.id).await.is_err());

    let released = h.task_engine.release(task.id).await.unwrap();
    assert_eq!(released.state, TaskState::Ready);

    let jobs = h
        .task_engine
        .get_jobs(task.id, PlacementRequest::default())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(h.task_engine.jobs(task.id).await.unwrap(), jobs);
    assert_eq!(
        h.task_engine.last_job_state(task.id).await.unwrap(),
        Some(JobState::Ready)
    );

    let failed = h.task_engine.fail(task.id).await.unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    let retried = h.task_engine.retry(task.id).await.unwrap();
    assert_eq!(retried.state, TaskState::Ready);

    let completed = h.task_engine.complete(task.id).await.unwrap();
    assert_eq!(completed.state, TaskState::Completed);
    assert!(completed.finished_at.is_some());
    assert!(h.task_engine.release(task.id).await.is_err());
}

#[tokio::test]
async fn test_uniform_project_choice_uses_injected_chooser() {
    let env = TestEnv::new().await;
    env.registry.add_allocation(AllocationBuilder::new(2, "p20746", 1).build()).await;
    env.registry
        .add_project(
            ProjectBuilder::new(2, "alloys")
                .with_users([1])
                .with_allocations([2])
                .build(),
        )
        .await;
    let h = harness_with(
        env,
        HarnessOptions {
            chooser: Arc::new(SequenceChooser::new([1])),
            ..HarnessOptions::default()
        },
    );

    let mut task = h
        .task_engine
        .create(42, "static", params(json!({})), None, Some(BTreeSet::from([1, 2])))
        .await
        .unwrap();
    let PlacementOutcome::Placed(job) = h
        .task_engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap()
    else {
        panic!("expected a job");
    };
    assert_eq!(job.allocation_id, 2);
}

#[tokio::test]
async fn test_place_rechecks_stored_task() {
    let h = harness().await;
    h.env.registry.add_project(ProjectBuilder::new(2, "alloys").build()).await;
    h.static_task(json!({"encut": 520})).await;
    let mut snapshot = h.env.tasks.find_ready(10).await.unwrap().remove(0);

    // 取得快照之后任务被并入新项目并挂起
    h.task_engine
        .create(42, "static", params(json!({"encut": 520})), None, Some(BTreeSet::from([2])))
        .await
        .unwrap();
    h.task_engine.hold(snapshot.id).await.unwrap();

    let outcome = h
        .task_engine
        .place(&mut snapshot, PlacementRequest::default())
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Skipped(_)));

    let stored = h.reload(snapshot.id).await;
    assert_eq!(stored.state, TaskState::Held);
    assert_eq!(stored.project_ids, BTreeSet::from([1, 2]));
    assert_eq!(snapshot, stored);
    assert_eq!(h.env.calculator.call_count(), 0);
    assert!(h.env.jobs.all().await.is_empty());
}

#[tokio::test]
async fn test_place_keeps_projects_merged_after_snapshot() {
    let h = harness().await;
    h.env.registry.add_project(ProjectBuilder::new(2, "alloys").build()).await;
    h.static_task(json!({"encut": 520})).await;
    let mut snapshot = h.env.tasks.find_ready(10).await.unwrap().remove(0);

    h.task_engine
        .create(42, "static", params(json!({"encut": 520})), None, Some(BTreeSet::from([2])))
        .await
        .unwrap();

    let outcome = h
        .task_engine
        .place(&mut snapshot, PlacementRequest::for_project(1))
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Placed(_)));

    let stored = h.reload(snapshot.id).await;
    assert_eq!(stored.state, TaskState::Running);
    assert_eq!(stored.project_ids, BTreeSet::from([1, 2]));
}

/// 计算期间把实体上的就绪任务挂起
struct HoldDuringCompute {
    tasks: Arc<InMemoryTaskRepository>,
    inner: Arc<MockCalculator>,
}

#[async_trait]
impl Calculator for HoldDuringCompute {
    async fn compute(
        &self,
        module: &str,
        entity: &Entity,
        parameters: &Parameters,
    ) -> SchedulerResult<CalculationResult> {
        for mut task in self.tasks.find_by_entity(entity.id).await? {
            if task.state == TaskState::Ready {
                task.hold()?;
                self.tasks.update_state(&task, TaskState::Ready).await?;
            }
        }
        self.inner.compute(module, entity, parameters).await
    }
}

#[tokio::test]
async fn test_hold_during_placement_discards_new_job() {
    let h = harness().await;
    let engine = TaskEngine::new(
        h.env.tasks.clone(),
        h.env.jobs.clone(),
        h.env.entities.clone(),
        h.env.registry.clone(),
        Arc::new(HoldDuringCompute {
            tasks: h.env.tasks.clone(),
            inner: h.env.calculator.clone(),
        }),
        Arc::new(SequenceChooser::first()),
        Arc::new(HostPolicyRegistry::from_config(&HostPolicyConfig::default())),
        h.job_engine.clone(),
        TaskEngineConfig::default(),
        Arc::new(MetricsCollector::new().unwrap()),
    );
    let mut task = h.static_task(json!({})).await;

    let outcome = engine
        .place(&mut task, PlacementRequest::default())
        .await
        .unwrap();
    assert!(matches!(outcome, PlacementOutcome::Skipped(_)));
    assert_eq!(task.state, TaskState::Held);
    assert_eq!(h.reload(task.id).await.state, TaskState::Held);

    let jobs = h.env.jobs.all().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert_eq!(h.env.registry.in_use(1).await, Some(0));
}

#[tokio::test]
async fn test_requested_project_must_belong_to_task() {
    let h = harness().await;
    h.env
        .registry
        .add_project(
            ProjectBuilder::new(2, "alloys")
                .with_users([1])
                .with_allocations([1])
                .build(),
        )
        .await;
    let mut task = h.static_task(json!({})).await;

    let err = h
        .task_engine
        .place(&mut task, PlacementRequest::for_project(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceUnavailable(_)));
    assert_eq!(h.env.calculator.call_count(), 0);
    assert_eq!(h.env.registry.in_use(1).await, Some(0));
}

#[tokio::test]
async fn test_requested_project_must_be_schedulable() {
    let h = harness().await;
    h.env
        .registry
        .add_project(
            ProjectBuilder::new(2, "alloys")
                .with_users([1])
                .with_allocations([1])
                .held()
                .build(),
        )
        .await;
    let mut task = h
        .task_engine
        .create(42, "static", params(json!({})), None, Some(BTreeSet::from([1, 2])))
        .await
        .unwrap();

    let err = h
        .task_engine
        .place(&mut task, PlacementRequest::for_project(2))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceUnavailable(_)));
    assert_eq!(h.reload(task.id).await.state, TaskState::Ready);
}

#[tokio::test]
async fn test_requested_allocation_is_validated() {
    let h = harness().await;
    h.env.registry.add_host(HostBuilder::new(2, "edison").build()).await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(2, "m1234", 2).build())
        .await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(3, "p20746", 1).inactive().build())
        .await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(4, "b1000", 1).build())
        .await;
    h.env
        .registry
        .add_project(
            ProjectBuilder::new(1, "chem")
                .with_users([1])
                .with_allocations([1, 2, 3])
                .build(),
        )
        .await;
    let task = h.static_task(json!({})).await;

    let requests = [
        // 不属于项目
        PlacementRequest {
            project: Some(1),
            allocation: Some(4),
            ..PlacementRequest::default()
        },
        // 未激活
        PlacementRequest {
            project: Some(1),
            allocation: Some(3),
            ..PlacementRequest::default()
        },
        // 不在请求的主机上
        PlacementRequest {
            allocation: Some(2),
            host: Some(1),
            ..PlacementRequest::default()
        },
    ];
    for request in requests {
        let err = h.task_engine.get_jobs(task.id, request).await.unwrap_err();
        assert!(
            matches!(err, SchedulerError::ResourceUnavailable(_)),
            "{request:?}: {err}"
        );
    }
    assert_eq!(h.env.calculator.call_count(), 0);
    assert!(h.env.jobs.all().await.is_empty());
}

#[tokio::test]
async fn test_requested_allocation_selects_owning_project() {
    let h = harness().await;
    h.env
        .registry
        .add_allocation(AllocationBuilder::new(2, "p20746", 1).build())
        .await;
    h.env
        .registry
        .add_project(
            ProjectBuilder::new(2, "alloys")
                .with_users([1])
                .with_allocations([2])
                .build(),
        )
        .await;
    let task = h
        .task_engine
        .create(42, "static", params(json!({})), None, Some(BTreeSet::from([1, 2])))
        .await
        .unwrap();

    let request = PlacementRequest {
        allocation: Some(2),
        ..PlacementRequest::default()
    };
    let jobs = h.task_engine.get_jobs(task.id, request).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].allocation_id, 2);
}

#[tokio::test]
async fn test_requested_account_must_be_on_host() {
    let h = harness().await;
    h.env.registry.add_host(HostBuilder::new(2, "edison").build()).await;
    h.env
        .registry
        .add_account(AccountBuilder::new(2, 1, 2).build())
        .await;
    let task = h.static_task(json!({})).await;

    let request = PlacementRequest {
        account: Some(2),
        ..PlacementRequest::default()
    };
    let err = h.task_engine.get_jobs(task.id, request).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ResourceUnavailable(_)));
    assert_eq!(h.env.registry.in_use(1).await, Some(0));
}
