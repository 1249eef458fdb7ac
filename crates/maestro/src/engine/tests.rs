use std::{
    str::FromStr,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use db::models::{
    activity::{ActivityRecord, ActivityStatus},
    artifact::Artifact,
    run::{CreateRun, Run, RunStage, RunStatus},
    work_item::{CreateWorkItem, Priority, WorkItem, WorkItemStatus},
};
use services::services::{
    artifact_store::ArtifactStore,
    config::{MaestroConfig, TrackerConfig},
    tracker::TrackerService,
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tempfile::TempDir;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use super::{RunEngine, RunHandle};
use crate::{
    MaestroError,
    events::{EventHub, RunEvent},
    generation::{GenerationError, scripted::ScriptedClient},
    invoker::{AgentInvoker, RetryPolicy},
    roster::AgentRoster,
};

const PASS: &str = r#"{"passed": true, "feedback": ""}"#;
const FAIL: &str = r#"{"passed": false, "feedback": "tighten the error handling"}"#;
const BRIEF: &str = "## Requirements\nBuild the widget service end to end.";

struct Harness {
    engine: RunEngine,
    pool: SqlitePool,
    hub: Arc<EventHub>,
    client: Arc<ScriptedClient>,
    store: ArtifactStore,
    _store_dir: TempDir,
}

async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("../db/migrations").run(&pool).await.unwrap();
    pool
}

async fn harness(config: MaestroConfig) -> Harness {
    let pool = test_pool().await;
    let hub = Arc::new(EventHub::new());
    let roster = Arc::new(AgentRoster::builtin());
    let client = Arc::new(ScriptedClient::new());
    let invoker = Arc::new(
        AgentInvoker::new(roster.clone(), client.clone())
            .with_timeout(Duration::from_secs(5))
            .with_retry_policy(RetryPolicy {
                max_times: 1,
                min_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            }),
    );
    let store_dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(store_dir.path().to_path_buf());
    let tracker = TrackerService::new(TrackerConfig::default());
    let engine = RunEngine::new(
        pool.clone(),
        hub.clone(),
        roster,
        invoker,
        store.clone(),
        tracker,
        Arc::new(RwLock::new(config)),
    );
    Harness {
        engine,
        pool,
        hub,
        client,
        store,
        _store_dir: store_dir,
    }
}

/// One item at a time so scripted replies pop in work item order.
fn serial_config() -> MaestroConfig {
    let mut config = MaestroConfig::default();
    config.work_item_concurrency = 1;
    config.fanout_concurrency = 1;
    config
}

fn serial_config_without_fanout() -> MaestroConfig {
    let mut config = serial_config();
    config.fanout_tasks = Vec::new();
    config
}

fn plan_json(items: &[(&str, &str, &str)]) -> String {
    let elements: Vec<serde_json::Value> = items
        .iter()
        .map(|(title, description, agent)| {
            serde_json::json!({
                "title": title,
                "description": description,
                "agent": agent,
                "priority": "medium",
            })
        })
        .collect();
    serde_json::to_string(&elements).unwrap()
}

async fn create_run(h: &Harness, name: &str) -> Run {
    h.engine
        .create_run(&CreateRun {
            project_name: name.to_string(),
            description: "integration test project".to_string(),
        })
        .await
        .unwrap()
}

async fn drive(h: &Harness, run_id: Uuid) {
    h.engine
        .drive(run_id, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
}

async fn reload(h: &Harness, run_id: Uuid) -> Run {
    Run::find_by_id(&h.pool, run_id).await.unwrap().unwrap()
}

fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_terminal(pool: &SqlitePool, run_id: Uuid) -> Run {
    for _ in 0..250 {
        let run = Run::find_by_id(pool, run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {} never settled", run_id);
}

#[tokio::test]
async fn full_run_reaches_ready_and_counts_failed_items() {
    let h = harness(serial_config()).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content(
            "slate",
            plan_json(&[
                ("Item A", "Deliver part A", "mason"),
                ("Item B", "Deliver part B", "mason"),
                ("Item C", "Deliver part C", "mason"),
            ]),
        )
        .await;
    // Item A settles on round 3, item B burns all 5 rounds, item C
    // passes first try.
    for _ in 0..9 {
        h.client.push_content("mason", "draft deliverable").await;
    }
    for verdict in [FAIL, FAIL, PASS, FAIL, FAIL, FAIL, FAIL, FAIL, PASS] {
        h.client.push_content("probe", verdict).await;
    }
    h.client.push_content("vista", "architecture diagram").await;
    h.client.push_content("docent", "user manual").await;
    h.client.push_content("tally", "test report").await;

    let run = create_run(&h, "widget-service").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Ready);
    assert_eq!(run.stage, RunStage::Complete);
    assert_eq!(run.failed_items, 1);
    assert!(run.error.is_none());
    assert!(run.planning_completed_at.is_some());
    assert!(run.build_verify_completed_at.is_some());
    assert!(run.fanout_completed_at.is_some());

    let items = WorkItem::find_by_run(&h.pool, run.id).await.unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].status, WorkItemStatus::Completed);
    assert_eq!(items[0].attempts, 3);
    assert!(items[0].last_error.is_none());
    assert_eq!(items[1].status, WorkItemStatus::Failed);
    assert_eq!(items[1].attempts, 5);
    assert!(items[1].last_error.as_deref().unwrap().contains("tighten"));
    assert_eq!(items[2].status, WorkItemStatus::Completed);
    assert_eq!(items[2].attempts, 1);

    let artifacts = Artifact::find_by_run(&h.pool, run.id).await.unwrap();
    assert_eq!(artifacts.len(), 4);
    let requirements = artifacts.iter().find(|a| a.kind == "requirements").unwrap();
    let content = h.store.read(&requirements.path).await.unwrap();
    assert_eq!(content, BRIEF);

    let partial =
        ActivityRecord::count_by_status(&h.pool, run.id, ActivityStatus::PartialFailure)
            .await
            .unwrap();
    assert_eq!(partial, 1);

    for agent in ["scribe", "slate", "mason", "probe", "vista", "docent", "tally"] {
        assert_eq!(h.client.remaining(agent).await, 0, "{} script leftover", agent);
    }
}

#[tokio::test]
async fn events_arrive_in_stage_order() {
    let h = harness(serial_config_without_fanout()).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content("slate", plan_json(&[("Only item", "Deliver it", "mason")]))
        .await;
    h.client.push_content("mason", "draft deliverable").await;
    h.client.push_content("probe", PASS).await;

    let run = create_run(&h, "event-order").await;
    let mut rx = h.hub.subscribe(run.id);
    drive(&h, run.id).await;

    let events = drain(&mut rx);
    assert!(!events.is_empty());

    let stages: Vec<RunStage> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::StageChanged { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![RunStage::BuildVerify, RunStage::ArtifactFanout, RunStage::Complete]
    );

    assert!(events.iter().any(|e| matches!(e, RunEvent::AgentActivity { .. })));
    assert!(events.iter().any(|e| matches!(e, RunEvent::WorkItemUpdated { .. })));

    match events.last().unwrap() {
        RunEvent::RunStatusChanged {
            status,
            failed_items,
            ..
        } => {
            assert_eq!(*status, RunStatus::Ready);
            assert_eq!(*failed_items, 0);
        }
        other => panic!("expected a final run status event, got {:?}", other),
    }
}

#[tokio::test]
async fn planning_agent_failure_fails_the_run() {
    let h = harness(serial_config()).await;
    h.client
        .push_failure(
            "scribe",
            GenerationError::AuthFailed("key rejected".to_string()),
        )
        .await;

    let run = create_run(&h, "doomed").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().starts_with("planning failed"));
    assert_eq!(run.stage, RunStage::Planning);
}

#[tokio::test]
async fn unusable_plan_fails_the_run() {
    let h = harness(serial_config()).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content("slate", "sure, here is my plan: do the work")
        .await;

    let run = create_run(&h, "gibberish-plan").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("work breakdown"));
}

#[tokio::test]
async fn retry_ceiling_is_configurable() {
    let mut config = serial_config_without_fanout();
    config.retry_ceiling = 2;
    let h = harness(config).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content("slate", plan_json(&[("Stubborn item", "Deliver it", "mason")]))
        .await;
    h.client.push_content("mason", "draft 1").await;
    h.client.push_content("mason", "draft 2").await;
    h.client.push_content("probe", FAIL).await;
    h.client.push_content("probe", FAIL).await;

    let run = create_run(&h, "short-rope").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Ready);
    assert_eq!(run.failed_items, 1);

    let items = WorkItem::find_by_run(&h.pool, run.id).await.unwrap();
    assert_eq!(items[0].status, WorkItemStatus::Failed);
    assert_eq!(items[0].attempts, 2);
}

#[tokio::test]
async fn unknown_agent_in_plan_falls_back_to_builder() {
    let h = harness(serial_config_without_fanout()).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content("slate", r#"[{"title": "Mystery item", "description": "Deliver it", "agent": "ghost"}]"#)
        .await;
    h.client.push_content("mason", "draft deliverable").await;
    h.client.push_content("probe", PASS).await;

    let run = create_run(&h, "ghost-agent").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Ready);

    let items = WorkItem::find_by_run(&h.pool, run.id).await.unwrap();
    assert_eq!(items[0].agent, "mason");
    assert_eq!(items[0].priority, Priority::Medium);
    assert_eq!(items[0].status, WorkItemStatus::Completed);
}

#[tokio::test]
async fn all_fanout_branches_failing_still_lands_ready() {
    let h = harness(serial_config()).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content("slate", plan_json(&[("Only item", "Deliver it", "mason")]))
        .await;
    h.client.push_content("mason", "draft deliverable").await;
    h.client.push_content("probe", PASS).await;
    for agent in ["vista", "docent", "tally"] {
        h.client
            .push_failure(agent, GenerationError::InvalidRequest("refused".to_string()))
            .await;
    }

    let run = create_run(&h, "fanout-wipeout").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Ready);
    assert_eq!(run.failed_items, 0);

    // Only the requirements brief survives; every fan-out branch was
    // excluded.
    let artifacts = Artifact::find_by_run(&h.pool, run.id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, "requirements");

    let partial =
        ActivityRecord::count_by_status(&h.pool, run.id, ActivityStatus::PartialFailure)
            .await
            .unwrap();
    assert_eq!(partial, 3);
    let warnings = ActivityRecord::count_by_status(&h.pool, run.id, ActivityStatus::Warning)
        .await
        .unwrap();
    assert_eq!(warnings, 1);
}

#[tokio::test]
async fn failed_fanout_branch_is_excluded() {
    let h = harness(serial_config()).await;
    h.client.push_content("scribe", BRIEF).await;
    h.client
        .push_content("slate", plan_json(&[("Only item", "Deliver it", "mason")]))
        .await;
    h.client.push_content("mason", "draft deliverable").await;
    h.client.push_content("probe", PASS).await;
    h.client.push_content("vista", "architecture diagram").await;
    h.client.push_content("docent", "user manual").await;
    h.client
        .push_failure("tally", GenerationError::InvalidRequest("refused".to_string()))
        .await;

    let run = create_run(&h, "fanout-partial").await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Ready);

    let artifacts = Artifact::find_by_run(&h.pool, run.id).await.unwrap();
    let kinds: Vec<&str> = artifacts.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(artifacts.len(), 3);
    assert!(kinds.contains(&"architecture_diagram"));
    assert!(kinds.contains(&"user_manual"));
    assert!(!kinds.contains(&"test_report"));

    let partial =
        ActivityRecord::count_by_status(&h.pool, run.id, ActivityStatus::PartialFailure)
            .await
            .unwrap();
    assert_eq!(partial, 1);
}

#[tokio::test]
async fn preset_cancel_settles_the_run_failed() {
    let h = harness(serial_config()).await;
    h.client.push_content("scribe", BRIEF).await;

    let run = create_run(&h, "cancelled-early").await;
    h.engine
        .drive(run.id, Arc::new(AtomicBool::new(true)))
        .await
        .unwrap();

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("cancelled by user"));
    // Cancellation won the race before planning touched the agent.
    assert_eq!(h.client.remaining("scribe").await, 1);
}

#[tokio::test]
async fn driving_a_terminal_run_is_a_noop() {
    let h = harness(serial_config()).await;
    let run = create_run(&h, "already-settled").await;
    h.engine.fail_run(run.id, "boom").await.unwrap();

    drive(&h, run.id).await;
    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn spawn_refuses_a_duplicate_driver() {
    let h = harness(serial_config()).await;
    let run = create_run(&h, "double-spawn").await;

    h.engine.active.write().await.insert(
        run.id,
        RunHandle {
            cancel: Arc::new(AtomicBool::new(false)),
        },
    );

    match h.engine.spawn(run.id).await {
        Err(MaestroError::Conflict(msg)) => assert!(msg.contains("live driver")),
        other => panic!("expected a conflict, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn spawn_refuses_a_terminal_run() {
    let h = harness(serial_config()).await;
    let run = create_run(&h, "spent").await;
    h.engine.fail_run(run.id, "boom").await.unwrap();

    assert!(matches!(
        h.engine.spawn(run.id).await,
        Err(MaestroError::Conflict(_))
    ));
}

#[tokio::test]
async fn resume_respawns_unfinished_runs() {
    let h = harness(serial_config()).await;
    let first = create_run(&h, "interrupted-one").await;
    let second = create_run(&h, "interrupted-two").await;
    let settled = create_run(&h, "already-ready").await;
    Run::mark_ready(&h.pool, settled.id, 0).await.unwrap();

    let resumed = h.engine.resume_active_runs().await.unwrap();
    assert_eq!(resumed, 2);

    // No scripted replies exist, so both respawned drivers fail their
    // runs at planning.
    let first = wait_terminal(&h.pool, first.id).await;
    let second = wait_terminal(&h.pool, second.id).await;
    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(second.status, RunStatus::Failed);
    assert!(first.error.as_deref().unwrap().starts_with("planning failed"));
}

#[tokio::test]
async fn planning_resumes_past_existing_work_items() {
    let h = harness(serial_config_without_fanout()).await;
    // A previous driver already planned this run; only the later stages
    // should execute.
    let run = create_run(&h, "mid-flight").await;
    WorkItem::create(
        &h.pool,
        &CreateWorkItem {
            run_id: run.id,
            title: "Prebuilt item".to_string(),
            description: "Deliver it".to_string(),
            agent: "mason".to_string(),
            priority: Priority::Medium,
            position: 0,
        },
        Uuid::new_v4(),
    )
    .await
    .unwrap();
    h.client.push_content("mason", "draft deliverable").await;
    h.client.push_content("probe", PASS).await;

    drive(&h, run.id).await;

    let run = reload(&h, run.id).await;
    assert_eq!(run.status, RunStatus::Ready);
    let items = WorkItem::find_by_run(&h.pool, run.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, WorkItemStatus::Completed);
}
