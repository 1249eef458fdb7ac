use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use db::models::{
    activity::{ActivityRecord, ActivityStatus, CreateActivity},
    artifact::Artifact,
    run::{CreateRun, Run, RunStage},
    work_item::{WorkItem, WorkItemStatus},
};
use services::services::{
    artifact_store::ArtifactStore,
    config::MaestroConfig,
    tracker::TrackerService,
};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    MaestroError, Result, events::EventHub, invoker::AgentInvoker, metrics, roster::AgentRoster,
};

mod artifact_fanout;
mod build_verify;
mod planning;

#[cfg(test)]
mod tests;

/// Actor name used for activity rows written by the engine itself
/// rather than by an agent.
pub(crate) const ENGINE_ACTOR: &str = "maestro";

struct RunHandle {
    cancel: Arc<AtomicBool>,
}

/// Drives runs through the stage graph. One driver task per run at
/// most; every state change lands in the database first and is then
/// broadcast, so observers can always reconstruct the truth from
/// storage.
#[derive(Clone)]
pub struct RunEngine {
    pool: SqlitePool,
    events: Arc<EventHub>,
    roster: Arc<AgentRoster>,
    invoker: Arc<AgentInvoker>,
    artifacts: ArtifactStore,
    tracker: TrackerService,
    config: Arc<RwLock<MaestroConfig>>,
    active: Arc<RwLock<HashMap<Uuid, RunHandle>>>,
}

impl RunEngine {
    pub fn new(
        pool: SqlitePool,
        events: Arc<EventHub>,
        roster: Arc<AgentRoster>,
        invoker: Arc<AgentInvoker>,
        artifacts: ArtifactStore,
        tracker: TrackerService,
        config: Arc<RwLock<MaestroConfig>>,
    ) -> Self {
        Self {
            pool,
            events,
            roster,
            invoker,
            artifacts,
            tracker,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create_run(&self, data: &CreateRun) -> Result<Run> {
        let run = Run::create(&self.pool, data, Uuid::new_v4()).await?;
        self.record_activity(activity(
            run.id,
            None,
            ENGINE_ACTOR,
            "run_created",
            ActivityStatus::Completed,
            None,
            None,
        ))
        .await?;
        self.events.run_created(&run);
        metrics::record_run_created();
        tracing::info!(
            "[ENGINE] created run {} for project '{}'",
            run.id,
            run.project_name
        );
        Ok(run)
    }

    /// Start the driver task for a run. Exactly one driver may be live
    /// per run; a second spawn is refused rather than queued.
    pub async fn spawn(&self, run_id: Uuid) -> Result<()> {
        let mut active = self.active.write().await;
        if active.contains_key(&run_id) {
            return Err(MaestroError::Conflict(format!(
                "run {} already has a live driver",
                run_id
            )));
        }

        let run = Run::find_by_id(&self.pool, run_id)
            .await?
            .ok_or(MaestroError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(MaestroError::Conflict(format!(
                "run {} is already {}",
                run_id, run.status
            )));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let engine = self.clone();
        let flag = cancel.clone();
        tokio::spawn(async move {
            metrics::inc_active_runs();
            if let Err(e) = engine.drive(run_id, flag).await {
                tracing::error!("[ENGINE] driver for run {} stopped: {}", run_id, e);
                match Run::find_by_id(&engine.pool, run_id).await {
                    Ok(Some(run)) if !run.status.is_terminal() => {
                        if let Err(mark_err) = engine
                            .fail_run(run_id, &format!("internal error: {}", e))
                            .await
                        {
                            tracing::error!(
                                "[ENGINE] could not mark run {} failed: {}",
                                run_id,
                                mark_err
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(find_err) => tracing::error!(
                        "[ENGINE] could not load run {} after driver error: {}",
                        run_id,
                        find_err
                    ),
                }
            }
            metrics::dec_active_runs();
            engine.active.write().await.remove(&run_id);
            engine.events.prune(run_id);
        });

        active.insert(run_id, RunHandle { cancel });
        Ok(())
    }

    /// Advance a run until it settles. Idempotent: a terminal run is a
    /// no-op, and re-driving an interrupted run picks up at the stage
    /// recorded in storage. Cancellation is observed between stages.
    pub async fn drive(&self, run_id: Uuid, cancel: Arc<AtomicBool>) -> Result<()> {
        loop {
            let run = Run::find_by_id(&self.pool, run_id)
                .await?
                .ok_or(MaestroError::RunNotFound(run_id))?;

            if run.status.is_terminal() {
                return Ok(());
            }
            if cancel.load(Ordering::Relaxed) {
                self.fail_run(run_id, "cancelled by user").await?;
                return Ok(());
            }

            match run.stage {
                RunStage::Planning => self.run_planning(&run).await?,
                RunStage::BuildVerify => self.run_build_verify(&run).await?,
                RunStage::ArtifactFanout => self.run_artifact_fanout(&run).await?,
                RunStage::Complete => {
                    // stage says done but the status never flipped; settle it
                    self.finish_run(run_id).await?;
                }
            }
        }
    }

    /// Request cancellation. With a live driver the flag is set and the
    /// run settles as failed at the next stage boundary; without one
    /// the run is failed directly.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run> {
        if let Some(handle) = self.active.read().await.get(&run_id) {
            handle.cancel.store(true, Ordering::Relaxed);
            tracing::info!("[ENGINE] cancellation requested for run {}", run_id);
            return Run::find_by_id(&self.pool, run_id)
                .await?
                .ok_or(MaestroError::RunNotFound(run_id));
        }
        self.fail_run(run_id, "cancelled by user").await
    }

    pub async fn archive(&self, run_id: Uuid) -> Result<Run> {
        let run = Run::archive(&self.pool, run_id).await?;
        self.record_activity(activity(
            run_id,
            None,
            ENGINE_ACTOR,
            "run_archived",
            ActivityStatus::Completed,
            None,
            None,
        ))
        .await?;
        self.events.run_status(&run);
        tracing::info!("[ENGINE] archived run {}", run_id);
        Ok(run)
    }

    /// Respawn drivers for runs that were mid-flight when the process
    /// last stopped.
    pub async fn resume_active_runs(&self) -> Result<usize> {
        let runs = Run::find_active(&self.pool).await?;
        let mut resumed = 0;
        for run in &runs {
            match self.spawn(run.id).await {
                Ok(()) => resumed += 1,
                Err(e) => tracing::warn!("[ENGINE] could not resume run {}: {}", run.id, e),
            }
        }
        if resumed > 0 {
            tracing::info!("[ENGINE] resumed {} unfinished run(s)", resumed);
        }
        Ok(resumed)
    }

    /// Stage boundary: persist the new stage, append the transition to
    /// the activity log, then announce it.
    pub(crate) async fn advance_to(&self, run_id: Uuid, stage: RunStage) -> Result<Run> {
        let run = Run::advance_stage(&self.pool, run_id, stage).await?;
        self.record_activity(activity(
            run_id,
            None,
            ENGINE_ACTOR,
            &format!("enter_{}", run.stage),
            ActivityStatus::Completed,
            None,
            None,
        ))
        .await?;
        self.events.stage_changed(run_id, run.stage);
        Ok(run)
    }

    pub(crate) async fn fail_run(&self, run_id: Uuid, error: &str) -> Result<Run> {
        let run = Run::mark_failed(&self.pool, run_id, error).await?;
        self.record_activity(activity(
            run_id,
            None,
            ENGINE_ACTOR,
            "run_failed",
            ActivityStatus::Failed,
            Some(error.to_string()),
            None,
        ))
        .await?;
        self.events.run_status(&run);
        metrics::record_run_terminal("failed");
        tracing::warn!("[ENGINE] run {} failed: {}", run_id, error);
        Ok(run)
    }

    /// Terminal success. Failed work items do not block readiness; they
    /// are counted and carried on the run.
    pub(crate) async fn finish_run(&self, run_id: Uuid) -> Result<Run> {
        let failed = WorkItem::count_by_status(&self.pool, run_id, WorkItemStatus::Failed).await?;
        let run = Run::mark_ready(&self.pool, run_id, failed).await?;
        self.record_activity(activity(
            run_id,
            None,
            ENGINE_ACTOR,
            "run_ready",
            ActivityStatus::Completed,
            None,
            None,
        ))
        .await?;
        self.events.stage_changed(run_id, RunStage::Complete);
        self.events.run_status(&run);
        metrics::record_run_terminal("ready");
        tracing::info!(
            "[ENGINE] run {} is ready ({} failed item(s))",
            run_id,
            failed
        );
        Ok(run)
    }

    pub(crate) async fn record_activity(&self, data: CreateActivity) -> Result<ActivityRecord> {
        let record = ActivityRecord::create(&self.pool, &data).await?;
        self.events.agent_activity(&record);
        Ok(record)
    }

    pub(crate) async fn config_snapshot(&self) -> MaestroConfig {
        self.config.read().await.clone()
    }

    /// The requirements brief produced by planning, if it exists and is
    /// still readable. Later stages degrade gracefully without it.
    pub(crate) async fn load_requirements_brief(&self, run_id: Uuid) -> Option<String> {
        let artifacts = Artifact::find_by_run(&self.pool, run_id).await.ok()?;
        let brief = artifacts.into_iter().find(|a| a.kind == "requirements")?;
        match self.artifacts.read(&brief.path).await {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::warn!(
                    "[ENGINE] requirements brief for run {} unreadable: {}",
                    run_id,
                    e
                );
                None
            }
        }
    }
}

pub(crate) fn activity(
    run_id: Uuid,
    work_item_id: Option<Uuid>,
    agent: &str,
    action: &str,
    status: ActivityStatus,
    error: Option<String>,
    duration_ms: Option<i64>,
) -> CreateActivity {
    CreateActivity {
        run_id,
        work_item_id,
        agent: agent.to_string(),
        action: action.to_string(),
        status,
        error,
        duration_ms,
    }
}

/// Agents regularly wrap JSON replies in a markdown fence; strip it
/// before parsing.
pub(crate) fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
    }
    trimmed
}
