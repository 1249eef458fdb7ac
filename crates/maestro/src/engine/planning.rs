use std::time::Instant;

use db::models::{
    activity::ActivityStatus,
    artifact::{Artifact, CreateArtifact},
    run::{Run, RunStage},
    work_item::{CreateWorkItem, Priority, WorkItem},
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ENGINE_ACTOR, RunEngine, activity, extract_json};
use crate::{
    Result,
    invoker::{AgentOutput, AgentTask, TaskContext},
};

const REQUIREMENTS_AGENT: &str = "scribe";
const PLANNER_AGENT: &str = "slate";
const DEFAULT_BUILD_AGENT: &str = "mason";

const REQUIREMENTS_INSTRUCTIONS: &str = "Write a requirements brief for the project named in \
the task input. Cover goals, scope, constraints and acceptance criteria as markdown prose. \
Reply with the brief only.";

const DECOMPOSE_INSTRUCTIONS: &str = "Break the requirements brief down into independent work \
items. Reply with a JSON array only, no commentary. Each element must have the fields \
\"title\" (string), \"description\" (string), \"agent\" (one of the agent names in the task \
input) and \"priority\" (\"low\", \"medium\" or \"high\"). Order the array by execution \
priority.";

/// One element of the planner's work breakdown. Tolerant of missing
/// fields; only the title is required.
#[derive(Debug, Deserialize)]
struct PlannedItem {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
}

impl RunEngine {
    /// Planning stage: draft a requirements brief, decompose it into
    /// work items, register them with the external tracker when one is
    /// configured. Any agent failure here fails the run; without a plan
    /// there is nothing to execute.
    pub(super) async fn run_planning(&self, run: &Run) -> Result<()> {
        let existing = WorkItem::find_by_run(&self.pool, run.id).await?;
        if !existing.is_empty() {
            tracing::info!(
                "[PLANNING] run {} already has {} work item(s), resuming past planning",
                run.id,
                existing.len()
            );
            self.advance_to(run.id, RunStage::BuildVerify).await?;
            return Ok(());
        }

        tracing::info!("[PLANNING] run {}: drafting requirements", run.id);
        let task = AgentTask::new(REQUIREMENTS_INSTRUCTIONS)
            .with_requirements(serde_json::json!({
                "project_name": run.project_name,
                "description": run.description,
            }))
            .with_artifact("requirements", "Requirements Brief");
        let context = TaskContext::new();
        let brief = match self
            .planning_invoke(run.id, REQUIREMENTS_AGENT, "draft_requirements", &task, &context)
            .await?
        {
            Some(output) => output,
            None => return Ok(()),
        };

        for generated in &brief.artifacts {
            let path = self
                .artifacts
                .store(run.id, &generated.kind, &generated.content)
                .await?;
            Artifact::create(
                &self.pool,
                &CreateArtifact {
                    run_id: run.id,
                    kind: generated.kind.clone(),
                    title: generated.title.clone(),
                    path,
                },
                Uuid::new_v4(),
            )
            .await?;
        }

        tracing::info!("[PLANNING] run {}: decomposing into work items", run.id);
        let mut context = TaskContext::new();
        context.push("Requirements Brief", &brief.content);
        let task = AgentTask::new(DECOMPOSE_INSTRUCTIONS).with_requirements(serde_json::json!({
            "project_name": run.project_name,
            "agents": self.roster.names(),
        }));
        let plan = match self
            .planning_invoke(run.id, PLANNER_AGENT, "decompose_work", &task, &context)
            .await?
        {
            Some(output) => output,
            None => return Ok(()),
        };

        let planned: Vec<PlannedItem> = match serde_json::from_str(extract_json(&plan.content)) {
            Ok(items) => items,
            Err(e) => {
                let reason = format!("planner returned an unusable work breakdown: {}", e);
                return self.fail_planning(run.id, &reason).await;
            }
        };
        if planned.is_empty() {
            return self
                .fail_planning(run.id, "planner returned an empty work breakdown")
                .await;
        }

        let items: Vec<CreateWorkItem> = planned
            .into_iter()
            .enumerate()
            .map(|(idx, p)| {
                let agent = match p.agent {
                    Some(name) if self.roster.get(&name).is_some() => name,
                    Some(name) => {
                        tracing::warn!(
                            "[PLANNING] run {}: unknown agent '{}' in plan, assigning {}",
                            run.id,
                            name,
                            DEFAULT_BUILD_AGENT
                        );
                        DEFAULT_BUILD_AGENT.to_string()
                    }
                    None => DEFAULT_BUILD_AGENT.to_string(),
                };
                CreateWorkItem {
                    run_id: run.id,
                    title: p.title,
                    description: p.description,
                    agent,
                    priority: p.priority.unwrap_or(Priority::Medium),
                    position: idx as i64,
                }
            })
            .collect();

        let created = WorkItem::create_batch(&self.pool, &items).await?;
        for item in &created {
            self.events.work_item_updated(item);
        }
        tracing::info!(
            "[PLANNING] run {}: planned {} work item(s)",
            run.id,
            created.len()
        );

        if self.tracker.is_enabled() {
            self.register_with_tracker(run, &created).await?;
        }

        self.advance_to(run.id, RunStage::BuildVerify).await?;
        Ok(())
    }

    /// Invoke a planning agent with activity bookkeeping on both sides.
    /// Returns `None` after failing the run, so callers can bail out.
    async fn planning_invoke(
        &self,
        run_id: Uuid,
        agent: &str,
        action: &str,
        task: &AgentTask,
        context: &TaskContext,
    ) -> Result<Option<AgentOutput>> {
        self.record_activity(activity(
            run_id,
            None,
            agent,
            action,
            ActivityStatus::Started,
            None,
            None,
        ))
        .await?;
        let started = Instant::now();
        match self.invoker.invoke(agent, task, context).await {
            Ok(output) => {
                self.record_activity(activity(
                    run_id,
                    None,
                    agent,
                    action,
                    ActivityStatus::Completed,
                    None,
                    Some(started.elapsed().as_millis() as i64),
                ))
                .await?;
                Ok(Some(output))
            }
            Err(e) => {
                self.record_activity(activity(
                    run_id,
                    None,
                    agent,
                    action,
                    ActivityStatus::Failed,
                    Some(e.to_string()),
                    Some(started.elapsed().as_millis() as i64),
                ))
                .await?;
                self.fail_run(run_id, &format!("planning failed: {}", e)).await?;
                Ok(None)
            }
        }
    }

    async fn fail_planning(&self, run_id: Uuid, reason: &str) -> Result<()> {
        self.record_activity(activity(
            run_id,
            None,
            ENGINE_ACTOR,
            "parse_plan",
            ActivityStatus::Failed,
            Some(reason.to_string()),
            None,
        ))
        .await?;
        self.fail_run(run_id, reason).await?;
        Ok(())
    }

    /// Mirror the plan into the configured tracker. Registration is
    /// best effort: a tracker outage is recorded as a warning and the
    /// run carries on without external references.
    async fn register_with_tracker(&self, run: &Run, items: &[WorkItem]) -> Result<()> {
        match self.tracker.register_work_items(run, items).await {
            Ok(refs) => {
                for (item_id, external_ref) in refs {
                    WorkItem::set_external_ref(&self.pool, item_id, &external_ref).await?;
                }
                self.record_activity(activity(
                    run.id,
                    None,
                    ENGINE_ACTOR,
                    "register_tracking",
                    ActivityStatus::Completed,
                    None,
                    None,
                ))
                .await?;
            }
            Err(e) => {
                tracing::warn!(
                    "[PLANNING] run {}: tracker registration failed, continuing without it: {}",
                    run.id,
                    e
                );
                self.record_activity(activity(
                    run.id,
                    None,
                    ENGINE_ACTOR,
                    "register_tracking",
                    ActivityStatus::Warning,
                    Some(e.to_string()),
                    None,
                ))
                .await?;
            }
        }
        Ok(())
    }
}
