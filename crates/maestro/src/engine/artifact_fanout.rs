use std::{sync::Arc, time::Instant};

use db::models::{
    activity::ActivityStatus,
    artifact::{Artifact, CreateArtifact},
    run::Run,
    work_item::WorkItem,
};
use services::services::config::FanoutTask;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::{ENGINE_ACTOR, RunEngine, activity};
use crate::{
    MaestroError, Result,
    invoker::{AgentTask, TaskContext},
};

fn render_item_summary(items: &[WorkItem]) -> String {
    items
        .iter()
        .map(|item| format!("- [{}] {} ({})", item.status, item.title, item.agent))
        .collect::<Vec<_>>()
        .join("\n")
}

impl RunEngine {
    /// Fan-out stage: produce the configured supplementary artifacts in
    /// parallel and join on all of them. A failed branch is excluded
    /// from the result set; even losing every branch still lands the
    /// run in ready, just with a warning on the record.
    pub(super) async fn run_artifact_fanout(&self, run: &Run) -> Result<()> {
        let config = self.config_snapshot().await;
        let existing = Artifact::find_by_run(&self.pool, run.id).await?;
        let tasks: Vec<FanoutTask> = config
            .fanout_tasks
            .iter()
            .filter(|task| !existing.iter().any(|a| a.kind == task.kind))
            .cloned()
            .collect();

        if tasks.is_empty() {
            tracing::info!("[FANOUT] run {}: no artifact tasks outstanding", run.id);
            self.finish_run(run.id).await?;
            return Ok(());
        }

        let brief = self.load_requirements_brief(run.id).await;
        let items = WorkItem::find_by_run(&self.pool, run.id).await?;
        let summary = render_item_summary(&items);

        tracing::info!(
            "[FANOUT] run {}: producing {} artifact(s), up to {} in flight",
            run.id,
            tasks.len(),
            config.fanout_concurrency.max(1)
        );

        let semaphore = Arc::new(Semaphore::new(config.fanout_concurrency.max(1)));
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| MaestroError::Execution(format!("Semaphore error: {}", e)))?;
            let engine = self.clone();
            let run_id = run.id;
            let brief = brief.clone();
            let summary = summary.clone();
            handles.push(tokio::spawn(async move {
                let result = engine.run_fanout_branch(run_id, task, brief, summary).await;
                drop(permit);
                result
            }));
        }

        let mut produced = 0usize;
        let mut excluded = 0usize;
        let mut first_err: Option<MaestroError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(true)) => produced += 1,
                Ok(Ok(false)) => excluded += 1,
                Ok(Err(e)) => {
                    tracing::error!("[FANOUT] artifact task failed: {}", e);
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!("[FANOUT] artifact task panicked: {}", e);
                    let panic = MaestroError::Execution(format!("artifact task panicked: {}", e));
                    first_err.get_or_insert(panic);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if produced == 0 && excluded > 0 {
            tracing::warn!("[FANOUT] run {}: all artifact tasks failed", run.id);
            self.record_activity(activity(
                run.id,
                None,
                ENGINE_ACTOR,
                "artifact_fanout",
                ActivityStatus::Warning,
                Some("all artifact tasks failed".to_string()),
                None,
            ))
            .await?;
        } else {
            self.record_activity(activity(
                run.id,
                None,
                ENGINE_ACTOR,
                "artifact_fanout",
                ActivityStatus::Completed,
                if excluded > 0 {
                    Some(format!("{} artifact task(s) excluded", excluded))
                } else {
                    None
                },
                None,
            ))
            .await?;
        }

        tracing::info!(
            "[FANOUT] run {}: {} artifact(s) produced, {} excluded",
            run.id,
            produced,
            excluded
        );
        self.finish_run(run.id).await?;
        Ok(())
    }

    /// One branch of the fan-out. Returns whether the branch produced
    /// its artifact; an agent failure is absorbed here and only
    /// infrastructure errors bubble up.
    async fn run_fanout_branch(
        &self,
        run_id: Uuid,
        task: FanoutTask,
        brief: Option<String>,
        summary: String,
    ) -> Result<bool> {
        self.record_activity(activity(
            run_id,
            None,
            &task.agent,
            &task.kind,
            ActivityStatus::Started,
            None,
            None,
        ))
        .await?;

        let mut context = TaskContext::new();
        if let Some(brief) = &brief {
            context.push("Requirements Brief", brief);
        }
        context.push("Delivered Work Items", &summary);
        let agent_task = AgentTask::new(task.instructions.clone())
            .with_artifact(task.kind.clone(), task.title.clone());

        let started = Instant::now();
        match self.invoker.invoke(&task.agent, &agent_task, &context).await {
            Ok(output) => {
                for generated in &output.artifacts {
                    let path = self
                        .artifacts
                        .store(run_id, &generated.kind, &generated.content)
                        .await?;
                    Artifact::create(
                        &self.pool,
                        &CreateArtifact {
                            run_id,
                            kind: generated.kind.clone(),
                            title: generated.title.clone(),
                            path,
                        },
                        Uuid::new_v4(),
                    )
                    .await?;
                }
                self.record_activity(activity(
                    run_id,
                    None,
                    &task.agent,
                    &task.kind,
                    ActivityStatus::Completed,
                    None,
                    Some(started.elapsed().as_millis() as i64),
                ))
                .await?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    "[FANOUT] run {}: artifact '{}' excluded: {}",
                    run_id,
                    task.kind,
                    e
                );
                self.record_activity(activity(
                    run_id,
                    None,
                    &task.agent,
                    &task.kind,
                    ActivityStatus::PartialFailure,
                    Some(e.to_string()),
                    Some(started.elapsed().as_millis() as i64),
                ))
                .await?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod summary_tests {
    use chrono::Utc;
    use db::models::work_item::{Priority, WorkItem, WorkItemStatus};
    use uuid::Uuid;

    use super::render_item_summary;

    fn item(title: &str, agent: &str, status: WorkItemStatus) -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            title: title.to_string(),
            description: String::new(),
            agent: agent.to_string(),
            status,
            priority: Priority::Medium,
            attempts: 1,
            last_error: None,
            position: 0,
            external_ref: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn summary_lists_status_title_and_agent() {
        let items = vec![
            item("Parse config", "mason", WorkItemStatus::Completed),
            item("Wire metrics", "mason", WorkItemStatus::Failed),
        ];
        let summary = render_item_summary(&items);
        assert_eq!(
            summary,
            "- [completed] Parse config (mason)\n- [failed] Wire metrics (mason)"
        );
    }
}
