use std::{sync::Arc, time::Instant};

use db::models::{
    activity::ActivityStatus,
    run::{Run, RunStage},
    work_item::{WorkItem, WorkItemStatus},
};
use serde::Deserialize;
use tokio::sync::Semaphore;

use super::{ENGINE_ACTOR, RunEngine, activity, extract_json};
use crate::{
    MaestroError, Result,
    invoker::{AgentTask, TaskContext},
    metrics,
};

const VERIFY_AGENT: &str = "probe";

const VERIFY_INSTRUCTIONS: &str = "Assess whether the deliverable in the context satisfies the \
work item named in the task input. Reply with JSON only, shaped as \
{\"passed\": true|false, \"feedback\": \"...\"}. When the deliverable falls short, make the \
feedback specific enough for the author to fix it.";

#[derive(Debug, Deserialize)]
struct Verdict {
    passed: bool,
    #[serde(default)]
    feedback: String,
}

/// A verdict the engine cannot read counts as a failed round; the
/// parse error becomes the feedback for the next one.
fn parse_verdict(content: &str) -> Verdict {
    match serde_json::from_str(extract_json(content)) {
        Ok(verdict) => verdict,
        Err(e) => Verdict {
            passed: false,
            feedback: format!("unparseable verdict: {}", e),
        },
    }
}

impl RunEngine {
    /// Build/verify stage: settle every unfinished work item through
    /// write-then-verify rounds, a bounded number of items in flight at
    /// once. Items that exhaust their rounds are failed and counted;
    /// only infrastructure errors abort the stage.
    pub(super) async fn run_build_verify(&self, run: &Run) -> Result<()> {
        let config = self.config_snapshot().await;
        let ceiling = i64::from(config.retry_ceiling);
        let items = WorkItem::find_unfinished(&self.pool, run.id).await?;
        let brief = self.load_requirements_brief(run.id).await;

        tracing::info!(
            "[BUILD_VERIFY] run {}: settling {} work item(s), up to {} in flight",
            run.id,
            items.len(),
            config.work_item_concurrency.max(1)
        );

        let semaphore = Arc::new(Semaphore::new(config.work_item_concurrency.max(1)));
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| MaestroError::Execution(format!("Semaphore error: {}", e)))?;
            let engine = self.clone();
            let brief = brief.clone();
            handles.push(tokio::spawn(async move {
                let result = engine.settle_work_item(item, brief, ceiling).await;
                drop(permit);
                result
            }));
        }

        let mut first_err: Option<MaestroError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_status)) => {}
                Ok(Err(e)) => {
                    tracing::error!("[BUILD_VERIFY] work item task failed: {}", e);
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!("[BUILD_VERIFY] work item task panicked: {}", e);
                    let panic = MaestroError::Execution(format!("work item task panicked: {}", e));
                    first_err.get_or_insert(panic);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        let failed = WorkItem::count_by_status(&self.pool, run.id, WorkItemStatus::Failed).await?;
        Run::set_failed_items(&self.pool, run.id, failed).await?;
        tracing::info!(
            "[BUILD_VERIFY] run {}: stage complete, {} item(s) failed",
            run.id,
            failed
        );

        self.advance_to(run.id, RunStage::ArtifactFanout).await?;
        Ok(())
    }

    /// Drive one work item to a terminal status. Each round is one
    /// write call plus one verify call; the attempt counter includes
    /// the round that settles the item. The counter and last feedback
    /// are persisted after every round so an interrupted run resumes
    /// mid-ladder instead of starting over.
    async fn settle_work_item(
        &self,
        item: WorkItem,
        brief: Option<String>,
        ceiling: i64,
    ) -> Result<WorkItemStatus> {
        let mut attempts = item.attempts;
        let mut feedback = item.last_error.clone();

        let item = WorkItem::start(&self.pool, item.id).await?;
        self.events.work_item_updated(&item);

        let write_task = AgentTask::new(item.description.clone())
            .with_requirements(serde_json::json!({ "work_item": item.title }));
        let verify_task = AgentTask::new(VERIFY_INSTRUCTIONS).with_requirements(serde_json::json!({
            "work_item": item.title,
            "acceptance": item.description,
        }));

        loop {
            attempts += 1;
            tracing::info!(
                "[BUILD_VERIFY] item {} '{}': round {}/{}",
                item.id,
                item.title,
                attempts,
                ceiling
            );

            // Write half of the round.
            let mut context = TaskContext::new();
            if let Some(brief) = &brief {
                context.push("Requirements Brief", brief);
            }
            if let Some(feedback) = &feedback {
                context.push("Previous Verification Feedback", feedback);
            }
            self.record_activity(activity(
                item.run_id,
                Some(item.id),
                &item.agent,
                "write",
                ActivityStatus::Started,
                None,
                None,
            ))
            .await?;
            let started = Instant::now();
            let output = match self.invoker.invoke(&item.agent, &write_task, &context).await {
                Ok(output) => {
                    self.record_activity(activity(
                        item.run_id,
                        Some(item.id),
                        &item.agent,
                        "write",
                        ActivityStatus::Completed,
                        None,
                        Some(started.elapsed().as_millis() as i64),
                    ))
                    .await?;
                    output
                }
                Err(e) => {
                    self.record_activity(activity(
                        item.run_id,
                        Some(item.id),
                        &item.agent,
                        "write",
                        ActivityStatus::Failed,
                        Some(e.to_string()),
                        Some(started.elapsed().as_millis() as i64),
                    ))
                    .await?;
                    if e.is_permanent() {
                        return self.fail_work_item(&item, attempts, &e.to_string()).await;
                    }
                    // Transport never recovered; the round is spent.
                    metrics::record_round(false);
                    if attempts >= ceiling {
                        return self.fail_work_item(&item, attempts, &e.to_string()).await;
                    }
                    let reason = e.to_string();
                    let updated =
                        WorkItem::record_attempt(&self.pool, item.id, attempts, &reason).await?;
                    self.events.work_item_updated(&updated);
                    feedback = Some(reason);
                    continue;
                }
            };

            // Verify half of the round.
            let mut context = TaskContext::new();
            if let Some(brief) = &brief {
                context.push("Requirements Brief", brief);
            }
            context.push("Deliverable", &output.content);
            self.record_activity(activity(
                item.run_id,
                Some(item.id),
                VERIFY_AGENT,
                "verify",
                ActivityStatus::Started,
                None,
                None,
            ))
            .await?;
            let started = Instant::now();
            let verdict = match self.invoker.invoke(VERIFY_AGENT, &verify_task, &context).await {
                Ok(output) => parse_verdict(&output.content),
                Err(e) => {
                    self.record_activity(activity(
                        item.run_id,
                        Some(item.id),
                        VERIFY_AGENT,
                        "verify",
                        ActivityStatus::Failed,
                        Some(e.to_string()),
                        Some(started.elapsed().as_millis() as i64),
                    ))
                    .await?;
                    if e.is_permanent() {
                        return self.fail_work_item(&item, attempts, &e.to_string()).await;
                    }
                    metrics::record_round(false);
                    if attempts >= ceiling {
                        return self.fail_work_item(&item, attempts, &e.to_string()).await;
                    }
                    let reason = e.to_string();
                    let updated =
                        WorkItem::record_attempt(&self.pool, item.id, attempts, &reason).await?;
                    self.events.work_item_updated(&updated);
                    feedback = Some(reason);
                    continue;
                }
            };

            if verdict.passed {
                self.record_activity(activity(
                    item.run_id,
                    Some(item.id),
                    VERIFY_AGENT,
                    "verify",
                    ActivityStatus::Completed,
                    None,
                    Some(started.elapsed().as_millis() as i64),
                ))
                .await?;
                metrics::record_round(true);
                let updated = WorkItem::complete(&self.pool, item.id, attempts).await?;
                self.events.work_item_updated(&updated);
                tracing::info!(
                    "[BUILD_VERIFY] item {} '{}' completed after {} round(s)",
                    item.id,
                    item.title,
                    attempts
                );
                return Ok(WorkItemStatus::Completed);
            }

            metrics::record_round(false);
            let out_of_rounds = attempts >= ceiling;
            self.record_activity(activity(
                item.run_id,
                Some(item.id),
                VERIFY_AGENT,
                "verify",
                if out_of_rounds {
                    ActivityStatus::Failed
                } else {
                    ActivityStatus::Retrying
                },
                Some(verdict.feedback.clone()),
                Some(started.elapsed().as_millis() as i64),
            ))
            .await?;
            if out_of_rounds {
                return self
                    .fail_work_item(
                        &item,
                        attempts,
                        &format!("verification failed: {}", verdict.feedback),
                    )
                    .await;
            }
            let updated =
                WorkItem::record_attempt(&self.pool, item.id, attempts, &verdict.feedback).await?;
            self.events.work_item_updated(&updated);
            feedback = Some(verdict.feedback);
        }
    }

    /// Settle an item as failed without failing the run; the stage
    /// summary picks the count up afterwards.
    async fn fail_work_item(
        &self,
        item: &WorkItem,
        attempts: i64,
        error: &str,
    ) -> Result<WorkItemStatus> {
        let updated = WorkItem::fail(&self.pool, item.id, attempts, error).await?;
        self.events.work_item_updated(&updated);
        self.record_activity(activity(
            item.run_id,
            Some(item.id),
            ENGINE_ACTOR,
            "work_item_failed",
            ActivityStatus::PartialFailure,
            Some(error.to_string()),
            None,
        ))
        .await?;
        tracing::warn!(
            "[BUILD_VERIFY] item {} '{}' failed after {} round(s): {}",
            item.id,
            item.title,
            attempts,
            error
        );
        Ok(WorkItemStatus::Failed)
    }
}
