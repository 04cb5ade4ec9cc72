//! Cron-driven scheduled task submission.
//!
//! Scheduler-originated submissions go through
//! [`crate::gateway::ChannelGatewayStateMachine::submit_scheduler_task`],
//! deriving a `scheduler-<job_id>-<fire_time>` session id so concurrent
//! fires of the same job don't collide in the Task Store.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use cron::{CronExpression, CronParser};

use crate::gateway::ChannelGatewayStateMachine;

/// How a job behaves when its previous fire is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Drop this fire entirely.
    Skip,
    /// Submit anyway; the Channel Gateway / Task Store admission path
    /// decides whether it can actually run concurrently.
    Delay,
}

#[derive(Debug, Clone)]
pub struct JobDef {
    pub job_id: String,
    pub expression: CronExpression,
    pub session_id: String,
    pub request: serde_json::Value,
    pub concurrency_policy: ConcurrencyPolicy,
}

struct JobState {
    def: JobDef,
    last_fired: Option<chrono::DateTime<chrono::Utc>>,
    in_flight_run_id: Option<String>,
}

/// Holds scheduled jobs and drives them on a `tick()` cadence.
pub struct Scheduler {
    gateway: Arc<ChannelGatewayStateMachine>,
    jobs: RwLock<HashMap<String, JobState>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(gateway: Arc<ChannelGatewayStateMachine>) -> Self {
        Self { gateway, jobs: RwLock::new(HashMap::new()) }
    }

    /// Register a job from a raw cron string. Replaces any existing job
    /// with the same `job_id`.
    pub fn add_job(
        &self,
        job_id: impl Into<String>,
        cron_expr: &str,
        session_id: impl Into<String>,
        request: serde_json::Value,
        concurrency_policy: ConcurrencyPolicy,
    ) -> anyhow::Result<()> {
        let expression = CronParser::parse(cron_expr)?;
        let job_id = job_id.into();
        self.jobs.write().insert(
            job_id.clone(),
            JobState {
                def: JobDef { job_id, expression, session_id: session_id.into(), request, concurrency_policy },
                last_fired: None,
                in_flight_run_id: None,
            },
        );
        Ok(())
    }

    pub fn remove_job(&self, job_id: &str) {
        self.jobs.write().remove(job_id);
    }

    /// Evaluate every job against `now` and submit the ones that fire.
    /// Intended to be called once a minute (cron resolution) from a
    /// `tokio::time::interval` loop in `main.rs`.
    pub async fn tick(&self, now: chrono::DateTime<chrono::Utc>) {
        let due: Vec<JobDef> = {
            let mut jobs = self.jobs.write();
            jobs.values_mut()
                .filter_map(|state| {
                    if !state.def.expression.matches(&now) {
                        return None;
                    }
                    if state.last_fired == Some(now) {
                        return None;
                    }
                    if state.def.concurrency_policy == ConcurrencyPolicy::Skip && state.in_flight_run_id.is_some() {
                        info!(job_id = %state.def.job_id, "skipping fire, previous run still in flight");
                        return None;
                    }
                    state.last_fired = Some(now);
                    Some(state.def.clone())
                })
                .collect()
        };

        for job in due {
            let session_id = format!("{}-{}", job.session_id, now.timestamp());
            match self.gateway.submit_scheduler_task(&session_id, job.request.clone()).await {
                Ok(run_id) => {
                    if let Some(state) = self.jobs.write().get_mut(&job.job_id) {
                        state.in_flight_run_id = Some(run_id);
                    }
                }
                Err(err) => warn!(job_id = %job.job_id, error = %err, "scheduled submission failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{BroadcasterConfig, EventBroadcaster};
    use crate::error::AppError;
    use crate::execution::{ExecutionConfig, ExecutionContext, ReactEngine, TaskExecutionService};
    use crate::gateway::{GatewayConfig, RecordingMessenger};
    use crate::history::{AsyncEventHistoryStore, HistoryConfig};
    use alex_durable::{InMemoryEventHistoryStore, InMemoryTaskStore, TaskRecordStore};
    use async_trait::async_trait;

    struct EchoEngine;

    #[async_trait]
    impl ReactEngine for EchoEngine {
        async fn run(&self, _ctx: ExecutionContext) -> Result<String, AppError> {
            Ok("ok".into())
        }
    }

    fn new_scheduler() -> Arc<Scheduler> {
        let store: Arc<dyn TaskRecordStore> = Arc::new(InMemoryTaskStore::new());
        let broadcaster = Arc::new(EventBroadcaster::new(BroadcasterConfig::default()));
        let history_store = Arc::new(InMemoryEventHistoryStore::new());
        let history = Arc::new(AsyncEventHistoryStore::new(history_store, HistoryConfig::default()));
        let execution = Arc::new(TaskExecutionService::new(
            store,
            broadcaster,
            history,
            Arc::new(EchoEngine),
            ExecutionConfig::default(),
        ));
        let gateway = Arc::new(ChannelGatewayStateMachine::new(
            execution,
            Arc::new(RecordingMessenger::new()),
            GatewayConfig::default(),
        ));
        Arc::new(Scheduler::new(gateway))
    }

    #[tokio::test]
    async fn job_fires_exactly_once_for_its_matching_minute() {
        let scheduler = new_scheduler();
        scheduler
            .add_job("job-1", "* * * * *", "scheduler-job-1", serde_json::json!({}), ConcurrencyPolicy::Delay)
            .unwrap();

        let now = chrono::Utc::now();
        scheduler.tick(now).await;
        scheduler.tick(now).await;

        assert_eq!(scheduler.jobs.read().get("job-1").unwrap().last_fired, Some(now));
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        assert!(CronParser::parse("not a cron").is_err());
    }
}
