use crate::application::pacing::{PacingService, RunReport};
use crate::domain::models::Options;
use crate::infrastructure::activity_store::ActivityStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::run_journal::RunJournal;
use crate::infrastructure::run_state_repository::RunStateRepository;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{error, info, warn};

pub type OptionsProvider = Arc<dyn Fn() -> Result<Options, InfraError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    pub interval: Duration,
    pub flex: Duration,
    pub run_timeout: Duration,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            flex: Duration::from_secs(5 * 60),
            run_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Acknowledgement {
    Finished { report: RunReport },
    Failed { error: String, retryable: bool },
    TimedOut { timeout_ms: u64 },
}

pub struct PeriodicTrigger<S, A>
where
    S: RunStateRepository,
    A: ActivityStore,
{
    service: Arc<PacingService<S, A>>,
    options_provider: OptionsProvider,
    policy: TriggerPolicy,
    journal: Option<Arc<RunJournal>>,
}

impl<S, A> PeriodicTrigger<S, A>
where
    S: RunStateRepository + 'static,
    A: ActivityStore + 'static,
{
    pub fn new(service: Arc<PacingService<S, A>>, options_provider: OptionsProvider) -> Self {
        Self {
            service,
            options_provider,
            policy: TriggerPolicy::default(),
            journal: None,
        }
    }

    pub fn with_policy(mut self, policy: TriggerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_journal(mut self, journal: Arc<RunJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub async fn trigger_once(&self) -> Acknowledgement {
        let acknowledgement = match (self.options_provider)() {
            Err(error) => Acknowledgement::Failed {
                retryable: error.is_retryable(),
                error: error.to_string(),
            },
            Ok(options) => {
                match tokio::time::timeout(self.policy.run_timeout, self.service.run_once(&options)).await {
                    Ok(Ok(report)) => Acknowledgement::Finished { report },
                    Ok(Err(error)) => Acknowledgement::Failed {
                        retryable: error.is_retryable(),
                        error: error.to_string(),
                    },
                    Err(_) => Acknowledgement::TimedOut {
                        timeout_ms: self.policy.run_timeout.as_millis() as u64,
                    },
                }
            }
        };

        match &acknowledgement {
            Acknowledgement::Finished { report } => {
                info!(steps_added = report.steps_added(), "pacer task finished");
            }
            Acknowledgement::Failed { error, retryable } => {
                error!(%error, retryable, "failed to run pacer task");
            }
            Acknowledgement::TimedOut { timeout_ms } => {
                warn!(timeout_ms, "pacer task timed out");
            }
        }
        if let Some(journal) = &self.journal {
            let level = match acknowledgement {
                Acknowledgement::Finished { .. } => "info",
                _ => "error",
            };
            let detail = serde_json::to_value(&acknowledgement).unwrap_or(serde_json::Value::Null);
            journal.append(level, "finished", detail);
        }
        acknowledgement
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut invocations = 0usize;
        info!(
            interval_secs = self.policy.interval.as_secs(),
            flex_secs = self.policy.flex.as_secs(),
            "scheduling pacer task"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            let delay = self.flex_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }

            self.trigger_once().await;
            invocations += 1;
        }

        info!(invocations, "pacer task stopped");
        invocations
    }

    fn flex_delay(&self) -> Duration {
        let flex_ms = self.policy.flex.as_millis() as u64;
        if flex_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=flex_ms))
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *shutdown.borrow();
        if stopped {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
