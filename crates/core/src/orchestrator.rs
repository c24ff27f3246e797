use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde_json::json;
use thiserror::Error;

use crate::checkpoint::{CheckpointStore, RunStatus};
use crate::config::{Account, AppConfig, ErrorPolicy};
use crate::evidence::EvidenceSink;
use crate::logger;
use crate::run_guard::StopFlag;
use crate::sleep::Clock;

/// Terminal failure of a step. Nothing below the account loop retries past one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// Force-exit the game and let the account loop try again.
    #[error("{0}")]
    Recoverable(String),
    /// Halt the run and wait for a human.
    #[error("manual intervention required: {0}")]
    Fatal(String),
}

impl StepFailure {
    pub fn for_policy(policy: ErrorPolicy, reason: impl Into<String>) -> Self {
        match policy {
            ErrorPolicy::Restart => StepFailure::Recoverable(reason.into()),
            ErrorPolicy::Manual => StepFailure::Fatal(reason.into()),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            StepFailure::Recoverable(r) | StepFailure::Fatal(r) => r,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StepFailure::Fatal(_))
    }
}

/// Record a `ui_failure` evidence bundle and classify the failure.
pub fn step_failure(
    evidence: &dyn EvidenceSink,
    policy: ErrorPolicy,
    window_title: &str,
    stage: &str,
    reason: &str,
    extra: serde_json::Value,
) -> StepFailure {
    let mut context = json!({ "stage": stage, "reason": reason });
    if let (Some(ctx), serde_json::Value::Object(more)) = (context.as_object_mut(), extra) {
        ctx.extend(more);
    }
    evidence.record("ui_failure", Some(window_title), reason, context);
    logger::error_p("flow", &format!("{} failed: {}", stage, reason));
    StepFailure::for_policy(policy, reason)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    pub timeout: Duration,
    pub retry_count: u32,
}

impl StepPolicy {
    pub fn new(timeout: Duration, retry_count: u32) -> Self {
        Self { timeout, retry_count }
    }

    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Step name to policy. Unknown names get the default policy.
#[derive(Debug, Clone)]
pub struct StepPolicies {
    table: HashMap<String, StepPolicy>,
    default: StepPolicy,
}

impl StepPolicies {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let flow = &cfg.flow;
        let step = flow.step_timeout();
        let table = [
            ("launch", StepPolicy::new(Duration::from_secs(cfg.launcher.login_timeout_seconds), 0)),
            ("wait_game_window", StepPolicy::new(step, 0)),
            ("wait_channel_select", StepPolicy::new(step, 1)),
            ("click_channel", StepPolicy::new(step, flow.click_retry)),
            ("wait_role_select", StepPolicy::new(step, 1)),
            ("click_role", StepPolicy::new(step, flow.click_retry)),
            ("wait_in_game", StepPolicy::new(Duration::from_secs(flow.in_game_match_timeout_seconds), 1)),
            ("exit_game", StepPolicy::new(Duration::from_secs(20), 1)),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), policy))
        .collect();
        Self { table, default: StepPolicy::new(step, 0) }
    }

    pub fn get(&self, name: &str) -> StepPolicy {
        self.table.get(name).copied().unwrap_or(self.default)
    }

    pub fn set(&mut self, name: &str, policy: StepPolicy) {
        self.table.insert(name.to_string(), policy);
    }
}

/// Runs named steps under their policies, leaving evidence for every failure.
pub struct StepRunner<'a> {
    policies: StepPolicies,
    error_policy: ErrorPolicy,
    evidence: &'a dyn EvidenceSink,
    window_title: String,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        policies: StepPolicies,
        error_policy: ErrorPolicy,
        evidence: &'a dyn EvidenceSink,
        window_title: &str,
    ) -> Self {
        Self { policies, error_policy, evidence, window_title: window_title.to_string() }
    }

    pub fn policy(&self, name: &str) -> StepPolicy {
        self.policies.get(name)
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    /// Attempt `action` up to `retry_count + 1` times. Errors are retried; a
    /// [`StepFailure`] raised inside the action ends the step immediately.
    pub fn run<T>(&self, name: &str, mut action: impl FnMut(&StepPolicy) -> Result<T>) -> Result<T, StepFailure> {
        let policy = self.policy(name);
        let attempts = policy.attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            logger::info_p("flow", &format!("step {} {}/{}", name, attempt, attempts));
            let err = match action(&policy) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if let Some(failure) = err.downcast_ref::<StepFailure>() {
                return Err(failure.clone());
            }
            last_error = format!("{:#}", err);
            logger::warn_p("flow", &format!("step {} {}/{} failed: {}", name, attempt, attempts, last_error));
            self.evidence.record(
                &format!("step_error_{}", name),
                Some(&self.window_title),
                &last_error,
                json!({ "step": name, "attempt": attempt, "attempts": attempts }),
            );
        }
        Err(step_failure(
            self.evidence,
            self.error_policy,
            &self.window_title,
            name,
            &format!("{} failed after {} attempts: {}", name, attempts, last_error),
            json!({ "step": name, "check": "step_policy" }),
        ))
    }
}

/// One account's whole sequence, from login to exit.
pub trait AccountSession {
    fn run(&mut self, account: &Account, steps: &StepRunner) -> Result<(), StepFailure>;
    /// Best-effort cleanup after a recoverable failure.
    fn force_exit(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
    pub status: RunStatus,
}

/// Loops the enabled accounts once, resuming from the checkpoint.
pub struct AccountRunner<'a> {
    cfg: &'a AppConfig,
    steps: StepRunner<'a>,
    checkpoint: CheckpointStore,
    stop: StopFlag,
    clock: &'a dyn Clock,
}

impl<'a> AccountRunner<'a> {
    pub fn new(cfg: &'a AppConfig, evidence: &'a dyn EvidenceSink, clock: &'a dyn Clock) -> Self {
        Self {
            cfg,
            steps: StepRunner::new(
                StepPolicies::from_config(cfg),
                cfg.flow.error_policy,
                evidence,
                &cfg.launcher.game_window_title_keyword,
            ),
            checkpoint: CheckpointStore::new(&cfg.paths.checkpoint),
            stop: StopFlag::new(&cfg.paths.stop_flag),
            clock,
        }
    }

    fn persist(&self, accounts: &[Account], next_index: usize, status: RunStatus) {
        if let Err(e) = self.checkpoint.save(accounts, next_index, status) {
            logger::warn_p("runner", &format!("saving checkpoint failed: {:#}", e));
        }
    }

    pub fn run_all(&self, session: &mut dyn AccountSession) -> Result<RunSummary> {
        let accounts = self.cfg.accounts.enabled();
        if accounts.is_empty() {
            bail!("no enabled account to run");
        }
        let total = accounts.len();
        let skipped = self.cfg.accounts.pool.len() - total;
        let max_retry = self.cfg.flow.account_max_retry.max(1);
        let start = self.checkpoint.resolve_start_index(&accounts);
        let mut summary = RunSummary { succeeded: 0, failed: 0, total, status: RunStatus::Running };
        logger::info_p("runner", &format!("running {} accounts ({} disabled)", total, skipped));

        for (offset, account) in accounts.iter().enumerate().skip(start) {
            let index = offset + 1;
            if self.stop.is_set() {
                logger::info_p("runner", "stop flag present, stopping");
                self.persist(&accounts, index, RunStatus::Stopped);
                summary.status = RunStatus::Stopped;
                break;
            }
            let started = Instant::now();
            self.persist(&accounts, index, RunStatus::Running);

            let mut success = false;
            for attempt in 1..=max_retry {
                logger::info_p(
                    "runner",
                    &format!("account {}/{} attempt {}/{}: {}", index, total, attempt, max_retry, account.username),
                );
                match session.run(account, &self.steps) {
                    Ok(()) => {
                        logger::info_p("runner", &format!("account {}/{} done: {}", index, total, account.username));
                        success = true;
                        break;
                    }
                    Err(StepFailure::Fatal(reason)) => {
                        logger::error_p("runner", &format!("manual intervention required, halting: {}", reason));
                        self.persist(&accounts, index, RunStatus::Manual);
                        summary.failed += 1;
                        summary.status = RunStatus::Manual;
                        return Ok(summary);
                    }
                    Err(StepFailure::Recoverable(reason)) => {
                        logger::error_p(
                            "runner",
                            &format!("account {}/{} attempt {}/{} failed: {}", index, total, attempt, max_retry, reason),
                        );
                        session.force_exit();
                    }
                }
            }
            if success {
                summary.succeeded += 1;
            } else {
                logger::error_p("runner", &format!("account {}/{} out of retries, skipping: {}", index, total, account.username));
                summary.failed += 1;
            }
            logger::info_p(
                "runner",
                &format!("account {}/{} took {:.2}s", index, total, started.elapsed().as_secs_f64()),
            );
            self.persist(&accounts, index + 1, RunStatus::Running);

            let wait = Duration::from_secs(self.cfg.flow.wait_next_account_seconds);
            if index < total && !wait.is_zero() {
                if self.stop.is_set() {
                    logger::info_p("runner", "stop flag present, skipping wait and stopping");
                    self.persist(&accounts, index + 1, RunStatus::Stopped);
                    summary.status = RunStatus::Stopped;
                    break;
                }
                logger::info_p("runner", &format!("next account in {}s", wait.as_secs()));
                self.clock.sleep(wait);
            }
        }

        if summary.status != RunStatus::Stopped {
            self.persist(&accounts, total, RunStatus::Completed);
            summary.status = RunStatus::Completed;
        }
        logger::info_p(
            "runner",
            &format!("run finished: ok={} failed={} total={}", summary.succeeded, summary.failed, summary.total),
        );
        Ok(summary)
    }
}
