use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use wombat_contracts::Problem;
use wombat_kernel::{checkpoint_key, pending_checkpoint, Checkpoint};

use crate::generation::Generator;
use crate::mediator::{ActionOutcome, Mediator};
use crate::prompts;
use crate::store::{FeedEvent, ProblemFeed};

const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The snapshot is not waiting on a checkpoint.
    NotApplicable,
    /// This instance is already generating for the checkpoint.
    AlreadyInFlight,
    Written,
    /// Another writer delivered the checkpoint first.
    Discarded,
    Failed,
}

/// Fires the Wombat's verdict and wager once per checkpoint for this
/// instance. Across instances the engine's write-once rule decides.
pub struct CheckpointTrigger {
    mediator: Arc<Mediator>,
    generator: Arc<dyn Generator>,
    in_flight: Mutex<HashSet<String>>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl CheckpointTrigger {
    pub fn new(mediator: Arc<Mediator>) -> Self {
        let generator = Arc::clone(mediator.generator());
        Self {
            mediator,
            generator,
            in_flight: Mutex::new(HashSet::new()),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Attempts per checkpoint when the write fails, and the first pause
    /// between them. The pause doubles after each failure.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub async fn observe(&self, problem: &Problem) -> TriggerOutcome {
        let Some(checkpoint) = pending_checkpoint(problem) else {
            return TriggerOutcome::NotApplicable;
        };
        let key = checkpoint_key(&problem.id, checkpoint);
        if !self.in_flight.lock().await.insert(key.clone()) {
            debug!(
                problem_id = %problem.id,
                checkpoint = checkpoint.as_str(),
                "checkpoint already in flight"
            );
            return TriggerOutcome::AlreadyInFlight;
        }

        let outcome = self.deliver(problem, checkpoint).await;
        self.in_flight.lock().await.remove(&key);
        outcome
    }

    /// Observes `problem`; while the write fails, waits, re-reads the record
    /// and tries again.
    pub async fn observe_with_retry(&self, problem: Problem) -> TriggerOutcome {
        let mut problem = problem;
        let mut backoff = self.retry_backoff;
        let mut attempt = 1;
        loop {
            let outcome = self.observe(&problem).await;
            if outcome != TriggerOutcome::Failed || attempt >= self.retry_attempts {
                return outcome;
            }
            warn!(
                problem_id = %problem.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "checkpoint write failed; retrying"
            );
            sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
            attempt += 1;
            match self.mediator.store().read(&problem.id).await {
                Ok(Some(latest)) => problem = latest,
                Ok(None) => return TriggerOutcome::NotApplicable,
                Err(e) => {
                    warn!(problem_id = %problem.id, error = %e, "re-read before retry failed");
                }
            }
        }
    }

    async fn deliver(&self, problem: &Problem, checkpoint: Checkpoint) -> TriggerOutcome {
        let prompt = prompts::checkpoint(checkpoint, problem);
        let text = match self.generator.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!(
                    problem_id = %problem.id,
                    checkpoint = checkpoint.as_str(),
                    "blank generation; writing sentinel"
                );
                prompts::sentinel(checkpoint).to_string()
            }
            Err(e) => {
                warn!(
                    problem_id = %problem.id,
                    checkpoint = checkpoint.as_str(),
                    error = %e,
                    "generation failed; writing sentinel"
                );
                prompts::sentinel(checkpoint).to_string()
            }
        };

        match self
            .mediator
            .record_checkpoint(&problem.id, checkpoint, text)
            .await
        {
            Ok(ActionOutcome::Applied(_)) => {
                info!(
                    problem_id = %problem.id,
                    checkpoint = checkpoint.as_str(),
                    "checkpoint delivered"
                );
                TriggerOutcome::Written
            }
            Ok(ActionOutcome::AlreadyHandled { .. }) => {
                debug!(
                    problem_id = %problem.id,
                    checkpoint = checkpoint.as_str(),
                    "checkpoint delivered elsewhere; discarding"
                );
                TriggerOutcome::Discarded
            }
            Err(e) => {
                warn!(
                    problem_id = %problem.id,
                    checkpoint = checkpoint.as_str(),
                    error = %e,
                    "checkpoint write failed"
                );
                TriggerOutcome::Failed
            }
        }
    }

    /// Starts an observation for every stored record still waiting on a
    /// checkpoint. Returns how many were started.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for checkpoint in [Checkpoint::Verdict, Checkpoint::Wager] {
            let waiting = match self.mediator.store().list_in_phase(checkpoint.phase()).await {
                Ok(waiting) => waiting,
                Err(e) => {
                    warn!(
                        checkpoint = checkpoint.as_str(),
                        error = %e,
                        "checkpoint sweep could not list records"
                    );
                    continue;
                }
            };
            for problem in waiting {
                if pending_checkpoint(&problem).is_some() {
                    self.spawn_observation(problem);
                    started += 1;
                }
            }
        }
        if started > 0 {
            info!(started, "checkpoint sweep picked up waiting records");
        }
        started
    }

    fn spawn_observation(self: &Arc<Self>, problem: Problem) {
        let trigger = Arc::clone(self);
        tokio::spawn(async move {
            trigger.observe_with_retry(problem).await;
        });
    }

    /// Catches up on stored records, then observes every snapshot on `feed`
    /// until the store goes away. Lag triggers another catch-up sweep.
    pub async fn run(self: Arc<Self>, mut feed: ProblemFeed) {
        self.sweep().await;
        while let Some(event) = feed.recv().await {
            match event {
                FeedEvent::Snapshot(problem) => {
                    if pending_checkpoint(&problem).is_some() {
                        self.spawn_observation(problem);
                    }
                }
                FeedEvent::Lagged(skipped) => {
                    warn!(skipped, "problem feed lagged; sweeping for missed checkpoints");
                    self.sweep().await;
                }
            }
        }
        debug!("problem feed closed; checkpoint trigger stopping");
    }
}
