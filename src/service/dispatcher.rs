use crate::config::ReconcilerConfig;
use crate::db::DesiredStateSource;
use crate::error::ProvisionerError;
use crate::service::reconciler::{Outcome, ReconcileError, Reconciler, Step};
use crate::types::RequestKey;

use backon::{BackoffBuilder, ExponentialBuilder};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Messages handled by the dispatcher actor.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Something about this request may have changed; reconcile it.
    Trigger(RequestKey),
    /// Trigger every known request.
    Resync,

    // Internal messages (sent by the actor's own tasks)
    /// A reconcile attempt has finished.
    Completed {
        key: RequestKey,
        result: Result<Outcome, ReconcileError>,
    },
}

/// Handle for interacting with the dispatcher actor.
#[derive(Clone)]
pub struct DispatcherHandle {
    actor: ActorRef<DispatcherMessage>,
}

impl DispatcherHandle {
    pub fn trigger(&self, key: RequestKey) {
        let _ = ractor::cast!(self.actor, DispatcherMessage::Trigger(key));
    }

    pub fn resync(&self) {
        let _ = ractor::cast!(self.actor, DispatcherMessage::Resync);
    }

    /// Stop the actor; in-flight attempts are aborted.
    pub fn stop(&self) {
        self.actor.stop(Some("shutdown".to_string()));
    }
}

pub struct DispatcherArgs {
    pub reconciler: Arc<Reconciler>,
    pub source: Arc<dyn DesiredStateSource>,
    pub workers: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub resync_interval: Duration,
}

impl DispatcherArgs {
    pub fn new(
        reconciler: Arc<Reconciler>,
        source: Arc<dyn DesiredStateSource>,
        cfg: &ReconcilerConfig,
    ) -> Self {
        Self {
            reconciler,
            source,
            workers: cfg.workers,
            backoff_min: cfg.backoff_min(),
            backoff_max: cfg.backoff_max(),
            resync_interval: cfg.resync_interval(),
        }
    }
}

struct DispatcherState {
    reconciler: Arc<Reconciler>,
    source: Arc<dyn DesiredStateSource>,
    max_in_flight: usize,
    backoff: ExponentialBuilder,
    backoff_max: Duration,
    /// At most one attempt per identity.
    in_flight: HashMap<RequestKey, AbortHandle>,
    /// Triggered while in flight; run once more when the current attempt ends.
    dirty: HashSet<RequestKey>,
    /// Waiting for a free worker slot.
    waiting: VecDeque<RequestKey>,
    queued: HashSet<RequestKey>,
    /// Consecutive failed attempts per identity.
    failures: HashMap<RequestKey, usize>,
    background: Vec<JoinHandle<()>>,
}

/// Single-flight, bounded-concurrency dispatcher of reconcile attempts.
struct ReconcileDispatcher;

#[ractor::async_trait]
impl Actor for ReconcileDispatcher {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(args.backoff_min)
            .with_max_delay(args.backoff_max)
            .without_max_times()
            .with_jitter();

        let watcher = spawn_watch_forwarder(args.source.as_ref(), myself.clone());
        let ticker = spawn_resync_ticker(args.resync_interval, myself);

        info!(
            workers = args.workers.max(1),
            resync_secs = args.resync_interval.as_secs(),
            "ReconcileDispatcher started"
        );

        Ok(DispatcherState {
            reconciler: args.reconciler,
            source: args.source,
            max_in_flight: args.workers.max(1),
            backoff,
            backoff_max: args.backoff_max,
            in_flight: HashMap::new(),
            dirty: HashSet::new(),
            waiting: VecDeque::new(),
            queued: HashSet::new(),
            failures: HashMap::new(),
            background: vec![watcher, ticker],
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Trigger(key) => {
                self.handle_trigger(state, &myself, key);
            }
            DispatcherMessage::Resync => {
                self.handle_resync(state, &myself).await;
            }
            DispatcherMessage::Completed { key, result } => {
                self.handle_completed(state, &myself, key, result);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for (key, handle) in state.in_flight.drain() {
            debug!(request = %key, "aborting in-flight reconcile");
            handle.abort();
        }
        for task in state.background.drain(..) {
            task.abort();
        }
        info!("ReconcileDispatcher stopped");
        Ok(())
    }
}

impl ReconcileDispatcher {
    fn handle_trigger(
        &self,
        state: &mut DispatcherState,
        myself: &ActorRef<DispatcherMessage>,
        key: RequestKey,
    ) {
        if state.in_flight.contains_key(&key) {
            debug!(request = %key, "attempt in flight; coalescing trigger");
            state.dirty.insert(key);
            return;
        }
        if state.in_flight.len() >= state.max_in_flight {
            if state.queued.insert(key.clone()) {
                state.waiting.push_back(key);
            }
            return;
        }
        self.start(state, myself, key);
    }

    fn start(
        &self,
        state: &mut DispatcherState,
        myself: &ActorRef<DispatcherMessage>,
        key: RequestKey,
    ) {
        let reconciler = state.reconciler.clone();
        let me = myself.clone();
        let task_key = key.clone();
        let attempt_key = key.clone();
        let attempt = tokio::spawn(async move { reconciler.reconcile(&attempt_key).await });
        state.in_flight.insert(key, attempt.abort_handle());

        // Completed must be posted even if the attempt panicked, or the key stays in flight.
        tokio::spawn(async move {
            let result = match attempt.await {
                Ok(result) => result,
                Err(e) => Err(ReconcileError::new(
                    Step::Attempt,
                    ProvisionerError::TaskFailed(e.to_string()),
                )),
            };
            let _ = ractor::cast!(
                me,
                DispatcherMessage::Completed {
                    key: task_key,
                    result
                }
            );
        });
    }

    fn handle_completed(
        &self,
        state: &mut DispatcherState,
        myself: &ActorRef<DispatcherMessage>,
        key: RequestKey,
        result: Result<Outcome, ReconcileError>,
    ) {
        state.in_flight.remove(&key);

        match result {
            Ok(outcome) => {
                state.failures.remove(&key);
                if let Outcome::Converged(report) = outcome
                    && !report.plan.is_noop()
                {
                    info!(request = %key, status_patched = report.status_patched, "request converged");
                }
            }
            Err(e) if e.kind().requeue() => {
                let attempts = state.failures.entry(key.clone()).or_insert(0);
                *attempts += 1;
                let delay = backoff_delay(&state.backoff, *attempts, state.backoff_max);
                warn!(
                    request = %key,
                    attempts = *attempts,
                    kind = ?e.kind(),
                    "requeueing after {:?}: {}",
                    delay,
                    e
                );
                let me = myself.clone();
                let retry_key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = ractor::cast!(me, DispatcherMessage::Trigger(retry_key));
                });
            }
            Err(e) => {
                state.failures.remove(&key);
                error!(request = %key, "giving up on request: {}", e);
            }
        }

        if state.dirty.remove(&key) {
            self.handle_trigger(state, myself, key);
        }
        while state.in_flight.len() < state.max_in_flight {
            let Some(next) = state.waiting.pop_front() else {
                break;
            };
            state.queued.remove(&next);
            self.handle_trigger(state, myself, next);
        }
    }

    async fn handle_resync(
        &self,
        state: &mut DispatcherState,
        myself: &ActorRef<DispatcherMessage>,
    ) {
        match state.source.list_keys().await {
            Ok(keys) => {
                debug!(count = keys.len(), "resync");
                for key in keys {
                    self.handle_trigger(state, myself, key);
                }
            }
            Err(e) => warn!("resync failed to list requests: {}", e),
        }
    }
}

fn backoff_delay(builder: &ExponentialBuilder, attempts: usize, max: Duration) -> Duration {
    builder
        .clone()
        .build()
        .nth(attempts.saturating_sub(1))
        .unwrap_or(max)
}

fn spawn_watch_forwarder(
    source: &dyn DesiredStateSource,
    actor: ActorRef<DispatcherMessage>,
) -> JoinHandle<()> {
    let mut changes = source.watch();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(key) => {
                    if ractor::cast!(actor, DispatcherMessage::Trigger(key)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "watch lagged; falling back to resync");
                    if ractor::cast!(actor, DispatcherMessage::Resync).is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_resync_ticker(every: Duration, actor: ActorRef<DispatcherMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            // first tick fires immediately: initial full sync
            ticker.tick().await;
            if ractor::cast!(actor, DispatcherMessage::Resync).is_err() {
                break;
            }
        }
    })
}

/// Spawn the dispatcher actor and return a handle.
pub async fn spawn(args: DispatcherArgs) -> Result<(DispatcherHandle, JoinHandle<()>), ProvisionerError> {
    let (actor, join) = Actor::spawn(None, ReconcileDispatcher, args)
        .await
        .map_err(|e| ProvisionerError::RactorError(format!("spawn dispatcher failed: {e}")))?;
    Ok((DispatcherHandle { actor }, join))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .without_max_times();
        let max = Duration::from_secs(1);

        // the builder works in floating point; compare whole milliseconds
        let millis = |attempts| backoff_delay(&builder, attempts, max).as_millis();
        assert_eq!(millis(1), 100);
        assert_eq!(millis(2), 200);
        assert_eq!(millis(3), 400);
        assert_eq!(millis(30), 1_000);
    }
}
