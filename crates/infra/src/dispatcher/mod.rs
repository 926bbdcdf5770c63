//! Background dispatcher: scans for retry candidates, delivers them and
//! records the outcome.
//!
//! ## Design
//!
//! - No in-process coordination between dispatchers; several may run against
//!   the same store
//! - A scan hands out candidates, the `transition` result decides who recorded
//!   the outcome (`false` counts as "already handled")
//! - Storage failures abort the current pass and are retried on the next tick
//! - Messages that exhaust `retry_limit` stay `Failed` until requeued
//!
//! ## Components
//!
//! - `MessageSender`: the transport boundary
//! - `Dispatcher`: one pass (`dispatch_once`) or a single message (`dispatch`)
//! - `DispatcherHandle`: a spawned polling loop with stats and shutdown

pub mod sender;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use courier_core::{MessageId, MessageKind, MessageStatus, RetryScan, StoreError, StoredMessage};

use crate::message_store::MessageStore;

pub use sender::{MessageSender, SendError};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to scan for retry candidates
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            name: "dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What happened to a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    Failed,
    /// Another worker recorded an outcome first, or the record is gone.
    AlreadyHandled,
}

/// Counters for one pass, or accumulated over a dispatcher's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub passes: u64,
    pub scanned: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub already_handled: u64,
    pub storage_errors: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.scanned += 1;
        match outcome {
            DispatchOutcome::Succeeded => self.succeeded += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::AlreadyHandled => self.already_handled += 1,
        }
    }

    fn merge(&mut self, pass: &DispatchStats) {
        self.passes += pass.passes;
        self.scanned += pass.scanned;
        self.succeeded += pass.succeeded;
        self.failed += pass.failed;
        self.already_handled += pass.already_handled;
        self.storage_errors += pass.storage_errors;
    }
}

/// Delivers stored messages through a [`MessageSender`].
pub struct Dispatcher<S, T> {
    store: S,
    sender: T,
    strict_claims: bool,
}

impl<S, T> Dispatcher<S, T>
where
    S: MessageStore,
    T: MessageSender,
{
    pub fn new(store: S, sender: T) -> Self {
        Self {
            store,
            sender,
            strict_claims: false,
        }
    }

    /// Record outcomes with a compare-and-set on the scanned status instead
    /// of a plain transition.
    pub fn with_strict_claims(mut self, strict: bool) -> Self {
        self.strict_claims = strict;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One scan-and-deliver pass over published, then received messages.
    pub async fn dispatch_once(&self) -> Result<DispatchStats, StoreError> {
        let mut stats = DispatchStats::default();
        self.run_pass(&mut stats).await?;
        Ok(stats)
    }

    /// Like `dispatch_once`, but counts into `stats` as it goes so outcomes
    /// recorded before a storage failure are kept.
    async fn run_pass(&self, stats: &mut DispatchStats) -> Result<(), StoreError> {
        let scan = self.store.retry_options().scan();
        stats.passes += 1;

        for kind in MessageKind::ALL {
            let candidates = self.store.list_retryable(kind, scan).await?;
            if !candidates.is_empty() {
                debug!(kind = %kind, count = candidates.len(), "retry candidates");
            }
            for message in &candidates {
                let outcome = self.deliver(message, scan).await?;
                stats.record(outcome);
            }
        }

        Ok(())
    }

    /// Deliver one message right away, e.g. straight after its transaction committed.
    ///
    /// Returns `None` if the id does not exist.
    pub async fn dispatch(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> Result<Option<DispatchOutcome>, StoreError> {
        let Some(message) = self.store.get(kind, id).await? else {
            return Ok(None);
        };
        if !message.status.is_dispatchable() {
            return Ok(Some(DispatchOutcome::AlreadyHandled));
        }
        let scan = self.store.retry_options().scan();
        self.deliver(&message, scan).await.map(Some)
    }

    async fn deliver(
        &self,
        message: &StoredMessage,
        scan: RetryScan,
    ) -> Result<DispatchOutcome, StoreError> {
        let next = match self.sender.send(message).await {
            Ok(()) => MessageStatus::Succeeded,
            Err(e) => {
                warn!(
                    kind = %message.kind,
                    id = %message.id,
                    name = %message.name,
                    retries = message.retries,
                    error = %e,
                    "delivery failed"
                );
                MessageStatus::Failed
            }
        };

        let applied = if self.strict_claims {
            self.store
                .transition_from(message.kind, message.id, message.status, next)
                .await?
        } else {
            self.store.transition(message.kind, message.id, next).await?
        };

        if !applied {
            debug!(kind = %message.kind, id = %message.id, "outcome already recorded elsewhere");
            return Ok(DispatchOutcome::AlreadyHandled);
        }

        match next {
            MessageStatus::Succeeded => Ok(DispatchOutcome::Succeeded),
            _ => {
                if message.retries + 1 >= scan.retry_limit {
                    warn!(
                        kind = %message.kind,
                        id = %message.id,
                        retry_limit = scan.retry_limit,
                        "retry budget exhausted; message stays Failed until requeued"
                    );
                }
                Ok(DispatchOutcome::Failed)
            }
        }
    }
}

impl<S, T> Dispatcher<S, T>
where
    S: MessageStore + 'static,
    T: MessageSender + 'static,
{
    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self, config: DispatcherConfig) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(DispatchStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(dispatcher_loop(self, config, shutdown_rx, stats_clone));

        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatchStats>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    /// Accumulated statistics.
    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

async fn dispatcher_loop<S, T>(
    dispatcher: Dispatcher<S, T>,
    config: DispatcherConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<DispatchStats>>,
) where
    S: MessageStore,
    T: MessageSender,
{
    info!(dispatcher = %config.name, "dispatcher started");

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let mut pass = DispatchStats::default();
        match dispatcher.run_pass(&mut pass).await {
            Ok(()) => {
                if pass.scanned > 0 {
                    debug!(
                        dispatcher = %config.name,
                        scanned = pass.scanned,
                        succeeded = pass.succeeded,
                        failed = pass.failed,
                        already_handled = pass.already_handled,
                        "dispatch pass finished"
                    );
                }
            }
            Err(e) => {
                // The next tick doubles as the backoff.
                if e.is_transient() {
                    warn!(dispatcher = %config.name, error = %e, "storage unavailable; retrying next tick");
                } else {
                    error!(dispatcher = %config.name, error = %e, "dispatch pass failed");
                }
                pass.storage_errors += 1;
            }
        }
        stats.lock().unwrap_or_else(|e| e.into_inner()).merge(&pass);
    }

    info!(dispatcher = %config.name, "dispatcher stopped");
}
