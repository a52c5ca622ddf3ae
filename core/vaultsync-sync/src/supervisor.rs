//! Connection supervision.
//!
//! The supervisor owns a [`SourceObserver`] for its whole lifetime and
//! drives it through `Starting → Running → Reconnecting → Stopped`:
//!
//! - transport errors pause for `retry_delay × retry_count` and restart; once
//!   `max_transport_retries` is exceeded the counter resets after a longer
//!   pause, so the channel keeps trying to recover
//! - a health check reconnects when the source has been silent for longer
//!   than the silence threshold
//! - failed restarts back off exponentially with jitter until
//!   `max_reconnect_attempts`, after which the supervisor stops for good
//!
//! `stop` is the only other way to halt it.

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::observer::{Notification, ObserverContext, SourceObserver};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a supervised source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Starting,
    Running,
    Reconnecting,
    Stopped,
}

/// Counters and timestamps of one observed source.
#[derive(Debug, Clone)]
pub struct WatcherState {
    /// Consecutive transport errors since the last notification.
    pub retry_count: u32,
    /// Reconnect attempts since the last successful restart.
    pub current_attempt: u32,
    pub max_attempts: u32,
    /// When the source last delivered anything.
    pub last_activity: Instant,
    /// Set once the supervisor has stopped.
    pub stopped: bool,
    /// Cleared on every (re)start.
    pub first_notification_received: bool,
}

impl WatcherState {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            retry_count: 0,
            current_attempt: 0,
            max_attempts,
            last_activity: Instant::now(),
            stopped: false,
            first_notification_received: false,
        }
    }
}

/// Exponential backoff for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            cap: Duration::from_millis(config.reconnect_cap_ms),
            jitter: config.reconnect_jitter,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// `min(base × 2^(attempt-1), cap)` for a 1-based attempt.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.cap)
    }

    /// [`Self::base_delay`] with jitter applied, never above `cap`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let spread = secs * self.jitter;
        let jittered = (secs + rng.gen_range(-spread..=spread)).max(0.0);
        Duration::from_secs_f64(jittered).min(self.cap)
    }

    /// Whether `attempt` is past the ceiling.
    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

/// Pause schedule after transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub exhaustion_pause: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_transport_retries,
            retry_delay: Duration::from_millis(config.transport_retry_delay_ms),
            exhaustion_pause: Duration::from_millis(config.exhaustion_pause_ms),
        }
    }

    /// Counts one more error and returns how long to wait before
    /// restarting. Past `max_retries` the counter starts over.
    pub fn on_error(&self, retry_count: &mut u32) -> Duration {
        *retry_count += 1;
        if *retry_count > self.max_retries {
            *retry_count = 0;
            self.exhaustion_pause
        } else {
            self.retry_delay * *retry_count
        }
    }
}

/// Running supervisor task and its observable state.
#[derive(Debug)]
pub struct SupervisorHandle {
    state: watch::Receiver<SupervisorState>,
    watcher: Arc<Mutex<WatcherState>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorHandle {
    /// Spawns the supervisor. The observer starts immediately.
    pub fn spawn(
        observer: Box<dyn SourceObserver>,
        notifications: mpsc::Sender<Notification>,
        config: &EngineConfig,
    ) -> Self {
        let watcher = Arc::new(Mutex::new(WatcherState::new(config.max_reconnect_attempts)));
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SupervisorState::Starting);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let run = Run {
            observer,
            ctx: ObserverContext::new(notifications, errors_tx, Arc::clone(&watcher)),
            errors,
            watcher: Arc::clone(&watcher),
            state: state_tx,
            shutdown: shutdown_rx,
            reconnect: ReconnectPolicy::from_config(config),
            retry: RetryPolicy::from_config(config),
            health_interval: config.health_check_interval(),
            silence_threshold: config.silence_threshold(),
        };

        Self {
            state,
            watcher,
            shutdown,
            task: Mutex::new(Some(tokio::spawn(run.run()))),
        }
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Copy of the current watcher counters.
    #[must_use]
    pub fn watcher(&self) -> WatcherState {
        lock(&self.watcher).clone()
    }

    /// Stops the observer and cancels every pending timer. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "supervisor task ended abnormally");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Start,
    Running,
    AfterError,
    Reconnect,
    Stop,
}

struct Run {
    observer: Box<dyn SourceObserver>,
    ctx: ObserverContext,
    errors: mpsc::UnboundedReceiver<SyncError>,
    watcher: Arc<Mutex<WatcherState>>,
    state: watch::Sender<SupervisorState>,
    shutdown: watch::Receiver<bool>,
    reconnect: ReconnectPolicy,
    retry: RetryPolicy,
    health_interval: Duration,
    silence_threshold: Duration,
}

impl Run {
    async fn run(mut self) {
        let mut phase = Phase::Start;
        loop {
            phase = match phase {
                Phase::Start => self.initial_start().await,
                Phase::Running => self.watch().await,
                Phase::AfterError => self.after_error().await,
                Phase::Reconnect => self.reconnect().await,
                Phase::Stop => break,
            };
        }
        self.observer.stop().await;
        lock(&self.watcher).stopped = true;
        self.state.send_replace(SupervisorState::Stopped);
        info!(observer = self.observer.name(), "supervisor stopped");
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleeps unless shut down first. Returns `false` on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        let slept = tokio::select! {
            () = tokio::time::sleep(duration) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        };
        slept && !self.is_shutdown()
    }

    async fn try_start(&mut self) -> Result<(), SyncError> {
        {
            let mut watcher = lock(&self.watcher);
            watcher.first_notification_received = false;
            watcher.last_activity = Instant::now();
        }
        // errors from the previous subscription are stale
        while self.errors.try_recv().is_ok() {}
        self.observer.start(self.ctx.clone()).await
    }

    async fn initial_start(&mut self) -> Phase {
        if self.is_shutdown() {
            return Phase::Stop;
        }
        self.set_state(SupervisorState::Starting);
        match self.try_start().await {
            Ok(()) => {
                info!(observer = self.observer.name(), "observer started");
                Phase::Running
            }
            Err(e) => {
                warn!(observer = self.observer.name(), error = %e, "initial start failed");
                Phase::Reconnect
            }
        }
    }

    async fn watch(&mut self) -> Phase {
        self.set_state(SupervisorState::Running);
        let mut health = interval_at(Instant::now() + self.health_interval, self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => return Phase::Stop,
                Some(e) = self.errors.recv() => {
                    warn!(observer = self.observer.name(), error = %e, "observer transport error");
                    return Phase::AfterError;
                }
                _ = health.tick() => {
                    let silent_for = lock(&self.watcher).last_activity.elapsed();
                    if silent_for > self.silence_threshold {
                        warn!(
                            observer = self.observer.name(),
                            silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                            "no activity, reconnecting"
                        );
                        return Phase::Reconnect;
                    }
                    debug!(observer = self.observer.name(), "health check ok");
                }
            }
        }
    }

    async fn after_error(&mut self) -> Phase {
        self.set_state(SupervisorState::Reconnecting);
        self.observer.stop().await;

        let (pause, retry_count) = {
            let mut watcher = lock(&self.watcher);
            let pause = self.retry.on_error(&mut watcher.retry_count);
            (pause, watcher.retry_count)
        };
        if retry_count == 0 {
            warn!(
                max_retries = self.retry.max_retries,
                pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                "transport retries exhausted, pausing before starting over"
            );
        } else {
            info!(
                retry_count,
                delay_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                "restarting observer"
            );
        }

        if !self.pause(pause).await {
            return Phase::Stop;
        }
        match self.try_start().await {
            Ok(()) => {
                lock(&self.watcher).current_attempt = 0;
                Phase::Running
            }
            Err(e) => {
                warn!(error = %e, "restart after transport error failed");
                Phase::Reconnect
            }
        }
    }

    async fn reconnect(&mut self) -> Phase {
        self.set_state(SupervisorState::Reconnecting);
        self.observer.stop().await;

        loop {
            let attempt = {
                let mut watcher = lock(&self.watcher);
                watcher.current_attempt += 1;
                watcher.current_attempt
            };
            if self.reconnect.exhausted(attempt) {
                error!(
                    observer = self.observer.name(),
                    max_attempts = self.reconnect.max_attempts,
                    "reconnect attempts exhausted, giving up"
                );
                return Phase::Stop;
            }

            let delay = self.reconnect.delay_for(attempt, &mut rand::thread_rng());
            info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling reconnect"
            );
            if !self.pause(delay).await {
                return Phase::Stop;
            }

            match self.try_start().await {
                Ok(()) => {
                    let mut watcher = lock(&self.watcher);
                    watcher.current_attempt = 0;
                    watcher.retry_count = 0;
                    info!(attempt, "reconnected");
                    return Phase::Running;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
    }
}

fn lock(watcher: &Mutex<WatcherState>) -> MutexGuard<'_, WatcherState> {
    watcher.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_resets_past_ceiling() {
        let policy = RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            exhaustion_pause: Duration::from_secs(5),
        };
        let mut count = 0;
        assert_eq!(policy.on_error(&mut count), Duration::from_secs(1));
        assert_eq!(policy.on_error(&mut count), Duration::from_secs(2));
        assert_eq!(policy.on_error(&mut count), Duration::from_secs(5));
        assert_eq!(count, 0);
    }
}
