//! Background token refresher.
//!
//! One task per refresher keeps a [`CredentialStore`] populated by calling a
//! [`TokenSource`] on a schedule derived from the reported `expires_in`.
//!
//! The task is a small state machine:
//!
//! ```text
//!   Idle --start--> Refreshing --> Armed(d) --timer fired / ManualRefresh--> Refreshing --> Armed(d')
//!                   Armed(d) --ResetInterval(x)--> Armed(x)
//!   any  --shutdown--> Idle
//! ```
//!
//! Only the task owns the timer. Everyone else talks to it through a bounded
//! command queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::credential::{Credential, CredentialError, CredentialStore};
use crate::token::{self, TokenSource};

/// Interval used after a failed refresh.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound for one issuance, including the HTTP round trip.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

const COMMAND_CAPACITY: usize = 8;

/// Turn the provider's `expires_in` into the delay before the next refresh.
///
/// Longer lifetimes get a larger safety buffer so the token is replaced well
/// before the server expires it.
pub fn refresh_interval(expires_in: i64) -> token::Result<Duration> {
    let secs = match expires_in {
        s if s > 3600 => s - 600,
        s if s > 1800 => s - 300,
        s if s > 300 => s - 60,
        s if s > 60 => s - 10,
        s if s > 0 => s,
        s => return Err(token::Error::NonPositiveExpiresIn(s)),
    };
    Ok(Duration::from_secs(secs as u64))
}

/// Observable phase of the refresher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed(Duration),
    Refreshing,
}

#[derive(Debug)]
enum Command {
    ManualRefresh,
    ResetInterval(Duration),
}

/// Tuning knobs
#[derive(Debug, Clone)]
pub struct RefresherOptions {
    /// Delay before retrying after a failed refresh (default: 60s)
    pub retry_interval: Duration,
    /// Upper bound for one issuance (default: 15s)
    pub fetch_timeout: Duration,
}

impl Default for RefresherOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

struct Inner {
    source: Arc<dyn TokenSource>,
    store: Arc<dyn CredentialStore>,
    options: RefresherOptions,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn set_state(&self, state: SchedulerState) {
        *self.state.lock() = state;
    }

    /// Issue once, publish the outcome, and report the next interval.
    async fn fetch_and_publish(&self) -> token::Result<(String, Duration)> {
        let outcome = match timeout(self.options.fetch_timeout, self.source.issue()).await {
            Ok(result) => result,
            Err(_) => Err(token::Error::Timeout(self.options.fetch_timeout)),
        }
        .and_then(|issued| {
            refresh_interval(issued.expires_in).map(|interval| (issued.access_token, interval))
        });

        let credential = match &outcome {
            Ok((value, interval)) => {
                info!(refresh_in = ?interval, "token refreshed");
                Credential::issued(value.clone(), *interval)
            }
            Err(e) => {
                warn!("token refresh failed: {e}");
                Credential::failed(CredentialError::from(e), self.options.retry_interval)
            }
        };
        if let Err(e) = self.store.set(credential).await {
            warn!("failed to publish credential: {e}");
        }
        outcome
    }

    /// One timer- or command-driven refresh; returns the interval to arm next.
    async fn cycle(&self, armed: Duration) -> Duration {
        self.set_state(SchedulerState::Refreshing);
        match self.fetch_and_publish().await {
            Ok((_, interval)) => {
                if interval != armed {
                    debug!(from = ?armed, to = ?interval, "re-arming refresh timer");
                }
                interval
            }
            Err(_) => {
                if armed != self.options.retry_interval {
                    debug!(retry_in = ?self.options.retry_interval, "falling back to retry interval");
                }
                self.options.retry_interval
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(scope = %self.source.scope()))]
    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
        first_issued: oneshot::Sender<()>,
    ) {
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("refresher cancelled before its first issuance");
                self.set_state(SchedulerState::Idle);
                return;
            }
            outcome = self.fetch_and_publish() => outcome,
        };
        let mut armed = match first {
            Ok((_, interval)) => interval,
            Err(_) => self.options.retry_interval,
        };
        let mut deadline = Instant::now() + armed;
        self.set_state(SchedulerState::Armed(armed));
        debug!(first_refresh_in = ?armed, "refresher started");
        // The starter may have stopped waiting.
        let _ = first_issued.send(());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("refresher cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(Command::ResetInterval(interval)) => {
                        debug!(interval = ?interval, "refresh timer reset");
                        armed = interval;
                    }
                    Some(Command::ManualRefresh) => {
                        armed = self.cycle(armed).await;
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    armed = self.cycle(armed).await;
                }
            }
            deadline = Instant::now() + armed;
            self.set_state(SchedulerState::Armed(armed));
        }

        self.set_state(SchedulerState::Idle);
    }
}

/// Keeps one credential fresh in the background.
///
/// Dropping the refresher cancels its task.
pub struct TokenRefresher {
    inner: Arc<Inner>,
    started: AtomicBool,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TokenRefresher {
    pub fn new(
        source: Arc<dyn TokenSource>,
        store: Arc<dyn CredentialStore>,
        options: RefresherOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                options,
                state: Mutex::new(SchedulerState::Idle),
            }),
            started: AtomicBool::new(false),
            commands: Mutex::new(None),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the background task and wait for its first issuance.
    ///
    /// Only the first call does anything; later calls return `false`. The task
    /// is running before this future first yields, so dropping the future
    /// (e.g. a caller-side timeout) never leaves the refresher half started.
    pub async fn start(&self) -> bool {
        let Some(first_issued) = self.launch() else {
            return false;
        };
        if first_issued.await.is_err() {
            debug!("refresher stopped before its first issuance");
        }
        true
    }

    /// Start the background task without waiting; it issues immediately.
    ///
    /// Must be called from within a tokio runtime. Returns `false` if already started.
    pub fn spawn(&self) -> bool {
        self.launch().is_some()
    }

    fn launch(&self) -> Option<oneshot::Receiver<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.inner.set_state(SchedulerState::Refreshing);
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (first_tx, first_rx) = oneshot::channel();
        *self.commands.lock() = Some(tx);
        let handle = tokio::spawn(Arc::clone(&self.inner).run(rx, self.cancel.clone(), first_tx));
        *self.task.lock() = Some(handle);
        Some(first_rx)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Refresh synchronously and realign the background timer.
    ///
    /// On failure the timer is reset to the retry interval so the next attempt
    /// comes soon.
    pub async fn refresh_now(&self) -> Result<String, CredentialError> {
        let outcome = self.inner.fetch_and_publish().await;
        let next = match &outcome {
            Ok((_, interval)) => *interval,
            Err(_) => self.inner.options.retry_interval,
        };
        self.send(Command::ResetInterval(next)).await;
        outcome.map(|(value, _)| value).map_err(CredentialError::from)
    }

    /// Ask the background task to refresh as soon as possible.
    ///
    /// Returns `false` if the refresher is not running or its queue is full.
    pub fn request_refresh(&self) -> bool {
        let tx = self.commands.lock().clone();
        match tx {
            Some(tx) => tx.try_send(Command::ManualRefresh).is_ok(),
            None => false,
        }
    }

    /// Current phase of the background task.
    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock()
    }

    /// The store this refresher publishes into.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// Stop the background task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("refresher task ended abnormally: {e}");
            }
        }
    }

    async fn send(&self, command: Command) {
        let tx = self.commands.lock().clone();
        let Some(tx) = tx else { return };
        let command = match tx.try_send(command) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("refresher task is gone; command dropped");
                return;
            }
            Err(mpsc::error::TrySendError::Full(command)) => command,
        };
        if tx.send(command).await.is_err() {
            debug!("refresher task is gone; command dropped");
        }
    }
}

impl Drop for TokenRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
