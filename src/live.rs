//! Live projection consumers: configuration, the per-tag polling loop, and
//! the handle that controls a running [`ProjectionEngine`].
//!
//! [`ProjectionEngine`]: crate::ProjectionEngine

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::projection::ProjectionRunner;

/// Configuration for live projection consumers.
///
/// All fields have defaults accessible via [`LiveConfig::default()`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use shopping_cart_es::LiveConfig;
///
/// let config = LiveConfig {
///     poll_interval: Duration::from_millis(50),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.poll_interval, Duration::from_millis(50));
/// assert_eq!(config.retry_base_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How long a consumer that has caught up waits before reading again.
    ///
    /// Default: 100 milliseconds.
    pub poll_interval: Duration,

    /// Base delay for exponential backoff after a failed event.
    ///
    /// After an error the consumer waits `retry_base_delay`, then
    /// `2 * retry_base_delay`, etc., up to
    /// [`retry_max_delay`](LiveConfig::retry_max_delay). A successful batch
    /// resets the backoff.
    ///
    /// Default: 1 second.
    pub retry_base_delay: Duration,

    /// Maximum delay between retries.
    ///
    /// Default: 30 seconds.
    pub retry_max_delay: Duration,

    /// Maximum number of events read from the log at once.
    ///
    /// Default: 256.
    pub batch_size: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            batch_size: 256,
        }
    }
}

/// Handle for controlling running projection consumers.
///
/// Dropping the handle does **not** stop the consumers; call
/// [`shutdown`](LiveHandle::shutdown).
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct LiveHandle {
    /// Sends `true` to signal the consumers to stop.
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    /// One flag per tag, set once that tag has been read to its end.
    caught_up: Arc<[AtomicBool]>,
    /// Spawned consumer tasks, taken and awaited once by `shutdown`.
    tasks: Arc<tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("caught_up", &self.is_caught_up())
            .finish_non_exhaustive()
    }
}

impl LiveHandle {
    pub(crate) fn new(
        shutdown_tx: tokio::sync::watch::Sender<bool>,
        caught_up: Arc<[AtomicBool]>,
        tasks: Vec<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            shutdown_tx,
            caught_up,
            tasks: Arc::new(tokio::sync::Mutex::new(tasks)),
        }
    }

    /// Returns `true` once every tag has been read to its end at least once.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.iter().all(|t| t.load(Ordering::Acquire))
    }

    /// Signal every consumer to stop and wait for them.
    ///
    /// A consumer in the middle of a batch finishes the event it is
    /// processing first. Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if a consumer task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        // The consumers may already have exited.
        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut result = Ok(());
        for task in tasks {
            if let Err(e) = task.await {
                result = Err(io::Error::other(format!("projection task panicked: {e}")));
            }
        }
        result
    }
}

/// Consume one tag until shutdown.
///
/// Reads a batch, then either continues immediately (full batch), waits
/// `poll_interval` (caught up), or backs off exponentially (error). A
/// failed event is retried from the committed offset, never skipped.
pub(crate) async fn run_tag_loop(
    mut runner: ProjectionRunner,
    config: LiveConfig,
    caught_up: Arc<[AtomicBool]>,
    index: usize,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut backoff = config.retry_base_delay;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wait = match runner.run_batch().await {
            Ok(processed) => {
                backoff = config.retry_base_delay;
                if processed < runner.batch_size() {
                    if !caught_up[index].swap(true, Ordering::AcqRel) {
                        tracing::debug!(tag = runner.tag(), "projection caught up");
                    }
                    config.poll_interval
                } else {
                    Duration::ZERO
                }
            }
            Err(e) => {
                tracing::error!(
                    tag = runner.tag(),
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "projection failed, will retry"
                );
                let wait = backoff;
                backoff = (backoff * 2).min(config.retry_max_delay);
                wait
            }
        };

        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!(tag = runner.tag(), "projection consumer stopped");
}
