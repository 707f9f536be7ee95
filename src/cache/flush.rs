//! Debounced Persistence
//!
//! Arm-on-write, re-arm on every subsequent write, flush on shutdown.
//!
//! # Durability window
//!
//! A mutation is persisted at most `delay` after the *last* mutation of a
//! burst. A crash inside that window loses the index changes made since the
//! previous successful flush; [`DebouncedFlush::unpersisted_mutations`]
//! reports how many there are right now.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Something that can persist its state on demand
#[async_trait]
pub trait FlushTarget: Send + Sync + 'static {
    async fn flush(&self) -> Result<()>;
}

enum FlushCommand {
    Arm,
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Scheduled flush driven by one background task
pub struct DebouncedFlush {
    tx: mpsc::UnboundedSender<FlushCommand>,
    pending: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
    delay: Duration,
}

impl std::fmt::Debug for DebouncedFlush {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedFlush")
            .field("delay", &self.delay)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl DebouncedFlush {
    /// Start the flush task for `target`
    pub fn spawn(target: Arc<dyn FlushTarget>, delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run(target, delay, rx, pending.clone()));
        Self {
            tx,
            pending,
            handle: Mutex::new(Some(handle)),
            delay,
        }
    }

    /// Record one mutation and (re)start the quiet timer
    pub fn arm(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        // Closed channel means we are shutting down; the final flush already ran.
        let _ = self.tx.send(FlushCommand::Arm);
    }

    /// Persist immediately
    pub async fn flush_now(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FlushCommand::Flush(reply))
            .map_err(|_| Error::Internal("flush task stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("flush task dropped reply".into()))?
    }

    /// Persist and stop the task; later calls are no-ops
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        if self.tx.send(FlushCommand::Shutdown(reply)).is_err() {
            return Ok(());
        }
        let result = rx
            .await
            .map_err(|_| Error::Internal("flush task dropped reply".into()))?;
        let _ = handle.await;
        result
    }

    /// Mutations recorded since the last successful flush
    pub fn unpersisted_mutations(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

async fn flush_once(target: &Arc<dyn FlushTarget>, pending: &AtomicU64) -> Result<()> {
    let covered = pending.load(Ordering::Relaxed);
    target.flush().await?;
    // Mutations that arrived during the flush stay counted.
    pending.fetch_sub(covered, Ordering::Relaxed);
    Ok(())
}

async fn run(
    target: Arc<dyn FlushTarget>,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<FlushCommand>,
    pending: Arc<AtomicU64>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let armed = deadline;
        let quiet = async move {
            match armed {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = rx.recv() => match command {
                Some(FlushCommand::Arm) => {
                    deadline = Some(Instant::now() + delay);
                }
                Some(FlushCommand::Flush(reply)) => {
                    deadline = None;
                    let _ = reply.send(flush_once(&target, &pending).await);
                }
                Some(FlushCommand::Shutdown(reply)) => {
                    let _ = reply.send(flush_once(&target, &pending).await);
                    break;
                }
                None => {
                    if deadline.is_some() {
                        if let Err(e) = flush_once(&target, &pending).await {
                            error!(category = "cache.l2", "Final flush failed: {}", e);
                        }
                    }
                    break;
                }
            },
            _ = quiet => {
                deadline = None;
                match flush_once(&target, &pending).await {
                    Ok(()) => debug!(category = "cache.l2", "Debounced flush complete"),
                    Err(e) => {
                        error!(category = "cache.l2", "Debounced flush failed: {}", e);
                        // Retry after another quiet period.
                        deadline = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct CountingTarget {
        flushes: AtomicU64,
        fail: AtomicBool,
    }

    #[async_trait]
    impl FlushTarget for CountingTarget {
        async fn flush(&self) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::Internal("disk full".into()));
            }
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced() {
        let target = Arc::new(CountingTarget::default());
        let flush = DebouncedFlush::spawn(target.clone(), Duration::from_secs(5));

        for _ in 0..10 {
            flush.arm();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(target.flushes.load(Ordering::Relaxed), 0);
        assert_eq!(flush.unpersisted_mutations(), 10);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.flushes.load(Ordering::Relaxed), 1);
        assert_eq!(flush.unpersisted_mutations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now() {
        let target = Arc::new(CountingTarget::default());
        let flush = DebouncedFlush::spawn(target.clone(), Duration::from_secs(5));

        flush.arm();
        flush.flush_now().await.unwrap();
        assert_eq!(target.flushes.load(Ordering::Relaxed), 1);
        assert_eq!(flush.unpersisted_mutations(), 0);

        // Deadline was cleared by the explicit flush.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(target.flushes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_stops() {
        let target = Arc::new(CountingTarget::default());
        let flush = DebouncedFlush::spawn(target.clone(), Duration::from_secs(5));

        flush.arm();
        flush.shutdown().await.unwrap();
        assert_eq!(target.flushes.load(Ordering::Relaxed), 1);

        flush.shutdown().await.unwrap();
        assert!(flush.flush_now().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_keeps_pending() {
        let target = Arc::new(CountingTarget::default());
        target.fail.store(true, Ordering::Relaxed);
        let flush = DebouncedFlush::spawn(target.clone(), Duration::from_millis(100));

        flush.arm();
        flush.arm();
        assert!(flush.flush_now().await.is_err());
        assert_eq!(flush.unpersisted_mutations(), 2);

        target.fail.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(500)).await;
        flush.flush_now().await.unwrap();
        assert_eq!(flush.unpersisted_mutations(), 0);
    }
}
