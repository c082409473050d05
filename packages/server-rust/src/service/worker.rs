//! Background workers, and the audit forwarder built on them.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with optional periodic tick callbacks.
//! `ChannelAuditSink` uses one to move audit delivery off the request path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use keel_core::{AuditEvent, AuditSink};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. On stop, runs every task already queued, then calls `BackgroundRunnable::shutdown()`
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable, queue capacity
    /// and tick interval.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn start(runnable: R, capacity: usize, tick_interval: Duration) -> Self {
        Self::start_with_sender(runnable, capacity, tick_interval).0
    }

    fn start_with_sender(
        mut runnable: R,
        capacity: usize,
        tick_interval: Duration,
    ) -> (Self, mpsc::Sender<R::Task>) {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity);
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            rx.close();
            while let Some(task) = rx.recv().await {
                runnable.run(task).await;
            }
            runnable.shutdown().await;
        });

        let worker = Self {
            tx: Some(tx.clone()),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        };
        (worker, tx)
    }

    /// Submit a task, waiting for queue space.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow!("worker channel closed")),
            None => Err(anyhow!("worker not running")),
        }
    }

    /// Submit a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the worker has been stopped.
    pub fn try_submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx.try_send(task).map_err(|e| match e {
                TrySendError::Full(_) => anyhow!("worker queue full"),
                TrySendError::Closed(_) => anyhow!("worker channel closed"),
            }),
            None => Err(anyhow!("worker not running")),
        }
    }

    /// Stop the worker gracefully, waiting for queued tasks and shutdown to complete.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Audit forwarding
// ---------------------------------------------------------------------------

/// Runnable delivering queued audit events to a (possibly slow) sink.
pub struct AuditForwarder {
    inner: Arc<dyn AuditSink>,
    forwarded: u64,
    failed: u64,
}

impl AuditForwarder {
    #[must_use]
    pub fn new(inner: Arc<dyn AuditSink>) -> Self {
        Self {
            inner,
            forwarded: 0,
            failed: 0,
        }
    }

    /// Starts a forwarder in front of `inner` and returns the sink to hand
    /// to the coordinator, plus the worker to stop on shutdown.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn spawn(
        inner: Arc<dyn AuditSink>,
        capacity: usize,
    ) -> (ChannelAuditSink, BackgroundWorker<AuditForwarder>) {
        let (worker, tx) =
            BackgroundWorker::start_with_sender(Self::new(inner), capacity, Duration::from_secs(60));
        (ChannelAuditSink { tx }, worker)
    }
}

#[async_trait]
impl BackgroundRunnable for AuditForwarder {
    type Task = AuditEvent;

    async fn run(&mut self, event: AuditEvent) {
        match self.inner.record(&event) {
            Ok(()) => self.forwarded += 1,
            Err(err) => {
                self.failed += 1;
                tracing::warn!(
                    request_id = %event.request_id,
                    operation = %event.operation_name,
                    error = %format!("{err:#}"),
                    "audit forwarding failed"
                );
            }
        }
    }

    async fn on_tick(&mut self) {
        tracing::debug!(
            forwarded = self.forwarded,
            failed = self.failed,
            "audit forwarder status"
        );
    }

    async fn shutdown(&mut self) {
        tracing::info!(
            forwarded = self.forwarded,
            failed = self.failed,
            "audit forwarder stopped"
        );
    }
}

/// Audit sink that enqueues events for an [`AuditForwarder`] and returns
/// immediately.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("audit queue full"),
            TrySendError::Closed(_) => anyhow!("audit forwarder stopped"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
