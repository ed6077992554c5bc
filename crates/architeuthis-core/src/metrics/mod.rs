//! Buffered metric emission.
//!
//! The pipeline and stores emit [`MetricPoint`]s through a bounded channel;
//! a writer task batches them and hands batches of 100 to a [`MetricsSink`].
//! The sink (a timeseries backend in production) is a collaborator seam; a
//! tracing-backed sink and a null sink are provided.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Points buffered before a flush.
pub const FLUSH_BATCH_SIZE: usize = 100;

/// Channel depth; emission is fire-and-forget and drops on overflow.
const CHANNEL_CAPACITY: usize = 4096;

/// What a sleep was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepContext {
    /// Retry backoff.
    Retry,
    /// Rate-limit pacing.
    Rate,
}

impl SleepContext {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Rate => "rate",
        }
    }
}

/// One emitted event.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricPoint {
    /// One upstream attempt. `ok` means no transport error occurred; the
    /// status and size are absent when no response arrived.
    Request {
        ok: bool,
        status: Option<u16>,
        latency_seconds: f64,
        size: i64,
    },
    /// A pipeline sleep, either rate pacing or retry backoff.
    Sleep {
        context: SleepContext,
        duration_seconds: f64,
    },
    /// The alive pool changed size.
    AddProxy { new_count: usize },
}

/// A point with its emission timestamp.
#[derive(Debug, Clone)]
pub struct TimedPoint {
    pub at: DateTime<Utc>,
    pub point: MetricPoint,
}

/// Receiving end for flushed batches.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Persists one batch.
    ///
    /// # Errors
    ///
    /// Backend write failures; the writer logs and drops the batch.
    async fn write(&self, batch: Vec<TimedPoint>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Discards every batch. For tests and metrics-less deployments.
pub struct NullSink;

#[async_trait]
impl MetricsSink for NullSink {
    async fn write(
        &self,
        _batch: Vec<TimedPoint>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Logs batch sizes at debug level.
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn write(
        &self,
        batch: Vec<TimedPoint>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        debug!(size = batch.len(), "wrote points");
        Ok(())
    }
}

/// Handle used to emit points from anywhere in the pipeline.
pub struct MetricsEmitter {
    tx: mpsc::Sender<TimedPoint>,
}

impl MetricsEmitter {
    /// Creates the emitter and spawns its writer task. The task drains the
    /// channel, flushing every [`FLUSH_BATCH_SIZE`] points and once more on
    /// shutdown when the last emitter handle drops.
    #[must_use]
    pub fn spawn(sink: Arc<dyn MetricsSink>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(writer(rx, sink));
        (Arc::new(Self { tx }), task)
    }

    /// Emits a point. Never blocks; the point is dropped when the buffer is
    /// saturated.
    pub fn emit(&self, point: MetricPoint) {
        let timed = TimedPoint { at: Utc::now(), point };
        if self.tx.try_send(timed).is_err() {
            trace!("metrics buffer full, dropping point");
        }
    }
}

async fn writer(mut rx: mpsc::Receiver<TimedPoint>, sink: Arc<dyn MetricsSink>) {
    trace!("started metrics writer");
    let mut batch: Vec<TimedPoint> = Vec::with_capacity(FLUSH_BATCH_SIZE);

    while let Some(point) = rx.recv().await {
        batch.push(point);
        if batch.len() >= FLUSH_BATCH_SIZE {
            flush(&sink, &mut batch).await;
        }
    }
    flush(&sink, &mut batch).await;
}

async fn flush(sink: &Arc<dyn MetricsSink>, batch: &mut Vec<TimedPoint>) {
    if batch.is_empty() {
        return;
    }
    let points = std::mem::replace(batch, Vec::with_capacity(FLUSH_BATCH_SIZE));
    if let Err(e) = sink.write(points).await {
        error!(error = %e, "metrics write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn write(
            &self,
            batch: Vec<TimedPoint>,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.batches.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn flushes_in_batches_of_100_and_on_shutdown() {
        let sink = Arc::new(RecordingSink { batches: Mutex::new(Vec::new()) });
        let (emitter, task) = MetricsEmitter::spawn(sink.clone());

        for _ in 0..250 {
            emitter.emit(MetricPoint::AddProxy { new_count: 1 });
        }
        drop(emitter);
        task.await.unwrap();

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn sleep_contexts_have_stable_labels() {
        assert_eq!(SleepContext::Retry.as_str(), "retry");
        assert_eq!(SleepContext::Rate.as_str(), "rate");
    }

    #[tokio::test]
    async fn emit_never_blocks_when_no_reader_keeps_up() {
        let sink = Arc::new(NullSink);
        let (emitter, _task) = MetricsEmitter::spawn(sink);
        for _ in 0..20_000 {
            emitter.emit(MetricPoint::Sleep {
                context: SleepContext::Rate,
                duration_seconds: 0.01,
            });
        }
    }
}
