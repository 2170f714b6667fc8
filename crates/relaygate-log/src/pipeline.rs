use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;

use crate::record::LogEvent;

/// Durable writer for batches of log events. Implemented by
/// `relaygate-storage`; failures here never reach the dispatcher.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, batch: &[LogEvent]) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy)]
pub struct LogPipelineConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 65_536,
            batch_size: 200,
            flush_interval: Duration::from_millis(200),
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogStats {
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub avg_ms: f64,
    pub last_at: Option<OffsetDateTime>,
    pub healthy: bool,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    avg_ms_bits: AtomicU64,
    last_at_unix_ms: AtomicU64,
    healthy: AtomicBool,
}

/// Bounded, non-blocking async queue persisting two-phase request log
/// records. `enqueue` never blocks the dispatcher's hot
/// path: on a full queue the record is dropped and `dropped` increments.
pub struct LogPipeline {
    tx: mpsc::Sender<LogEvent>,
    queue_capacity: usize,
    counters: Arc<Counters>,
}

impl LogPipeline {
    pub fn spawn(sink: Arc<dyn LogSink>, config: LogPipelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(Counters::default());
        counters.healthy.store(true, Ordering::Relaxed);
        tokio::spawn(writer_loop(sink, rx, config, counters.clone()));
        Self {
            tx,
            queue_capacity: config.queue_capacity,
            counters,
        }
    }

    /// Non-blocking enqueue. Returns `true` if accepted, `false` if the
    /// record was dropped because the queue was at capacity.
    pub fn enqueue(&self, event: LogEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> LogStats {
        let pending = self.queue_capacity.saturating_sub(self.tx.capacity());
        LogStats {
            pending,
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            avg_ms: f64::from_bits(self.counters.avg_ms_bits.load(Ordering::Relaxed)),
            last_at: last_at_from_unix_ms(self.counters.last_at_unix_ms.load(Ordering::Relaxed)),
            healthy: self.counters.healthy.load(Ordering::Relaxed),
        }
    }
}

fn last_at_from_unix_ms(ms: u64) -> Option<OffsetDateTime> {
    if ms == 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp((ms / 1000) as i64).ok()
}

async fn writer_loop(
    sink: Arc<dyn LogSink>,
    mut rx: mpsc::Receiver<LogEvent>,
    config: LogPipelineConfig,
    counters: Arc<Counters>,
) {
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut batch: Vec<LogEvent> = Vec::with_capacity(config.batch_size);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= config.batch_size {
                            flush(&sink, &mut batch, &config, &counters).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush(&sink, &mut batch, &config, &counters).await;
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&sink, &mut batch, &config, &counters).await;
                }
            }
        }
    }
}

async fn flush(
    sink: &Arc<dyn LogSink>,
    batch: &mut Vec<LogEvent>,
    config: &LogPipelineConfig,
    counters: &Arc<Counters>,
) {
    let started = std::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        match sink.write_batch(batch).await {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as f64;
                record_latency(counters, elapsed_ms);
                counters
                    .processed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                counters.last_at_unix_ms.store(now_unix_ms(), Ordering::Relaxed);
                counters.healthy.store(true, Ordering::Relaxed);
                batch.clear();
                return;
            }
            Err(err) => {
                attempt += 1;
                if attempt > config.max_retries {
                    tracing::warn!(error = %err, dropped = batch.len(), "log batch write failed permanently");
                    counters
                        .failed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    counters.healthy.store(false, Ordering::Relaxed);
                    batch.clear();
                    return;
                }
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
        }
    }
}

fn record_latency(counters: &Counters, sample_ms: f64) {
    // Lock-free exponential moving average: good enough for an
    // operational gauge, no need for exact precision under contention.
    let prev_bits = counters.avg_ms_bits.load(Ordering::Relaxed);
    let prev = f64::from_bits(prev_bits);
    let next = if prev_bits == 0 {
        sample_ms
    } else {
        prev * 0.9 + sample_ms * 0.1
    };
    counters.avg_ms_bits.store(next.to_bits(), Ordering::Relaxed);
}

fn now_unix_ms() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp() as u64 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::InsertRecord;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct RecordingSink {
        batches: Mutex<Vec<Vec<LogEvent>>>,
        fail_first_n: AtomicUsize,
        notify: Notify,
    }

    #[async_trait::async_trait]
    impl LogSink for RecordingSink {
        async fn write_batch(&self, batch: &[LogEvent]) -> Result<(), String> {
            if self.fail_first_n.load(Ordering::Relaxed) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::Relaxed);
                return Err("simulated failure".into());
            }
            self.batches.lock().await.push(batch.to_vec());
            self.notify.notify_one();
            Ok(())
        }
    }

    fn insert(id: &str) -> LogEvent {
        LogEvent::Insert(InsertRecord {
            request_id: id.to_string(),
            proxy_key_id: 1,
            group_id: None,
            provider_kind: None,
            model: None,
            method: "POST".into(),
            endpoint: "/v1/chat/completions".into(),
            request_headers: vec![],
            request_body: vec![],
            content_truncated: false,
            is_streaming: false,
            has_tools: false,
            client_ip: None,
            user_agent: None,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    #[tokio::test]
    async fn enqueued_records_are_flushed_in_fifo_order() {
        let sink = Arc::new(RecordingSink {
            batches: Mutex::new(vec![]),
            fail_first_n: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        let pipeline = LogPipeline::spawn(
            sink.clone(),
            LogPipelineConfig {
                queue_capacity: 16,
                batch_size: 2,
                flush_interval: Duration::from_millis(20),
                max_retries: 1,
                retry_backoff: Duration::from_millis(5),
            },
        );

        assert!(pipeline.enqueue(insert("r1")));
        assert!(pipeline.enqueue(insert("r2")));
        sink.notify.notified().await;

        let batches = sink.batches.lock().await;
        assert_eq!(batches.len(), 1);
        match &batches[0][0] {
            LogEvent::Insert(r) => assert_eq!(r.request_id, "r1"),
            _ => panic!("expected insert"),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let sink = Arc::new(RecordingSink {
            batches: Mutex::new(vec![]),
            fail_first_n: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        let pipeline = LogPipeline::spawn(
            sink,
            LogPipelineConfig {
                queue_capacity: 1,
                batch_size: 64,
                flush_interval: Duration::from_secs(60),
                max_retries: 1,
                retry_backoff: Duration::from_millis(1),
            },
        );
        // First fills the one slot (writer may or may not have drained it
        // yet); keep enqueuing past capacity to force at least one drop.
        let mut accepted = 0;
        for i in 0..50 {
            if pipeline.enqueue(insert(&format!("r{i}"))) {
                accepted += 1;
            }
        }
        let stats = pipeline.stats();
        assert!(accepted <= 50);
        assert!(stats.dropped >= 1, "expected at least one dropped record");
    }

    #[tokio::test]
    async fn failed_writes_retry_then_count_as_failed_after_budget() {
        let sink = Arc::new(RecordingSink {
            batches: Mutex::new(vec![]),
            fail_first_n: AtomicUsize::new(10),
            notify: Notify::new(),
        });
        let pipeline = LogPipeline::spawn(
            sink,
            LogPipelineConfig {
                queue_capacity: 16,
                batch_size: 1,
                flush_interval: Duration::from_millis(10),
                max_retries: 2,
                retry_backoff: Duration::from_millis(1),
            },
        );
        pipeline.enqueue(insert("r1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = pipeline.stats();
        assert_eq!(stats.failed, 1);
        assert!(!stats.healthy);
    }
}
