//! # Transfer Strategies
//!
//! The timed write loop, in two structurally distinct renditions behind one
//! interface, selected at the call site:
//!
//! - [`BlockingTransfer`] writes buffer after buffer, suspending only inside
//!   the write itself. The duration limit is a soft deadline checked once
//!   per iteration, so a run always measures at least the requested window.
//! - [`EventDrivenTransfer`] models backpressure-aware writing: a worker
//!   task performs one buffer write per writable-readiness notification,
//!   a shared counter tracks completed buffers, and a gate flag flips when
//!   the count is reached or the deadline passes, cancelling the readiness
//!   subscription. The caller suspends on the gate until then.
//!
//! Neither loop forces a flush between buffers; buffering behavior is left
//! to the configured socket options.

use crate::config::{TransferLimit, TransferMode};
use crate::provider::DataStream;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Measured outcome of one transfer loop
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub buffers_sent: u64,
    /// Wall-clock start of the loop
    pub start: DateTime<Utc>,
    /// Wall-clock end of the loop
    pub end: DateTime<Utc>,
    /// Monotonic elapsed time, microsecond resolution
    pub elapsed: Duration,
}

/// One complete transfer run: payload buffers out, statistics back
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    async fn run(
        &self,
        stream: Box<dyn DataStream>,
        payload: Arc<Vec<u8>>,
        limit: TransferLimit,
    ) -> Result<(Box<dyn DataStream>, TransferStats)>;
}

/// Strategy instance for a transfer mode
pub fn strategy_for(mode: TransferMode) -> &'static dyn TransferStrategy {
    match mode {
        TransferMode::Blocking => &BlockingTransfer,
        TransferMode::EventDriven => &EventDrivenTransfer,
    }
}

/// Straight write loop; does not yield between buffers
pub struct BlockingTransfer;

#[async_trait]
impl TransferStrategy for BlockingTransfer {
    async fn run(
        &self,
        mut stream: Box<dyn DataStream>,
        payload: Arc<Vec<u8>>,
        limit: TransferLimit,
    ) -> Result<(Box<dyn DataStream>, TransferStats)> {
        let buffer_len = payload.len() as u64;
        let start = Utc::now();
        let clock = Instant::now();
        let mut bytes_sent: u64 = 0;
        let mut buffers_sent: u64 = 0;

        match limit {
            TransferLimit::Count(count) => {
                for _ in 0..count {
                    stream.write_all(&payload).await?;
                    bytes_sent += buffer_len;
                    buffers_sent += 1;
                }
            }
            TransferLimit::Elapsed(window) => {
                // Soft deadline: checked each iteration, never preempts a write
                while clock.elapsed() < window {
                    stream.write_all(&payload).await?;
                    bytes_sent += buffer_len;
                    buffers_sent += 1;
                }
            }
        }
        stream.flush().await?;

        let elapsed = clock.elapsed();
        let end = Utc::now();
        debug!("blocking transfer: {} buffers, {} bytes in {:?}", buffers_sent, bytes_sent, elapsed);
        Ok((stream, TransferStats { bytes_sent, buffers_sent, start, end, elapsed }))
    }
}

/// Readiness-gated write loop with a shared counter and completion gate
pub struct EventDrivenTransfer;

struct WorkerOutcome {
    stream: Box<dyn DataStream>,
    stats: TransferStats,
    error: Option<io::Error>,
}

#[async_trait]
impl TransferStrategy for EventDrivenTransfer {
    async fn run(
        &self,
        stream: Box<dyn DataStream>,
        payload: Arc<Vec<u8>>,
        limit: TransferLimit,
    ) -> Result<(Box<dyn DataStream>, TransferStats)> {
        let counter = Arc::new(AtomicU64::new(0));
        let (gate, mut gate_watch) = watch::channel(false);

        let worker_counter = Arc::clone(&counter);
        let worker = tokio::spawn(async move {
            let outcome = write_on_readiness(stream, payload, limit, worker_counter).await;
            // Flip the gate; the suspended caller resumes regardless of outcome
            let _ = gate.send(true);
            outcome
        });

        // Suspend until the worker signals completion through the gate
        let _ = gate_watch.changed().await;
        let outcome = worker.await?;
        if let Some(error) = outcome.error {
            return Err(error.into());
        }
        debug!(
            "event-driven transfer: {} buffers, {} bytes in {:?}",
            outcome.stats.buffers_sent, outcome.stats.bytes_sent, outcome.stats.elapsed
        );
        Ok((outcome.stream, outcome.stats))
    }
}

async fn write_on_readiness(
    stream: Box<dyn DataStream>,
    payload: Arc<Vec<u8>>,
    limit: TransferLimit,
    counter: Arc<AtomicU64>,
) -> WorkerOutcome {
    let buffer_len = payload.len();
    let start = Utc::now();
    let clock = Instant::now();
    let mut bytes_sent: u64 = 0;
    let mut offset: usize = 0;
    let mut error: Option<io::Error> = None;

    loop {
        // Completion is only considered at buffer boundaries, so a run
        // always sends whole buffers
        if offset == 0 {
            let done = match limit {
                TransferLimit::Count(count) => counter.load(Ordering::Acquire) >= count,
                TransferLimit::Elapsed(window) => clock.elapsed() >= window,
            };
            if done {
                break;
            }
        }

        if let Err(e) = stream.writable().await {
            error = Some(e);
            break;
        }
        match stream.try_write(&payload[offset..]) {
            Ok(written) => {
                bytes_sent += written as u64;
                offset += written;
                if offset == buffer_len {
                    offset = 0;
                    counter.fetch_add(1, Ordering::Release);
                }
            }
            // Readiness was stale; wait for the next notification
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    let elapsed = clock.elapsed();
    WorkerOutcome {
        stream,
        stats: TransferStats {
            bytes_sent,
            buffers_sent: counter.load(Ordering::Acquire),
            start,
            end: Utc::now(),
            elapsed,
        },
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SocketProvider, TcpProvider};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accepts one connection and drains it, returning total bytes read
    async fn sink() -> (u16, tokio::task::JoinHandle<u64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut total: u64 = 0;
            let mut buf = vec![0u8; 16384];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                total += n as u64;
            }
            total
        });
        (port, handle)
    }

    async fn run_transfer(
        mode: TransferMode,
        limit: TransferLimit,
        write_size: usize,
    ) -> (TransferStats, u64) {
        let (port, drained) = sink().await;
        let provider = TcpProvider::new();
        let stream = provider.connect("127.0.0.1", port).await.unwrap();
        let payload = Arc::new(vec![0x2a; write_size]);

        let (mut stream, stats) = strategy_for(mode).run(stream, payload, limit).await.unwrap();
        stream.shutdown_write().await.unwrap();
        let received = drained.await.unwrap();
        (stats, received)
    }

    #[tokio::test]
    async fn test_blocking_count_mode_sends_exact_bytes() {
        let (stats, received) =
            run_transfer(TransferMode::Blocking, TransferLimit::Count(100), 4096).await;
        assert_eq!(stats.bytes_sent, 409600);
        assert_eq!(stats.buffers_sent, 100);
        assert_eq!(received, 409600);
        assert!(stats.end >= stats.start);
    }

    #[tokio::test]
    async fn test_blocking_duration_mode_respects_soft_deadline() {
        let window = Duration::from_millis(120);
        let (stats, received) =
            run_transfer(TransferMode::Blocking, TransferLimit::Elapsed(window), 1024).await;
        assert!(stats.elapsed >= window);
        assert_eq!(stats.bytes_sent % 1024, 0);
        assert_eq!(received, stats.bytes_sent);
    }

    #[tokio::test]
    async fn test_event_driven_count_mode_sends_exact_bytes() {
        let (stats, received) =
            run_transfer(TransferMode::EventDriven, TransferLimit::Count(50), 8192).await;
        assert_eq!(stats.bytes_sent, 50 * 8192);
        assert_eq!(stats.buffers_sent, 50);
        assert_eq!(received, stats.bytes_sent);
    }

    #[tokio::test]
    async fn test_event_driven_duration_mode_sends_whole_buffers() {
        let window = Duration::from_millis(120);
        let (stats, received) =
            run_transfer(TransferMode::EventDriven, TransferLimit::Elapsed(window), 2048).await;
        assert!(stats.elapsed >= window);
        assert_eq!(stats.bytes_sent % 2048, 0);
        assert_eq!(received, stats.bytes_sent);
    }
}
