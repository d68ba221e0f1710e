//! IPC broker.
//!
//! Ported from PipelineDB's `broker.c`: a long-running process that drains
//! every producer's queue and republishes its frames to the readers that
//! want them, waking on a short poll interval so it notices a shutdown
//! request promptly without spinning. The driving loop shape — signal
//! handling plus a bounded wait plus periodic stats — is grounded in
//! `kaos-driver`'s `main.rs`, which runs the analogous role for that
//! teacher crate (a supervisor process bridging raw sockets to a ring
//! buffer).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipcq_queue::IpcQueue;
use ipcq_tuplebuf::{ReaderId, TupleBuffer};

/// How long the broker waits on an empty producer queue before re-checking
/// shutdown state, matching `broker.c`'s 1-second `WaitLatch` timeout.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct BrokerMetrics {
    pub frames_routed: Arc<AtomicU64>,
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self { frames_routed: Arc::new(AtomicU64::new(0)) }
    }
}

/// One producer queue this broker drains, and the set of reader ids that
/// should receive every frame pulled from it.
pub struct Source {
    pub queue: Arc<IpcQueue>,
    pub readers: HashSet<ReaderId>,
}

pub struct Broker {
    sources: Vec<Source>,
    buffer: Arc<TupleBuffer>,
    metrics: BrokerMetrics,
    poll_interval: Duration,
}

impl Broker {
    pub fn new(sources: Vec<Source>, buffer: Arc<TupleBuffer>) -> Self {
        Self {
            sources,
            buffer,
            metrics: BrokerMetrics::default(),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the shutdown-check cadence; tests use a short interval so
    /// they don't have to wait out a full second per shutdown.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn metrics(&self) -> BrokerMetrics {
        self.metrics.clone()
    }

    /// Runs until `shutdown` is set. Each pass visits every source once;
    /// a source with nothing queued is waited on for at most
    /// [`POLL_INTERVAL`] before moving to the next, so one idle producer
    /// never starves the others and the loop still notices shutdown
    /// promptly.
    pub fn run(&self, shutdown: &AtomicBool) {
        tracing::info!(sources = self.sources.len(), "broker started");
        while !shutdown.load(Ordering::Acquire) {
            let mut routed_this_pass = 0u64;
            for source in &self.sources {
                if !source.queue.wait_non_empty_timeout(self.poll_interval) {
                    continue;
                }
                routed_this_pass += self.drain_source(source);
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            if routed_this_pass == 0 {
                tracing::trace!("broker pass routed nothing");
            }
        }
        tracing::info!("broker shutting down");
    }

    /// Drains every source of whatever is immediately available, without
    /// waiting on empty ones. Useful for embedding `Engine`-style or for
    /// tests that want one deterministic pass instead of running a
    /// background thread.
    pub fn drain_once(&self) -> u64 {
        self.sources.iter().map(|s| self.drain_source(s)).sum()
    }

    fn drain_source(&self, source: &Source) -> u64 {
        let mut routed = 0u64;
        while let Some(payload) = source.queue.peek() {
            self.buffer.insert(Arc::from(payload.into_boxed_slice()), source.readers.clone());
            routed += 1;
        }
        if routed > 0 {
            source.queue.commit();
            self.metrics.frames_routed.fetch_add(routed, Ordering::Relaxed);
        }
        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn drain_source_routes_every_queued_frame() {
        let queue = Arc::new(IpcQueue::new(1024));
        let buffer = Arc::new(TupleBuffer::new(16));
        let reader = buffer.open_reader();

        queue.push(b"row-1").unwrap();
        queue.push(b"row-2").unwrap();

        let broker = Broker::new(
            vec![Source { queue, readers: [reader].into_iter().collect() }],
            buffer.clone(),
        );
        let routed = broker.drain_source(&broker.sources[0]);
        assert_eq!(routed, 2);
        assert_eq!(broker.metrics().frames_routed.load(Ordering::Relaxed), 2);

        assert!(buffer.pin_next(reader).unwrap().is_some());
        assert!(buffer.pin_next(reader).unwrap().is_some());
    }

    #[test]
    fn run_exits_promptly_once_shutdown_is_set() {
        let queue = Arc::new(IpcQueue::new(1024));
        let buffer = Arc::new(TupleBuffer::new(16));
        let reader = buffer.open_reader();
        let broker = Arc::new(
            Broker::new(vec![Source { queue, readers: [reader].into_iter().collect() }], buffer)
                .with_poll_interval(Duration::from_millis(20)),
        );
        let shutdown = Arc::new(AtomicBool::new(false));

        let b = broker.clone();
        let s = shutdown.clone();
        let handle = thread::spawn(move || b.run(&s));

        thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
