//! One subscriber session: filter, rate limiter, batch buffer and the
//! bounded outbound queue feeding its write pump.
//!
//! Everything on the offer path is synchronous and non-blocking; a slow or
//! stalled subscriber can only ever fill its own queue.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::{format_rfc3339, LogMessage, RawLogEntry};

use super::filter::{ClientSubscription, FilterError, SubscriptionFilter};
use super::protocol::{BatchMessage, ServerFrame};
use super::rate::TokenBucket;

/// Session lifecycle: OPEN accepts offers, DRAINING lets the write pump
/// empty the queue, CLOSED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Draining,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct Session {
    id: u64,
    out: Mutex<Option<mpsc::Sender<String>>>,
    queue_capacity: usize,
    state: AtomicU8,
    filter: RwLock<SubscriptionFilter>,
    limiter: Mutex<Option<TokenBucket>>,
    batch: Mutex<Vec<LogMessage>>,
    batch_task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
    dropped_rate: AtomicU64,
    dropped_queue: AtomicU64,
}

impl Session {
    /// Create a session with the default subscription (INFO and above).
    /// Returns the receiving half of the outbound queue for the write pump.
    pub fn new(id: u64, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let session = Arc::new(Self {
            id,
            out: Mutex::new(Some(tx)),
            queue_capacity,
            state: AtomicU8::new(STATE_OPEN),
            filter: RwLock::new(SubscriptionFilter::default()),
            limiter: Mutex::new(None),
            batch: Mutex::new(Vec::new()),
            batch_task: Mutex::new(None),
            started: Instant::now(),
            dropped_rate: AtomicU64::new(0),
            dropped_queue: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => SessionState::Open,
            STATE_DRAINING => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }

    pub fn dropped_rate(&self) -> u64 {
        self.dropped_rate.load(Ordering::Relaxed)
    }

    pub fn dropped_queue(&self) -> u64 {
        self.dropped_queue.load(Ordering::Relaxed)
    }

    /// Messages currently waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        let out = self.out.lock();
        match out.as_ref() {
            Some(tx) => self.queue_capacity.saturating_sub(tx.capacity()),
            None => 0,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Filter, rate-limit, transform and enqueue one record. Called from a
    /// hub dispatch task; never blocks and never fails.
    pub fn offer(&self, entry: &RawLogEntry) {
        if self.state() != SessionState::Open {
            return;
        }

        let filter = self.filter.read();
        if !filter.matches(entry) {
            return;
        }

        if filter.subscription().max_rate > 0 {
            let mut limiter = self.limiter.lock();
            if let Some(bucket) = limiter.as_mut() {
                if !bucket.allow(self.now_ms()) {
                    self.dropped_rate.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_session_drop("rate");
                    return;
                }
            }
        }

        let message = transform(entry, &filter);

        if filter.subscription().batch_timeout_ms > 0 {
            self.batch.lock().push(message);
        } else {
            drop(filter);
            self.send_frame(&ServerFrame::Log(message));
        }
    }

    /// Serialize a frame and push it onto the outbound queue, dropping on
    /// overflow.
    pub fn send_frame(&self, frame: &ServerFrame) {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                debug!(session = self.id, error = %e, "failed to serialize frame");
                return;
            }
        };

        let out = self.out.lock();
        let Some(tx) = out.as_ref() else {
            return;
        };
        if tx.try_send(text).is_err() {
            self.dropped_queue.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_session_drop("queue");
            debug!(session = self.id, "outbound queue full, dropping message");
        }
    }

    /// Swap out the batch buffer and enqueue it as one `batch` frame.
    pub fn flush_batch(&self) {
        let pending = std::mem::take(&mut *self.batch.lock());
        if pending.is_empty() {
            return;
        }

        self.send_frame(&ServerFrame::Batch(BatchMessage {
            count: pending.len(),
            messages: pending,
        }));
    }

    fn spawn_batch_flusher(self: &Arc<Self>, timeout_ms: u64) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(timeout_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                if session.state() != SessionState::Open {
                    break;
                }
                session.flush_batch();
            }
        })
    }

    /// Replace the compiled filter, limiter and batch window. On a compile
    /// failure the previous filter stays in effect.
    pub fn update_subscription(
        self: &Arc<Self>,
        subscription: ClientSubscription,
    ) -> Result<(), FilterError> {
        let filter = SubscriptionFilter::compile(subscription)?;
        let max_rate = filter.subscription().max_rate;
        let batch_timeout_ms = filter.subscription().batch_timeout_ms;

        *self.filter.write() = filter;
        *self.limiter.lock() = (max_rate > 0).then(|| TokenBucket::per_second(max_rate));

        let mut task = self.batch_task.lock();
        if let Some(handle) = task.take() {
            handle.abort();
        }
        // Whatever accumulated under the old window still goes out.
        self.flush_batch();
        if batch_timeout_ms > 0 {
            *task = Some(self.spawn_batch_flusher(batch_timeout_ms));
        }

        Ok(())
    }

    /// Close the outbound queue. The write pump drains what is already
    /// queued and then exits. Idempotent; only the first caller transitions
    /// the state.
    pub fn begin_drain(&self) {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            if let Some(handle) = self.batch_task.lock().take() {
                handle.abort();
            }
            *self.out.lock() = None;
        }
    }

    /// Terminal state, entered by the write pump once the queue is empty.
    pub fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

fn transform(entry: &RawLogEntry, filter: &SubscriptionFilter) -> LogMessage {
    LogMessage {
        timestamp: format_rfc3339(entry.timestamp),
        host: entry.host.clone(),
        logger: entry.logger.clone(),
        level: entry.level.clone(),
        message: entry.message.clone(),
        stack_trace: filter.reduce_stack_trace(&entry.stack_trace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(level: &str, message: &str) -> RawLogEntry {
        RawLogEntry {
            timestamp: Utc::now(),
            host: "h1".into(),
            logger: "app.A".into(),
            level: level.into(),
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    fn decode(text: &str) -> ServerFrame {
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn offers_matching_records_as_log_frames() {
        let (session, mut rx) = Session::new(1, 16);

        session.offer(&entry("INFO", "hello"));
        session.offer(&entry("TRACE", "too low"));

        let frame = decode(&rx.try_recv().unwrap());
        match frame {
            ServerFrame::Log(msg) => assert_eq!(msg.message, "hello"),
            other => panic!("expected log frame, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rate_limit_allows_burst_then_drops() {
        let (session, mut rx) = Session::new(1, 64);
        session
            .update_subscription(ClientSubscription {
                max_rate: 5,
                ..ClientSubscription::default()
            })
            .unwrap();

        for _ in 0..20 {
            session.offer(&entry("INFO", "m"));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert_eq!(session.dropped_rate(), 15);
    }

    #[tokio::test]
    async fn queue_overflow_drops_and_counts() {
        let (session, mut rx) = Session::new(1, 2);

        for _ in 0..5 {
            session.offer(&entry("INFO", "m"));
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(session.dropped_queue(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batching_collects_offers_into_one_frame() {
        let (session, mut rx) = Session::new(1, 16);
        session
            .update_subscription(ClientSubscription {
                batch_timeout_ms: 50,
                ..ClientSubscription::default()
            })
            .unwrap();

        session.offer(&entry("INFO", "a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.offer(&entry("INFO", "b"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.offer(&entry("INFO", "c"));

        // Nothing leaves before the window fires.
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let frame = decode(&rx.try_recv().unwrap());
        match frame {
            ServerFrame::Batch(batch) => {
                assert_eq!(batch.count, 3);
                let bodies: Vec<&str> =
                    batch.messages.iter().map(|m| m.message.as_str()).collect();
                assert_eq!(bodies, vec!["a", "b", "c"]);
            }
            other => panic!("expected batch frame, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_subscription_update_keeps_prior_filter() {
        let (session, mut rx) = Session::new(1, 16);
        session
            .update_subscription(ClientSubscription {
                levels: vec!["ERROR".into()],
                ..ClientSubscription::default()
            })
            .unwrap();

        let err = session.update_subscription(ClientSubscription {
            message_regex: "(broken".into(),
            ..ClientSubscription::default()
        });
        assert!(err.is_err());

        // Still the ERROR-only filter.
        session.offer(&entry("INFO", "nope"));
        session.offer(&entry("ERROR", "yes"));
        let frame = decode(&rx.try_recv().unwrap());
        match frame {
            ServerFrame::Log(msg) => assert_eq!(msg.message, "yes"),
            other => panic!("expected log frame, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drain_closes_queue_after_pending_messages() {
        let (session, mut rx) = Session::new(1, 16);
        session.offer(&entry("INFO", "queued before drain"));

        session.begin_drain();
        assert_eq!(session.state(), SessionState::Draining);

        // Offers after drain are ignored.
        session.offer(&entry("INFO", "late"));

        // The queued message is still delivered, then the channel closes.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn drain_is_idempotent() {
        let (session, _rx) = Session::new(1, 16);
        session.begin_drain();
        session.begin_drain();
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn stack_trace_is_reduced_on_transform() {
        let (session, mut rx) = Session::new(1, 16);

        let mut e = entry("ERROR", "boom");
        e.stack_trace = "at a.b.C.m(C.java:1)\nat x.y.Z.n(Z.java:2)".into();
        session.offer(&e);

        let frame = decode(&rx.try_recv().unwrap());
        match frame {
            ServerFrame::Log(msg) => {
                let trace = msg.stack_trace.expect("reduced trace present");
                let json = serde_json::to_value(&trace).unwrap();
                assert_eq!(json["frame_count"], 2);
                assert_eq!(json["first_line"], "at a.b.C.m(C.java:1)");
            }
            other => panic!("expected log frame, got {other:?}"),
        }
    }
}
