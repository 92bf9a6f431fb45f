// Time-keyed, bounded, single-subscriber log of lobby updates.
//
// Pushes and deliveries are serialized under one async mutex: catch-up
// replay finishes before any live push is delivered, and no eviction can run
// while a delivery is in flight.

use crate::domain::battle::BattleId;
use crate::domain::events::LobbyUpdate;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

/// One buffered lobby update with its assigned timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    /// Microseconds since the unix epoch; strictly monotonic within the
    /// process.
    pub time_us: u64,
    pub battle_id: BattleId,
    pub update: LobbyUpdate,
}

/// Delivery callback. Must not fail; a panicking subscriber takes the
/// process down with it.
pub type UpdateSink = Box<dyn FnMut(BufferedEvent) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, PartialEq, Eq)]
pub enum BufferError {
    /// A subscriber is already installed.
    CallbackAlreadySet,
    /// The requested catch-up point has already been evicted.
    TooFarInThePast,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::CallbackAlreadySet => f.write_str("callback_already_set"),
            BufferError::TooFarInThePast => f.write_str("too_far_in_the_past"),
        }
    }
}

/// Wall-clock-anchored monotonic microsecond source.
///
/// The public `since` contract is in wall-clock microseconds, but wall time
/// can step backwards; anchoring once at startup and counting with the
/// monotonic clock keeps assigned timestamps increasing.
#[derive(Debug, Clone)]
struct MicroClock {
    anchor_us: u64,
    started: Instant,
}

impl MicroClock {
    fn new() -> Self {
        let anchor_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self {
            anchor_us,
            started: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.anchor_us + self.started.elapsed().as_micros() as u64
    }
}

struct BufferInner {
    events: VecDeque<BufferedEvent>,
    sink: Option<UpdateSink>,
    last_time_us: u64,
    last_eviction: Instant,
}

/// Bounded, time-ordered event log with catch-up subscription.
pub struct EventsBuffer {
    max_age: Duration,
    dropping_frequency: Duration,
    clock: MicroClock,
    inner: Mutex<BufferInner>,
}

impl EventsBuffer {
    pub fn new(max_age: Duration) -> Self {
        // Amortize eviction cost instead of scanning on every push.
        Self::with_dropping_frequency(max_age, max_age / 10)
    }

    pub fn with_dropping_frequency(max_age: Duration, dropping_frequency: Duration) -> Self {
        Self {
            max_age,
            dropping_frequency,
            clock: MicroClock::new(),
            inner: Mutex::new(BufferInner {
                events: VecDeque::new(),
                sink: None,
                last_time_us: 0,
                last_eviction: Instant::now(),
            }),
        }
    }

    /// Current time in the buffer's public timebase.
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Append an update, assign it a strictly monotonic timestamp, and
    /// deliver it to the subscriber if one is attached. Returns the
    /// assigned timestamp.
    pub async fn push(&self, battle_id: BattleId, update: LobbyUpdate) -> u64 {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now_us();
        let time_us = now.max(inner.last_time_us + 1);
        inner.last_time_us = time_us;

        if inner.last_eviction.elapsed() >= self.dropping_frequency {
            let cutoff = now.saturating_sub(self.max_age.as_micros() as u64);
            while inner
                .events
                .front()
                .is_some_and(|event| event.time_us < cutoff)
            {
                inner.events.pop_front();
            }
            inner.last_eviction = Instant::now();
        }

        let event = BufferedEvent {
            time_us,
            battle_id,
            update,
        };
        inner.events.push_back(event.clone());

        // Await the subscriber before accepting further pushes: slow
        // consumers back-pressure the producer instead of losing events.
        if let Some(sink) = inner.sink.as_mut() {
            sink(event).await;
        }
        time_us
    }

    /// Replay every stored event with `time_us > since_us`, then keep
    /// delivering future pushes to `sink`.
    pub async fn subscribe(&self, since_us: u64, mut sink: UpdateSink) -> Result<(), BufferError> {
        let mut inner = self.inner.lock().await;
        if inner.sink.is_some() {
            return Err(BufferError::CallbackAlreadySet);
        }
        let cutoff = self
            .clock
            .now_us()
            .saturating_sub(self.max_age.as_micros() as u64);
        if since_us < cutoff {
            return Err(BufferError::TooFarInThePast);
        }

        let backlog: Vec<BufferedEvent> = inner
            .events
            .iter()
            .filter(|event| event.time_us > since_us)
            .cloned()
            .collect();
        debug!(since_us, backlog = backlog.len(), "updates subscription attached");
        for event in backlog {
            sink(event).await;
        }
        inner.sink = Some(sink);
        Ok(())
    }

    /// Detach the subscriber; no further deliveries happen.
    pub async fn unsubscribe(&self) {
        let mut inner = self.inner.lock().await;
        if inner.sink.take().is_some() {
            debug!("updates subscription detached");
        }
    }

    #[cfg(test)]
    pub(crate) async fn stored_len(&self) -> usize {
        self.inner.lock().await.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::LobbyUpdate;
    use std::sync::{Arc, Mutex as StdMutex};

    fn update(text: &str) -> LobbyUpdate {
        LobbyUpdate::EngineMessage {
            message: text.to_string(),
        }
    }

    fn recording_sink() -> (UpdateSink, Arc<StdMutex<Vec<BufferedEvent>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_in_sink = seen.clone();
        let sink: UpdateSink = Box::new(move |event| {
            let seen = seen_in_sink.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(event);
            })
        });
        (sink, seen)
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing() {
        let buffer = EventsBuffer::new(Duration::from_secs(600));
        let id = BattleId::from("b1");
        let mut last = 0;
        for n in 0..50 {
            let ts = buffer.push(id.clone(), update(&format!("m{n}"))).await;
            assert!(ts > last, "timestamp {ts} not after {last}");
            last = ts;
        }
    }

    #[tokio::test]
    async fn subscribe_replays_only_events_after_since() {
        let buffer = EventsBuffer::new(Duration::from_secs(600));
        let id = BattleId::from("b1");
        let t_a = buffer.push(id.clone(), update("A")).await;
        let t_b = buffer.push(id.clone(), update("B")).await;
        assert!(t_a < t_b);

        let since = t_a; // strictly-greater comparison excludes A itself
        let (sink, seen) = recording_sink();
        buffer.subscribe(since, sink).await.unwrap();
        let t_c = buffer.push(id.clone(), update("C")).await;

        let seen = seen.lock().unwrap();
        let times: Vec<u64> = seen.iter().map(|event| event.time_us).collect();
        assert_eq!(times, vec![t_b, t_c]);
        assert_eq!(seen[0].update, update("B"));
    }

    #[tokio::test]
    async fn second_subscribe_fails_while_first_active() {
        let buffer = EventsBuffer::new(Duration::from_secs(600));
        let (first, _) = recording_sink();
        buffer.subscribe(buffer.now_us(), first).await.unwrap();

        let (second, _) = recording_sink();
        assert_eq!(
            buffer.subscribe(buffer.now_us(), second).await,
            Err(BufferError::CallbackAlreadySet)
        );

        buffer.unsubscribe().await;
        let (third, _) = recording_sink();
        buffer.subscribe(buffer.now_us(), third).await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_too_far_in_the_past_fails() {
        let buffer = EventsBuffer::new(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let (sink, _) = recording_sink();
        assert_eq!(
            buffer.subscribe(0, sink).await,
            Err(BufferError::TooFarInThePast)
        );
    }

    #[tokio::test]
    async fn old_events_are_evicted_after_max_age() {
        let buffer =
            EventsBuffer::with_dropping_frequency(Duration::from_millis(40), Duration::ZERO);
        let id = BattleId::from("b1");
        buffer.push(id.clone(), update("old")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        // The push both evicts the expired event and appends the new one.
        buffer.push(id.clone(), update("new")).await;
        assert_eq!(buffer.stored_len().await, 1);
    }

    #[tokio::test]
    async fn eviction_is_rate_limited() {
        let buffer = EventsBuffer::with_dropping_frequency(
            Duration::from_millis(40),
            Duration::from_secs(3600),
        );
        let id = BattleId::from("b1");
        buffer.push(id.clone(), update("old")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        // The eviction interval has not elapsed, so the stale event stays.
        buffer.push(id.clone(), update("new")).await;
        assert_eq!(buffer.stored_len().await, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_deliveries() {
        let buffer = EventsBuffer::new(Duration::from_secs(600));
        let id = BattleId::from("b1");
        let (sink, seen) = recording_sink();
        buffer.subscribe(buffer.now_us(), sink).await.unwrap();
        buffer.push(id.clone(), update("one")).await;
        buffer.unsubscribe().await;
        buffer.push(id.clone(), update("two")).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
