//! Time-bucketed aggregation for windowed operators.
//!
//! Events are grouped into buckets by flooring their event time to the
//! bucket size. A bucket is finalized when it has gone quiet for longer than
//! the idle timeout, or has been open for longer than the hard timeout,
//! whichever comes first. Eviction runs when a watermark is ingested; the
//! ticker loop injects one every tick.
//!
//! Acknowledgment tokens of absorbed events are retained with their bucket
//! and handed to the bucket's outputs, so upstream sees an event as
//! processed only once its aggregate has been processed downstream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use athena_types::{Ack, Event};

use crate::ack::AckBarrier;
use crate::component::{Emit, EmitNext};

/// Folds events of one bucket into aggregate output events.
pub trait Accumulator: Send + 'static {
    fn add(&mut self, event: &Event);

    /// Produce the bucket's outputs. `id` is unique per finalized bucket.
    fn finish(self, id: &str, bucket: DateTime<Utc>) -> Vec<Event>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    pub bucket: Duration,
    pub idle_timeout: Duration,
    pub hard_timeout: Duration,
    pub tick: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            hard_timeout: Duration::from_secs(300),
            tick: Duration::from_secs(10),
        }
    }
}

struct Bucket<A> {
    acc: A,
    acks: Vec<Ack>,
    first_write: Instant,
    last_write: Instant,
}

struct WindowState<A> {
    buckets: HashMap<i64, Bucket<A>>,
    sequence: u64,
}

type AccumulatorFactory<A> = Box<dyn Fn(DateTime<Utc>) -> A + Send + Sync>;

pub struct WindowedAggregator<A: Accumulator> {
    config: WindowConfig,
    bucket_ms: i64,
    new_accumulator: AccumulatorFactory<A>,
    state: Mutex<WindowState<A>>,
}

impl<A: Accumulator> WindowedAggregator<A> {
    pub fn new(
        config: WindowConfig,
        new_accumulator: impl Fn(DateTime<Utc>) -> A + Send + Sync + 'static,
    ) -> Self {
        let bucket_ms = i64::try_from(config.bucket.as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        Self {
            config,
            bucket_ms,
            new_accumulator: Box::new(new_accumulator),
            state: Mutex::new(WindowState {
                buckets: HashMap::new(),
                sequence: 0,
            }),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState<A>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bucket_key(&self, time: DateTime<Utc>) -> i64 {
        time.timestamp_millis().div_euclid(self.bucket_ms) * self.bucket_ms
    }

    /// Start of the bucket `time` falls into.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        key_to_time(self.bucket_key(time))
    }

    pub fn add(&self, event: Event) {
        self.add_at(event, Instant::now());
    }

    /// Fold `event` into its bucket as if observed at `now`.
    pub fn add_at(&self, mut event: Event, now: Instant) {
        let key = self.bucket_key(event.time);
        let ack = event.take_ack();
        let mut state = self.lock();
        let bucket = state.buckets.entry(key).or_insert_with(|| Bucket {
            acc: (self.new_accumulator)(key_to_time(key)),
            acks: Vec::new(),
            first_write: now,
            last_write: now,
        });
        bucket.acc.add(&event);
        bucket.last_write = now;
        bucket.acks.extend(ack);
    }

    pub fn evict(&self) -> Vec<Event> {
        self.evict_at(Instant::now())
    }

    /// Finalize every bucket past its idle or hard timeout at `now`.
    pub fn evict_at(&self, now: Instant) -> Vec<Event> {
        let idle = self.config.idle_timeout;
        let hard = self.config.hard_timeout;
        let mut state = self.lock();
        let mut expired: Vec<i64> = state
            .buckets
            .iter()
            .filter(|(_, b)| now > b.last_write + idle || now > b.first_write + hard)
            .map(|(key, _)| *key)
            .collect();
        expired.sort_unstable();
        finalize(&mut state, &expired)
    }

    /// Finalize every open bucket regardless of age.
    pub fn flush_all(&self) -> Vec<Event> {
        let mut state = self.lock();
        let mut keys: Vec<i64> = state.buckets.keys().copied().collect();
        keys.sort_unstable();
        finalize(&mut state, &keys)
    }

    /// Start times of the open buckets, oldest first.
    pub fn open_buckets(&self) -> Vec<DateTime<Utc>> {
        let mut keys: Vec<i64> = self.lock().buckets.keys().copied().collect();
        keys.sort_unstable();
        keys.into_iter().map(key_to_time).collect()
    }

    /// Route one ingress event: watermarks trigger eviction, everything else
    /// is absorbed.
    pub async fn ingest(&self, event: Event, next: &EmitNext) {
        if event.is_watermark() {
            for out in self.evict() {
                next.emit(out).await;
            }
        } else {
            self.add(event);
        }
    }

    /// Inject a watermark every tick until `cancel` fires.
    pub async fn run_ticker(&self, next: EmitNext, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.ingest(Event::watermark(), &next).await,
            }
        }
    }
}

fn key_to_time(key: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(key).unwrap_or_default()
}

fn finalize<A: Accumulator>(state: &mut WindowState<A>, keys: &[i64]) -> Vec<Event> {
    let mut outputs = Vec::new();
    for key in keys {
        let Some(bucket) = state.buckets.remove(key) else {
            continue;
        };
        state.sequence += 1;
        let start = key_to_time(*key);
        let id = format!("{}-{}", start.format("%Y%m%d%H%M%S"), state.sequence);
        let mut produced = bucket.acc.finish(&id, start);
        debug!(bucket = %id, outputs = produced.len(), absorbed = bucket.acks.len(), "Bucket finalized");

        if !bucket.acks.is_empty() {
            let members = AckBarrier::split(Ack::all(bucket.acks), produced.len());
            for (event, ack) in produced.iter_mut().zip(members) {
                event.set_ack(Some(ack));
            }
        }
        outputs.extend(produced);
    }
    outputs
}
