//! In-process metrics
//!
//! Plain integer counters use atomic adds. Float counters (cost, savings)
//! store the IEEE-754 bit pattern in an atomic u64 and update through a
//! compare-and-swap loop. Labeled collections sit behind a read-write lock
//! with per-entry atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Monotonic integer counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Counter(AtomicU64::new(0))
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lock-free float accumulator backed by an atomic bit pattern.
#[derive(Debug)]
pub struct FloatCounter(AtomicU64);

impl Default for FloatCounter {
    fn default() -> Self {
        FloatCounter(AtomicU64::new(0f64.to_bits()))
    }
}

impl FloatCounter {
    pub fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Gauge with set semantics.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter collection keyed by a label value (provider, model, …).
#[derive(Debug, Default)]
pub struct LabeledCounter {
    entries: RwLock<HashMap<String, Arc<Counter>>>,
}

impl LabeledCounter {
    pub fn with_label(&self, label: &str) -> Arc<Counter> {
        if let Some(counter) = self.entries.read().expect("metrics lock").get(label) {
            return counter.clone();
        }
        let mut entries = self.entries.write().expect("metrics lock");
        entries
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    pub fn add(&self, label: &str, n: u64) {
        self.with_label(label).add(n);
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.entries
            .read()
            .expect("metrics lock")
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect()
    }
}

/// Fixed-bucket latency histogram in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<u64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Histogram {
            bounds,
            buckets,
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe_ms(&self, ms: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Process-wide proxy metrics.
pub struct Metrics {
    pub requests_total: LabeledCounter,
    pub requests_failed: LabeledCounter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub tokens_in: Counter,
    pub tokens_out: Counter,
    pub tokens_saved: Counter,
    pub cost_usd: FloatCounter,
    pub savings_usd: FloatCounter,
    pub stream_sessions_active: Gauge,
    pub request_latency: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            requests_total: LabeledCounter::default(),
            requests_failed: LabeledCounter::default(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            tokens_in: Counter::new(),
            tokens_out: Counter::new(),
            tokens_saved: Counter::new(),
            cost_usd: FloatCounter::default(),
            savings_usd: FloatCounter::default(),
            stream_sessions_active: Gauge::default(),
            request_latency: Histogram::new(vec![10, 50, 100, 250, 500, 1000, 2500, 5000, 15000]),
        }
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

/// Global metrics handle.
pub fn global() -> &'static Metrics {
    &METRICS
}
