//! Traffic State Tracker
//!
//! Per-source sliding windows of request timestamps, byte volume and recent
//! client signatures. Each source's window sits behind its own lock inside a
//! sharded map, so a hot source never serializes unrelated ones.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{RequestMeta, SourceKey};

/// Signature-length variance is divided by this before capping
const SIGNATURE_VARIANCE_SCALE: f64 = 100.0;
/// Upper bound of the signature variability score
const SIGNATURE_VARIANCE_CAP: f64 = 10.0;

/// Per-source aggregate. Only the tracker mutates it.
#[derive(Debug)]
struct TrafficWindow {
    /// In-window events, oldest first: (arrival, bytes)
    events: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
    total_requests: u64,
    total_bytes: u64,
    signatures: VecDeque<String>,
    last_update: Instant,
    /// Set by the sweep under this window's lock just before removal
    retired: bool,
}

impl TrafficWindow {
    fn new(now: Instant) -> Self {
        Self {
            events: VecDeque::new(),
            bytes_in_window: 0,
            total_requests: 0,
            total_bytes: 0,
            signatures: VecDeque::new(),
            last_update: now,
            retired: false,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, bytes)) = self.events.front() {
            if now.saturating_duration_since(at) >= window {
                self.events.pop_front();
                self.bytes_in_window = self.bytes_in_window.saturating_sub(bytes);
            } else {
                break;
            }
        }
    }

    fn record_signature(&mut self, signature: &str, cap: usize) {
        self.signatures.push_back(signature.to_string());
        while self.signatures.len() > cap {
            self.signatures.pop_front();
        }
    }

    fn signature_variance(&self) -> f64 {
        if self.signatures.len() < 2 {
            return 0.0;
        }
        let n = self.signatures.len() as f64;
        let lengths: Vec<f64> = self.signatures.iter().map(|s| s.len() as f64).collect();
        let mean = lengths.iter().sum::<f64>() / n;
        let variance = lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
        let score = (variance / SIGNATURE_VARIANCE_SCALE).min(SIGNATURE_VARIANCE_CAP);
        if score.is_finite() {
            score
        } else {
            0.0
        }
    }

    /// An empty window was just inserted by an observe and is about to be filled
    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.total_requests > 0 && now.saturating_duration_since(self.last_update) > window
    }
}

/// Point-in-time view of one source's window, taken right after an update.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSnapshot {
    /// Requests within the window, including the current one
    pub request_count: u64,
    /// Bytes within the window, including the current request
    pub bytes_in_window: u64,
    pub total_requests: u64,
    pub total_bytes: u64,
    /// Signature variability score in [0, 10]
    pub signature_variance: f64,
    /// Time between the oldest in-window event and the current one
    pub window_span: Duration,
    /// Time since the previous request from this source
    pub since_previous: Option<Duration>,
}

impl WindowSnapshot {
    /// Snapshot for a source seen for the first time
    pub fn first(bytes: u64) -> Self {
        Self {
            request_count: 1,
            bytes_in_window: bytes,
            total_requests: 1,
            total_bytes: bytes,
            signature_variance: 0.0,
            window_span: Duration::ZERO,
            since_previous: None,
        }
    }
}

/// Concurrent per-source window store
#[derive(Debug)]
pub struct TrafficTracker {
    windows: DashMap<SourceKey, Arc<Mutex<TrafficWindow>>>,
    window: Duration,
    signature_cap: usize,
}

impl TrafficTracker {
    pub fn new(window: Duration, signature_cap: usize) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            signature_cap: signature_cap.max(1),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count a request from `key` at the current instant
    pub fn observe(&self, key: SourceKey, request: &RequestMeta) -> WindowSnapshot {
        self.observe_at(key, request.wire_size(), request.user_agent(), Instant::now())
    }

    /// Count a request from `key` at `now`
    pub fn observe_at(
        &self,
        key: SourceKey,
        bytes: u64,
        signature: &str,
        now: Instant,
    ) -> WindowSnapshot {
        loop {
            // The map guard is released at the end of this statement; only the
            // per-source lock is held while updating.
            let slot = self
                .windows
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(TrafficWindow::new(now))))
                .value()
                .clone();

            let mut window = slot.lock();
            if window.retired {
                // Lost a race with the sweep; the entry is gone, create a fresh one.
                drop(window);
                continue;
            }

            // Concurrent callers may carry slightly older instants.
            let now = now.max(window.last_update);
            let since_previous = if window.total_requests > 0 {
                Some(now.saturating_duration_since(window.last_update))
            } else {
                None
            };

            window.prune(now, self.window);
            window.events.push_back((now, bytes));
            window.bytes_in_window = window.bytes_in_window.saturating_add(bytes);
            window.total_requests += 1;
            window.total_bytes = window.total_bytes.saturating_add(bytes);
            window.record_signature(signature, self.signature_cap);
            window.last_update = now;

            let window_span = window
                .events
                .front()
                .map(|&(oldest, _)| now.saturating_duration_since(oldest))
                .unwrap_or_default();

            return WindowSnapshot {
                request_count: window.events.len() as u64,
                bytes_in_window: window.bytes_in_window,
                total_requests: window.total_requests,
                total_bytes: window.total_bytes,
                signature_variance: window.signature_variance(),
                window_span,
                since_previous,
            };
        }
    }

    /// Current in-window count for `key` without recording a request
    pub fn in_window_count(&self, key: &SourceKey) -> u64 {
        self.in_window_count_at(key, Instant::now())
    }

    pub fn in_window_count_at(&self, key: &SourceKey, now: Instant) -> u64 {
        let Some(slot) = self.windows.get(key).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let window = slot.lock();
        window
            .events
            .iter()
            .filter(|&&(at, _)| now.saturating_duration_since(at) < self.window)
            .count() as u64
    }

    pub fn tracked_sources(&self) -> usize {
        self.windows.len()
    }

    /// Remove windows idle for longer than the window duration
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        // Counted in the closure; concurrent inserts make map lengths unreliable.
        let mut evicted = 0;
        self.windows.retain(|_, slot| {
            // A window locked by an in-flight observe is by definition active.
            match slot.try_lock() {
                Some(mut window) => {
                    if window.is_idle(now, self.window) {
                        window.retired = true;
                        evicted += 1;
                        false
                    } else {
                        true
                    }
                }
                None => true,
            }
        });
        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.windows.len(),
                "Swept idle traffic windows"
            );
        }
        evicted
    }

    /// Run the sweep every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            info!(?interval, "Starting traffic window sweeper");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Traffic window sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        tracker.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> SourceKey {
        SourceKey::parse(raw).unwrap()
    }

    #[test]
    fn test_first_request_creates_window() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 10);
        let snapshot = tracker.observe_at(key("10.0.0.1"), 120, "Mozilla/5.0", Instant::now());

        assert_eq!(snapshot, WindowSnapshot::first(120));
        assert_eq!(tracker.tracked_sources(), 1);
    }

    #[test]
    fn test_window_expires_old_requests() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 10);
        let source = key("10.0.0.2");
        let start = Instant::now();

        for i in 0..61 {
            let at = start + Duration::from_millis(i * 100);
            tracker.observe_at(source, 10, "ua", at);
        }
        assert_eq!(tracker.in_window_count_at(&source, start + Duration::from_secs(7)), 61);

        let later = start + Duration::from_millis(6_000) + Duration::from_secs(61);
        let snapshot = tracker.observe_at(source, 10, "ua", later);
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.bytes_in_window, 10);
        assert_eq!(snapshot.total_requests, 62);
    }

    #[test]
    fn test_partial_expiry() {
        let tracker = TrafficTracker::new(Duration::from_secs(10), 10);
        let source = key("10.0.0.3");
        let start = Instant::now();

        tracker.observe_at(source, 5, "ua", start);
        tracker.observe_at(source, 5, "ua", start + Duration::from_secs(5));
        let snapshot = tracker.observe_at(source, 5, "ua", start + Duration::from_secs(12));

        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.bytes_in_window, 10);
        assert_eq!(snapshot.window_span, Duration::from_secs(7));
        assert_eq!(snapshot.since_previous, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_sources_are_independent() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 10);
        let now = Instant::now();

        for _ in 0..5 {
            tracker.observe_at(key("10.0.0.1"), 1, "a", now);
        }
        let other = tracker.observe_at(key("10.0.0.2"), 1, "a", now);

        assert_eq!(other.request_count, 1);
        assert_eq!(tracker.in_window_count_at(&key("10.0.0.1"), now), 5);
    }

    #[test]
    fn test_signature_history_is_bounded() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 3);
        let source = key("10.0.0.4");
        let now = Instant::now();

        // Wildly different lengths first, then three identical ones push them out.
        tracker.observe_at(source, 0, "", now);
        tracker.observe_at(source, 0, &"x".repeat(400), now);
        let noisy = tracker.observe_at(source, 0, "abc", now);
        assert!(noisy.signature_variance > 0.0);

        tracker.observe_at(source, 0, "abc", now);
        tracker.observe_at(source, 0, "abc", now);
        let settled = tracker.observe_at(source, 0, "abc", now);
        assert_eq!(settled.signature_variance, 0.0);
    }

    #[test]
    fn test_signature_variance_capped() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 10);
        let source = key("10.0.0.5");
        let now = Instant::now();

        tracker.observe_at(source, 0, "", now);
        let snapshot = tracker.observe_at(source, 0, &"x".repeat(10_000), now);
        assert_eq!(snapshot.signature_variance, SIGNATURE_VARIANCE_CAP);
    }

    #[test]
    fn test_sweep_evicts_only_idle_windows() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 10);
        let start = Instant::now();

        tracker.observe_at(key("10.0.0.1"), 1, "a", start);
        tracker.observe_at(key("10.0.0.2"), 1, "a", start + Duration::from_secs(30));

        let evicted = tracker.sweep_at(start + Duration::from_secs(61));
        assert_eq!(evicted, 1);
        assert_eq!(tracker.tracked_sources(), 1);
        assert_eq!(
            tracker.in_window_count_at(&key("10.0.0.2"), start + Duration::from_secs(61)),
            1
        );
    }

    #[test]
    fn test_observe_after_sweep_starts_fresh() {
        let tracker = TrafficTracker::new(Duration::from_secs(60), 10);
        let source = key("10.0.0.9");
        let start = Instant::now();

        tracker.observe_at(source, 1, "a", start);
        tracker.sweep_at(start + Duration::from_secs(120));
        assert_eq!(tracker.tracked_sources(), 0);

        let snapshot = tracker.observe_at(source, 1, "a", start + Duration::from_secs(121));
        assert_eq!(snapshot.total_requests, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_racing_observers_loses_nothing() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        const OBSERVERS: usize = 4;
        const PER_OBSERVER: usize = 2_000;

        let tracker = Arc::new(TrafficTracker::new(Duration::from_secs(60), 10));
        let source = key("10.9.9.9");
        let stop = Arc::new(AtomicBool::new(false));
        let evicted = Arc::new(AtomicUsize::new(0));

        // Sweeping far in the future treats every unlocked window as idle.
        let sweeper = {
            let tracker = tracker.clone();
            let stop = stop.clone();
            let evicted = evicted.clone();
            tokio::task::spawn_blocking(move || {
                while !stop.load(Ordering::Relaxed) {
                    let n = tracker.sweep_at(Instant::now() + Duration::from_secs(3600));
                    evicted.fetch_add(n, Ordering::Relaxed);
                }
            })
        };

        let observers: Vec<_> = (0..OBSERVERS)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::task::spawn_blocking(move || {
                    (0..PER_OBSERVER)
                        .map(|_| tracker.observe_at(source, 1, "ua", Instant::now()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut snapshots = Vec::new();
        for observer in observers {
            snapshots.extend(observer.await.unwrap());
        }
        stop.store(true, Ordering::Relaxed);
        sweeper.await.unwrap();

        assert_eq!(snapshots.len(), OBSERVERS * PER_OBSERVER);
        for snapshot in &snapshots {
            assert!(snapshot.request_count >= 1);
            assert_eq!(snapshot.request_count, snapshot.total_requests);
            assert_eq!(snapshot.bytes_in_window, snapshot.request_count);
            assert_eq!(snapshot.total_bytes, snapshot.total_requests);
        }

        // Each window instance yields totals 1..=k exactly once, so the
        // histogram of totals never increases and its first bucket counts
        // every window ever created.
        let max = snapshots.iter().map(|s| s.total_requests).max().unwrap() as usize;
        let mut histogram = vec![0usize; max + 1];
        for snapshot in &snapshots {
            histogram[snapshot.total_requests as usize] += 1;
        }
        assert!(histogram[1..].windows(2).all(|pair| pair[0] >= pair[1]));
        assert_eq!(
            histogram[1],
            evicted.load(Ordering::Relaxed) + tracker.tracked_sources()
        );
        assert!(tracker.tracked_sources() <= 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let tracker = Arc::new(TrafficTracker::new(Duration::from_secs(60), 10));
        let cancel = CancellationToken::new();
        let handle = tracker.spawn_sweeper(Duration::from_millis(10), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
