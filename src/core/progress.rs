use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Logical phase of a pair comparison that reports progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ComparePhase {
    /// Removing units shared with the exclusion document.
    Exclusion,
    /// Cross comparison of text units.
    Text,
    /// Perceptual image comparison.
    Image,
    /// One whole pair finished; `done/total` counts pairs of the run.
    Pair,
}

/// Progress event sent to subscribers, keyed by pair id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareProgress {
    pub pair_id: Uuid,
    pub phase: ComparePhase,
    pub fraction: f64,
    pub label: String,
}

pub type ProgressSender = mpsc::UnboundedSender<CompareProgress>;

pub type ProgressCallback = Box<dyn FnMut(f64, &str) + Send>;

/// Counts completed tasks and reports `(fraction, "done/total")`.
///
/// Reports are throttled to one per interval (one second by default); the
/// report for the last task is always delivered. A tracker with a total of
/// zero reports completion immediately.
pub struct ProgressTracker {
    total: usize,
    done: usize,
    interval: Duration,
    last_report: Option<Instant>,
    callback: ProgressCallback,
}

impl ProgressTracker {
    pub fn new(total: usize, callback: impl FnMut(f64, &str) + Send + 'static) -> Self {
        Self::with_interval(total, Duration::from_secs(1), callback)
    }

    pub fn with_interval(
        total: usize,
        interval: Duration,
        callback: impl FnMut(f64, &str) + Send + 'static,
    ) -> Self {
        let mut tracker = Self {
            total,
            done: 0,
            interval,
            last_report: None,
            callback: Box::new(callback),
        };
        if total == 0 {
            tracker.report(1.0);
        }
        tracker
    }

    /// A tracker that reports nowhere.
    pub fn silent(total: usize) -> Self {
        Self::new(total, |_, _| {})
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn done(&self) -> usize {
        self.done
    }

    /// Record one finished task.
    pub fn tick(&mut self) {
        self.done += 1;
        if self.total == 0 {
            return;
        }

        let fraction = (self.done as f64 / self.total as f64).min(1.0);
        if self.done == self.total {
            self.report(fraction);
            return;
        }

        let due = self
            .last_report
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.report(fraction);
        }
    }

    fn report(&mut self, fraction: f64) {
        self.last_report = Some(Instant::now());
        let label = format!("{}/{}", self.done, self.total);
        let callback = &mut self.callback;

        // A misbehaving subscriber must not take the comparison down with it.
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(fraction, &label);
        })) {
            log::warn!("Progress callback panicked: {:?}", e);
        }
    }
}

/// Progress scope for one comparison pair.
#[derive(Debug, Clone)]
pub struct PairProgress {
    pair_id: Uuid,
    sender: Option<ProgressSender>,
}

impl PairProgress {
    pub fn new(pair_id: Uuid, sender: Option<ProgressSender>) -> Self {
        Self { pair_id, sender }
    }

    pub fn detached() -> Self {
        Self::new(Uuid::nil(), None)
    }

    pub fn pair_id(&self) -> Uuid {
        self.pair_id
    }

    /// Tracker whose reports are forwarded as `phase` events for this pair.
    pub fn tracker(&self, phase: ComparePhase, total: usize) -> ProgressTracker {
        match self.sender.clone() {
            Some(sender) => {
                let pair_id = self.pair_id;
                ProgressTracker::new(total, move |fraction, label| {
                    let _ = sender.send(CompareProgress {
                        pair_id,
                        phase,
                        fraction,
                        label: label.to_string(),
                    });
                })
            }
            None => ProgressTracker::silent(total),
        }
    }

    /// Send a single unthrottled event.
    pub fn send(&self, phase: ComparePhase, done: usize, total: usize) {
        if let Some(sender) = &self.sender {
            let fraction = if total == 0 {
                1.0
            } else {
                done as f64 / total as f64
            };
            let _ = sender.send(CompareProgress {
                pair_id: self.pair_id,
                phase,
                fraction,
                label: format!("{}/{}", done, total),
            });
        }
    }
}
