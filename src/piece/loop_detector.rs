//! Loop detection for movement cycles.
//!
//! Tracks the recent sequence of entered movement names. When a configured
//! cycle repeats its threshold number of times, the engine interrupts the
//! flow with the monitor's judge movement.

use tracing::{debug, warn};

use super::config::LoopMonitor;

/// A fired monitor: which one, and how many consecutive cycle repetitions
/// were observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleHit {
    pub monitor_index: usize,
    pub cycle_count: u32,
}

/// Bounded history of entered movements plus the configured monitors
#[derive(Debug, Clone)]
pub struct LoopDetector {
    monitors: Vec<LoopMonitor>,
    history: Vec<String>,
    capacity: usize,
}

impl LoopDetector {
    /// Build a detector for a piece's monitors.
    ///
    /// The history capacity covers the longest configured cycle times
    /// (threshold + 1) repetitions, so a full detection window is never
    /// evicted early.
    pub fn new(monitors: &[LoopMonitor]) -> Self {
        let capacity = monitors
            .iter()
            .map(|m| m.cycle.len() * (m.threshold as usize + 1))
            .max()
            .unwrap_or(0)
            .max(16);

        Self {
            monitors: monitors.to_vec(),
            history: Vec::new(),
            capacity,
        }
    }

    /// Record entry into `movement` and check every monitor.
    ///
    /// A monitor fires when the newly entered movement would begin another
    /// repetition of its cycle and the history tail already holds
    /// `threshold` complete consecutive repetitions.
    pub fn record_entry(&mut self, movement: &str) -> Option<CycleHit> {
        self.history.push(movement.to_string());
        if self.history.len() > self.capacity {
            let excess = self.history.len() - self.capacity;
            self.history.drain(..excess);
        }

        // Exclude the in-flight entry: it starts the next repetition
        let settled = &self.history[..self.history.len() - 1];

        for (monitor_index, monitor) in self.monitors.iter().enumerate() {
            if monitor.cycle.first().map(String::as_str) != Some(movement) {
                continue;
            }
            let cycle_count = count_tail_repetitions(settled, &monitor.cycle);
            if cycle_count >= monitor.threshold {
                warn!(
                    "Loop monitor '{}' fired after {} repetitions of {:?}",
                    monitor.display_name(),
                    cycle_count,
                    monitor.cycle
                );
                return Some(CycleHit {
                    monitor_index,
                    cycle_count,
                });
            }
        }

        None
    }

    /// Monitor accessor for the engine's judge construction
    pub fn monitor(&self, index: usize) -> &LoopMonitor {
        &self.monitors[index]
    }

    /// Truncate the history after a monitor fired, so the same cycle must
    /// re-accumulate from zero.
    pub fn reset(&mut self) {
        debug!("Loop detector history reset");
        self.history.clear();
    }

    /// The recorded history (most recent last)
    pub fn history(&self) -> &[String] {
        &self.history
    }
}

/// Count how many immediately consecutive repetitions of `cycle` terminate
/// `history`.
fn count_tail_repetitions(history: &[String], cycle: &[String]) -> u32 {
    let len = cycle.len();
    if len == 0 {
        return 0;
    }

    let mut reps = 0u32;
    while history.len() >= (reps as usize + 1) * len {
        let end = history.len() - reps as usize * len;
        let window = &history[end - len..end];
        if window.iter().map(String::as_str).eq(cycle.iter().map(String::as_str)) {
            reps += 1;
        } else {
            break;
        }
    }
    reps
}
