//! Per-class admission window that de-duplicates repeated detections.

use std::collections::HashMap;
use std::time::Duration;

use crate::classes::DefectClass;

/// Outcome of offering an event to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Suppressed,
}

/// Tracks the last admitted time per defect class.
///
/// A class is admitted when it has never been admitted before, or when at
/// least the cooldown window has elapsed since its last admission. Only
/// admissions update state; a suppressed event never extends the window.
/// The check and the update happen under one `&mut self` borrow, so sharing
/// the tracker behind a mutex gives concurrent workers exactly-once
/// admission per window.
pub struct CooldownTracker {
    window_ms: i64,
    last_admitted: HashMap<DefectClass, i64>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            last_admitted: HashMap::new(),
        }
    }

    pub fn admit(&mut self, class: DefectClass, now_ms: i64) -> Admission {
        match self.last_admitted.get(&class) {
            // A clock stepping backwards lands here too: negative elapsed
            // stays below the window and the recorded time is kept.
            Some(&last) if now_ms - last < self.window_ms => Admission::Suppressed,
            _ => {
                self.last_admitted.insert(class, now_ms);
                Admission::Admitted
            }
        }
    }

    /// Last admitted timestamp for `class`, if any.
    pub fn last_admitted(&self, class: DefectClass) -> Option<i64> {
        self.last_admitted.get(&class).copied()
    }

    /// Forget all per-class history.
    pub fn reset(&mut self) {
        self.last_admitted.clear();
    }
}
