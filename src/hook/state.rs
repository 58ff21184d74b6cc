//! Hook lifecycle state

use serde::{Deserialize, Serialize};

/// Elapsed loaded time while the game is not loaded
pub const NOT_LOADED: i64 = -1;

/// Where the hook is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookState {
    /// No process attached
    Unattached,
    /// Attached, game not loaded
    NotLoaded,
    /// Attached, game loaded
    Loaded,
}

/// A change reported by [`LoadTracker::advance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTransition {
    Loaded,
    Unloaded,
}

/// Loaded/not-loaded state machine driven once per refresh
///
/// The elapsed time is [`NOT_LOADED`] exactly when the game is not loaded, and
/// a non-negative multiple of the refresh interval otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTracker {
    elapsed_ms: i64,
    interval_ms: i64,
}

impl LoadTracker {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            elapsed_ms: NOT_LOADED,
            interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.elapsed_ms >= 0
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.elapsed_ms
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// Feed the result of one loaded check
    pub fn advance(&mut self, loaded_now: bool) -> Option<LoadTransition> {
        match (self.is_loaded(), loaded_now) {
            (false, true) => {
                self.elapsed_ms = 0;
                Some(LoadTransition::Loaded)
            }
            (true, false) => {
                self.elapsed_ms = NOT_LOADED;
                Some(LoadTransition::Unloaded)
            }
            (true, true) => {
                self.elapsed_ms = self.elapsed_ms.saturating_add(self.interval_ms);
                None
            }
            (false, false) => None,
        }
    }

    /// Return to not loaded, reporting an unload if the game was loaded
    pub fn reset(&mut self) -> Option<LoadTransition> {
        self.advance(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_starts_not_loaded() {
        let tracker = LoadTracker::new(100);
        assert!(!tracker.is_loaded());
        assert_eq!(tracker.elapsed_ms(), NOT_LOADED);
    }

    #[test]
    fn test_tracker_transitions() {
        let mut tracker = LoadTracker::new(100);

        assert_eq!(tracker.advance(false), None);
        assert_eq!(tracker.elapsed_ms(), -1);

        assert_eq!(tracker.advance(true), Some(LoadTransition::Loaded));
        assert_eq!(tracker.elapsed_ms(), 0);

        assert_eq!(tracker.advance(true), None);
        assert_eq!(tracker.advance(true), None);
        assert_eq!(tracker.elapsed_ms(), 200);

        assert_eq!(tracker.advance(false), Some(LoadTransition::Unloaded));
        assert_eq!(tracker.elapsed_ms(), -1);

        assert_eq!(tracker.advance(true), Some(LoadTransition::Loaded));
        assert_eq!(tracker.elapsed_ms(), 0);
    }

    #[test]
    fn test_tracker_reset() {
        let mut tracker = LoadTracker::new(100);
        assert_eq!(tracker.reset(), None);

        tracker.advance(true);
        assert_eq!(tracker.reset(), Some(LoadTransition::Unloaded));
        assert_eq!(tracker.elapsed_ms(), NOT_LOADED);
    }

    #[test]
    fn test_unloads_never_exceed_loads() {
        let mut tracker = LoadTracker::new(10);
        let (mut loads, mut unloads) = (0, 0);

        for loaded_now in [true, false, false, true, true, false, true, true, true, false] {
            match tracker.advance(loaded_now) {
                Some(LoadTransition::Loaded) => loads += 1,
                Some(LoadTransition::Unloaded) => unloads += 1,
                None => {}
            }
            assert!(unloads <= loads);
            assert!(unloads + 1 >= loads);
            assert_eq!(tracker.elapsed_ms() >= 0, tracker.is_loaded());
            if tracker.is_loaded() {
                assert_eq!(tracker.elapsed_ms() % 10, 0);
            }
        }
        assert_eq!((loads, unloads), (3, 3));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&HookState::NotLoaded).unwrap(), "\"not_loaded\"");
        let state: HookState = serde_json::from_str("\"loaded\"").unwrap();
        assert_eq!(state, HookState::Loaded);
    }
}
