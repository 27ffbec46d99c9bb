//! Seek offsets for "jump to result".
//!
//! Decoders seek to the nearest reference frame at or before the requested
//! time, so starting a little early avoids landing after the matched frame.
//! The margin is a fixed heuristic, not derived from the stream's keyframes.

use crate::search::QueryResult;

pub const DEFAULT_SEEK_MARGIN_SECS: f64 = 0.3;

/// `max(0, timestamp - margin)`; non-finite input seeks to the start
pub fn reconcile(timestamp_sec: f64, margin_secs: f64) -> f64 {
    let seek = timestamp_sec - margin_secs;
    if seek.is_finite() && seek > 0.0 {
        seek
    } else {
        0.0
    }
}

/// A resolved jump for the player
#[derive(Debug, Clone, PartialEq)]
pub struct JumpRequest {
    /// Timestamp of the matched frame
    pub exact_sec: f64,
    /// Where playback should start
    pub seek_sec: f64,
    /// Whole-second start for players that only take integers
    pub start_secs: u64,
}

impl JumpRequest {
    pub fn caption(&self) -> String {
        format!(
            "Showing from ~{:.2}s (keyframe-safe). Exact match: {:.2}s",
            self.seek_sec, self.exact_sec
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackReconciler {
    margin_secs: f64,
}

impl Default for PlaybackReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_SEEK_MARGIN_SECS)
    }
}

impl PlaybackReconciler {
    pub fn new(margin_secs: f64) -> Self {
        Self {
            margin_secs: margin_secs.max(0.0),
        }
    }

    pub fn reconcile(&self, timestamp_sec: f64) -> f64 {
        reconcile(timestamp_sec, self.margin_secs)
    }

    pub fn jump_to(&self, timestamp_sec: f64) -> JumpRequest {
        let seek_sec = self.reconcile(timestamp_sec);
        JumpRequest {
            exact_sec: timestamp_sec,
            seek_sec,
            start_secs: seek_sec.floor() as u64,
        }
    }

    pub fn jump(&self, result: &QueryResult) -> JumpRequest {
        self.jump_to(result.frame.timestamp_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::FrameRef;

    #[test]
    fn test_reconcile_subtracts_margin() {
        let reconciler = PlaybackReconciler::default();
        assert!((reconciler.reconcile(5.0) - 4.7).abs() < 1e-9);
        assert!((reconciler.reconcile(0.3)).abs() < 1e-9);
    }

    #[test]
    fn test_reconcile_clamps_at_zero() {
        let reconciler = PlaybackReconciler::default();
        assert_eq!(reconciler.reconcile(0.1), 0.0);
        assert_eq!(reconciler.reconcile(0.0), 0.0);
        assert_eq!(reconciler.reconcile(f64::NAN), 0.0);
    }

    #[test]
    fn test_never_after_timestamp() {
        let reconciler = PlaybackReconciler::default();
        for ms in (0..10_000).step_by(137) {
            let t = ms as f64 / 1000.0;
            let seek = reconciler.reconcile(t);
            assert!(seek >= 0.0 && seek <= t);
        }
    }

    #[test]
    fn test_jump_from_result() {
        let result = QueryResult {
            frame: FrameRef {
                timestamp_sec: 12.5,
                frame_filename: "frame_00012500ms.jpg".to_string(),
            },
            similarity: 0.31,
            rank: 1,
        };
        let jump = PlaybackReconciler::default().jump(&result);

        assert_eq!(jump.exact_sec, 12.5);
        assert!((jump.seek_sec - 12.2).abs() < 1e-9);
        assert_eq!(jump.start_secs, 12);
        assert_eq!(jump.caption(), "Showing from ~12.20s (keyframe-safe). Exact match: 12.50s");
    }
}
