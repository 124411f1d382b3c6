//! Comparison state machine stages.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where a comparison is. Success runs `Idle → Loading → Detecting →
/// Extracting → Scoring → Deciding → Done`; any stage may end in `Degraded`
/// or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    Loading = 1,
    Detecting = 2,
    Extracting = 3,
    Scoring = 4,
    Deciding = 5,
    Done = 6,
    Degraded = 7,
    Failed = 8,
}

impl Stage {
    fn from_u8(v: u8) -> Stage {
        match v {
            0 => Stage::Idle,
            1 => Stage::Loading,
            2 => Stage::Detecting,
            3 => Stage::Extracting,
            4 => Stage::Scoring,
            5 => Stage::Deciding,
            6 => Stage::Done,
            7 => Stage::Degraded,
            _ => Stage::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Degraded | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Loading => "loading",
            Stage::Detecting => "detecting",
            Stage::Extracting => "extracting",
            Stage::Scoring => "scoring",
            Stage::Deciding => "deciding",
            Stage::Done => "done",
            Stage::Degraded => "degraded",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress of one comparison, shared with its worker threads.
///
/// Pipeline stages only move forward; with two images in flight the tracker
/// reports the furthest stage either has reached. Terminal stages are set
/// once and never overwritten.
#[derive(Debug, Clone)]
pub struct StageTracker(Arc<AtomicU8>);

impl StageTracker {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Stage::Idle as u8)))
    }

    pub fn current(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `stage`. Ignored once a terminal stage is reached.
    pub fn advance(&self, stage: Stage) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let cur_stage = Stage::from_u8(cur);
            if cur_stage.is_terminal() || stage <= cur_stage {
                None
            } else {
                Some(stage as u8)
            }
        });
    }

    /// Enter a terminal stage, returning the stage that was current before.
    pub fn finish(&self, terminal: Stage) -> Stage {
        debug_assert!(terminal.is_terminal());
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if Stage::from_u8(cur).is_terminal() {
                    None
                } else {
                    Some(terminal as u8)
                }
            })
            .unwrap_or_else(|cur| cur);
        Stage::from_u8(prev)
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advances_forward_only() {
        let t = StageTracker::new();
        t.advance(Stage::Loading);
        t.advance(Stage::Extracting);
        t.advance(Stage::Detecting); // second image lagging behind
        assert_eq!(t.current(), Stage::Extracting);
    }

    #[test]
    fn test_terminal_is_sticky() {
        let t = StageTracker::new();
        t.advance(Stage::Detecting);
        assert_eq!(t.finish(Stage::Degraded), Stage::Detecting);
        t.advance(Stage::Scoring);
        assert_eq!(t.current(), Stage::Degraded);
        // A second finish reports the terminal stage and changes nothing.
        assert_eq!(t.finish(Stage::Done), Stage::Degraded);
        assert_eq!(t.current(), Stage::Degraded);
    }

    #[test]
    fn test_clones_share_state() {
        let t = StageTracker::new();
        let worker = t.clone();
        worker.advance(Stage::Extracting);
        assert_eq!(t.current(), Stage::Extracting);
    }

    #[test]
    fn test_display() {
        assert_eq!(Stage::Extracting.to_string(), "extracting");
    }
}
