use std::sync::Arc;
use std::time::Duration;

use af_core::types::AgentRole;
use dashmap::DashMap;
use tokio::time::Instant;

/// Last-seen instants per role, written by worker links and read by the
/// supervisor's health probe.
///
/// Heartbeats are kept in memory rather than in per-role files because the
/// daemon owns every worker's stdio (or runs the worker in-process).
#[derive(Debug, Clone, Default)]
pub struct HeartbeatBoard {
    beats: Arc<DashMap<AgentRole, Instant>>,
}

impl HeartbeatBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, role: AgentRole) {
        self.beats.insert(role, Instant::now());
    }

    pub fn last_beat(&self, role: AgentRole) -> Option<Instant> {
        self.beats.get(&role).map(|entry| *entry)
    }

    pub fn clear(&self, role: AgentRole) {
        self.beats.remove(&role);
    }

    /// Time since the last beat, or `None` if the role never beat.
    pub fn silence(&self, role: AgentRole) -> Option<Duration> {
        self.last_beat(role).map(|at| at.elapsed())
    }

    /// A role that never beat counts as stale.
    pub fn is_stale(&self, role: AgentRole, threshold: Duration) -> bool {
        self.silence(role).map_or(true, |silence| silence > threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn staleness_follows_last_beat() {
        let board = HeartbeatBoard::new();
        let threshold = Duration::from_secs(10);
        assert!(board.is_stale(AgentRole::Designer, threshold));

        board.beat(AgentRole::Designer);
        assert!(!board.is_stale(AgentRole::Designer, threshold));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(board.is_stale(AgentRole::Designer, threshold));

        board.beat(AgentRole::Designer);
        assert!(!board.is_stale(AgentRole::Designer, threshold));
        board.clear(AgentRole::Designer);
        assert!(board.last_beat(AgentRole::Designer).is_none());
    }
}
