use std::time::Duration;

/// Counters a worker accumulates over a run.
#[derive(Debug, Default, Clone)]
pub struct WorkerMetrics {
    pub compute_time: Duration,

    /// Rounds computed to the end and answered in full.
    pub rounds: u64,
    /// Gradient messages handed to the sender.
    pub emitted: u64,
    /// Passes abandoned mid-way because a newer step arrived.
    pub abandoned: u64,
    /// Rounds skipped because the weight broadcast was overtaken.
    pub superseded: u64,
}

impl WorkerMetrics {
    #[inline]
    pub fn bump_round(&mut self) {
        self.rounds += 1;
    }

    #[inline]
    pub fn bump_emitted(&mut self) {
        self.emitted += 1;
    }

    #[inline]
    pub fn bump_abandoned(&mut self) {
        self.abandoned += 1;
    }

    #[inline]
    pub fn bump_superseded(&mut self) {
        self.superseded += 1;
    }
}
