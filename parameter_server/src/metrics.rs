use std::time::Instant;

use machine_learning::EvalRecord;

/// Counters the coordinator accumulates over a run.
#[derive(Debug, Clone)]
pub struct TrainMetrics {
    started: Instant,

    pub rounds: u64,
    /// Gradients folded into an accumulator.
    pub folded: u64,
    /// Gradients discarded for carrying an old step tag.
    pub stale: u64,

    pub records: Vec<EvalRecord>,
}

impl TrainMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rounds: 0,
            folded: 0,
            stale: 0,
            records: Vec::new(),
        }
    }

    #[inline]
    pub fn bump_round(&mut self) {
        self.rounds += 1;
    }

    #[inline]
    pub fn bump_folded(&mut self) {
        self.folded += 1;
    }

    #[inline]
    pub fn bump_stale(&mut self) {
        self.stale += 1;
    }

    /// Milliseconds since the run started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Stores an evaluation snapshot and hands back a copy for logging.
    pub fn record(&mut self, step: u32, loss: f32, error_rate: f32) -> EvalRecord {
        let record = EvalRecord {
            step,
            elapsed_ms: self.elapsed_ms(),
            loss,
            error_rate,
        };
        self.records.push(record);
        record
    }
}

impl Default for TrainMetrics {
    fn default() -> Self {
        Self::new()
    }
}
