use std::fmt;

/// One evaluation snapshot taken during a run.
///
/// `Display` renders the artifact line format: step, elapsed milliseconds,
/// loss and error rate, space separated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalRecord {
    pub step: u32,
    pub elapsed_ms: u64,
    pub loss: f32,
    pub error_rate: f32,
}

impl fmt::Display for EvalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.step, self.elapsed_ms, self.loss, self.error_rate
        )
    }
}
