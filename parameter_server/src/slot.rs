use comms::{Result, SendHandle};

/// One outbound broadcast slot, either idle or tracking an in-flight send.
///
/// Each (destination, channel) pair the coordinator broadcasts on gets its
/// own slot, which bounds the outstanding sends per pair to one. How a slot
/// is vacated depends on what it carries: step words are waited out, weight
/// payloads are superseded.
pub struct SendSlot {
    inflight: Option<SendHandle>,
}

impl SendSlot {
    pub fn new() -> Self {
        Self { inflight: None }
    }

    /// Waits out the in-flight send, if any. A step notification must land
    /// before the next one is issued, never be dropped.
    pub fn make_idle(&mut self) -> Result<()> {
        if let Some(handle) = self.inflight.take() {
            handle.wait()?;
        }
        Ok(())
    }

    /// Revokes the in-flight send, if any. Only the newest weights matter,
    /// so an unconsumed broadcast is withdrawn rather than waited for.
    pub fn supersede(&mut self) -> Result<()> {
        if let Some(handle) = self.inflight.take() {
            handle.cancel()?;
        }
        Ok(())
    }

    /// Occupies the slot. The caller vacates it first.
    pub fn put(&mut self, handle: SendHandle) {
        debug_assert!(self.inflight.is_none(), "slot is already in flight");
        self.inflight = Some(handle);
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_none()
    }
}

impl Default for SendSlot {
    fn default() -> Self {
        Self::new()
    }
}
