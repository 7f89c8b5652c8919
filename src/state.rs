//! Per-stream state shared between interrupt handlers and queue hooks

use core::sync::atomic::{AtomicBool, Ordering};

/// The logical state of a stream's receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Phase {
    /// The RX buffer is empty, or its contents were already forwarded.
    Idle,
    /// One packet is held in the RX buffer, waiting for queue space.
    RxWaiting,
}

/// Mutable state for one USB stream
///
/// The zero value is the valid initial state, so a `static` is all you need:
///
/// ```
/// use usb_stream::{Phase, StreamState};
///
/// static STATE: StreamState = StreamState::new();
/// assert_eq!(STATE.phase(), Phase::Idle);
/// ```
///
/// The flag is only loaded and stored, never read-modify-written, so this
/// works on targets without atomic compare-and-swap.
pub struct StreamState {
    rx_waiting: AtomicBool,
}

impl StreamState {
    pub const fn new() -> Self {
        StreamState {
            rx_waiting: AtomicBool::new(false),
        }
    }

    /// Indicates if a received packet is waiting for queue space
    pub fn is_rx_waiting(&self) -> bool {
        self.rx_waiting.load(Ordering::Acquire)
    }

    /// Returns the logical state of the receive path
    pub fn phase(&self) -> Phase {
        if self.is_rx_waiting() {
            Phase::RxWaiting
        } else {
            Phase::Idle
        }
    }

    pub(crate) fn set_rx_waiting(&self) {
        self.rx_waiting.store(true, Ordering::Release);
    }

    pub(crate) fn clear_rx_waiting(&self) {
        self.rx_waiting.store(false, Ordering::Release);
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
