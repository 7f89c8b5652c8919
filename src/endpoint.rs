//! The endpoint primitives a stream needs from the USB stack

use crate::packet::PacketBuffer;

/// Endpoint status, per direction
///
/// The hardware owns the packet buffer while the status is `Valid`. Once a
/// transaction completes, the hardware switches the status to `Nak`, and the
/// host is told to retry until software re-arms the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u32)]
pub enum Status {
    Disabled = 0b00,
    Stall = 0b01,
    Nak = 0b10,
    Valid = 0b11,
}

impl Status {
    /// Decode a two-bit status field
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => Status::Disabled,
            0b01 => Status::Stall,
            0b10 => Status::Nak,
            _ => Status::Valid,
        }
    }

    /// The two-bit field value for this status
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Endpoint arming and status primitives
///
/// This is the interface between a stream and the USB device stack. The
/// endpoint index always refers to a bulk IN/OUT pair sharing one index.
///
/// Methods are called from the endpoint's interrupt handler, and from queue
/// notifications. They must complete in bounded time, and never block.
pub trait EndpointHal {
    /// Point the endpoint's buffer descriptors at `rx` and `tx`
    ///
    /// Sets the RX buffer size to one maximum packet, and clears both counts.
    fn set_buffers(&self, endpoint: u8, rx: &PacketBuffer, tx: &PacketBuffer);
    /// Configure the endpoint for bulk transfers with the given statuses
    ///
    /// Resets the data toggles of both directions.
    fn configure_bulk(&self, endpoint: u8, rx: Status, tx: Status);
    /// The number of bytes received into the RX buffer by the last OUT transaction
    ///
    /// Only meaningful while the RX direction isn't `Valid`.
    fn rx_count(&self, endpoint: u8) -> usize;
    /// The status of the OUT direction
    fn rx_status(&self, endpoint: u8) -> Status;
    /// Set the status of the OUT direction
    fn set_rx_status(&self, endpoint: u8, status: Status);
    /// The status of the IN direction
    fn tx_status(&self, endpoint: u8) -> Status;
    /// Set the status of the IN direction
    fn set_tx_status(&self, endpoint: u8, status: Status);
    /// Send the first `len` bytes of `tx` with the next IN transaction
    ///
    /// `tx` is the buffer given to [`set_buffers`](EndpointHal::set_buffers).
    fn arm_tx(&self, endpoint: u8, tx: &PacketBuffer, len: usize);
}

impl<T: EndpointHal + ?Sized> EndpointHal for &T {
    fn set_buffers(&self, endpoint: u8, rx: &PacketBuffer, tx: &PacketBuffer) {
        T::set_buffers(self, endpoint, rx, tx)
    }
    fn configure_bulk(&self, endpoint: u8, rx: Status, tx: Status) {
        T::configure_bulk(self, endpoint, rx, tx)
    }
    fn rx_count(&self, endpoint: u8) -> usize {
        T::rx_count(self, endpoint)
    }
    fn rx_status(&self, endpoint: u8) -> Status {
        T::rx_status(self, endpoint)
    }
    fn set_rx_status(&self, endpoint: u8, status: Status) {
        T::set_rx_status(self, endpoint, status)
    }
    fn tx_status(&self, endpoint: u8) -> Status {
        T::tx_status(self, endpoint)
    }
    fn set_tx_status(&self, endpoint: u8, status: Status) {
        T::set_tx_status(self, endpoint, status)
    }
    fn arm_tx(&self, endpoint: u8, tx: &PacketBuffer, len: usize) {
        T::arm_tx(self, endpoint, tx, len)
    }
}
