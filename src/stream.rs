//! USB bulk endpoint streams
//!
//! A [`UsbStream`] moves bytes between a bulk IN/OUT endpoint pair and two
//! byte queues:
//!
//! - OUT packets from the host are copied into the RX queue. If the queue
//!   can't take a whole packet, the packet stays in the RX buffer, and the
//!   endpoint NAKs the host until the application frees enough space.
//! - bytes written to the TX queue are sent to the host, up to one packet
//!   at a time. When there's nothing to send, the IN endpoint NAKs.
//!
//! Neither path ever drops or duplicates a byte. Backpressure is the
//! host retrying NAKed transactions.

use crate::{
    dispatch::EndpointHandler,
    endpoint::{EndpointHal, Status},
    packet::{PacketBuffer, StreamBuffers},
    queue::{ByteQueue, Consumer, Producer},
    state::StreamState,
    MAX_ENDPOINTS, MAX_PACKET_SIZE,
};

/// The static parts of a stream
///
/// ```
/// use usb_stream::{StreamBuffers, StreamConfig, StreamState};
///
/// static BUFFERS: StreamBuffers = StreamBuffers::new();
/// static STATE: StreamState = StreamState::new();
/// static CONFIG: StreamConfig = StreamConfig::new(1, &BUFFERS, &STATE);
///
/// assert_eq!(CONFIG.endpoint(), 1);
/// ```
///
/// A bad endpoint index fails to compile:
///
/// ```compile_fail
/// use usb_stream::{StreamBuffers, StreamConfig, StreamState};
///
/// static BUFFERS: StreamBuffers = StreamBuffers::new();
/// static STATE: StreamState = StreamState::new();
/// static CONFIG: StreamConfig = StreamConfig::new(0, &BUFFERS, &STATE);
/// ```
#[derive(Clone, Copy)]
pub struct StreamConfig<'a> {
    endpoint: u8,
    rx_buffer: &'a PacketBuffer,
    tx_buffer: &'a PacketBuffer,
    state: &'a StreamState,
}

impl<'a> StreamConfig<'a> {
    /// Bind the endpoint index, packet buffers, and state of one stream
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` is 0, the control endpoint, or if it's out of range.
    pub const fn new(endpoint: u8, buffers: &'a StreamBuffers, state: &'a StreamState) -> Self {
        Self::from_parts(endpoint, &buffers.rx, &buffers.tx, state)
    }

    /// Like [`new()`](StreamConfig::new), but with separately-allocated buffers
    pub const fn from_parts(
        endpoint: u8,
        rx_buffer: &'a PacketBuffer,
        tx_buffer: &'a PacketBuffer,
        state: &'a StreamState,
    ) -> Self {
        assert!(endpoint != 0, "endpoint 0 belongs to the control pipe");
        assert!((endpoint as usize) < MAX_ENDPOINTS, "endpoint index out of range");
        StreamConfig {
            endpoint,
            rx_buffer,
            tx_buffer,
            state,
        }
    }

    /// Returns the endpoint index
    pub const fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Returns the stream state
    pub const fn state(&self) -> &'a StreamState {
        self.state
    }

    /// Returns the buffer that holds the last OUT packet
    pub const fn rx_buffer(&self) -> &'a PacketBuffer {
        self.rx_buffer
    }

    /// Returns the buffer that holds the next IN packet
    pub const fn tx_buffer(&self) -> &'a PacketBuffer {
        self.tx_buffer
    }
}

/// A byte stream over one bulk endpoint pair
///
/// The stream is the producer of `rx_queue`, and the consumer of `tx_queue`.
/// After construction, attach it to both queues so that it hears about
/// queue activity, and register it in the [`EndpointTable`](crate::EndpointTable):
///
/// ```ignore
/// static STREAM: UsbStream<'static, &Endpoints<Usb>> =
///     UsbStream::new(CONFIG, &RX_QUEUE, &TX_QUEUE, &ENDPOINTS);
/// static TABLE: EndpointTable = EndpointTable::new().with(1, &STREAM);
///
/// RX_QUEUE.attach_producer(&STREAM);
/// TX_QUEUE.attach_consumer(&STREAM);
/// ```
///
/// Both queues should hold at least one full packet. An RX queue that's
/// smaller than a packet may never accept a full-sized packet from the host.
pub struct UsbStream<'a, H> {
    config: StreamConfig<'a>,
    rx_queue: &'a (dyn ByteQueue + Sync),
    tx_queue: &'a (dyn ByteQueue + Sync),
    hal: H,
}

impl<'a, H: EndpointHal> UsbStream<'a, H> {
    /// Wire a stream to its queues, and to the endpoint HAL
    ///
    /// Construction does nothing to the hardware. The stream starts
    /// working on the first [`reset()`](UsbStream::reset).
    pub const fn new(
        config: StreamConfig<'a>,
        rx_queue: &'a (dyn ByteQueue + Sync),
        tx_queue: &'a (dyn ByteQueue + Sync),
        hal: H,
    ) -> Self {
        UsbStream {
            config,
            rx_queue,
            tx_queue,
            hal,
        }
    }

    /// Returns the stream configuration
    pub fn config(&self) -> &StreamConfig<'a> {
        &self.config
    }

    /// Returns the stream state
    pub fn state(&self) -> &'a StreamState {
        self.config.state
    }

    /// Returns the endpoint HAL
    pub fn hal(&self) -> &H {
        &self.hal
    }

    fn endpoint(&self) -> u8 {
        self.config.endpoint
    }

    /// Handle a completed IN transaction
    ///
    /// Call this from the transmit-complete interrupt. It's also fine to
    /// call this to kick off transmission.
    pub fn tx(&self) {
        self.send_next();
    }

    /// Handle a completed OUT transaction
    ///
    /// Call this from the receive-ready interrupt.
    pub fn rx(&self) {
        if self.forward_rx() {
            self.hal.set_rx_status(self.endpoint(), Status::Valid);
        } else {
            self.state().set_rx_waiting();
            debug!("EP{} OUT BACKPRESSURE", self.endpoint());
            // The consumer may have freed space after the check, but before
            // the flag was set. Its notification would have missed the packet.
            self.flush_rx();
        }
    }

    /// Return the stream to its initial state
    ///
    /// Call this on bus reset, interface reset, or reconnect. Any packet
    /// waiting in the RX buffer is lost. Bytes in the queues are kept; the
    /// next TX notification sends them.
    pub fn reset(&self) {
        debug_assert!(
            self.rx_queue.capacity() >= MAX_PACKET_SIZE,
            "RX queue is smaller than a packet"
        );
        debug_assert!(
            self.tx_queue.capacity() >= MAX_PACKET_SIZE,
            "TX queue is smaller than a packet"
        );

        let ep = self.endpoint();
        self.hal
            .set_buffers(ep, self.config.rx_buffer, self.config.tx_buffer);
        self.state().clear_rx_waiting();
        self.hal.configure_bulk(ep, Status::Valid, Status::Nak);
        debug!("EP{} RESET", ep);
    }

    /// Copy the received packet into the RX queue, if there's space
    ///
    /// Returns `false` if the packet didn't fit, and is still in the buffer.
    fn forward_rx(&self) -> bool {
        let count = self.hal.rx_count(self.endpoint()).min(MAX_PACKET_SIZE);
        if count > self.rx_queue.free_space() {
            return false;
        }

        let mut packet = [0; MAX_PACKET_SIZE];
        let read = self.config.rx_buffer.volatile_read(&mut packet[..count]);
        let written = self.rx_queue.write(&packet[..read]);
        debug_assert_eq!(written, read, "RX queue lost bytes");
        trace!("EP{} OUT {=usize}", self.endpoint(), written);
        true
    }

    /// Retry a packet that's waiting in the RX buffer
    fn flush_rx(&self) {
        if !self.state().is_rx_waiting() {
            return;
        }
        debug_assert_ne!(
            self.hal.rx_status(self.endpoint()),
            Status::Valid,
            "endpoint re-armed while a packet waits"
        );
        // The endpoint is NAKing, so no new packet lands while we look at
        // this one. The count is still in the buffer descriptor.
        if self.forward_rx() {
            self.state().clear_rx_waiting();
            self.hal.set_rx_status(self.endpoint(), Status::Valid);
            debug!("EP{} OUT RESUMED", self.endpoint());
        }
    }

    /// Move the next packet from the TX queue into the TX buffer, and send it
    ///
    /// Does nothing while the previous packet is still in flight. If the queue
    /// is empty, the endpoint keeps NAKing.
    fn send_next(&self) {
        let ep = self.endpoint();
        if self.hal.tx_status(ep) == Status::Valid {
            return;
        }

        let mut packet = [0; MAX_PACKET_SIZE];
        let count = self.tx_queue.read(&mut packet);
        if count == 0 {
            return;
        }

        let written = self.config.tx_buffer.volatile_write(&packet[..count]);
        debug_assert_eq!(written, count);
        self.hal.arm_tx(ep, self.config.tx_buffer, written);
        trace!("EP{} IN {=usize}", ep, written);
    }
}

/// The RX queue's consumer freed space
impl<H: EndpointHal> Producer for UsbStream<'_, H> {
    fn space_available(&self, _freed: usize) {
        // Keep the receive interrupt's own flush out.
        critical_section::with(|_| self.flush_rx());
    }
}

/// The TX queue's producer added data
impl<H: EndpointHal> Consumer for UsbStream<'_, H> {
    fn data_available(&self, _added: usize) {
        // Keep the transmit-complete interrupt out, so that it can't slip in
        // between the status check and arming the endpoint.
        critical_section::with(|_| self.send_next());
    }
}

impl<H: EndpointHal> EndpointHandler for UsbStream<'_, H> {
    fn on_tx(&self) {
        self.tx();
    }
    fn on_rx(&self) {
        self.rx();
    }
    fn on_reset(&self) {
        self.reset();
    }
}
