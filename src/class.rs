//! Run a stream as a `usb-device` class
//!
//! [`UsbEndpoints`] allocates a bulk endpoint pair from a `usb-device` bus,
//! and implements [`EndpointHal`] on top of it. [`StreamClass`] forwards the
//! device's class callbacks to a [`UsbStream`] that uses those endpoints.
//!
//! The bus owns the hardware endpoint buffers. `UsbEndpoints` tracks the
//! stream's view of each direction in software:
//!
//! - OUT is `Valid` while the stream can take another packet. Receiving a
//!   packet copies it into the stream's RX buffer and switches OUT to `Nak`.
//!   Until the stream re-arms, the next packet stays in the bus, and the bus
//!   NAKs the host.
//! - IN is `Valid` from the moment the stream arms a packet, until the bus
//!   reports that the host took it.
//!
//! ```no_run
//! use usb_device::{
//!     bus::{UsbBus, UsbBusAllocator},
//!     device::{UsbDeviceBuilder, UsbVidPid},
//! };
//! use usb_stream::{
//!     ByteQueue, Queue, StreamBuffers, StreamClass, StreamConfig, StreamState, UsbEndpoints,
//!     UsbStream,
//! };
//!
//! fn run<B: UsbBus>(alloc: &UsbBusAllocator<B>) -> usb_device::Result<()> {
//!     let rx_queue: Queue<256> = Queue::new();
//!     let tx_queue: Queue<256> = Queue::new();
//!     let buffers = StreamBuffers::new();
//!     let state = StreamState::new();
//!
//!     let endpoints = UsbEndpoints::new(alloc, 1)?;
//!     let config = StreamConfig::new(1, &buffers, &state);
//!     let stream = UsbStream::new(config, &rx_queue, &tx_queue, endpoints);
//!     rx_queue.attach_producer(&stream);
//!     tx_queue.attach_consumer(&stream);
//!
//!     let mut class = StreamClass::new(alloc, &stream);
//!     let mut device = UsbDeviceBuilder::new(alloc, UsbVidPid(0x1209, 0x0001)).build();
//!     loop {
//!         device.poll(&mut [&mut class]);
//!         // Echo whatever the host sent.
//!         let mut buffer = [0; 64];
//!         let count = rx_queue.read(&mut buffer);
//!         tx_queue.write(&buffer[..count]);
//!     }
//! }
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use usb_device::{
    bus::{InterfaceNumber, UsbBus, UsbBusAllocator},
    class::UsbClass,
    class_prelude::DescriptorWriter,
    endpoint::{EndpointAddress, EndpointIn, EndpointOut, EndpointType},
    UsbDirection, UsbError,
};

use crate::{
    descriptor::{
        IN_INTERVAL, USB_CLASS_VENDOR_SPEC, USB_PROTOCOL_GOOGLE_SERIAL, USB_SUBCLASS_GOOGLE_SERIAL,
    },
    endpoint::{EndpointHal, Status},
    packet::PacketBuffer,
    stream::UsbStream,
    MAX_PACKET_SIZE,
};

/// A bulk endpoint pair allocated from a `usb-device` bus
pub struct UsbEndpoints<'a, B: UsbBus> {
    ep_in: EndpointIn<'a, B>,
    ep_out: EndpointOut<'a, B>,
    rx_status: AtomicU32,
    tx_status: AtomicU32,
    rx_count: AtomicUsize,
    tx_count: AtomicUsize,
    /// The bus accepted the armed IN packet
    tx_loaded: AtomicBool,
}

impl<'a, B: UsbBus> UsbEndpoints<'a, B> {
    /// Allocate the IN and OUT endpoints with index `endpoint`
    ///
    /// Both directions start out disabled. The stream configures them on
    /// reset.
    pub fn new(alloc: &'a UsbBusAllocator<B>, endpoint: u8) -> usb_device::Result<Self> {
        if endpoint == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let index = endpoint as usize;
        let max_packet_size = MAX_PACKET_SIZE as u16;
        let ep_in = alloc.alloc(
            Some(EndpointAddress::from_parts(index, UsbDirection::In)),
            EndpointType::Bulk,
            max_packet_size,
            IN_INTERVAL,
        )?;
        let ep_out = alloc.alloc(
            Some(EndpointAddress::from_parts(index, UsbDirection::Out)),
            EndpointType::Bulk,
            max_packet_size,
            0,
        )?;
        Ok(UsbEndpoints {
            ep_in,
            ep_out,
            rx_status: AtomicU32::new(Status::Disabled.bits()),
            tx_status: AtomicU32::new(Status::Disabled.bits()),
            rx_count: AtomicUsize::new(0),
            tx_count: AtomicUsize::new(0),
            tx_loaded: AtomicBool::new(false),
        })
    }

    /// The IN endpoint, device to host
    pub fn ep_in(&self) -> &EndpointIn<'a, B> {
        &self.ep_in
    }

    /// The OUT endpoint, host to device
    pub fn ep_out(&self) -> &EndpointOut<'a, B> {
        &self.ep_out
    }

    fn load(status: &AtomicU32) -> Status {
        Status::from_bits(status.load(Ordering::SeqCst))
    }

    fn check(&self, endpoint: u8) {
        debug_assert_eq!(endpoint as usize, self.ep_in.address().index());
    }

    /// Move the next OUT packet from the bus into `rx`
    ///
    /// Only takes a packet while OUT is `Valid`. Returns `true` if a packet
    /// arrived; OUT is then `Nak`.
    pub fn receive(&self, rx: &PacketBuffer) -> bool {
        if Self::load(&self.rx_status) != Status::Valid {
            return false;
        }

        let mut packet = [0; MAX_PACKET_SIZE];
        match self.ep_out.read(&mut packet) {
            Ok(count) => {
                let count = rx.volatile_write(&packet[..count]);
                self.rx_count.store(count, Ordering::SeqCst);
                self.rx_status.store(Status::Nak.bits(), Ordering::SeqCst);
                true
            }
            Err(UsbError::WouldBlock) => false,
            Err(_err) => {
                warn!("EP{} OUT {}", self.ep_out.address().index(), _err);
                false
            }
        }
    }

    /// Hand the armed IN packet in `tx` to the bus, if it hasn't taken it yet
    ///
    /// Returns `true` if the bus holds the packet.
    pub fn transmit(&self, tx: &PacketBuffer) -> bool {
        if Self::load(&self.tx_status) != Status::Valid {
            return false;
        }
        if self.tx_loaded.load(Ordering::SeqCst) {
            return true;
        }

        let mut packet = [0; MAX_PACKET_SIZE];
        let len = self.tx_count.load(Ordering::SeqCst).min(MAX_PACKET_SIZE);
        let len = tx.volatile_read(&mut packet[..len]);
        match self.ep_in.write(&packet[..len]) {
            Ok(_) => {
                self.tx_loaded.store(true, Ordering::SeqCst);
                true
            }
            Err(UsbError::WouldBlock) => false,
            Err(_err) => {
                warn!("EP{} IN {}", self.ep_in.address().index(), _err);
                false
            }
        }
    }

    /// The host took the IN packet
    ///
    /// Returns `false` if no packet was in flight.
    pub fn transmit_complete(&self) -> bool {
        if !self.tx_loaded.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.tx_status.store(Status::Nak.bits(), Ordering::SeqCst);
        true
    }
}

impl<B: UsbBus> EndpointHal for UsbEndpoints<'_, B> {
    fn set_buffers(&self, endpoint: u8, _: &PacketBuffer, _: &PacketBuffer) {
        self.check(endpoint);
        self.rx_count.store(0, Ordering::SeqCst);
        self.tx_count.store(0, Ordering::SeqCst);
        self.tx_loaded.store(false, Ordering::SeqCst);
    }

    fn configure_bulk(&self, endpoint: u8, rx: Status, tx: Status) {
        self.check(endpoint);
        self.rx_status.store(rx.bits(), Ordering::SeqCst);
        self.tx_status.store(tx.bits(), Ordering::SeqCst);
    }

    fn rx_count(&self, endpoint: u8) -> usize {
        self.check(endpoint);
        self.rx_count.load(Ordering::SeqCst)
    }

    fn rx_status(&self, endpoint: u8) -> Status {
        self.check(endpoint);
        Self::load(&self.rx_status)
    }

    fn set_rx_status(&self, endpoint: u8, status: Status) {
        self.check(endpoint);
        self.rx_status.store(status.bits(), Ordering::SeqCst);
    }

    fn tx_status(&self, endpoint: u8) -> Status {
        self.check(endpoint);
        Self::load(&self.tx_status)
    }

    fn set_tx_status(&self, endpoint: u8, status: Status) {
        self.check(endpoint);
        if status != Status::Valid {
            self.tx_loaded.store(false, Ordering::SeqCst);
        }
        self.tx_status.store(status.bits(), Ordering::SeqCst);
    }

    fn arm_tx(&self, endpoint: u8, tx: &PacketBuffer, len: usize) {
        self.check(endpoint);
        debug_assert!(len <= MAX_PACKET_SIZE);
        self.tx_count.store(len, Ordering::SeqCst);
        self.tx_loaded.store(false, Ordering::SeqCst);
        self.tx_status.store(Status::Valid.bits(), Ordering::SeqCst);
        // If the bus is still busy, the next poll retries.
        self.transmit(tx);
    }
}

/// A stream, driven by a `usb-device` device
///
/// Pass it to `UsbDevice::poll` with your other classes. It describes a
/// vendor-specific interface with the stream's endpoint pair.
pub struct StreamClass<'a, B: UsbBus> {
    interface: InterfaceNumber,
    stream: &'a UsbStream<'a, UsbEndpoints<'a, B>>,
}

impl<'a, B: UsbBus> StreamClass<'a, B> {
    /// Allocate an interface for `stream`
    pub fn new(alloc: &'a UsbBusAllocator<B>, stream: &'a UsbStream<'a, UsbEndpoints<'a, B>>) -> Self {
        StreamClass {
            interface: alloc.interface(),
            stream,
        }
    }

    /// Returns the interface number
    pub fn interface(&self) -> InterfaceNumber {
        self.interface
    }

    fn endpoints(&self) -> &UsbEndpoints<'a, B> {
        self.stream.hal()
    }

    /// Feed waiting OUT packets to the stream, until it pushes back
    fn receive(&self) {
        let rx = self.stream.config().rx_buffer();
        while self.endpoints().receive(rx) {
            self.stream.rx();
        }
    }
}

impl<B: UsbBus> UsbClass<B> for StreamClass<'_, B> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> usb_device::Result<()> {
        writer.interface(
            self.interface,
            USB_CLASS_VENDOR_SPEC,
            USB_SUBCLASS_GOOGLE_SERIAL,
            USB_PROTOCOL_GOOGLE_SERIAL,
        )?;
        writer.endpoint(self.endpoints().ep_in())?;
        writer.endpoint(self.endpoints().ep_out())?;
        Ok(())
    }

    fn reset(&mut self) {
        self.stream.reset();
    }

    fn poll(&mut self) {
        // Packets the bus held back while the stream was waiting for space.
        self.receive();
        self.endpoints().transmit(self.stream.config().tx_buffer());
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.endpoints().ep_out().address() {
            self.receive();
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.endpoints().ep_in().address() && self.endpoints().transmit_complete() {
            self.stream.tx();
        }
    }
}
