//! Interrupt-driven byte streams over USB bulk endpoints
//!
//! `usb-stream` connects a bulk IN/OUT endpoint pair to two byte queues. The
//! host writes into the RX queue, your firmware reads it. Your firmware writes
//! into the TX queue, the host reads it. The stream never drops or duplicates a
//! byte, and it never allocates.
//!
//! The pieces:
//!
//! - a [`UsbStream`] per endpoint pair, built from a [`StreamConfig`] and two
//!   [`ByteQueue`]s. [`Queue`] is a ready-made queue.
//! - an [`EndpointHal`] that arms and NAKs endpoints. [`Endpoints`] implements
//!   it for the STM32 full-speed USB device. To use it, you must define a safe
//!   implementation of [`Peripherals`].
//! - an [`EndpointTable`] that routes USB interrupts to the streams.
//! - a [`StreamClass`] that runs a stream under a `usb-device` device,
//!   through [`UsbEndpoints`].
//! - a [`StreamInterface`] that describes the endpoint pair to the host.
//!
//! # Design
//!
//! Everything is built in `static`s, with `const fn`s. Wiring mistakes, like
//! registering two handlers for one endpoint, fail at compile time.
//!
//! A stream's handlers run in the USB interrupt. Queue notifications run in
//! whatever context touched the queue, usually your main loop. The two meet
//! at the hardware endpoint status, and at one atomic flag per stream. While
//! the hardware owns a packet buffer (status `Valid`) the stream leaves it
//! alone; once the transaction completes, the endpoint NAKs the host until
//! the stream re-arms it. When the RX queue is full, the stream simply doesn't
//! re-arm, and the host retries until there's room.
//!
//! ```no_run
//! use usb_stream::{
//!     Endpoints, EndpointTable, Event, Interrupt, Peripherals, Queue, StreamBuffers,
//!     StreamConfig, StreamState, UsbStream,
//! };
//!
//! struct Usb;
//! unsafe impl Peripherals for Usb {
//!     fn usb(&self) -> *const () { 0x4000_5C00 as _ }
//!     fn packet_memory(&self) -> *const () { 0x4000_6000 as _ }
//! }
//!
//! static ENDPOINTS: Endpoints<Usb> = Endpoints::new(Usb);
//!
//! static RX_QUEUE: Queue<256> = Queue::new();
//! static TX_QUEUE: Queue<256> = Queue::new();
//!
//! // The buffers belong in packet memory. Place them with a
//! // #[link_section] that your linker script maps there.
//! static BUFFERS: StreamBuffers = StreamBuffers::new();
//! static STATE: StreamState = StreamState::new();
//!
//! static STREAM: UsbStream<&Endpoints<Usb>> = UsbStream::new(
//!     StreamConfig::new(1, &BUFFERS, &STATE),
//!     &RX_QUEUE,
//!     &TX_QUEUE,
//!     &ENDPOINTS,
//! );
//! static TABLE: EndpointTable = EndpointTable::new().with(1, &STREAM);
//!
//! RX_QUEUE.attach_producer(&STREAM);
//! TX_QUEUE.attach_consumer(&STREAM);
//! ENDPOINTS.initialize();
//! ENDPOINTS.enable_interrupts(Interrupt::CTR | Interrupt::RESET);
//!
//! // In the USB interrupt handler, after your USB stack's own poll:
//! ENDPOINTS.on_interrupt(&TABLE);
//!
//! // When your USB stack reports a bus reset:
//! TABLE.dispatch(Event::Reset);
//! ```
//!
//! If your firmware runs `usb-device`, use [`StreamClass`] instead. It
//! allocates the endpoint pair from the bus, and the device drives the
//! stream through the class callbacks.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod bus;
mod class;
mod descriptor;
mod dispatch;
mod endpoint;
mod packet;
mod queue;
mod ral;
mod state;
mod stream;

pub use bus::{Endpoints, Interrupt};
pub use class::{StreamClass, UsbEndpoints};
pub use descriptor::{
    StreamInterface, USB_CLASS_VENDOR_SPEC, USB_PROTOCOL_GOOGLE_SERIAL, USB_SUBCLASS_GOOGLE_SERIAL,
};
pub use dispatch::{EndpointHandler, EndpointTable, Event};
pub use endpoint::{EndpointHal, Status};
pub use packet::{PacketBuffer, StreamBuffers};
pub use queue::{ByteQueue, Consumer, Producer, Queue};
pub use state::{Phase, StreamState};
pub use stream::{StreamConfig, UsbStream};

/// The largest packet on a full-speed bulk endpoint
pub const MAX_PACKET_SIZE: usize = 64;

/// Eight endpoints, including the control endpoint
pub const MAX_ENDPOINTS: usize = ral::ENDPOINT_COUNT;

/// A type that owns the USB device registers, and its packet memory
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USB
/// register block, and the packet memory that the USB device reads and
/// writes. The pointers returned by the methods are assumed to be valid, and
/// will be cast to register definitions.
///
/// The packet memory must be 32-bit accessible. Its first 64 bytes hold the
/// buffer descriptor table, so place your packet buffers after that.
///
/// # Example
///
/// ```
/// use usb_stream::Peripherals;
///
/// struct Usb {
///     _private: (),
/// }
///
/// impl Usb {
///     /// Only call this once
///     pub unsafe fn steal() -> Self {
///         Usb { _private: () }
///     }
/// }
///
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         0x4000_5C00 as _
///     }
///     fn packet_memory(&self) -> *const () {
///         0x4000_6000 as _
///     }
/// }
///
/// let usb = unsafe { Usb::steal() };
/// assert_eq!(usb.usb(), 0x4000_5C00 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB device registers
    fn usb(&self) -> *const ();
    /// Returns the address of the packet memory, starting with the buffer
    /// descriptor table
    fn packet_memory(&self) -> *const ();
}
