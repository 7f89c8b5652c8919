//! Endpoint packet buffers
//!
//! A [`PacketBuffer`] holds exactly one maximum-sized packet. It's
//! expected to live in the USB peripheral's packet memory, so that the
//! hardware can read and write it directly. Software only touches the
//! buffer while the hardware doesn't own it (the endpoint is NAKing),
//! and always with volatile accesses.

use core::cell::UnsafeCell;

use crate::MAX_PACKET_SIZE;

/// One packet of hardware-accessible memory
///
/// Place these in packet memory with a `#[link_section]` that your
/// linker script maps onto the USB peripheral's SRAM.
///
/// ```
/// use usb_stream::PacketBuffer;
///
/// static RX: PacketBuffer = PacketBuffer::new();
/// assert_eq!(RX.len(), 64);
/// ```
#[repr(C, align(4))]
pub struct PacketBuffer(UnsafeCell<[u32; WORDS]>);

const WORDS: usize = MAX_PACKET_SIZE / 4;

// Safety: accesses are volatile, and the stream only touches a buffer from its
// own endpoint's handlers while the hardware isn't using it.
unsafe impl Sync for PacketBuffer {}

impl PacketBuffer {
    /// Allocate a zeroed packet buffer
    pub const fn new() -> Self {
        PacketBuffer(UnsafeCell::new([0; WORDS]))
    }

    /// Returns the size of the buffer, in bytes
    pub const fn len(&self) -> usize {
        MAX_PACKET_SIZE
    }

    /// Returns the address of the buffer
    pub fn as_ptr(&self) -> *const u8 {
        self.0.get().cast::<u8>().cast_const()
    }

    /// Read the first `buffer.len()` bytes of the packet into `buffer`
    ///
    /// Returns the number of bytes read, which is constrained by the packet size.
    /// Packet memory is only ever read in whole words.
    pub fn volatile_read(&self, buffer: &mut [u8]) -> usize {
        let size = buffer.len().min(MAX_PACKET_SIZE);
        let src = self.0.get().cast::<u32>().cast_const();
        for (idx, dst) in buffer[..size].chunks_mut(4).enumerate() {
            // Safety: idx < WORDS, and the pointer is valid and aligned for
            // the whole array.
            let word = unsafe { src.add(idx).read_volatile() };
            dst.copy_from_slice(&word.to_ne_bytes()[..dst.len()]);
        }
        size
    }

    /// Copy `buffer` into the start of the packet
    ///
    /// Returns the number of bytes written, which is constrained by the packet size.
    /// Packet memory is only ever written in whole words; a trailing partial word
    /// is padded with zeros. The write is fenced, so it's visible before the
    /// caller hands the buffer to the hardware.
    pub fn volatile_write(&self, buffer: &[u8]) -> usize {
        let size = buffer.len().min(MAX_PACKET_SIZE);
        let dst = self.0.get().cast::<u32>();
        for (idx, src) in buffer[..size].chunks(4).enumerate() {
            let mut bytes = [0; 4];
            bytes[..src.len()].copy_from_slice(src);
            // Safety: idx < WORDS, and the pointer is valid and aligned for
            // the whole array.
            unsafe { dst.add(idx).write_volatile(u32::from_ne_bytes(bytes)) };
        }
        memory_barrier();
        size
    }
}

/// Order packet memory writes before the endpoint register write that
/// passes ownership to the hardware.
#[inline(always)]
fn memory_barrier() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dmb();
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

/// The RX and TX packet buffers for one stream
///
/// A convenience for placing both buffers in packet memory with one
/// `#[link_section]`.
#[repr(C)]
pub struct StreamBuffers {
    pub rx: PacketBuffer,
    pub tx: PacketBuffer,
}

impl StreamBuffers {
    pub const fn new() -> Self {
        StreamBuffers {
            rx: PacketBuffer::new(),
            tx: PacketBuffer::new(),
        }
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for StreamBuffers {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::size_of::<PacketBuffer>() == MAX_PACKET_SIZE);
