//! RAL-compatible definitions for the USB device peripheral
//!
//! Covers the full-speed USB device found on STM32 parts with 32-bit packet
//! memory access (G0, H5, U5 and friends). Registers are modeled with [`Reg`]
//! so that they work with the `ral-registers` macros, and so that tests can
//! point the driver at ordinary memory.

#![allow(non_snake_case, non_upper_case_globals)]
#![allow(clippy::declare_interior_mutable_const)] // Register blocks are built from const items.

use core::cell::UnsafeCell;

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// A register, or a word of packet memory, accessed with volatile loads and stores
#[repr(transparent)]
pub struct Reg<T>(UnsafeCell<T>);

// Safety: all access is volatile and word sized. Coordinating read-modify-write
// sequences is the responsibility of the driver.
unsafe impl<T: Send> Sync for Reg<T> {}

#[cfg(test)]
impl<T> Reg<T> {
    pub const fn new(val: T) -> Self {
        Reg(UnsafeCell::new(val))
    }
}

impl<T: Copy> Reg<T> {
    #[inline(always)]
    pub fn read(&self) -> T {
        // Safety: pointer from UnsafeCell is valid and aligned.
        unsafe { self.0.get().read_volatile() }
    }
    #[inline(always)]
    pub fn write(&self, val: T) {
        // Safety: pointer from UnsafeCell is valid and aligned.
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// Number of endpoint registers (and buffer descriptors)
pub const ENDPOINT_COUNT: usize = 8;

pub mod usb {
    use super::{Reg, ENDPOINT_COUNT};

    /// The USB device register block
    #[repr(C)]
    pub struct RegisterBlock {
        /// Endpoint registers; use [`endpoint::register`](super::endpoint::register)
        pub CHEPR: [Reg<u32>; ENDPOINT_COUNT],
        _reserved0: [u32; 8],
        pub CNTR: Reg<u32>,
        pub ISTR: Reg<u32>,
        _reserved1: [u32; 2],
        pub BTABLE: Reg<u32>,
    }

    #[cfg(test)]
    impl RegisterBlock {
        /// A register block with every register cleared
        ///
        /// Useful for simulating the peripheral in memory.
        pub const fn new() -> Self {
            const ZERO: Reg<u32> = Reg::new(0);
            RegisterBlock {
                CHEPR: [ZERO; ENDPOINT_COUNT],
                _reserved0: [0; 8],
                CNTR: Reg::new(0),
                ISTR: Reg::new(0),
                _reserved1: [0; 2],
                BTABLE: Reg::new(0),
            }
        }
    }

    pub mod CNTR {}

    pub mod ISTR {}

    pub mod BTABLE {
        pub mod BTABLE {
            pub const offset: u32 = 3;
            pub const mask: u32 = 0x1FFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    const _: () = assert!(core::mem::size_of::<RegisterBlock>() == 0x54);
}

/// The RAL API requires us to treat all endpoint registers as unique.
/// We can make it a little easier with this function, the `EndpointRegister`
/// type, and the helper module.
pub mod endpoint {
    use super::{usb, Reg};

    pub struct EndpointRegister<'a> {
        pub CHEPR: &'a Reg<u32>,
    }

    pub fn register(usb: &usb::RegisterBlock, endpoint: usize) -> EndpointRegister<'_> {
        EndpointRegister {
            CHEPR: usb
                .CHEPR
                .get(endpoint)
                .unwrap_or_else(|| unreachable!("CHEP{}R register doesn't exist", endpoint)),
        }
    }

    pub mod CHEPR {
        pub mod EA {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Toggle on write 1
        pub mod STAT_TX {
            pub const offset: u32 = 4;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Toggle on write 1
        pub mod DTOG_TX {
            pub const offset: u32 = 6;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Cleared on write 0
        pub mod CTR_TX {
            pub const offset: u32 = 7;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod EP_KIND {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod UTYPE {
            pub const offset: u32 = 9;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {
                pub const BULK: u32 = 0b00;
            }
            pub mod R {}
            pub mod W {}
        }
        /// Toggle on write 1
        pub mod STAT_RX {
            pub const offset: u32 = 12;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Toggle on write 1
        pub mod DTOG_RX {
            pub const offset: u32 = 14;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Cleared on write 0
        pub mod CTR_RX {
            pub const offset: u32 = 15;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }
}

/// The buffer descriptor table, located in packet memory
pub mod btable {
    use super::{Reg, ENDPOINT_COUNT};

    /// One endpoint's transmit and receive buffer descriptors
    #[repr(C)]
    pub struct BufferDescriptor {
        pub TXBD: Reg<u32>,
        pub RXBD: Reg<u32>,
    }

    #[cfg(test)]
    impl BufferDescriptor {
        pub const fn new() -> Self {
            BufferDescriptor {
                TXBD: Reg::new(0),
                RXBD: Reg::new(0),
            }
        }
    }

    /// All buffer descriptors, indexed by endpoint
    #[repr(C, align(8))]
    pub struct BufferTable(pub [BufferDescriptor; ENDPOINT_COUNT]);

    #[cfg(test)]
    impl BufferTable {
        pub const fn new() -> Self {
            const BD: BufferDescriptor = BufferDescriptor::new();
            BufferTable([BD; ENDPOINT_COUNT])
        }
    }

    pub mod TXBD {
        pub mod ADDR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod COUNT {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0x3FF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod RXBD {
        pub mod ADDR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod COUNT {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0x3FF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod NUM_BLOCK {
            pub const offset: u32 = 26;
            pub const mask: u32 = 0x1F << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// 0: blocks of 2 bytes, 1: blocks of 32 bytes
        pub mod BLSIZE {
            pub const offset: u32 = 31;
            pub const mask: u32 = 1 << offset;
            pub mod RW {
                pub const BYTES_32: u32 = 1;
            }
            pub mod R {}
            pub mod W {}
        }
    }

    const _: () = assert!(core::mem::size_of::<BufferTable>() == 8 * ENDPOINT_COUNT);
}

#[cfg(test)]
mod test {
    use super::{btable, endpoint, usb};
    use crate::ral;

    #[test]
    fn endpoint_address() {
        let usb = usb::RegisterBlock::new();
        let epr = endpoint::register(&usb, 3);
        ral::write_reg!(endpoint, &epr, CHEPR, EA: u32::MAX);
        assert_eq!(usb.CHEPR[3].read(), 0xF);
        assert_eq!(usb.CHEPR[2].read(), 0);
    }

    #[test]
    fn endpoint_status_values() {
        let usb = usb::RegisterBlock::new();
        let epr = endpoint::register(&usb, 1);
        ral::write_reg!(endpoint, &epr, CHEPR, STAT_RX: 0b11, STAT_TX: 0b10);
        assert_eq!(usb.CHEPR[1].read(), (0b11 << 12) | (0b10 << 4));
        assert!(ral::read_reg!(endpoint, &epr, CHEPR, STAT_RX == 0b11));
        assert_eq!(ral::read_reg!(endpoint, &epr, CHEPR, STAT_TX), 0b10);
    }

    #[test]
    fn endpoint_type() {
        let usb = usb::RegisterBlock::new();
        let epr = endpoint::register(&usb, 0);
        usb.CHEPR[0].write((0b11 << 9) | 1);
        ral::modify_reg!(endpoint, &epr, CHEPR, UTYPE: BULK);
        assert_eq!(usb.CHEPR[0].read(), 1);
    }

    #[test]
    fn rx_descriptor() {
        let table = btable::BufferTable::new();
        let bd = &table.0[2];
        ral::write_reg!(btable, bd, RXBD, ADDR: 0x80, COUNT: u32::MAX, NUM_BLOCK: 1, BLSIZE: BYTES_32);
        assert_eq!(bd.RXBD.read(), (1 << 31) | (1 << 26) | (0x3FF << 16) | 0x80);
        assert_eq!(ral::read_reg!(btable, bd, RXBD, COUNT), 0x3FF);
        assert_eq!(table.0[1].RXBD.read(), 0);
    }

    #[test]
    fn tx_descriptor() {
        let table = btable::BufferTable::new();
        let bd = &table.0[0];
        ral::write_reg!(btable, bd, TXBD, ADDR: 0x40, COUNT: 17);
        ral::modify_reg!(btable, bd, TXBD, COUNT: 64);
        assert_eq!(bd.TXBD.read(), (64 << 16) | 0x40);
    }

    #[test]
    fn buffer_table_offset() {
        let usb = usb::RegisterBlock::new();
        ral::write_reg!(usb, &usb, BTABLE, BTABLE: 0x100 >> 3);
        assert_eq!(usb.BTABLE.read(), 0x100);
    }
}
