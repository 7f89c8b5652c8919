//! Register-backed endpoint driver
//!
//! Implements [`EndpointHal`] for the STM32 full-speed USB device, and decodes
//! the USB interrupt into [`Event`]s. This driver only manages bulk endpoint
//! pairs; enumeration and the control endpoint belong to your USB stack.
//!
//! The USB interrupt is shared with that stack. [`Endpoints::poll`] only
//! acknowledges transactions on endpoints that have a handler in your
//! [`EndpointTable`]. It never touches the control endpoint, and it never
//! clears a bus reset. When your stack reports a reset, dispatch
//! [`Event::Reset`] to the table yourself.
//!
//! # Endpoint register writes
//!
//! The endpoint register mixes three kinds of bits:
//!
//! - the status and data toggle fields flip when written with 1.
//! - the transaction-complete (CTR) flags clear when written with 0.
//! - everything else is plain read-write.
//!
//! Every write starts from the current register value, keeps the read-write
//! bits, writes 1 to both CTR flags so they're left alone, and writes the XOR
//! of the current and desired value into the toggle fields.

use crate::{
    dispatch::{EndpointTable, Event},
    endpoint::{EndpointHal, Status},
    packet::PacketBuffer,
    ral::{self, btable, endpoint, usb},
    Peripherals, MAX_PACKET_SIZE,
};

bitflags::bitflags! {
    /// USB interrupts
    ///
    /// The same positions select interrupts in `CNTR`, and report them in `ISTR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt: u32 {
        /// Correct transfer on an endpoint
        const CTR = 1 << 15;
        /// Packet memory over / underrun
        const PMAOVR = 1 << 14;
        /// Bus error
        const ERR = 1 << 13;
        /// Wakeup request
        const WKUP = 1 << 12;
        /// Suspend request
        const SUSP = 1 << 11;
        /// Bus reset
        const RESET = 1 << 10;
        /// Start of frame
        const SOF = 1 << 9;
        /// Expected start of frame missed
        const ESOF = 1 << 8;
    }
}

/// Endpoint register bits that keep their value when written
const CHEPR_RW: u32 = endpoint::CHEPR::EA::mask
    | endpoint::CHEPR::EP_KIND::mask
    | endpoint::CHEPR::UTYPE::mask;

/// Endpoint register bits that are cleared by writing 0
const CHEPR_RC_W0: u32 = endpoint::CHEPR::CTR_RX::mask | endpoint::CHEPR::CTR_TX::mask;

/// Compute the endpoint register value that changes the requested statuses,
/// and leaves everything else untouched
fn status_write(current: u32, rx: Option<Status>, tx: Option<Status>) -> u32 {
    let mut value = (current & CHEPR_RW) | CHEPR_RC_W0;
    if let Some(rx) = rx {
        value |= (current ^ (rx.bits() << endpoint::CHEPR::STAT_RX::offset))
            & endpoint::CHEPR::STAT_RX::mask;
    }
    if let Some(tx) = tx {
        value |= (current ^ (tx.bits() << endpoint::CHEPR::STAT_TX::offset))
            & endpoint::CHEPR::STAT_TX::mask;
    }
    value
}

/// Compute the endpoint register value that acknowledges `flag`, one of the CTR flags
fn ctr_clear(current: u32, flag: u32) -> u32 {
    ((current & CHEPR_RW) | CHEPR_RC_W0) & !flag
}

/// Endpoints of one USB peripheral instance
///
/// `Endpoints` is usually shared by all streams on the peripheral. Wrap it in
/// a reference, and give each stream a copy of the reference:
///
/// ```no_run
/// use usb_stream::{Endpoints, Peripherals};
///
/// struct Usb;
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () { 0x4000_5C00 as _ }
///     fn packet_memory(&self) -> *const () { 0x4000_6000 as _ }
/// }
///
/// static ENDPOINTS: Endpoints<Usb> = Endpoints::new(Usb);
/// ENDPOINTS.initialize();
/// ```
pub struct Endpoints<P> {
    peripherals: P,
}

impl<P> Endpoints<P> {
    /// Wrap the peripheral instance
    ///
    /// Creation does nothing to the hardware. Call [`initialize()`](Endpoints::initialize)
    /// before using the endpoints.
    pub const fn new(peripherals: P) -> Self {
        Endpoints { peripherals }
    }
}

impl<P: Peripherals> Endpoints<P> {
    fn usb(&self) -> &usb::RegisterBlock {
        // Safety: Peripherals implementer guarantees that this is a valid
        // pointer to the USB registers.
        unsafe { &*self.peripherals.usb().cast() }
    }

    fn buffer_table(&self) -> &btable::BufferTable {
        // Safety: Peripherals implementer guarantees that this is a valid
        // pointer to packet memory. The buffer table is placed at offset 0
        // by initialize().
        unsafe { &*self.peripherals.packet_memory().cast() }
    }

    fn descriptor(&self, ep: u8) -> &btable::BufferDescriptor {
        &self.buffer_table().0[ep as usize]
    }

    fn endpoint_register(&self, ep: u8) -> endpoint::EndpointRegister<'_> {
        endpoint::register(self.usb(), ep as usize)
    }

    /// Returns the packet memory offset of `buffer`
    ///
    /// The buffer must be in packet memory, beyond the buffer table.
    fn packet_offset(&self, buffer: &PacketBuffer) -> u32 {
        let base = self.peripherals.packet_memory() as usize;
        let addr = buffer.as_ptr() as usize;
        debug_assert!(
            addr >= base + core::mem::size_of::<btable::BufferTable>(),
            "packet buffer isn't in packet memory"
        );
        debug_assert!(addr - base <= u16::MAX as usize, "packet buffer out of range");
        addr.wrapping_sub(base) as u32
    }

    /// Place the buffer table at the start of packet memory, and clear
    /// interrupt flags
    ///
    /// Interrupts stay disabled. See [`enable_interrupts()`](Endpoints::enable_interrupts).
    pub fn initialize(&self) {
        let usb = self.usb();
        ral::write_reg!(usb, usb, BTABLE, BTABLE: 0);
        ral::write_reg!(usb, usb, ISTR, 0);
        ral::write_reg!(usb, usb, CNTR, 0);
        debug!("USB INITIALIZED");
    }

    /// Select the interrupts that drive the USB interrupt line
    ///
    /// A stream needs at least [`Interrupt::CTR`]. Your USB stack usually
    /// wants [`Interrupt::RESET`] as well.
    pub fn enable_interrupts(&self, interrupts: Interrupt) {
        let usb = self.usb();
        let keep = ral::read_reg!(usb, usb, CNTR) & !Interrupt::all().bits();
        ral::write_reg!(usb, usb, CNTR, keep | interrupts.bits());
    }

    /// Returns the currently enabled interrupts
    pub fn enabled_interrupts(&self) -> Interrupt {
        Interrupt::from_bits_truncate(ral::read_reg!(usb, self.usb(), CNTR))
    }

    /// Acknowledge and return the next transaction on an endpoint in `table`
    ///
    /// Endpoints without a handler, and every other interrupt flag, are left
    /// for your USB stack. Returns `None` when there's nothing left to handle.
    pub fn poll(&self, table: &EndpointTable<'_>) -> Option<Event> {
        let istr = Interrupt::from_bits_truncate(ral::read_reg!(usb, self.usb(), ISTR));
        if !istr.contains(Interrupt::CTR) {
            return None;
        }
        table.endpoints().find_map(|ep| self.acknowledge(ep))
    }

    /// Clear one completed transaction on `ep`, OUT first
    fn acknowledge(&self, ep: u8) -> Option<Event> {
        let epr = self.endpoint_register(ep);
        let current = ral::read_reg!(endpoint, &epr, CHEPR);

        if current & endpoint::CHEPR::CTR_RX::mask != 0 {
            ral::write_reg!(endpoint, &epr, CHEPR, ctr_clear(current, endpoint::CHEPR::CTR_RX::mask));
            Some(Event::Rx(ep))
        } else if current & endpoint::CHEPR::CTR_TX::mask != 0 {
            ral::write_reg!(endpoint, &epr, CHEPR, ctr_clear(current, endpoint::CHEPR::CTR_TX::mask));
            Some(Event::Tx(ep))
        } else {
            None
        }
    }

    /// Handle the stream endpoints' share of the USB interrupt
    ///
    /// Dispatches events to `table` until none remain. Call this from your
    /// USB interrupt handler, next to your USB stack's own poll.
    pub fn on_interrupt(&self, table: &EndpointTable<'_>) {
        while let Some(event) = self.poll(table) {
            if !table.dispatch(event) {
                trace!("UNHANDLED {}", event);
            }
        }
    }
}

impl<P: Peripherals> EndpointHal for Endpoints<P> {
    fn set_buffers(&self, ep: u8, rx: &PacketBuffer, tx: &PacketBuffer) {
        let bd = self.descriptor(ep);
        ral::write_reg!(btable, bd, TXBD, ADDR: self.packet_offset(tx), COUNT: 0);
        ral::write_reg!(
            btable,
            bd,
            RXBD,
            ADDR: self.packet_offset(rx),
            COUNT: 0,
            NUM_BLOCK: (MAX_PACKET_SIZE / 32 - 1) as u32,
            BLSIZE: BYTES_32
        );
    }

    fn configure_bulk(&self, ep: u8, rx: Status, tx: Status) {
        let epr = self.endpoint_register(ep);
        let current = ral::read_reg!(endpoint, &epr, CHEPR);

        let mut value = status_write(current, Some(rx), Some(tx));
        value &= !(endpoint::CHEPR::EA::mask
            | endpoint::CHEPR::UTYPE::mask
            | endpoint::CHEPR::EP_KIND::mask);
        value |= ((ep as u32) << endpoint::CHEPR::EA::offset)
            | (endpoint::CHEPR::UTYPE::RW::BULK << endpoint::CHEPR::UTYPE::offset);
        // Writing a set toggle bit flips it back to DATA0.
        value |= current & (endpoint::CHEPR::DTOG_RX::mask | endpoint::CHEPR::DTOG_TX::mask);

        ral::write_reg!(endpoint, &epr, CHEPR, value);
    }

    fn rx_count(&self, ep: u8) -> usize {
        ral::read_reg!(btable, self.descriptor(ep), RXBD, COUNT) as usize
    }

    fn rx_status(&self, ep: u8) -> Status {
        Status::from_bits(ral::read_reg!(endpoint, &self.endpoint_register(ep), CHEPR, STAT_RX))
    }

    fn set_rx_status(&self, ep: u8, status: Status) {
        let epr = self.endpoint_register(ep);
        let current = ral::read_reg!(endpoint, &epr, CHEPR);
        ral::write_reg!(endpoint, &epr, CHEPR, status_write(current, Some(status), None));
    }

    fn tx_status(&self, ep: u8) -> Status {
        Status::from_bits(ral::read_reg!(endpoint, &self.endpoint_register(ep), CHEPR, STAT_TX))
    }

    fn set_tx_status(&self, ep: u8, status: Status) {
        let epr = self.endpoint_register(ep);
        let current = ral::read_reg!(endpoint, &epr, CHEPR);
        ral::write_reg!(endpoint, &epr, CHEPR, status_write(current, None, Some(status)));
    }

    fn arm_tx(&self, ep: u8, tx: &PacketBuffer, len: usize) {
        debug_assert!(len <= MAX_PACKET_SIZE);
        ral::write_reg!(btable, self.descriptor(ep), TXBD, ADDR: self.packet_offset(tx), COUNT: len as u32);
        self.set_tx_status(ep, Status::Valid);
    }
}

#[cfg(test)]
mod tests {
    use super::{ctr_clear, status_write, Endpoints, Interrupt};
    use crate::{
        dispatch::{EndpointHandler, EndpointTable, Event},
        endpoint::{EndpointHal, Status},
        packet::PacketBuffer,
        ral::{btable::BufferTable, usb::RegisterBlock},
        Peripherals,
    };

    /// Packet memory: the buffer table, then one stream's buffers
    #[repr(C)]
    struct PacketMemory {
        table: BufferTable,
        rx: PacketBuffer,
        tx: PacketBuffer,
    }

    impl PacketMemory {
        fn new() -> Self {
            PacketMemory {
                table: BufferTable::new(),
                rx: PacketBuffer::new(),
                tx: PacketBuffer::new(),
            }
        }
    }

    struct Memory<'a> {
        usb: &'a RegisterBlock,
        pma: &'a PacketMemory,
    }

    unsafe impl Peripherals for Memory<'_> {
        fn usb(&self) -> *const () {
            (self.usb as *const RegisterBlock).cast()
        }
        fn packet_memory(&self) -> *const () {
            (self.pma as *const PacketMemory).cast()
        }
    }

    const STAT_RX: u32 = 12;
    const STAT_TX: u32 = 4;

    #[test]
    fn status_write_toggles_difference() {
        // RX NAK -> VALID toggles one bit; TX untouched.
        let current = (0b10 << STAT_RX) | (0b10 << STAT_TX) | 3;
        let value = status_write(current, Some(Status::Valid), None);
        assert_eq!(value, (0b01 << STAT_RX) | (1 << 15) | (1 << 7) | 3);

        // Same status writes no toggles.
        let value = status_write(current, Some(Status::Nak), Some(Status::Nak));
        assert_eq!(value, (1 << 15) | (1 << 7) | 3);
    }

    #[test]
    fn status_write_keeps_ctr_flags() {
        let current = (1 << 15) | (1 << 7) | (0b11 << STAT_TX);
        let value = status_write(current, None, Some(Status::Nak));
        assert_eq!(value, (1 << 15) | (1 << 7) | (0b01 << STAT_TX));
    }

    #[test]
    fn ctr_clear_only_clears_one() {
        let current = (1 << 15) | (1 << 7) | (0b11 << STAT_RX) | (1 << 14) | 2;
        assert_eq!(ctr_clear(current, 1 << 15), (1 << 7) | 2);
        assert_eq!(ctr_clear(current, 1 << 7), (1 << 15) | 2);
    }

    #[test]
    fn set_buffers() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });

        endpoints.set_buffers(1, &pma.rx, &pma.tx);
        // Buffer table is 64 bytes, then RX, then TX.
        assert_eq!(pma.table.0[1].TXBD.read(), 0x80);
        assert_eq!(pma.table.0[1].RXBD.read(), (1 << 31) | (1 << 26) | 0x40);
        assert_eq!(pma.table.0[0].RXBD.read(), 0);
    }

    #[test]
    fn configure_bulk_from_reset() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });

        endpoints.configure_bulk(2, Status::Valid, Status::Nak);
        assert_eq!(
            usb.CHEPR[2].read(),
            (1 << 15) | (0b11 << STAT_RX) | (1 << 7) | (0b10 << STAT_TX) | 2
        );
    }

    #[test]
    fn configure_bulk_resets_toggles() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });

        // Control type, RX VALID, TX VALID, both DTOGs set.
        usb.CHEPR[1].write((1 << 14) | (0b11 << STAT_RX) | (0b01 << 9) | (1 << 6) | (0b11 << STAT_TX) | 1);
        endpoints.configure_bulk(1, Status::Valid, Status::Nak);
        assert_eq!(
            usb.CHEPR[1].read(),
            (1 << 15) | (1 << 14) | (1 << 7) | (1 << 6) | (0b01 << STAT_TX) | 1
        );
    }

    #[test]
    fn statuses() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });

        usb.CHEPR[3].write((0b10 << STAT_RX) | (0b11 << STAT_TX) | 3);
        assert_eq!(endpoints.rx_status(3), Status::Nak);
        assert_eq!(endpoints.tx_status(3), Status::Valid);

        endpoints.set_rx_status(3, Status::Valid);
        assert_eq!(usb.CHEPR[3].read(), (1 << 15) | (0b01 << STAT_RX) | (1 << 7) | 3);
    }

    #[test]
    fn rx_count_and_arm_tx() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });
        endpoints.set_buffers(1, &pma.rx, &pma.tx);

        pma.table.0[1].RXBD.write(pma.table.0[1].RXBD.read() | (37 << 16));
        assert_eq!(endpoints.rx_count(1), 37);

        usb.CHEPR[1].write((0b10 << STAT_TX) | 1);
        endpoints.arm_tx(1, &pma.tx, 12);
        assert_eq!(pma.table.0[1].TXBD.read(), (12 << 16) | 0x80);
        assert_eq!(usb.CHEPR[1].read(), (1 << 15) | (1 << 7) | (0b01 << STAT_TX) | 1);
    }

    #[test]
    fn interrupts() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });

        usb.CNTR.write(0b11);
        endpoints.enable_interrupts(Interrupt::CTR | Interrupt::RESET);
        assert_eq!(usb.CNTR.read(), (1 << 15) | (1 << 10) | 0b11);
        assert_eq!(endpoints.enabled_interrupts(), Interrupt::CTR | Interrupt::RESET);

        endpoints.initialize();
        assert_eq!(usb.CNTR.read(), 0);
        assert!(endpoints.enabled_interrupts().is_empty());
    }

    struct Ignore;

    impl EndpointHandler for Ignore {
        fn on_tx(&self) {}
        fn on_rx(&self) {}
        fn on_reset(&self) {}
    }

    static IGNORE: Ignore = Ignore;

    #[test]
    fn poll_transactions() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });
        let table = EndpointTable::new().with(2, &IGNORE).with(5, &IGNORE);

        assert_eq!(endpoints.poll(&table), None);

        usb.ISTR.write(Interrupt::CTR.bits() | (1 << 4) | 2);
        usb.CHEPR[2].write((1 << 15) | (0b10 << STAT_RX) | 2);
        assert_eq!(endpoints.poll(&table), Some(Event::Rx(2)));
        assert_eq!(usb.CHEPR[2].read(), (1 << 7) | 2);
        usb.CHEPR[2].write(2);

        usb.ISTR.write(Interrupt::CTR.bits() | 5);
        usb.CHEPR[5].write((1 << 7) | (0b10 << STAT_TX) | 5);
        assert_eq!(endpoints.poll(&table), Some(Event::Tx(5)));
        assert_eq!(usb.CHEPR[5].read(), (1 << 15) | 5);

        usb.CHEPR[5].write(5);
        assert_eq!(endpoints.poll(&table), None);
    }

    #[test]
    fn control_endpoint_left_for_the_stack() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });
        let table = EndpointTable::new().with(1, &IGNORE);

        // A SETUP transaction on EP0.
        let setup = (1 << 15) | (1 << 11) | (0b01 << 9) | (0b10 << STAT_RX);
        usb.CHEPR[0].write(setup);
        usb.ISTR.write(Interrupt::CTR.bits() | (1 << 4));

        assert_eq!(endpoints.poll(&table), None);
        endpoints.on_interrupt(&table);
        assert_eq!(usb.CHEPR[0].read(), setup);
        assert_eq!(usb.ISTR.read(), Interrupt::CTR.bits() | (1 << 4));
    }

    #[test]
    fn registered_endpoint_found_behind_control_endpoint() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });
        let table = EndpointTable::new().with(1, &IGNORE);

        // EP_ID reports EP0, but EP1 also completed a transaction.
        usb.CHEPR[0].write((1 << 7) | (0b01 << 9));
        usb.CHEPR[1].write((1 << 15) | 1);
        usb.ISTR.write(Interrupt::CTR.bits());

        assert_eq!(endpoints.poll(&table), Some(Event::Rx(1)));
        assert_eq!(usb.CHEPR[1].read(), (1 << 7) | 1);

        // Plain memory keeps the 1 written to CTR_TX; the hardware wouldn't.
        usb.CHEPR[1].write(1);
        assert_eq!(endpoints.poll(&table), None);
        assert_eq!(usb.CHEPR[0].read(), (1 << 7) | (0b01 << 9));
    }

    #[test]
    fn reset_left_for_the_stack() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });
        let table = EndpointTable::new().with(1, &IGNORE);

        usb.ISTR.write(Interrupt::RESET.bits());
        assert_eq!(endpoints.poll(&table), None);
        endpoints.on_interrupt(&table);
        assert_eq!(usb.ISTR.read(), Interrupt::RESET.bits());
    }

    #[test]
    fn unregistered_endpoint_left_for_the_stack() {
        let usb = RegisterBlock::new();
        let pma = PacketMemory::new();
        let endpoints = Endpoints::new(Memory { usb: &usb, pma: &pma });
        let table = EndpointTable::new().with(1, &IGNORE);

        usb.CHEPR[3].write((1 << 15) | 3);
        usb.ISTR.write(Interrupt::CTR.bits() | 3);
        assert_eq!(endpoints.poll(&table), None);
        assert_eq!(usb.CHEPR[3].read(), (1 << 15) | 3);
    }
}
