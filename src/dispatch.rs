//! Endpoint event dispatch
//!
//! The USB interrupt is shared by all endpoints. The HAL decodes it into
//! [`Event`]s, and an [`EndpointTable`] routes each event to the handler
//! registered for that endpoint.

use crate::MAX_ENDPOINTS;

/// Something happened on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Event {
    /// An IN transaction completed on the endpoint
    Tx(u8),
    /// An OUT transaction completed on the endpoint
    Rx(u8),
    /// The host reset the bus
    Reset,
}

/// Callbacks for one bulk endpoint pair
///
/// The dispatcher never re-enters a handler for the same endpoint before the
/// previous call returns. Handlers run in interrupt context: no blocking, no
/// allocation.
pub trait EndpointHandler {
    /// The previous IN packet was sent
    fn on_tx(&self);
    /// An OUT packet was received
    fn on_rx(&self);
    /// The bus, or the interface, was reset
    fn on_reset(&self);
}

/// A table of endpoint handlers
///
/// Build it once, in a `static`, with [`new`](EndpointTable::new) and
/// [`with`](EndpointTable::with). Registration mistakes are then compile
/// time errors.
///
/// ```
/// use usb_stream::{EndpointHandler, EndpointTable, Event};
///
/// struct Blinky;
/// impl EndpointHandler for Blinky {
///     fn on_tx(&self) {}
///     fn on_rx(&self) {}
///     fn on_reset(&self) {}
/// }
///
/// static BLINKY: Blinky = Blinky;
/// static TABLE: EndpointTable = EndpointTable::new().with(2, &BLINKY);
///
/// assert!(TABLE.dispatch(Event::Rx(2)));
/// assert!(!TABLE.dispatch(Event::Rx(3)));
/// ```
pub struct EndpointTable<'a> {
    handlers: [Option<&'a (dyn EndpointHandler + Sync)>; MAX_ENDPOINTS],
}

impl<'a> EndpointTable<'a> {
    /// An empty table
    pub const fn new() -> Self {
        EndpointTable {
            handlers: [None; MAX_ENDPOINTS],
        }
    }

    /// Register `handler` for `endpoint`
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` is the control endpoint, or out of range, or
    /// already has a handler.
    pub const fn with(mut self, endpoint: u8, handler: &'a (dyn EndpointHandler + Sync)) -> Self {
        let idx = endpoint as usize;
        assert!(idx != 0, "endpoint 0 belongs to the control pipe");
        assert!(idx < MAX_ENDPOINTS, "endpoint index out of range");
        assert!(self.handlers[idx].is_none(), "endpoint already has a handler");
        self.handlers[idx] = Some(handler);
        self
    }

    /// Returns the handler for `endpoint`, if there is one
    pub fn handler(&self, endpoint: u8) -> Option<&'a (dyn EndpointHandler + Sync)> {
        self.handlers.get(endpoint as usize).copied().flatten()
    }

    /// Returns the endpoints that have a handler, in ascending order
    pub fn endpoints(&self) -> impl Iterator<Item = u8> + '_ {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, handler)| handler.is_some())
            .map(|(endpoint, _)| endpoint as u8)
    }

    /// Route `event` to its handler, or handlers
    ///
    /// Returns `false` if no handler wanted the event.
    pub fn dispatch(&self, event: Event) -> bool {
        match event {
            Event::Reset => {
                let mut handled = false;
                for handler in self.handlers.iter().flatten() {
                    handler.on_reset();
                    handled = true;
                }
                handled
            }
            Event::Tx(endpoint) => {
                let Some(handler) = self.handler(endpoint) else {
                    warn!("EP{} IN event without a handler", endpoint);
                    return false;
                };
                handler.on_tx();
                true
            }
            Event::Rx(endpoint) => {
                let Some(handler) = self.handler(endpoint) else {
                    warn!("EP{} OUT event without a handler", endpoint);
                    return false;
                };
                handler.on_rx();
                true
            }
        }
    }
}

impl Default for EndpointTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{EndpointHandler, EndpointTable, Event};
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        tx: AtomicUsize,
        rx: AtomicUsize,
        reset: AtomicUsize,
    }

    impl Calls {
        fn counts(&self) -> (usize, usize, usize) {
            (
                self.tx.load(Ordering::SeqCst),
                self.rx.load(Ordering::SeqCst),
                self.reset.load(Ordering::SeqCst),
            )
        }
    }

    impl EndpointHandler for Calls {
        fn on_tx(&self) {
            self.tx.fetch_add(1, Ordering::SeqCst);
        }
        fn on_rx(&self) {
            self.rx.fetch_add(1, Ordering::SeqCst);
        }
        fn on_reset(&self) {
            self.reset.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn routes_by_endpoint() {
        let one = Calls::default();
        let three = Calls::default();
        let table = EndpointTable::new().with(1, &one).with(3, &three);

        assert!(table.dispatch(Event::Tx(1)));
        assert!(table.dispatch(Event::Rx(3)));
        assert!(table.dispatch(Event::Rx(3)));
        assert_eq!(one.counts(), (1, 0, 0));
        assert_eq!(three.counts(), (0, 2, 0));
    }

    #[test]
    fn reset_reaches_everyone() {
        let one = Calls::default();
        let two = Calls::default();
        let table = EndpointTable::new().with(1, &one).with(2, &two);

        assert!(table.dispatch(Event::Reset));
        assert_eq!(one.counts(), (0, 0, 1));
        assert_eq!(two.counts(), (0, 0, 1));
    }

    #[test]
    fn unregistered_endpoints() {
        let table = EndpointTable::new();
        assert!(!table.dispatch(Event::Reset));
        assert!(!table.dispatch(Event::Tx(1)));
        assert!(!table.dispatch(Event::Rx(200)));
        assert!(table.handler(0).is_none());
        assert_eq!(table.endpoints().count(), 0);
    }

    #[test]
    fn lists_registered_endpoints() {
        let calls = Calls::default();
        let table = EndpointTable::new().with(5, &calls).with(2, &calls);
        let mut endpoints = table.endpoints();
        assert_eq!(endpoints.next(), Some(2));
        assert_eq!(endpoints.next(), Some(5));
        assert_eq!(endpoints.next(), None);
    }

    #[test]
    #[should_panic]
    fn rejects_control_endpoint() {
        let calls = Calls::default();
        let _ = EndpointTable::new().with(0, &calls);
    }

    #[test]
    #[should_panic]
    fn rejects_double_registration() {
        let calls = Calls::default();
        let _ = EndpointTable::new().with(4, &calls).with(4, &calls);
    }
}
