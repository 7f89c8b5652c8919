//! Byte queues and their notification hooks
//!
//! A stream talks to the rest of the firmware through two byte queues. It
//! writes received bytes into one, and reads bytes to transmit from the
//! other. Each queue has exactly one writer, the [`Producer`], and one
//! reader, the [`Consumer`]. When one side changes the queue, the queue
//! notifies the other side:
//!
//! - reading frees space, so the queue calls [`Producer::space_available`].
//! - writing adds data, so the queue calls [`Consumer::data_available`].
//!
//! The notifications are synchronous. They run in whatever context changed
//! the queue, which might be an interrupt handler, after the change is
//! published. Keep them short. A hook may work its own end of the queue, but
//! it must never touch the other end.
//!
//! [`Queue`] is a [`ByteQueue`] built on a `heapless` deque that supports the
//! hooks. You may supply your own queue, as long as it upholds the same
//! contract.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use heapless::Deque;

/// A bounded FIFO of bytes
///
/// Implementations must be safe to call from one writing context and one
/// reading context at the same time, without tearing.
pub trait ByteQueue {
    /// Append as many of `bytes` as fit
    ///
    /// Returns the number of bytes written.
    fn write(&self, bytes: &[u8]) -> usize;
    /// Remove up to `buffer.len()` bytes from the front of the queue
    ///
    /// Returns the number of bytes read.
    fn read(&self, buffer: &mut [u8]) -> usize;
    /// The number of bytes that can be written right now
    fn free_space(&self) -> usize;
    /// The number of bytes that can be read right now
    fn available(&self) -> usize;
    /// The total number of bytes the queue holds when full
    fn capacity(&self) -> usize {
        self.free_space() + self.available()
    }
}

/// The writing side of a queue
pub trait Producer {
    /// The consumer removed `freed` bytes from the queue
    fn space_available(&self, freed: usize);
}

/// The reading side of a queue
pub trait Consumer {
    /// The producer added `added` bytes to the queue
    fn data_available(&self, added: usize);
}

/// A bounded byte queue with notification hooks
///
/// Each operation holds a critical section only while it moves bytes. Hooks
/// run after the critical section ends.
///
/// ```
/// use usb_stream::{ByteQueue, Queue};
///
/// static QUEUE: Queue<'static, 8> = Queue::new();
///
/// assert_eq!(QUEUE.write(b"hello, world"), 8);
/// let mut buffer = [0; 5];
/// assert_eq!(QUEUE.read(&mut buffer), 5);
/// assert_eq!(&buffer, b"hello");
/// assert_eq!(QUEUE.available(), 3);
/// ```
pub struct Queue<'a, const N: usize> {
    bytes: Mutex<RefCell<Deque<u8, N>>>,
    producer: Mutex<Cell<Option<&'a (dyn Producer + Sync)>>>,
    consumer: Mutex<Cell<Option<&'a (dyn Consumer + Sync)>>>,
}

impl<'a, const N: usize> Queue<'a, N> {
    /// Create an empty queue
    ///
    /// # Panics
    ///
    /// Panics if `N` is zero. In a `static` initializer, that's a compile
    /// time error.
    pub const fn new() -> Self {
        assert!(N > 0, "a queue must hold at least one byte");
        Queue {
            bytes: Mutex::new(RefCell::new(Deque::new())),
            producer: Mutex::new(Cell::new(None)),
            consumer: Mutex::new(Cell::new(None)),
        }
    }

    /// Register the writer that's notified when space frees up
    ///
    /// Replaces any previously-attached producer.
    pub fn attach_producer(&self, producer: &'a (dyn Producer + Sync)) {
        critical_section::with(|cs| self.producer.borrow(cs).set(Some(producer)));
    }

    /// Register the reader that's notified when data arrives
    ///
    /// Replaces any previously-attached consumer.
    pub fn attach_consumer(&self, consumer: &'a (dyn Consumer + Sync)) {
        critical_section::with(|cs| self.consumer.borrow(cs).set(Some(consumer)));
    }

    fn producer(&self) -> Option<&'a (dyn Producer + Sync)> {
        critical_section::with(|cs| self.producer.borrow(cs).get())
    }

    fn consumer(&self) -> Option<&'a (dyn Consumer + Sync)> {
        critical_section::with(|cs| self.consumer.borrow(cs).get())
    }

    fn len(&self) -> usize {
        critical_section::with(|cs| self.bytes.borrow_ref(cs).len())
    }
}

impl<const N: usize> Default for Queue<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ByteQueue for Queue<'_, N> {
    fn write(&self, bytes: &[u8]) -> usize {
        let count = critical_section::with(|cs| {
            let mut queue = self.bytes.borrow_ref_mut(cs);
            bytes
                .iter()
                .take_while(|&&byte| queue.push_back(byte).is_ok())
                .count()
        });

        if count > 0 {
            if let Some(consumer) = self.consumer() {
                consumer.data_available(count);
            }
        }
        count
    }

    fn read(&self, buffer: &mut [u8]) -> usize {
        let count = critical_section::with(|cs| {
            let mut queue = self.bytes.borrow_ref_mut(cs);
            let mut count = 0;
            for slot in buffer.iter_mut() {
                let Some(byte) = queue.pop_front() else {
                    break;
                };
                *slot = byte;
                count += 1;
            }
            count
        });

        if count > 0 {
            if let Some(producer) = self.producer() {
                producer.space_available(count);
            }
        }
        count
    }

    fn free_space(&self) -> usize {
        N - self.len()
    }

    fn available(&self) -> usize {
        self.len()
    }

    fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteQueue, Consumer, Producer, Queue};
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        total: AtomicUsize,
    }

    impl Counter {
        fn record(&self, count: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.total.fetch_add(count, Ordering::SeqCst);
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
        fn total(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }
    }

    impl Producer for Counter {
        fn space_available(&self, freed: usize) {
            self.record(freed);
        }
    }

    impl Consumer for Counter {
        fn data_available(&self, added: usize) {
            self.record(added);
        }
    }

    #[test]
    fn empty_queue() {
        let queue: Queue<16> = Queue::new();
        assert_eq!(queue.available(), 0);
        assert_eq!(queue.free_space(), 16);
        assert_eq!(queue.capacity(), 16);
        let mut buffer = [0; 4];
        assert_eq!(queue.read(&mut buffer), 0);
    }

    #[test]
    fn preserves_order() {
        let queue: Queue<16> = Queue::new();
        assert_eq!(queue.write(&[1, 2, 3]), 3);
        assert_eq!(queue.write(&[4, 5]), 2);
        assert_eq!(queue.available(), 5);
        assert_eq!(queue.free_space(), 11);

        let mut buffer = [0; 8];
        assert_eq!(queue.read(&mut buffer), 5);
        assert_eq!(&buffer[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn truncates_when_full() {
        let queue: Queue<4> = Queue::new();
        assert_eq!(queue.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(queue.free_space(), 0);
        assert_eq!(queue.write(&[7]), 0);

        let mut buffer = [0; 8];
        assert_eq!(queue.read(&mut buffer), 4);
        assert_eq!(&buffer[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn wraps_around() {
        let queue: Queue<5> = Queue::new();
        let mut expected = 0u8;
        let mut next = 0u8;
        // Enough iterations to wrap the deque many times.
        for round in 0..50 {
            let chunk: [u8; 3] = core::array::from_fn(|_| {
                next = next.wrapping_add(1);
                next
            });
            assert_eq!(queue.write(&chunk), 3, "round {round}");
            let mut buffer = [0; 3];
            assert_eq!(queue.read(&mut buffer), 3);
            for byte in buffer {
                expected = expected.wrapping_add(1);
                assert_eq!(byte, expected);
            }
        }
        assert_eq!(queue.available(), 0);
    }

    #[test]
    fn full_queue_after_wraparound() {
        let queue: Queue<4> = Queue::new();
        let mut buffer = [0; 4];
        queue.write(&[0; 3]);
        queue.read(&mut buffer[..3]);
        assert_eq!(queue.write(&[9, 8, 7, 6]), 4);
        assert_eq!(queue.free_space(), 0);
        assert_eq!(queue.available(), 4);
        assert_eq!(queue.read(&mut buffer), 4);
        assert_eq!(buffer, [9, 8, 7, 6]);
    }

    #[test]
    fn notifies_consumer_on_write() {
        let consumer = Counter::default();
        let queue: Queue<8> = Queue::new();
        queue.attach_consumer(&consumer);

        queue.write(&[1, 2, 3]);
        assert_eq!(consumer.calls(), 1);
        assert_eq!(consumer.total(), 3);

        // Nothing written, nothing to notify.
        queue.write(&[]);
        queue.write(&[0; 8]);
        assert_eq!(consumer.calls(), 2);
        assert_eq!(consumer.total(), 8);
        queue.write(&[1]);
        assert_eq!(consumer.calls(), 2);
    }

    #[test]
    fn notifies_producer_on_read() {
        let producer = Counter::default();
        let queue: Queue<8> = Queue::new();
        queue.attach_producer(&producer);

        let mut buffer = [0; 8];
        queue.read(&mut buffer);
        assert_eq!(producer.calls(), 0);

        queue.write(&[1, 2, 3, 4]);
        queue.read(&mut buffer[..2]);
        queue.read(&mut buffer);
        assert_eq!(producer.calls(), 2);
        assert_eq!(producer.total(), 4);
    }
}
