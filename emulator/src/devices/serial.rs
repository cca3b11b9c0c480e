//! The serial line: a two-register-pair console device.
//!
//! The receiver side holds at most one unread byte at a time; `service`
//! refills it from the inbound ring, one byte per call, only once the
//! program has consumed the previous one. The transmitter side always
//! reports ready and pushes into the outbound ring.

use bitflags::bitflags;
use tracing::trace;

use crate::constants as C;

bitflags! {
    /// Status bits shared by the receiver and transmitter CSRs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LineCsr: C::Word {
        /// Receiver: a byte is waiting in the buffer. Transmitter: ready.
        const DONE = 0o200;
        /// Kept for the program's benefit; no interrupts are ever raised.
        const INT_ENABLE = 0o100;
    }
}

/// Capacity of the inbound (transport to CPU) ring.
const RX_CAPACITY: usize = 1024;
/// Capacity of the outbound (CPU to transport) ring.
const TX_CAPACITY: usize = 4096;

/// A fixed-capacity byte ring. When full, pushes are dropped; that is the
/// documented overflow policy for both directions of the line.
struct Ring {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.len == self.buf.len() {
            return false;
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = byte;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.buf[self.head];
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(byte)
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

pub struct Serial {
    rcsr: LineCsr,
    rbuf: u8,
    xcsr: LineCsr,
    rx: Ring,
    tx: Ring,
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl Serial {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rcsr: LineCsr::empty(),
            rbuf: 0,
            // The transmitter never exerts backpressure toward the CPU.
            xcsr: LineCsr::DONE,
            rx: Ring::new(RX_CAPACITY),
            tx: Ring::new(TX_CAPACITY),
        }
    }

    /// Reset to power-up state, dropping any buffered bytes.
    pub fn reset(&mut self) {
        self.rcsr = LineCsr::empty();
        self.rbuf = 0;
        self.xcsr = LineCsr::DONE;
        self.rx.clear();
        self.tx.clear();
    }

    /// Read a device register. Reading the receiver buffer consumes the
    /// byte: the done bit is cleared and stays clear until `service` moves
    /// the next byte in.
    pub fn read_register(&mut self, address: C::Address) -> C::Word {
        match address {
            C::RCSR => self.rcsr.bits(),
            C::RBUF => {
                self.rcsr.remove(LineCsr::DONE);
                C::Word::from(self.rbuf)
            }
            C::XCSR => self.xcsr.bits(),
            // The transmit buffer is write-only; it reads back as zero.
            _ => 0,
        }
    }

    /// Write a device register. Only the interrupt-enable bit of each CSR is
    /// program-writable; writing the transmit buffer enqueues the byte
    /// (masked to 7 bits), dropping it if the outbound ring is full.
    pub fn write_register(&mut self, address: C::Address, value: C::Word) {
        match address {
            C::RCSR => self
                .rcsr
                .set(LineCsr::INT_ENABLE, value & LineCsr::INT_ENABLE.bits() != 0),
            C::XCSR => self
                .xcsr
                .set(LineCsr::INT_ENABLE, value & LineCsr::INT_ENABLE.bits() != 0),
            #[allow(clippy::cast_possible_truncation)]
            C::XBUF => {
                let byte = (value & 0x7F) as u8;
                if !self.tx.push(byte) {
                    trace!("outbound ring full, dropping byte");
                }
            }
            _ => {}
        }
    }

    /// Enqueue a byte arriving from the transport. Dropped if the inbound
    /// ring is full.
    pub fn input_byte(&mut self, byte: u8) {
        if !self.rx.push(byte) {
            trace!("inbound ring full, dropping byte");
        }
    }

    #[must_use]
    pub fn has_output(&self) -> bool {
        !self.tx.is_empty()
    }

    pub fn read_output(&mut self) -> Option<u8> {
        self.tx.pop()
    }

    /// True while an unread byte sits in the receiver buffer.
    #[must_use]
    pub fn receiver_done(&self) -> bool {
        self.rcsr.contains(LineCsr::DONE)
    }

    /// Move at most one byte from the inbound ring into the receiver
    /// buffer, and only if the previous byte has been consumed.
    pub fn service(&mut self) {
        if self.rcsr.contains(LineCsr::DONE) {
            return;
        }
        if let Some(byte) = self.rx.pop() {
            self.rbuf = byte;
            self.rcsr.insert(LineCsr::DONE);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::constants as C;

    #[test]
    fn reading_the_buffer_clears_done() {
        let mut serial = Serial::new();
        serial.input_byte(b'A');
        serial.service();
        assert_eq!(serial.read_register(C::RCSR) & 0o200, 0o200);
        assert_eq!(serial.read_register(C::RBUF), C::Word::from(b'A'));
        assert_eq!(serial.read_register(C::RCSR) & 0o200, 0);
    }

    #[test]
    fn second_byte_is_held_until_the_first_is_consumed() {
        let mut serial = Serial::new();
        serial.input_byte(1);
        serial.input_byte(2);
        serial.service();
        serial.service();
        // done must not be re-posted over an unread byte
        assert_eq!(serial.read_register(C::RBUF), 1);
        serial.service();
        assert!(serial.receiver_done());
        assert_eq!(serial.read_register(C::RBUF), 2);
    }

    #[test]
    fn transmitter_is_always_ready() {
        let mut serial = Serial::new();
        assert_eq!(serial.read_register(C::XCSR) & 0o200, 0o200);
        for _ in 0..10_000 {
            serial.write_register(C::XBUF, C::Word::from(b'x'));
        }
        assert_eq!(serial.read_register(C::XCSR) & 0o200, 0o200);
    }

    #[test]
    fn transmit_masks_to_seven_bits() {
        let mut serial = Serial::new();
        serial.write_register(C::XBUF, 0o600 | C::Word::from(b'A'));
        assert_eq!(serial.read_output(), Some(b'A'));
    }

    #[test]
    fn full_outbound_ring_drops_the_newest_byte() {
        let mut serial = Serial::new();
        for i in 0..5000u32 {
            #[allow(clippy::cast_possible_truncation)]
            serial.write_register(C::XBUF, (i & 0x7F) as C::Word);
        }
        // Capacity bytes survive; the first one is untouched by the drops.
        assert_eq!(serial.read_output(), Some(0));
        let mut count = 1;
        while serial.read_output().is_some() {
            count += 1;
        }
        assert_eq!(count, 4096);
    }

    #[test]
    fn reset_drops_buffered_bytes() {
        let mut serial = Serial::new();
        serial.input_byte(9);
        serial.write_register(C::XBUF, 9);
        serial.reset();
        assert!(!serial.has_output());
        serial.service();
        assert!(!serial.receiver_done());
    }
}
