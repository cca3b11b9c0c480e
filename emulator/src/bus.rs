//! The address space: a flat byte store plus the I/O page.
//!
//! [`Memory`] is plain storage with no special cases. [`Bus`] wraps it
//! together with the devices and routes every access falling inside the
//! reserved register range to the owning device, so device registers read
//! and write like ordinary memory cells from the program's point of view.

use thiserror::Error;
use tracing::trace;

use crate::constants as C;
use crate::devices::{Disk, Serial};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The given address falls outside the configured store
    #[error("address {0:#o} is out of range")]
    OutOfRange(C::Address),

    /// The requested store size is not representable
    #[error("invalid memory size {0} (must be even, between 64 KiB and 4 MiB)")]
    InvalidSize(usize),

    /// A bulk load would run past the end of the store
    #[error("image of {len} bytes does not fit at {start:#o}")]
    ImageTooLarge { start: C::Address, len: usize },
}

type Result<T> = std::result::Result<T, BusError>;

/// Holds the byte store of the machine.
///
/// Words are little-endian. Word accesses at odd addresses have bit 0 of the
/// address masked off; this truncation is the fixed policy for unaligned
/// access and is relied on by the CPU.
pub struct Memory {
    inner: Vec<u8>,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            inner: vec![0; C::DEFAULT_MEMORY_SIZE],
        }
    }
}

impl Memory {
    /// Allocate a store of the given size.
    ///
    /// # Errors
    ///
    /// Fails if the size is odd or outside the 64 KiB – 4 MiB range.
    pub fn new(size: usize) -> Result<Self> {
        if size % 2 != 0 || !(C::MIN_MEMORY_SIZE..=C::MAX_MEMORY_SIZE).contains(&size) {
            return Err(BusError::InvalidSize(size));
        }
        Ok(Self {
            inner: vec![0; size],
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.len()
    }

    /// Read a byte.
    ///
    /// # Errors
    ///
    /// Fails if the address is out of range.
    pub fn read_byte(&self, address: C::Address) -> Result<u8> {
        self.inner
            .get(address as usize)
            .copied()
            .ok_or(BusError::OutOfRange(address))
    }

    /// Write a byte.
    ///
    /// # Errors
    ///
    /// Fails if the address is out of range.
    pub fn write_byte(&mut self, address: C::Address, value: u8) -> Result<()> {
        let cell = self
            .inner
            .get_mut(address as usize)
            .ok_or(BusError::OutOfRange(address))?;
        *cell = value;
        Ok(())
    }

    /// Read a word. Odd addresses are truncated to the word boundary below.
    ///
    /// # Errors
    ///
    /// Fails if the address is out of range.
    pub fn read_word(&self, address: C::Address) -> Result<C::Word> {
        let address = address & !1;
        let lo = self.read_byte(address)?;
        let hi = self.read_byte(address + 1)?;
        Ok(C::Word::from_le_bytes([lo, hi]))
    }

    /// Write a word. Odd addresses are truncated to the word boundary below.
    ///
    /// # Errors
    ///
    /// Fails if the address is out of range.
    pub fn write_word(&mut self, address: C::Address, value: C::Word) -> Result<()> {
        let address = address & !1;
        let [lo, hi] = value.to_le_bytes();
        self.write_byte(address, lo)?;
        self.write_byte(address + 1, hi)
    }

    /// Copy a raw image into the store starting at `start`.
    ///
    /// No header or checksum is expected; the buffer is copied as-is.
    ///
    /// # Errors
    ///
    /// Fails if the image would run past the end of the store.
    pub fn load_image(&mut self, data: &[u8], start: C::Address) -> Result<()> {
        let start = start as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= self.inner.len())
            .ok_or(BusError::ImageTooLarge {
                start: start as C::Address,
                len: data.len(),
            })?;
        self.inner[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// The system bus: the byte store plus both devices.
///
/// Accesses inside [`C::IO_BASE`]`..=`[`C::IO_TOP`] are dispatched to the
/// device owning the register; everything else goes straight to [`Memory`].
/// Registers nobody claims read as zero and swallow writes. The disk is
/// optional so the machine can run without a backing file (self-test mode).
pub struct Bus {
    pub mem: Memory,
    pub serial: Serial,
    pub disk: Option<Disk>,
}

impl Bus {
    #[must_use]
    pub fn new(mem: Memory, serial: Serial, disk: Option<Disk>) -> Self {
        Self { mem, serial, disk }
    }

    fn is_io(address: C::Address) -> bool {
        (C::IO_BASE..=C::IO_TOP).contains(&(address & !1))
    }

    fn read_io(&mut self, address: C::Address) -> C::Word {
        match (address, &mut self.disk) {
            (C::RCSR | C::RBUF | C::XCSR | C::XBUF, _) => self.serial.read_register(address),
            (C::RKDS | C::RKER | C::RKCS | C::RKWC | C::RKBA | C::RKDA, Some(disk)) => {
                disk.read_register(address)
            }
            _ => {
                trace!(address = format_args!("{address:#o}"), "read of unassigned I/O register");
                0
            }
        }
    }

    fn write_io(&mut self, address: C::Address, value: C::Word) {
        match (address, &mut self.disk) {
            (C::RCSR | C::RBUF | C::XCSR | C::XBUF, _) => {
                self.serial.write_register(address, value);
            }
            (C::RKDS | C::RKER | C::RKCS | C::RKWC | C::RKBA | C::RKDA, Some(disk)) => {
                disk.write_register(address, value, &mut self.mem);
            }
            _ => {
                trace!(address = format_args!("{address:#o}"), "write to unassigned I/O register");
            }
        }
    }

    /// Read a word, dispatching to devices inside the I/O page.
    ///
    /// # Errors
    ///
    /// Fails if the address is outside the store.
    pub fn read_word(&mut self, address: C::Address) -> Result<C::Word> {
        let address = address & !1;
        if Self::is_io(address) {
            Ok(self.read_io(address))
        } else {
            self.mem.read_word(address)
        }
    }

    /// Write a word, dispatching to devices inside the I/O page.
    ///
    /// # Errors
    ///
    /// Fails if the address is outside the store.
    pub fn write_word(&mut self, address: C::Address, value: C::Word) -> Result<()> {
        let address = address & !1;
        if Self::is_io(address) {
            self.write_io(address, value);
            Ok(())
        } else {
            self.mem.write_word(address, value)
        }
    }

    /// Read a byte. In the I/O page this reads the register and selects the
    /// addressed half, so byte-width polling of status registers works.
    ///
    /// # Errors
    ///
    /// Fails if the address is outside the store.
    pub fn read_byte(&mut self, address: C::Address) -> Result<u8> {
        if Self::is_io(address) {
            let word = self.read_io(address & !1);
            let [lo, hi] = word.to_le_bytes();
            Ok(if address & 1 == 0 { lo } else { hi })
        } else {
            self.mem.read_byte(address)
        }
    }

    /// Write a byte. In the I/O page the byte lands in the addressed half of
    /// the register; the other half is written back unchanged.
    ///
    /// # Errors
    ///
    /// Fails if the address is outside the store.
    pub fn write_byte(&mut self, address: C::Address, value: u8) -> Result<()> {
        if Self::is_io(address) {
            let word = self.read_io(address & !1);
            let [lo, hi] = word.to_le_bytes();
            let word = if address & 1 == 0 {
                C::Word::from_le_bytes([value, hi])
            } else {
                C::Word::from_le_bytes([lo, value])
            };
            self.write_io(address & !1, word);
            Ok(())
        } else {
            self.mem.write_byte(address, value)
        }
    }

    /// Reset both devices, as the RESET instruction does.
    pub fn reset_devices(&mut self) {
        self.serial.reset();
        if let Some(disk) = &mut self.disk {
            disk.reset();
        }
    }
}
