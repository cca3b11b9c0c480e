//! The disk controller: six registers over a flat image file.
//!
//! Every function runs synchronously at the moment the control/status
//! register is written with its GO bit set, so polling the controller is
//! free: by the time the program can look at the done bit, the transfer has
//! already happened.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, error};

use crate::bus::Memory;
use crate::constants as C;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("cannot open disk image {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

bitflags! {
    /// Control/status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlStatus: C::Word {
        const GO         = 0o000_001;
        const FUNCTION   = 0o000_016;
        /// Extends the 16-bit bus address register to 18 bits.
        const MEM_EXT    = 0o000_060;
        const INT_ENABLE = 0o000_100;
        const DONE       = 0o000_200;
    }
}

bitflags! {
    /// Error register bits. Accumulated until the next controller reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorReg: C::Word {
        /// Sector field beyond the geometry
        const NXS  = 0o000_040;
        /// Cylinder field beyond the geometry
        const NXC  = 0o000_100;
        /// Backing file I/O failure mid-transfer
        const HARD = 0o100_000;
    }
}

/// Drive-ready pattern presented in the drive status register.
const DRIVE_READY: C::Word = 1 << 14;

/// Controller functions, encoded in bits 1–3 of the CSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    ControlReset,
    Write,
    Read,
    WriteCheck,
    Seek,
    ReadCheck,
    DriveReset,
    WriteLock,
}

impl Function {
    fn from_csr(csr: ControlStatus) -> Self {
        match (csr.bits() >> 1) & 7 {
            0 => Function::ControlReset,
            1 => Function::Write,
            2 => Function::Read,
            3 => Function::WriteCheck,
            4 => Function::Seek,
            5 => Function::ReadCheck,
            6 => Function::DriveReset,
            _ => Function::WriteLock,
        }
    }
}

pub struct Disk {
    file: File,
    rkds: C::Word,
    rker: ErrorReg,
    rkcs: ControlStatus,
    rkwc: C::Word,
    rkba: C::Word,
    rkda: C::Word,
}

impl Disk {
    /// Open the backing file, creating and zero-filling it to the full
    /// geometry size if absent or short.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened, created or sized; this is fatal
    /// at startup.
    pub fn open(path: &Path) -> Result<Self, DiskError> {
        let err = |source| DiskError::Open {
            path: path.to_owned(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(err)?;
        let len = file.metadata().map_err(err)?.len();
        if len < C::DISK_SIZE {
            file.set_len(C::DISK_SIZE).map_err(err)?;
        }
        debug!(path = %path.display(), "disk image attached");
        Ok(Self {
            file,
            rkds: DRIVE_READY,
            rker: ErrorReg::empty(),
            rkcs: ControlStatus::DONE,
            rkwc: 0,
            rkba: 0,
            rkda: 0,
        })
    }

    /// Reset the controller, as the CPU RESET instruction does.
    pub fn reset(&mut self) {
        self.rker = ErrorReg::empty();
        self.rkds = DRIVE_READY;
        self.rkcs = ControlStatus::DONE;
        self.rkwc = 0;
        self.rkba = 0;
        self.rkda = 0;
    }

    #[must_use]
    pub fn read_register(&self, address: C::Address) -> C::Word {
        match address {
            C::RKDS => self.rkds,
            C::RKER => self.rker.bits(),
            C::RKCS => self.rkcs.bits(),
            C::RKWC => self.rkwc,
            C::RKBA => self.rkba,
            C::RKDA => self.rkda,
            _ => 0,
        }
    }

    /// Write a device register. A CSR write with GO set executes the
    /// encoded function immediately; there is nothing asynchronous here.
    pub fn write_register(&mut self, address: C::Address, value: C::Word, mem: &mut Memory) {
        match address {
            C::RKER | C::RKDS => {} // read-only
            C::RKWC => self.rkwc = value,
            C::RKBA => self.rkba = value,
            C::RKDA => self.rkda = value,
            C::RKCS => {
                self.rkcs = ControlStatus::from_bits_truncate(value);
                if self.rkcs.contains(ControlStatus::GO) {
                    self.execute(mem);
                }
            }
            _ => {}
        }
    }

    /// A periodic poll. All transfers complete inline at register-write
    /// time, so there is never anything to do.
    pub fn service(&mut self) {}

    /// Word count is held as its two's-complement negative; zero encodes a
    /// full 65536-word transfer.
    fn transfer_words(&self) -> u32 {
        if self.rkwc == 0 {
            65536
        } else {
            u32::from(0u16.wrapping_sub(self.rkwc))
        }
    }

    /// Bus address extended to 18 bits by the CSR extension bits.
    fn bus_address(&self) -> C::Address {
        let ext = C::Address::from((self.rkcs & ControlStatus::MEM_EXT).bits() >> 4);
        (ext << 16) | C::Address::from(self.rkba)
    }

    /// Decompose the disk address register; `None` if outside the geometry.
    fn byte_offset(&mut self) -> Option<u64> {
        let sector = u32::from(self.rkda) & 0o17;
        let surface = (u32::from(self.rkda) >> 4) & 1;
        let cylinder = u32::from(self.rkda) >> 5;
        if sector >= C::SECTORS {
            self.rker.insert(ErrorReg::NXS);
            return None;
        }
        if cylinder >= C::CYLINDERS {
            self.rker.insert(ErrorReg::NXC);
            return None;
        }
        let linear = (cylinder * C::SURFACES + surface) * C::SECTORS + sector;
        Some(u64::from(linear) * u64::from(C::SECTOR_SIZE))
    }

    fn execute(&mut self, mem: &mut Memory) {
        let function = Function::from_csr(self.rkcs);
        debug!(?function, rkda = self.rkda, rkba = self.rkba, "disk function");
        match function {
            Function::ControlReset => {
                self.rker = ErrorReg::empty();
                self.rkds = DRIVE_READY;
            }
            Function::Read => {
                if let Some(offset) = self.byte_offset() {
                    if let Err(e) = self.read_into(mem, offset) {
                        error!("disk read failed: {e}");
                        self.rker.insert(ErrorReg::HARD);
                    }
                }
            }
            Function::Write => {
                if let Some(offset) = self.byte_offset() {
                    if let Err(e) = self.write_from(mem, offset) {
                        error!("disk write failed: {e}");
                        self.rker.insert(ErrorReg::HARD);
                    }
                }
            }
            // Accepted for compatibility; they complete immediately with
            // done set and move no data.
            Function::WriteCheck
            | Function::Seek
            | Function::ReadCheck
            | Function::DriveReset
            | Function::WriteLock => {}
        }
        self.rkcs.remove(ControlStatus::GO);
        self.rkcs.insert(ControlStatus::DONE);
        self.rkwc = 0;
    }

    /// Copy words from the image into memory. A transfer running past the
    /// end of the file or of the address space stops short, silently; the
    /// program can only infer it from the data.
    fn read_into(&mut self, mem: &mut Memory, offset: u64) -> std::io::Result<()> {
        let wanted = (self.transfer_words() as usize) * 2;
        let available = C::DISK_SIZE.saturating_sub(offset) as usize;
        let mut buf = vec![0u8; wanted.min(available)];
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let dest = self.bus_address();
        for (i, byte) in buf[..filled].iter().enumerate() {
            if mem.write_byte(dest + i as C::Address, *byte).is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Copy words from memory into the image and flush, so the file is
    /// durable after every write.
    fn write_from(&mut self, mem: &mut Memory, offset: u64) -> std::io::Result<()> {
        let wanted = (self.transfer_words() as usize) * 2;
        let available = C::DISK_SIZE.saturating_sub(offset) as usize;
        let src = self.bus_address();
        let mut buf = Vec::with_capacity(wanted.min(available));
        for i in 0..wanted.min(available) {
            match mem.read_byte(src + i as C::Address) {
                Ok(byte) => buf.push(byte),
                Err(_) => break,
            }
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bus::Memory;

    fn rkda(cylinder: u16, surface: u16, sector: u16) -> u16 {
        (cylinder << 5) | (surface << 4) | sector
    }

    /// Issue one function through the register interface.
    fn run(disk: &mut Disk, mem: &mut Memory, function: u16, words: u16, ba: u16, da: u16) {
        disk.write_register(C::RKWC, 0u16.wrapping_sub(words), mem);
        disk.write_register(C::RKBA, ba, mem);
        disk.write_register(C::RKDA, da, mem);
        disk.write_register(C::RKCS, (function << 1) | 1, mem);
    }

    fn fresh() -> (Disk, Memory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::open(&dir.path().join("rk05.img")).unwrap();
        (disk, Memory::default(), dir)
    }

    #[test]
    fn image_is_created_at_full_geometry_size() {
        let (disk, _, _dir) = fresh();
        assert_eq!(disk.file.metadata().unwrap().len(), C::DISK_SIZE);
        assert_eq!(disk.read_register(C::RKDS), 1 << 14);
        assert_ne!(disk.read_register(C::RKCS) & 0o200, 0);
    }

    #[test]
    fn sector_roundtrip_first_middle_last() {
        let (mut disk, mut mem, _dir) = fresh();
        let last = rkda(202, 1, 11);
        for (i, da) in [rkda(0, 0, 0), rkda(101, 1, 6), last].into_iter().enumerate() {
            let pattern = 0x40 + i as u8;
            for b in 0..512u32 {
                mem.write_byte(0o20000 + b, pattern ^ b as u8).unwrap();
            }
            run(&mut disk, &mut mem, 1, 256, 0o20000, da); // write
            for b in 0..512u32 {
                mem.write_byte(0o30000 + b, 0).unwrap();
            }
            run(&mut disk, &mut mem, 2, 256, 0o30000, da); // read
            for b in 0..512u32 {
                assert_eq!(
                    mem.read_byte(0o30000 + b).unwrap(),
                    pattern ^ b as u8,
                    "sector {da:#o} byte {b}"
                );
            }
            assert_eq!(disk.read_register(C::RKER), 0);
            assert_eq!(disk.read_register(C::RKWC), 0);
        }
    }

    #[test]
    fn read_past_end_of_image_truncates_silently() {
        let (mut disk, mut mem, _dir) = fresh();
        // Sentinel beyond the requested destination range
        for b in 0..2048u32 {
            mem.write_byte(0o30000 + b, 0xEE).unwrap();
        }
        // Ask for two sectors starting at the last one: only one exists
        run(&mut disk, &mut mem, 2, 512, 0o30000, rkda(202, 1, 11));
        // First sector arrived (zero-filled image), second never read
        assert_eq!(mem.read_byte(0o30000).unwrap(), 0);
        assert_eq!(mem.read_byte(0o30000 + 511).unwrap(), 0);
        assert_eq!(mem.read_byte(0o30000 + 512).unwrap(), 0xEE);
        assert_eq!(mem.read_byte(0o30000 + 2047).unwrap(), 0xEE);
        // Truncation is not an error
        assert_eq!(disk.read_register(C::RKER), 0);
        assert_ne!(disk.read_register(C::RKCS) & 0o200, 0);
    }

    #[test]
    fn out_of_geometry_address_sets_error_and_moves_nothing() {
        let (mut disk, mut mem, _dir) = fresh();
        mem.write_byte(0o30000, 0xEE).unwrap();
        run(&mut disk, &mut mem, 2, 256, 0o30000, rkda(0, 0, 12));
        assert_ne!(disk.read_register(C::RKER) & 0o40, 0);
        assert_eq!(mem.read_byte(0o30000).unwrap(), 0xEE);

        run(&mut disk, &mut mem, 2, 256, 0o30000, rkda(203, 0, 0));
        assert_ne!(disk.read_register(C::RKER) & 0o100, 0);

        // control reset clears the accumulated errors
        run(&mut disk, &mut mem, 0, 0, 0, 0);
        assert_eq!(disk.read_register(C::RKER), 0);
    }

    #[test]
    fn writes_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rk05.img");
        let mut mem = Memory::default();
        {
            let mut disk = Disk::open(&path).unwrap();
            for b in 0..512u32 {
                mem.write_byte(0o20000 + b, b as u8).unwrap();
            }
            run(&mut disk, &mut mem, 1, 256, 0o20000, rkda(42, 0, 3));
        }
        let mut disk = Disk::open(&path).unwrap();
        run(&mut disk, &mut mem, 2, 256, 0o40000, rkda(42, 0, 3));
        for b in 0..512u32 {
            assert_eq!(mem.read_byte(0o40000 + b).unwrap(), b as u8);
        }
    }

    #[test]
    fn seek_and_friends_complete_without_moving_data() {
        let (mut disk, mut mem, _dir) = fresh();
        for function in [3u16, 4, 5, 6, 7] {
            mem.write_byte(0o30000, 0x55).unwrap();
            run(&mut disk, &mut mem, function, 256, 0o30000, rkda(0, 0, 0));
            assert_eq!(mem.read_byte(0o30000).unwrap(), 0x55);
            assert_ne!(disk.read_register(C::RKCS) & 0o200, 0);
            assert_eq!(disk.read_register(C::RKWC), 0);
        }
    }
}
