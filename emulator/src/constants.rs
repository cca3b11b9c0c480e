//! Machine-wide constants: word types, memory sizing, the I/O page and the
//! fixed device register addresses.

/// A machine word. The architecture is 16-bit throughout.
pub type Word = u16;

/// A physical address.
///
/// The CPU only ever forms 16-bit addresses, but the disk controller can
/// reach the whole store through its bus-address extension bits, so physical
/// addresses are wider than a [`Word`].
pub type Address = u32;

/// Default size of the byte store (256 KiB).
pub const DEFAULT_MEMORY_SIZE: usize = 256 * 1024;

/// Smallest allowed store: the CPU must be able to form any 16-bit address.
pub const MIN_MEMORY_SIZE: usize = 64 * 1024;

/// Largest allowed store (4 MiB).
pub const MAX_MEMORY_SIZE: usize = 4 * 1024 * 1024;

/// First address of the reserved device register range.
pub const IO_BASE: Address = 0o160_000;

/// Last address (inclusive) of the reserved device register range.
pub const IO_TOP: Address = 0o177_777;

/// Default address at which bootstrap images are loaded and started.
pub const BOOT_ADDRESS: Address = 0o1000;

// Serial line (console) registers.
pub const RCSR: Address = 0o177_560;
pub const RBUF: Address = 0o177_562;
pub const XCSR: Address = 0o177_564;
pub const XBUF: Address = 0o177_566;

// Disk controller registers.
pub const RKDS: Address = 0o177_400;
pub const RKER: Address = 0o177_402;
pub const RKCS: Address = 0o177_404;
pub const RKWC: Address = 0o177_406;
pub const RKBA: Address = 0o177_410;
pub const RKDA: Address = 0o177_412;

// Disk geometry. The backing file is exactly this big.
pub const CYLINDERS: u32 = 203;
pub const SURFACES: u32 = 2;
pub const SECTORS: u32 = 12;
pub const SECTOR_SIZE: u32 = 512;

/// Total size of the disk image in bytes.
pub const DISK_SIZE: u64 = (CYLINDERS * SURFACES * SECTORS * SECTOR_SIZE) as u64;
