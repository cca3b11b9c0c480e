use bitflags::bitflags;
use parse_display::Display;

use crate::constants as C;

bitflags! {
    /// The processor status word.
    ///
    /// Bits 5–7 hold the priority field and are kept verbatim; use
    /// [`Psw::priority`] to extract them.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Psw: C::Word {
        const CARRY    = 0o001;
        const OVERFLOW = 0o002;
        const ZERO     = 0o004;
        const NEGATIVE = 0o010;
        const TRAP     = 0o020;
        const PRIORITY = 0o340;
    }
}

impl std::fmt::Debug for Psw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#08b}", self.bits())
    }
}

impl Psw {
    #[must_use]
    pub fn priority(self) -> u8 {
        ((self.bits() & Self::PRIORITY.bits()) >> 5) as u8
    }

    pub fn set_priority(&mut self, level: u8) {
        let bits = (self.bits() & !Self::PRIORITY.bits()) | (C::Word::from(level & 7) << 5);
        *self = Self::from_bits_retain(bits);
    }
}

/// A general register. R6 doubles as the stack pointer and R7 as the
/// program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    SP,
    PC,
}

impl Reg {
    /// Decode a 3-bit register field.
    #[must_use]
    pub fn from_field(field: C::Word) -> Self {
        match field & 7 {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::SP,
            _ => Reg::PC,
        }
    }

    #[must_use]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The register file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registers {
    r: [C::Word; 8],
    pub psw: Psw,
}

impl Registers {
    #[must_use]
    pub fn get(&self, reg: Reg) -> C::Word {
        self.r[reg.index()]
    }

    pub fn set(&mut self, reg: Reg, value: C::Word) {
        self.r[reg.index()] = value;
    }

    #[must_use]
    pub fn pc(&self) -> C::Word {
        self.get(Reg::PC)
    }

    pub fn set_pc(&mut self, value: C::Word) {
        self.set(Reg::PC, value);
    }

    #[must_use]
    pub fn sp(&self) -> C::Word {
        self.get(Reg::SP)
    }

    pub fn set_sp(&mut self, value: C::Word) {
        self.set(Reg::SP, value);
    }
}

impl std::fmt::Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "r0={:06o} r1={:06o} r2={:06o} r3={:06o} r4={:06o} r5={:06o} sp={:06o} pc={:06o} psw={:?}",
            self.r[0], self.r[1], self.r[2], self.r[3], self.r[4], self.r[5], self.r[6], self.r[7],
            self.psw,
        )
    }
}
