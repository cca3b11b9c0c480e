//! Instruction words: decoding and display.
//!
//! [`decode`] classifies a fetched 16-bit word. Operands stay in their
//! encoded mode/register form; effective addresses are resolved at execution
//! time because auto-increment and auto-decrement modes mutate registers.

use parse_display::Display;

use super::registers::{Psw, Reg};
use crate::constants as C;

/// Operand width of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Word,
    Byte,
}

impl Width {
    /// The natural auto-increment/decrement step for this width.
    #[must_use]
    pub(crate) fn step(self) -> C::Word {
        match self {
            Width::Word => 2,
            Width::Byte => 1,
        }
    }
}

/// An encoded operand: 3-bit mode plus register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub mode: u8,
    pub reg: Reg,
}

impl Operand {
    #[must_use]
    pub(crate) fn from_field(field: C::Word) -> Self {
        Self {
            mode: ((field >> 3) & 7) as u8,
            reg: Reg::from_field(field),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = self.reg;
        match self.mode {
            0 => write!(f, "{r}"),
            1 => write!(f, "({r})"),
            2 => write!(f, "({r})+"),
            3 => write!(f, "@({r})+"),
            4 => write!(f, "-({r})"),
            5 => write!(f, "@-({r})"),
            6 => write!(f, "x({r})"),
            _ => write!(f, "@x({r})"),
        }
    }
}

/// Branch condition, tested against the condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum Cond {
    /// Unconditional
    R,
    Ne,
    Eq,
    Ge,
    Lt,
    Gt,
    Le,
    Pl,
    Mi,
    Hi,
    Los,
    Vc,
    Vs,
    Cc,
    Cs,
}

impl Cond {
    /// Evaluate the condition against the status word.
    #[must_use]
    pub(crate) fn holds(self, psw: Psw) -> bool {
        let n = psw.contains(Psw::NEGATIVE);
        let z = psw.contains(Psw::ZERO);
        let v = psw.contains(Psw::OVERFLOW);
        let c = psw.contains(Psw::CARRY);
        match self {
            Cond::R => true,
            Cond::Ne => !z,
            Cond::Eq => z,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && (n == v),
            Cond::Le => z || (n != v),
            Cond::Pl => !n,
            Cond::Mi => n,
            Cond::Hi => !c && !z,
            Cond::Los => c || z,
            Cond::Vc => !v,
            Cond::Vs => v,
            Cond::Cc => !c,
            Cond::Cs => c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Halt,
    Wait,
    Reset,

    /// Set or clear a subset of the NZVC bits. `scc`/`ccc` group; a zero
    /// mask is the canonical NOP.
    CondCode { set: bool, mask: Psw },

    Mov(Width, Operand, Operand),
    Cmp(Width, Operand, Operand),
    Bit(Width, Operand, Operand),
    Bic(Width, Operand, Operand),
    Bis(Width, Operand, Operand),
    Add(Operand, Operand),
    Sub(Operand, Operand),

    Xor(Reg, Operand),
    /// Subtract one and branch back `offset` words if not zero.
    Sob(Reg, C::Word),

    Jmp(Operand),
    Jsr(Reg, Operand),
    Rts(Reg),

    Swab(Operand),
    Clr(Width, Operand),
    Com(Width, Operand),
    Inc(Width, Operand),
    Dec(Width, Operand),
    Neg(Width, Operand),
    Adc(Width, Operand),
    Sbc(Width, Operand),
    Tst(Width, Operand),
    Ror(Width, Operand),
    Rol(Width, Operand),
    Asr(Width, Operand),
    Asl(Width, Operand),
    Sxt(Operand),

    /// PC-relative branch; the offset is in words.
    Branch(Cond, i8),
}

/// Decode one instruction word. Returns `None` for opcodes the machine does
/// not implement; the CPU halts with a diagnostic in that case.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn decode(word: C::Word) -> Option<Instruction> {
    use Instruction as I;

    match word {
        0o000_000 => return Some(I::Halt),
        0o000_001 => return Some(I::Wait),
        0o000_005 => return Some(I::Reset),
        0o000_240..=0o000_277 => {
            return Some(I::CondCode {
                set: word & 0o20 != 0,
                mask: Psw::from_bits_truncate(word & 0o17),
            })
        }
        _ => {}
    }

    // Single-operand group.
    let dst = Operand::from_field(word);
    let width = if word & 0o100_000 == 0 {
        Width::Word
    } else {
        Width::Byte
    };
    match word & 0o077_700 {
        0o000_100 if width == Width::Word => return Some(I::Jmp(dst)),
        0o000_300 if width == Width::Word => return Some(I::Swab(dst)),
        0o005_000 => return Some(I::Clr(width, dst)),
        0o005_100 => return Some(I::Com(width, dst)),
        0o005_200 => return Some(I::Inc(width, dst)),
        0o005_300 => return Some(I::Dec(width, dst)),
        0o005_400 => return Some(I::Neg(width, dst)),
        0o005_500 => return Some(I::Adc(width, dst)),
        0o005_600 => return Some(I::Sbc(width, dst)),
        0o005_700 => return Some(I::Tst(width, dst)),
        0o006_000 => return Some(I::Ror(width, dst)),
        0o006_100 => return Some(I::Rol(width, dst)),
        0o006_200 => return Some(I::Asr(width, dst)),
        0o006_300 => return Some(I::Asl(width, dst)),
        0o006_700 if width == Width::Word => return Some(I::Sxt(dst)),
        _ => {}
    }

    if word & 0o177_770 == 0o000_200 {
        return Some(I::Rts(Reg::from_field(word)));
    }

    let reg = Reg::from_field(word >> 6);
    match word & 0o177_000 {
        0o004_000 => return Some(I::Jsr(reg, dst)),
        0o074_000 => return Some(I::Xor(reg, dst)),
        0o077_000 => return Some(I::Sob(reg, word & 0o77)),
        _ => {}
    }

    // Branches: base opcode in the high byte, signed word offset below.
    #[allow(clippy::cast_possible_truncation)]
    let offset = (word & 0xFF) as u8 as i8;
    let cond = match word & 0o177_400 {
        0o000_400 => Some(Cond::R),
        0o001_000 => Some(Cond::Ne),
        0o001_400 => Some(Cond::Eq),
        0o002_000 => Some(Cond::Ge),
        0o002_400 => Some(Cond::Lt),
        0o003_000 => Some(Cond::Gt),
        0o003_400 => Some(Cond::Le),
        0o100_000 => Some(Cond::Pl),
        0o100_400 => Some(Cond::Mi),
        0o101_000 => Some(Cond::Hi),
        0o101_400 => Some(Cond::Los),
        0o102_000 => Some(Cond::Vc),
        0o102_400 => Some(Cond::Vs),
        0o103_000 => Some(Cond::Cc),
        0o103_400 => Some(Cond::Cs),
        _ => None,
    };
    if let Some(cond) = cond {
        return Some(I::Branch(cond, offset));
    }

    // Double-operand group.
    let src = Operand::from_field(word >> 6);
    match word & 0o070_000 {
        0o010_000 => Some(I::Mov(width, src, dst)),
        0o020_000 => Some(I::Cmp(width, src, dst)),
        0o030_000 => Some(I::Bit(width, src, dst)),
        0o040_000 => Some(I::Bic(width, src, dst)),
        0o050_000 => Some(I::Bis(width, src, dst)),
        0o060_000 if width == Width::Word => Some(I::Add(src, dst)),
        0o060_000 => Some(I::Sub(src, dst)),
        _ => None,
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Instruction as I;

        let suffix = |w: &Width| if *w == Width::Byte { "b" } else { "" };
        match self {
            I::Halt => write!(f, "halt"),
            I::Wait => write!(f, "wait"),
            I::Reset => write!(f, "reset"),
            I::CondCode { mask, .. } if mask.is_empty() => write!(f, "nop"),
            I::CondCode { set: true, mask } => write!(f, "scc {:o}", mask.bits()),
            I::CondCode { set: false, mask } => write!(f, "ccc {:o}", mask.bits()),
            I::Mov(w, s, d) => write!(f, "mov{} {s}, {d}", suffix(w)),
            I::Cmp(w, s, d) => write!(f, "cmp{} {s}, {d}", suffix(w)),
            I::Bit(w, s, d) => write!(f, "bit{} {s}, {d}", suffix(w)),
            I::Bic(w, s, d) => write!(f, "bic{} {s}, {d}", suffix(w)),
            I::Bis(w, s, d) => write!(f, "bis{} {s}, {d}", suffix(w)),
            I::Add(s, d) => write!(f, "add {s}, {d}"),
            I::Sub(s, d) => write!(f, "sub {s}, {d}"),
            I::Xor(r, d) => write!(f, "xor {r}, {d}"),
            I::Sob(r, o) => write!(f, "sob {r}, -{o}"),
            I::Jmp(d) => write!(f, "jmp {d}"),
            I::Jsr(r, d) => write!(f, "jsr {r}, {d}"),
            I::Rts(r) => write!(f, "rts {r}"),
            I::Swab(d) => write!(f, "swab {d}"),
            I::Clr(w, d) => write!(f, "clr{} {d}", suffix(w)),
            I::Com(w, d) => write!(f, "com{} {d}", suffix(w)),
            I::Inc(w, d) => write!(f, "inc{} {d}", suffix(w)),
            I::Dec(w, d) => write!(f, "dec{} {d}", suffix(w)),
            I::Neg(w, d) => write!(f, "neg{} {d}", suffix(w)),
            I::Adc(w, d) => write!(f, "adc{} {d}", suffix(w)),
            I::Sbc(w, d) => write!(f, "sbc{} {d}", suffix(w)),
            I::Tst(w, d) => write!(f, "tst{} {d}", suffix(w)),
            I::Ror(w, d) => write!(f, "ror{} {d}", suffix(w)),
            I::Rol(w, d) => write!(f, "rol{} {d}", suffix(w)),
            I::Asr(w, d) => write!(f, "asr{} {d}", suffix(w)),
            I::Asl(w, d) => write!(f, "asl{} {d}", suffix(w)),
            I::Sxt(d) => write!(f, "sxt {d}"),
            I::Branch(c, o) => write!(f, "b{c} {o:+}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decode_double_operand() {
        // mov r1, r2
        assert_eq!(
            decode(0o010_102),
            Some(Instruction::Mov(
                Width::Word,
                Operand { mode: 0, reg: Reg::R1 },
                Operand { mode: 0, reg: Reg::R2 },
            ))
        );
        // movb (r3)+, r0
        assert_eq!(
            decode(0o112_300),
            Some(Instruction::Mov(
                Width::Byte,
                Operand { mode: 2, reg: Reg::R3 },
                Operand { mode: 0, reg: Reg::R0 },
            ))
        );
        // add and sub share an opcode, split on the byte bit
        assert!(matches!(decode(0o060_001), Some(Instruction::Add(_, _))));
        assert!(matches!(decode(0o160_001), Some(Instruction::Sub(_, _))));
    }

    #[test]
    fn decode_single_operand() {
        assert_eq!(
            decode(0o005_000),
            Some(Instruction::Clr(
                Width::Word,
                Operand { mode: 0, reg: Reg::R0 },
            ))
        );
        assert!(matches!(
            decode(0o105_737),
            Some(Instruction::Tst(Width::Byte, Operand { mode: 3, reg: Reg::PC }))
        ));
        // sxt has no byte form
        assert!(decode(0o106_700).is_none());
    }

    #[test]
    fn decode_branches() {
        assert_eq!(decode(0o000_765), Some(Instruction::Branch(Cond::R, -11)));
        assert_eq!(decode(0o001_375), Some(Instruction::Branch(Cond::Ne, -3)));
        assert_eq!(decode(0o100_375), Some(Instruction::Branch(Cond::Pl, -3)));
        assert_eq!(decode(0o103_402), Some(Instruction::Branch(Cond::Cs, 2)));
    }

    #[test]
    fn decode_control() {
        assert_eq!(decode(0o000_000), Some(Instruction::Halt));
        assert_eq!(decode(0o000_001), Some(Instruction::Wait));
        assert_eq!(decode(0o000_005), Some(Instruction::Reset));
        assert_eq!(
            decode(0o000_240),
            Some(Instruction::CondCode { set: false, mask: Psw::empty() })
        );
        assert_eq!(
            decode(0o000_261),
            Some(Instruction::CondCode { set: true, mask: Psw::CARRY })
        );
        assert_eq!(decode(0o000_207), Some(Instruction::Rts(Reg::PC)));
        assert!(matches!(decode(0o004_167), Some(Instruction::Jsr(Reg::R1, _))));
        assert_eq!(decode(0o077_003), Some(Instruction::Sob(Reg::R0, 3)));
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        assert!(decode(0o000_007).is_none());
        assert!(decode(0o007_000).is_none());
        assert!(decode(0o170_000).is_none());
    }

    #[test]
    fn display_forms() {
        assert_eq!(decode(0o112_300).unwrap().to_string(), "movb (r3)+, r0");
        assert_eq!(decode(0o001_375).unwrap().to_string(), "bne -3");
        assert_eq!(decode(0o000_240).unwrap().to_string(), "nop");
    }
}
