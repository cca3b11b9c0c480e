//! The execution engine: fetch, decode, execute.

use thiserror::Error;
use tracing::trace;

use crate::bus::{Bus, BusError};
use crate::constants as C;

mod instructions;
mod registers;

pub use self::instructions::{decode, Cond, Instruction, Operand, Width};
pub use self::registers::{Psw, Reg, Registers};

#[derive(Error, Debug)]
pub enum CpuError {
    /// The fetched word does not decode to an implemented instruction. The
    /// CPU halts with this diagnostic; undefined opcodes are never silently
    /// skipped.
    #[error("illegal instruction {opcode:#08o} at {pc:#o}")]
    Illegal { opcode: C::Word, pc: C::Word },

    /// A jump or subroutine call resolved to register mode, which has no
    /// address to transfer to.
    #[error("register-mode jump target at {pc:#o}")]
    RegisterJump { pc: C::Word },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

type Result<T> = std::result::Result<T, CpuError>;

/// A resolved operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    Reg(Reg),
    Mem(C::Address),
}

/// CPU state: register file, status word and run flags.
#[derive(Default)]
pub struct Cpu {
    pub regs: Registers,
    /// Set by HALT or an illegal instruction; stops the emulation loop.
    pub halted: bool,
    /// Set by WAIT; cleared when the serial receiver posts a byte.
    pub waiting: bool,
    /// Instructions executed since startup.
    pub instructions: u64,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cpu {{ {}, halted: {}, instructions: {} }}",
            self.regs, self.halted, self.instructions
        )
    }
}

impl Cpu {
    /// Fetch the next word at PC and advance it.
    fn fetch_word(&mut self, bus: &mut Bus) -> Result<C::Word> {
        let pc = self.regs.pc();
        let word = bus.read_word(C::Address::from(pc))?;
        self.regs.set_pc(pc.wrapping_add(2));
        Ok(word)
    }

    /// Resolve an operand to a location, applying the register side effects
    /// of auto-increment and auto-decrement modes.
    ///
    /// The step is the operand width (1 for bytes), except on SP and PC
    /// where it is always a full word.
    fn resolve(&mut self, bus: &mut Bus, op: Operand, width: Width) -> Result<Place> {
        let step = if matches!(op.reg, Reg::SP | Reg::PC) {
            2
        } else {
            width.step()
        };
        let r = self.regs.get(op.reg);
        let place = match op.mode {
            0 => Place::Reg(op.reg),
            1 => Place::Mem(C::Address::from(r)),
            2 => {
                self.regs.set(op.reg, r.wrapping_add(step));
                Place::Mem(C::Address::from(r))
            }
            3 => {
                self.regs.set(op.reg, r.wrapping_add(2));
                Place::Mem(C::Address::from(bus.read_word(C::Address::from(r))?))
            }
            4 => {
                let r = r.wrapping_sub(step);
                self.regs.set(op.reg, r);
                Place::Mem(C::Address::from(r))
            }
            5 => {
                let r = r.wrapping_sub(2);
                self.regs.set(op.reg, r);
                Place::Mem(C::Address::from(bus.read_word(C::Address::from(r))?))
            }
            6 => {
                let index = self.fetch_word(bus)?;
                let base = self.regs.get(op.reg);
                Place::Mem(C::Address::from(base.wrapping_add(index)))
            }
            _ => {
                let index = self.fetch_word(bus)?;
                let base = self.regs.get(op.reg);
                let ptr = C::Address::from(base.wrapping_add(index));
                Place::Mem(C::Address::from(bus.read_word(ptr)?))
            }
        };
        Ok(place)
    }

    fn load(&mut self, bus: &mut Bus, place: Place, width: Width) -> Result<C::Word> {
        match (place, width) {
            (Place::Reg(reg), Width::Word) => Ok(self.regs.get(reg)),
            (Place::Reg(reg), Width::Byte) => Ok(self.regs.get(reg) & 0xFF),
            (Place::Mem(addr), Width::Word) => Ok(bus.read_word(addr)?),
            (Place::Mem(addr), Width::Byte) => Ok(C::Word::from(bus.read_byte(addr)?)),
        }
    }

    /// Store a result. Byte stores into a register leave the high byte
    /// untouched; MOVB handles its sign-extension separately.
    fn store(&mut self, bus: &mut Bus, place: Place, width: Width, value: C::Word) -> Result<()> {
        match (place, width) {
            (Place::Reg(reg), Width::Word) => self.regs.set(reg, value),
            (Place::Reg(reg), Width::Byte) => {
                let old = self.regs.get(reg);
                self.regs.set(reg, (old & 0xFF00) | (value & 0xFF));
            }
            (Place::Mem(addr), Width::Word) => bus.write_word(addr, value)?,
            #[allow(clippy::cast_possible_truncation)]
            (Place::Mem(addr), Width::Byte) => bus.write_byte(addr, value as u8)?,
        }
        Ok(())
    }

    fn set_nz(&mut self, value: C::Word, width: Width) {
        let (mask, sign) = width_bounds(width);
        self.regs.psw.set(Psw::NEGATIVE, value & sign != 0);
        self.regs.psw.set(Psw::ZERO, value & mask == 0);
    }

    /// V and C for shifts and rotates: V = N xor C, computed after NZ.
    fn set_shift_vc(&mut self, carry: bool) {
        self.regs.psw.set(Psw::CARRY, carry);
        let n = self.regs.psw.contains(Psw::NEGATIVE);
        self.regs.psw.set(Psw::OVERFLOW, n != carry);
    }

    fn push(&mut self, bus: &mut Bus, value: C::Word) -> Result<()> {
        let sp = self.regs.sp().wrapping_sub(2);
        self.regs.set_sp(sp);
        bus.write_word(C::Address::from(sp), value)?;
        Ok(())
    }

    fn pop(&mut self, bus: &mut Bus) -> Result<C::Word> {
        let sp = self.regs.sp();
        let value = bus.read_word(C::Address::from(sp))?;
        self.regs.set_sp(sp.wrapping_add(2));
        Ok(value)
    }

    fn branch_target(&self, offset: i8) -> C::Word {
        self.regs.pc().wrapping_add_signed(i16::from(offset) * 2)
    }

    /// Execute one instruction.
    ///
    /// # Errors
    ///
    /// Returns [`CpuError::Illegal`] for undefined opcodes (the halted flag
    /// is set as well) and propagates bus errors.
    pub fn step(&mut self, bus: &mut Bus) -> Result<()> {
        let pc = self.regs.pc();
        let word = self.fetch_word(bus)?;
        let Some(inst) = decode(word) else {
            self.halted = true;
            return Err(CpuError::Illegal { opcode: word, pc });
        };
        trace!(pc = format_args!("{pc:06o}"), "{inst}");
        self.execute(bus, inst)?;
        self.instructions += 1;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, bus: &mut Bus, inst: Instruction) -> Result<()> {
        use Instruction as I;

        match inst {
            I::Halt => self.halted = true,
            I::Wait => self.waiting = true,
            I::Reset => bus.reset_devices(),

            I::CondCode { set, mask } => {
                if set {
                    self.regs.psw.insert(mask);
                } else {
                    self.regs.psw.remove(mask);
                }
            }

            I::Mov(width, src, dst) => {
                let src = self.resolve(bus, src, width)?;
                let value = self.load(bus, src, width)?;
                let dst = self.resolve(bus, dst, width)?;
                self.set_nz(value, width);
                self.regs.psw.remove(Psw::OVERFLOW);
                // MOVB into a register sign-extends, the one documented
                // exception to byte stores.
                if width == Width::Byte {
                    if let Place::Reg(reg) = dst {
                        self.regs.set(reg, sign_extend(value));
                        return Ok(());
                    }
                }
                self.store(bus, dst, width, value)?;
            }

            I::Cmp(width, src, dst) => {
                let (mask, sign) = width_bounds(width);
                let src = self.resolve(bus, src, width)?;
                let s = self.load(bus, src, width)?;
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = s.wrapping_sub(d) & mask;
                self.set_nz(result, width);
                self.regs.psw.set(
                    Psw::OVERFLOW,
                    (s & sign) != (d & sign) && (result & sign) == (d & sign),
                );
                self.regs.psw.set(Psw::CARRY, s < d);
            }

            I::Bit(width, src, dst) => {
                let src = self.resolve(bus, src, width)?;
                let s = self.load(bus, src, width)?;
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                self.set_nz(s & d, width);
                self.regs.psw.remove(Psw::OVERFLOW);
            }

            I::Bic(width, src, dst) => {
                let src = self.resolve(bus, src, width)?;
                let s = self.load(bus, src, width)?;
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = d & !s;
                self.set_nz(result, width);
                self.regs.psw.remove(Psw::OVERFLOW);
                self.store(bus, dst, width, result)?;
            }

            I::Bis(width, src, dst) => {
                let src = self.resolve(bus, src, width)?;
                let s = self.load(bus, src, width)?;
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = d | s;
                self.set_nz(result, width);
                self.regs.psw.remove(Psw::OVERFLOW);
                self.store(bus, dst, width, result)?;
            }

            I::Add(src, dst) => {
                let src = self.resolve(bus, src, Width::Word)?;
                let s = self.load(bus, src, Width::Word)?;
                let dst = self.resolve(bus, dst, Width::Word)?;
                let d = self.load(bus, dst, Width::Word)?;
                let (result, carry) = d.overflowing_add(s);
                self.set_nz(result, Width::Word);
                self.regs.psw.set(
                    Psw::OVERFLOW,
                    (s & 0x8000) == (d & 0x8000) && (result & 0x8000) != (s & 0x8000),
                );
                self.regs.psw.set(Psw::CARRY, carry);
                self.store(bus, dst, Width::Word, result)?;
            }

            I::Sub(src, dst) => {
                let src = self.resolve(bus, src, Width::Word)?;
                let s = self.load(bus, src, Width::Word)?;
                let dst = self.resolve(bus, dst, Width::Word)?;
                let d = self.load(bus, dst, Width::Word)?;
                let result = d.wrapping_sub(s);
                self.set_nz(result, Width::Word);
                self.regs.psw.set(
                    Psw::OVERFLOW,
                    (s & 0x8000) != (d & 0x8000) && (result & 0x8000) == (s & 0x8000),
                );
                self.regs.psw.set(Psw::CARRY, s > d);
                self.store(bus, dst, Width::Word, result)?;
            }

            I::Xor(reg, dst) => {
                let s = self.regs.get(reg);
                let dst = self.resolve(bus, dst, Width::Word)?;
                let d = self.load(bus, dst, Width::Word)?;
                let result = d ^ s;
                self.set_nz(result, Width::Word);
                self.regs.psw.remove(Psw::OVERFLOW);
                self.store(bus, dst, Width::Word, result)?;
            }

            I::Sob(reg, offset) => {
                let value = self.regs.get(reg).wrapping_sub(1);
                self.regs.set(reg, value);
                if value != 0 {
                    let pc = self.regs.pc().wrapping_sub(offset.wrapping_mul(2));
                    self.regs.set_pc(pc);
                }
            }

            I::Jmp(dst) => {
                let target = self.jump_target(bus, dst)?;
                self.regs.set_pc(target);
            }

            I::Jsr(reg, dst) => {
                let target = self.jump_target(bus, dst)?;
                let saved = self.regs.get(reg);
                self.push(bus, saved)?;
                self.regs.set(reg, self.regs.pc());
                self.regs.set_pc(target);
            }

            I::Rts(reg) => {
                self.regs.set_pc(self.regs.get(reg));
                let value = self.pop(bus)?;
                self.regs.set(reg, value);
            }

            I::Swab(dst) => {
                let dst = self.resolve(bus, dst, Width::Word)?;
                let d = self.load(bus, dst, Width::Word)?;
                let result = d.rotate_right(8);
                self.set_nz(result, Width::Byte);
                self.regs.psw.remove(Psw::OVERFLOW | Psw::CARRY);
                self.store(bus, dst, Width::Word, result)?;
            }

            I::Clr(width, dst) => {
                let dst = self.resolve(bus, dst, width)?;
                self.regs.psw.remove(Psw::NEGATIVE | Psw::OVERFLOW | Psw::CARRY);
                self.regs.psw.insert(Psw::ZERO);
                self.store(bus, dst, width, 0)?;
            }

            I::Com(width, dst) => {
                let (mask, _) = width_bounds(width);
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = !d & mask;
                self.set_nz(result, width);
                self.regs.psw.remove(Psw::OVERFLOW);
                self.regs.psw.insert(Psw::CARRY);
                self.store(bus, dst, width, result)?;
            }

            I::Inc(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = d.wrapping_add(1) & mask;
                self.set_nz(result, width);
                self.regs.psw.set(Psw::OVERFLOW, d == sign - 1);
                self.store(bus, dst, width, result)?;
            }

            I::Dec(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = d.wrapping_sub(1) & mask;
                self.set_nz(result, width);
                self.regs.psw.set(Psw::OVERFLOW, d == sign);
                self.store(bus, dst, width, result)?;
            }

            I::Neg(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = 0u16.wrapping_sub(d) & mask;
                self.set_nz(result, width);
                self.regs.psw.set(Psw::OVERFLOW, result == sign);
                self.regs.psw.set(Psw::CARRY, result != 0);
                self.store(bus, dst, width, result)?;
            }

            I::Adc(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let carry = C::Word::from(self.regs.psw.contains(Psw::CARRY));
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = d.wrapping_add(carry) & mask;
                self.set_nz(result, width);
                self.regs.psw.set(Psw::OVERFLOW, carry == 1 && d == sign - 1);
                self.regs.psw.set(Psw::CARRY, carry == 1 && d == mask);
                self.store(bus, dst, width, result)?;
            }

            I::Sbc(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let carry = C::Word::from(self.regs.psw.contains(Psw::CARRY));
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = d.wrapping_sub(carry) & mask;
                self.set_nz(result, width);
                self.regs.psw.set(Psw::OVERFLOW, carry == 1 && d == sign);
                self.regs.psw.set(Psw::CARRY, carry == 1 && d == 0);
                self.store(bus, dst, width, result)?;
            }

            I::Tst(width, dst) => {
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                self.set_nz(d, width);
                self.regs.psw.remove(Psw::OVERFLOW | Psw::CARRY);
            }

            I::Ror(width, dst) => {
                let (_, sign) = width_bounds(width);
                let carry_in = C::Word::from(self.regs.psw.contains(Psw::CARRY));
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = (d >> 1) | (carry_in * sign);
                self.set_nz(result, width);
                self.set_shift_vc(d & 1 != 0);
                self.store(bus, dst, width, result)?;
            }

            I::Rol(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let carry_in = C::Word::from(self.regs.psw.contains(Psw::CARRY));
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = ((d << 1) | carry_in) & mask;
                self.set_nz(result, width);
                self.set_shift_vc(d & sign != 0);
                self.store(bus, dst, width, result)?;
            }

            I::Asr(width, dst) => {
                let (_, sign) = width_bounds(width);
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = (d >> 1) | (d & sign);
                self.set_nz(result, width);
                self.set_shift_vc(d & 1 != 0);
                self.store(bus, dst, width, result)?;
            }

            I::Asl(width, dst) => {
                let (mask, sign) = width_bounds(width);
                let dst = self.resolve(bus, dst, width)?;
                let d = self.load(bus, dst, width)?;
                let result = (d << 1) & mask;
                self.set_nz(result, width);
                self.set_shift_vc(d & sign != 0);
                self.store(bus, dst, width, result)?;
            }

            I::Sxt(dst) => {
                let dst = self.resolve(bus, dst, Width::Word)?;
                let n = self.regs.psw.contains(Psw::NEGATIVE);
                let result = if n { 0xFFFF } else { 0 };
                self.regs.psw.set(Psw::ZERO, !n);
                self.regs.psw.remove(Psw::OVERFLOW);
                self.store(bus, dst, Width::Word, result)?;
            }

            I::Branch(cond, offset) => {
                if cond.holds(self.regs.psw) {
                    let target = self.branch_target(offset);
                    self.regs.set_pc(target);
                }
            }
        }
        Ok(())
    }

    /// Resolve a jump target. Register mode has no address and is rejected.
    fn jump_target(&mut self, bus: &mut Bus, dst: Operand) -> Result<C::Word> {
        match self.resolve(bus, dst, Width::Word)? {
            #[allow(clippy::cast_possible_truncation)]
            Place::Mem(addr) => Ok(addr as C::Word),
            Place::Reg(_) => Err(CpuError::RegisterJump {
                pc: self.regs.pc(),
            }),
        }
    }
}

fn width_bounds(width: Width) -> (C::Word, C::Word) {
    match width {
        Width::Word => (0xFFFF, 0x8000),
        Width::Byte => (0xFF, 0x80),
    }
}

fn sign_extend(byte: C::Word) -> C::Word {
    if byte & 0x80 == 0 {
        byte & 0xFF
    } else {
        byte | 0xFF00
    }
}
