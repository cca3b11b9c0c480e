//! The machine aggregate and the emulation loop.
//!
//! Instructions run in fixed-size batches; network and device I/O is
//! serviced between batches, never during instruction execution. The only
//! per-instruction synchronization point is the serial `service` tick,
//! which moves at most one inbound byte into the receiver registers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bus::{Bus, BusError};
use crate::constants as C;
use crate::cpu::{Cpu, CpuError};
use crate::net::Mux;

/// Instructions executed per batch.
const BATCH_SIZE: usize = 10_000;

/// One I/O service pass runs every this many batches.
const SERVICE_INTERVAL: u64 = 4;

/// How long to yield the processor after a service pass.
const SERVICE_YIELD: Duration = Duration::from_millis(1);

/// Final state reported when the loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halt {
    pub pc: C::Word,
    pub instructions: u64,
}

/// The whole machine: CPU plus bus (memory and devices). Everything is
/// owned here and passed by reference into the pieces that need it; there
/// are no process-wide statics.
pub struct System {
    pub cpu: Cpu,
    pub bus: Bus,
}

impl System {
    #[must_use]
    pub fn new(bus: Bus) -> Self {
        Self {
            cpu: Cpu::default(),
            bus,
        }
    }

    /// Seed a bootstrap image and point the program counter at it.
    ///
    /// # Errors
    ///
    /// Fails if the image does not fit in memory.
    #[allow(clippy::cast_possible_truncation)]
    pub fn load_image(&mut self, data: &[u8], start: C::Address) -> Result<(), BusError> {
        self.bus.mem.load_image(data, start)?;
        self.cpu.regs.set_pc(start as C::Word);
        Ok(())
    }

    /// Execute one instruction plus its serial synchronization tick.
    ///
    /// # Errors
    ///
    /// Propagates execution errors; an illegal opcode has already set the
    /// halted flag when this returns.
    pub fn step(&mut self) -> Result<(), CpuError> {
        self.cpu.step(&mut self.bus)?;
        self.bus.serial.service();
        Ok(())
    }

    /// Run one batch of instructions. Returns `false` once the CPU is
    /// halted (or parked in WAIT with nothing pending).
    fn run_batch(&mut self) -> bool {
        for _ in 0..BATCH_SIZE {
            if self.cpu.halted {
                return false;
            }
            if self.cpu.waiting {
                // The receiver posting a byte is the only wake-up source.
                if self.bus.serial.receiver_done() {
                    self.cpu.waiting = false;
                } else {
                    self.bus.serial.service();
                    return true;
                }
            }
            match self.step() {
                Ok(()) => {}
                Err(e @ CpuError::Illegal { .. }) => {
                    warn!("{e}");
                    return false;
                }
                Err(e) => {
                    warn!("stopping on execution fault: {e}");
                    self.cpu.halted = true;
                    return false;
                }
            }
        }
        true
    }

    /// One I/O service pass: accept connections, shuttle bytes between the
    /// transport and the serial line.
    fn service_io(&mut self, mux: &mut Mux) {
        mux.accept_connections();
        mux.poll_input();
        while let Some(byte) = mux.read_byte() {
            self.bus.serial.input_byte(byte);
        }
        let mut out = Vec::new();
        while let Some(byte) = self.bus.serial.read_output() {
            out.push(byte);
        }
        if !out.is_empty() {
            mux.broadcast(&out);
        }
        if let Some(disk) = &mut self.bus.disk {
            disk.service();
        }
    }

    /// Run until the CPU halts or the run flag is cleared. Shutdown latency
    /// is bounded by one batch: the flag is consulted between batches only.
    pub fn run(&mut self, mut mux: Option<&mut Mux>, running: &AtomicBool) -> Halt {
        let mut batches: u64 = 0;
        while running.load(Ordering::Relaxed) {
            let keep_going = self.run_batch();
            batches += 1;
            if batches % SERVICE_INTERVAL == 0 {
                if let Some(mux) = mux.as_deref_mut() {
                    self.service_io(mux);
                }
                std::thread::sleep(SERVICE_YIELD);
            }
            if !keep_going && !self.cpu.waiting {
                break;
            }
        }
        // Flush whatever the program managed to transmit before stopping.
        if let Some(mux) = mux.as_deref_mut() {
            self.service_io(mux);
        }
        let halt = Halt {
            pc: self.cpu.regs.pc(),
            instructions: self.cpu.instructions,
        };
        if self.cpu.halted {
            info!(
                pc = format_args!("{:06o}", halt.pc),
                instructions = halt.instructions,
                "processor halted"
            );
        } else {
            debug!("emulation loop interrupted");
        }
        halt
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bus::Memory;
    use crate::cpu::Reg;
    use crate::devices::Serial;
    use crate::net::GREETING;
    use crate::programs;

    fn headless() -> System {
        System::new(Bus::new(Memory::default(), Serial::new(), None))
    }

    #[test]
    fn count_program_halts_with_r0_equal_ten() {
        let mut system = headless();
        system
            .load_image(&programs::count(), C::BOOT_ADDRESS)
            .unwrap();
        let running = AtomicBool::new(true);
        let halt = system.run(None, &running);
        assert!(system.cpu.halted);
        assert_eq!(system.cpu.regs.get(Reg::R0), 10);
        assert!(halt.instructions > 10);
    }

    #[test]
    fn echo_program_echoes_through_the_serial_line() {
        let mut system = headless();
        system
            .load_image(&programs::echo(), C::BOOT_ADDRESS)
            .unwrap();
        system.bus.serial.input_byte(0x41);
        for _ in 0..100 {
            system.step().unwrap();
            if system.bus.serial.has_output() {
                break;
            }
        }
        assert_eq!(system.bus.serial.read_output(), Some(0x41));
    }

    #[test]
    fn echo_end_to_end_over_the_network() {
        let mut system = headless();
        system
            .load_image(&programs::echo(), C::BOOT_ADDRESS)
            .unwrap();
        let mut mux = Mux::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = mux.local_addr().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            system.run(Some(&mut mux), &flag);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut greeting = vec![0u8; GREETING.len()];
        client.read_exact(&mut greeting).unwrap();
        client.write_all(b"A").unwrap();
        let mut echoed = [0u8; 1];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"A");

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn run_flag_interrupts_a_spinning_program() {
        let mut system = headless();
        // br .  — spins forever
        system.bus.mem.write_word(C::BOOT_ADDRESS, 0o000_777).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        system.cpu.regs.set_pc(C::BOOT_ADDRESS as C::Word);
        let running = AtomicBool::new(true);
        let flag = &running;
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(50));
                flag.store(false, Ordering::Relaxed);
            });
            let halt = system.run(None, flag);
            assert!(halt.instructions > 0);
        });
        assert!(!system.cpu.halted);
    }

    #[test]
    fn wait_is_woken_by_serial_input() {
        let mut system = headless();
        // wait ; movb @#RBUF, r0 ; halt
        system.bus.mem.write_word(C::BOOT_ADDRESS, 0o000_001).unwrap();
        system.bus.mem.write_word(C::BOOT_ADDRESS + 2, 0o113_700).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        system
            .bus
            .mem
            .write_word(C::BOOT_ADDRESS + 4, C::RBUF as C::Word)
            .unwrap();
        system.bus.mem.write_word(C::BOOT_ADDRESS + 6, 0).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        system.cpu.regs.set_pc(C::BOOT_ADDRESS as C::Word);

        system.step().unwrap();
        assert!(system.cpu.waiting);
        assert!(system.run_batch()); // parked, nothing pending

        system.bus.serial.input_byte(b'z');
        let running = AtomicBool::new(true);
        system.run(None, &running);
        assert!(system.cpu.halted);
        assert_eq!(system.cpu.regs.get(Reg::R0), C::Word::from(b'z'));
    }
}
