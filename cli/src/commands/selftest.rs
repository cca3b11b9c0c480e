use std::sync::atomic::AtomicBool;

use anyhow::bail;
use clap::Parser;
use pdp11_emulator::bus::{Bus, Memory};
use pdp11_emulator::constants::BOOT_ADDRESS;
use pdp11_emulator::cpu::Reg;
use pdp11_emulator::devices::Serial;
use pdp11_emulator::{programs, System};
use tracing::info;

/// Runs the built-in counting program on a bare machine, with no disk and
/// no listener, and checks the result it leaves in r0.
#[derive(Parser, Debug)]
pub struct SelftestOpt {}

impl SelftestOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        let mem = Memory::default();
        let mut system = System::new(Bus::new(mem, Serial::new(), None));
        system.load_image(&programs::count(), BOOT_ADDRESS)?;

        let running = AtomicBool::new(true);
        let halt = system.run(None, &running);

        let r0 = system.cpu.regs.get(Reg::R0);
        if !system.cpu.halted || r0 != 10 {
            bail!("self-test failed: halted={}, r0={r0}", system.cpu.halted);
        }

        info!(
            instructions = halt.instructions,
            "self-test passed, r0 = {r0}"
        );
        println!("ok: counted to {r0} in {} instructions", halt.instructions);
        Ok(())
    }
}
