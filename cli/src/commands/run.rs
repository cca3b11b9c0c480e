use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, ValueHint};
use pdp11_emulator::bus::{Bus, Memory};
use pdp11_emulator::constants::{Address, DEFAULT_MEMORY_SIZE};
use pdp11_emulator::devices::{Disk, Serial};
use pdp11_emulator::net::Mux;
use pdp11_emulator::System;
use tracing::info;

fn parse_octal_or_decimal(s: &str) -> Result<Address, String> {
    let parsed = if let Some(rest) = s.strip_prefix("0o") {
        Address::from_str_radix(rest, 8)
    } else if s.starts_with('0') && s.len() > 1 {
        Address::from_str_radix(s, 8)
    } else {
        s.parse()
    };
    parsed.map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
pub struct RunOpt {
    /// Bootstrap image to load and execute
    #[clap(value_parser, value_hint = ValueHint::FilePath)]
    image: Utf8PathBuf,

    /// TCP port for console connections
    #[clap(short, long, default_value = "2323")]
    port: u16,

    /// Disk image backing file (created and zero-filled if absent)
    #[clap(short, long, default_value = "rk05.img", value_hint = ValueHint::FilePath)]
    disk: Utf8PathBuf,

    /// Memory size in bytes
    #[clap(short, long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory: usize,

    /// Address at which the image is loaded (octal with a leading 0)
    #[clap(short, long, value_parser = parse_octal_or_decimal, default_value = "01000")]
    load_address: Address,

    /// Initial program counter, when different from the load address
    #[clap(short, long, value_parser = parse_octal_or_decimal)]
    start: Option<Address>,
}

impl RunOpt {
    pub fn exec(self) -> anyhow::Result<()> {
        let image = std::fs::read(&self.image)
            .with_context(|| format!("cannot read bootstrap image {}", self.image))?;

        let mem = Memory::new(self.memory)?;
        let disk = Disk::open(self.disk.as_std_path())?;
        let mut system = System::new(Bus::new(mem, Serial::new(), Some(disk)));

        system
            .load_image(&image, self.load_address)
            .context("bootstrap image does not fit in memory")?;
        if let Some(start) = self.start {
            #[allow(clippy::cast_possible_truncation)]
            system.cpu.regs.set_pc(start as u16);
        }

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let mut mux = Mux::bind(addr)?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        ctrlc::set_handler(move || {
            flag.store(false, Ordering::Relaxed);
        })
        .context("cannot install interrupt handler")?;

        info!(image = %self.image, port = self.port, "starting machine");
        let halt = system.run(Some(&mut mux), &running);
        info!(
            pc = format_args!("{:06o}", halt.pc),
            instructions = halt.instructions,
            "machine stopped"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pdp11_emulator::constants::BOOT_ADDRESS;

    use super::*;

    #[test]
    fn octal_and_decimal_addresses_parse() {
        assert_eq!(parse_octal_or_decimal("01000"), Ok(0o1000));
        assert_eq!(parse_octal_or_decimal("0o1000"), Ok(0o1000));
        assert_eq!(parse_octal_or_decimal("512"), Ok(512));
        assert_eq!(parse_octal_or_decimal("0"), Ok(0));
        assert!(parse_octal_or_decimal("0898").is_err());
    }

    #[test]
    fn default_load_address_is_the_boot_address() {
        assert_eq!(parse_octal_or_decimal("01000"), Ok(BOOT_ADDRESS));
    }
}
