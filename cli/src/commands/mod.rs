mod run;
mod selftest;

#[derive(clap::Subcommand)]
pub enum Subcommand {
    /// Boot a machine and serve its console over TCP
    Run(self::run::RunOpt),

    /// Run the built-in programs as a quick sanity check
    Selftest(self::selftest::SelftestOpt),
}

impl Subcommand {
    /// Run a subcommand
    pub fn exec(self) -> anyhow::Result<()> {
        match self {
            Subcommand::Run(opt) => opt.exec(),
            Subcommand::Selftest(opt) => opt.exec(),
        }
    }
}
