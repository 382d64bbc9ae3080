use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use gatewire::RunMode;

#[derive(Parser)]
#[command(name = "gatewired")]
#[command(version)]
#[command(about = "IRC gateway daemon for pluggable chat back-ends")]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long, env = "GATEWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run mode (overrides the config file)
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Worker hand-off file from a restarting coordinator
    #[arg(long, hide = true)]
    pub state_file: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Mode {
    /// One process serving all connections
    Daemon,
    /// Fork one worker per connection
    ForkDaemon,
    /// Serve the connection on stdin and exit
    Inetd,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Daemon => RunMode::Daemon,
            Mode::ForkDaemon => RunMode::ForkDaemon,
            Mode::Inetd => RunMode::Inetd,
        }
    }
}
