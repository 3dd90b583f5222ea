//! Command line arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Run controller automation commands over a serial link.
#[derive(Parser, Debug)]
#[command(name = "padpilot", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, short = 'c', global = true, env = "PADPILOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Serial port, overrides the configured one
    #[arg(long, short = 'p', global = true, env = "PADPILOT_PORT")]
    pub port: Option<String>,

    /// Baud rate, overrides the configured one
    #[arg(long, short = 'b', global = true)]
    pub baud: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List serial ports
    Ports,

    /// List the commands found in both command directories
    List,

    /// Run one command until it completes or Ctrl-C is pressed
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Command name as listed by `padpilot list`
    pub name: String,

    /// Look the name up among the hardware (firmware macro) commands
    #[arg(long)]
    pub hardware: bool,

    /// Forward keys typed on stdin to the controller while the command runs
    #[arg(long)]
    pub keyboard: bool,
}
