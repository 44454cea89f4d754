use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "minitrace")]
#[command(about = "Collect and analyze MiniTrace method traces from an Android device", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// More logging (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: $MINITRACE_CONFIG_PATH, then the platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trace an app: run the trace server, collect every session and analyze it
    Run(RunArgs),

    /// Print the events of one data segment
    Decode(DecodeArgs),

    /// Build the message and idle tables for a pulled session directory
    Aggregate(AggregateArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Package to trace, e.g. com.example.app
    pub package: String,

    /// Where pulled sessions and logs go
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for the server to exit
    #[arg(short, long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Device serial
    #[arg(short, long)]
    pub serial: Option<String>,

    /// Hex log-flag word for the trace server
    #[arg(long, value_name = "HEX")]
    pub log_flags: Option<String>,

    /// Don't capture the device log
    #[arg(long)]
    pub no_logcat: bool,
}

#[derive(Args)]
pub struct DecodeArgs {
    /// `<prefix>data_<N>.bin` file
    pub file: PathBuf,

    /// Directory holding the session's `info_*.log` symbol files
    #[arg(long, value_name = "DIR")]
    pub symbols: Option<PathBuf>,

    /// Session prefix of the symbol files (default: taken from the file name)
    #[arg(long, value_name = "PREFIX", requires = "symbols")]
    pub base: Option<String>,

    /// Print at most this many events
    #[arg(short = 'n', long, value_name = "N")]
    pub limit: Option<usize>,

    /// Print per-kind, per-thread and per-method counts instead of events
    #[arg(long)]
    pub stats: bool,
}

#[derive(Args)]
pub struct AggregateArgs {
    /// Directory of pulled session files
    pub dir: PathBuf,

    /// Session prefix (default: every session in the directory)
    #[arg(long, value_name = "PREFIX")]
    pub base: Option<String>,
}
