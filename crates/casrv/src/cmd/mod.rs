use clap::{Args, Subcommand};
use std::path::PathBuf;

use casrv_server::config::DEFAULT_MAX_ARRAY_BYTES;
use casrv_transport::DEFAULT_SERVER_PORT;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod pvs;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve process variables over Channel Access virtual circuits.
    Serve(ServeArgs),
    /// List the process variables defined in a catalogue file.
    Pvs(PvsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Pvs(args) => pvs::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Interface to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    /// TCP port for virtual circuits.
    #[arg(long, env = "EPICS_CA_SERVER_PORT", default_value_t = DEFAULT_SERVER_PORT)]
    pub port: u16,
    /// JSON catalogue of process variables to serve.
    #[arg(long, value_name = "FILE")]
    pub pvs: Option<PathBuf>,
    /// Largest array payload accepted or sent, in bytes.
    #[arg(long, env = "EPICS_CA_MAX_ARRAY_BYTES", default_value_t = DEFAULT_MAX_ARRAY_BYTES)]
    pub max_array_bytes: usize,
    /// Give up on a client that does not drain its circuit (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub write_timeout: String,
    /// Log every request at debug level.
    #[arg(long)]
    pub dump_requests: bool,
}

#[derive(Args, Debug)]
pub struct PvsArgs {
    /// JSON catalogue of process variables.
    #[arg(long, value_name = "FILE")]
    pub pvs: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
