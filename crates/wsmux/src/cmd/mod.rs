use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod check;
pub mod decode;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept multiplexed connections and echo every channel.
    Serve(ServeArgs),
    /// Connect, open logical channels and exchange a message on each.
    Check(CheckArgs),
    /// Decode one multiplexed message given as hex.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Check(args) => check::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Engine configuration (JSON).
    #[arg(long, value_name = "FILE", env = "WSMUX_CONFIG")]
    pub config: Option<PathBuf>,
    /// Override the number of initial channel slots.
    #[arg(long)]
    pub slots: Option<u64>,
    /// Override the receive quota attached to each initial slot.
    #[arg(long)]
    pub slot_quota: Option<u64>,
    /// Exit after the first connection finishes.
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Number of logical channels to open.
    #[arg(long, short = 'n', default_value = "1")]
    pub channels: u32,
    /// First channel id to request; later channels count up from it.
    #[arg(long, default_value = "2")]
    pub first_channel: u32,
    /// Message sent on each channel.
    #[arg(long, default_value = "ping")]
    pub message: String,
    /// Path requested in each AddChannelRequest.
    #[arg(long, default_value = "/")]
    pub request_path: String,
    /// Per-step timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex-encoded message payload (whitespace ignored).
    pub hex: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_units() {
        assert_eq!(parse_timeout("5s").expect("seconds"), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").expect("bare"), Duration::from_secs(2));
        assert_eq!(parse_timeout("150ms").expect("millis"), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        assert_eq!(parse_timeout("0s").expect_err("zero").code, USAGE);
        assert!(parse_timeout("bad").is_err());
        assert!(parse_timeout(" ").is_err());
    }
}
