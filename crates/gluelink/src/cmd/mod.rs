use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Args, Subcommand};
use gluelink_frame::ChecksumMode;

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod decode;
pub mod encode;
pub mod monitor;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a frame and print it.
    Encode(EncodeArgs),
    /// Decode frames from hex or a capture file.
    Decode(DecodeArgs),
    /// Connect to a device, exchange heartbeats and print link statistics.
    Monitor(MonitorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Encode(args) => encode::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Monitor(args) => monitor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("payload").args(["hex", "text", "motion", "glue", "param"])))]
pub struct EncodeArgs {
    /// Command name or hex code (e.g. move_to_position, 0x15).
    pub command: String,
    /// Payload as hex bytes.
    #[arg(long)]
    pub hex: Option<String>,
    /// Payload as UTF-8 text.
    #[arg(long)]
    pub text: Option<String>,
    /// Motion payload: x,y,z,speed.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    pub motion: Option<Vec<f32>>,
    /// Dispense payload: volume,pressure,temperature,duration_ms.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    pub glue: Option<Vec<f64>>,
    /// Parameter payload: name=value (int, float, bool or string).
    #[arg(long)]
    pub param: Option<String>,
    /// Checksum mode (additive, crc16).
    #[arg(long, default_value = "crc16")]
    pub checksum: ChecksumMode,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("input").required(true).args(["data", "file"])))]
pub struct DecodeArgs {
    /// Received bytes as hex (separators and 0x prefixes allowed).
    pub data: Option<String>,
    /// Read raw received bytes from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Expected checksum mode (additive, crc16).
    #[arg(long, default_value = "crc16")]
    pub checksum: ChecksumMode,
    /// Reject frames that only verify under the other checksum mode.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["tcp", "serial"])))]
pub struct MonitorArgs {
    /// TCP device address (host:port).
    #[arg(long)]
    pub tcp: Option<String>,
    /// Serial port name (e.g. /dev/ttyUSB0, COM3).
    #[arg(long)]
    pub serial: Option<String>,
    /// Serial baud rate.
    #[arg(long, default_value = "9600")]
    pub baud: u32,
    /// How long to stay connected (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub duration: String,
    /// Heartbeat interval.
    #[arg(long, default_value = "1s")]
    pub heartbeat: String,
    /// Connection timeout.
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
    /// Checksum mode (additive, crc16).
    #[arg(long, default_value = "crc16")]
    pub checksum: ChecksumMode,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(what: &str, input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage(format!("{what} must not be empty")));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::usage(format!("invalid {what}: {input}")))?;
    if value == 0 {
        return Err(CliError::usage(format!("{what} must be greater than zero")));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Parse hex bytes such as `AA 55 01`, `aa:55:01`, `0xAA,0x55` or `aa5501`.
pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ':' || c == ',' || c == '-')
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::usage(format!(
            "hex input has an odd number of digits ({})",
            digits.len()
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| CliError::usage(format!("invalid hex at offset {i}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("t", "5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("t", "2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("t", "150ms").unwrap(), Duration::from_millis(150));
        assert!(parse_duration("t", "0s").is_err());
        assert!(parse_duration("t", "soon").is_err());
    }

    #[test]
    fn hex_with_separators() {
        assert_eq!(parse_hex("AA 55 01").unwrap(), vec![0xAA, 0x55, 0x01]);
        assert_eq!(parse_hex("aa:55:0d").unwrap(), vec![0xAA, 0x55, 0x0D]);
        assert_eq!(parse_hex("0xAA,0x55").unwrap(), vec![0xAA, 0x55]);
        assert_eq!(parse_hex("aa5501").unwrap(), vec![0xAA, 0x55, 0x01]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
