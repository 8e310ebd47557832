use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use instrlink_kit::{Kit, KitConfig, RegisterAddr, RegisterValue};

use crate::exit::{kit_error, CliError, CliResult, DATA_INVALID};
use crate::output::OutputFormat;

pub mod capture;
pub mod dump;
pub mod exec;
pub mod read;
pub mod version;
pub mod write;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read one register.
    Read(ReadArgs),
    /// Write one register.
    Write(WriteArgs),
    /// Block-read consecutive registers.
    Dump(DumpArgs),
    /// Receive a stream channel into a file.
    Capture(CaptureArgs),
    /// Run a named command from the configured ICD.
    Exec(ExecArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Read(args) => read::run(args, config, format),
        Command::Write(args) => write::run(args, config, format),
        Command::Dump(args) => dump::run(args, config, format),
        Command::Capture(args) => capture::run(args, config, format),
        Command::Exec(args) => exec::run(args, config, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Register name, or numeric address (decimal or 0x-prefixed).
    pub register: String,
    /// Device endpoint overriding the configured command target.
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Register name, or numeric address (decimal or 0x-prefixed).
    pub register: String,
    /// Value: integer (decimal or 0x-prefixed), decimal fraction, or enum label.
    #[arg(allow_hyphen_values = true)]
    pub value: String,
    /// Device endpoint overriding the configured command target.
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// First register address.
    pub base: String,
    /// Bytes to read.
    pub length: usize,
    /// Read the same register repeatedly instead of walking addresses.
    #[arg(long = "loop")]
    pub repeat: bool,
    /// Device endpoint overriding the configured command target.
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,
}

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// File to append received blocks to.
    #[arg(long, short = 'o')]
    pub output: PathBuf,
    /// Logical channel to receive.
    #[arg(long, short = 'c', default_value = "0")]
    pub channel: u16,
    /// Bytes per transfer.
    #[arg(long, default_value = "4096")]
    pub block_size: usize,
    /// Stop after this many blocks. Default: until Ctrl-C.
    #[arg(long)]
    pub count: Option<u64>,
    /// Device endpoint overriding the configured stream target.
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Command name, or a parameter name to run every command that sends it.
    pub command: String,
    /// Set a parameter before running, as NAME=VALUE. Repeatable.
    #[arg(long = "set", value_name = "NAME=VALUE", allow_hyphen_values = true)]
    pub set: Vec<String>,
    /// File whose contents fill the command's payload entries.
    #[arg(long, value_name = "FILE")]
    pub payload: Option<PathBuf>,
    /// Device endpoint overriding the configured command target.
    #[arg(long, value_name = "URI")]
    pub target: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn load_kit(config: Option<&Path>) -> CliResult<Kit> {
    let config = match config {
        Some(path) => KitConfig::from_file(path).map_err(|err| kit_error("config", err))?,
        None => KitConfig::default(),
    };
    Kit::new(config).map_err(|err| kit_error("config", err))
}

/// Kit with its command interface started.
pub fn command_kit(config: Option<&Path>, target: Option<&str>) -> CliResult<Kit> {
    let mut kit = load_kit(config)?;
    let started = match target {
        Some(target) => kit.start_command_at(target),
        None => kit.start_command(),
    };
    started.map_err(|err| kit_error("start command interface", err))?;
    Ok(kit)
}

pub fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => text.replace('_', "").parse().ok(),
    }
}

pub fn parse_register(text: &str) -> CliResult<RegisterAddr> {
    if !text.starts_with(|c: char| c.is_ascii_digit()) {
        return Ok(RegisterAddr::from(text));
    }
    parse_number(text)
        .and_then(|value| u32::try_from(value).ok())
        .map(RegisterAddr::from)
        .ok_or_else(|| CliError::new(DATA_INVALID, format!("invalid register address {text:?}")))
}

pub fn parse_value(text: &str) -> RegisterValue {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if let Some(magnitude) = parse_number(digits).and_then(|v| i64::try_from(v).ok()) {
        return RegisterValue::from(if negative { -magnitude } else { magnitude });
    }
    if let Ok(value) = text.parse::<f64>() {
        return RegisterValue::from(value);
    }
    RegisterValue::from(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_parse_as_names_or_numbers() {
        assert_eq!(parse_register("STATUS").unwrap(), RegisterAddr::Symbol("STATUS".into()));
        assert_eq!(parse_register("0x10").unwrap(), RegisterAddr::Numeric(0x10));
        assert_eq!(parse_register("16").unwrap(), RegisterAddr::Numeric(16));
        assert!(parse_register("0xZZ").is_err());
    }

    #[test]
    fn values_parse_by_shape() {
        assert_eq!(parse_value("5"), RegisterValue::from(5i64));
        assert_eq!(parse_value("0xff"), RegisterValue::from(255i64));
        assert_eq!(parse_value("-2"), RegisterValue::from(-2i64));
        assert_eq!(parse_value("-1.5"), RegisterValue::from(-1.5f64));
        assert_eq!(parse_value("RUN"), RegisterValue::from("RUN"));
    }
}
