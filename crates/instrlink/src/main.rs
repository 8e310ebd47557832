mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "instrlink", version, about = "Instrument register and stream CLI")]
struct Cli {
    /// Kit configuration file (JSON).
    #[arg(long, value_name = "FILE", global = true, env = "INSTRLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, cli.config.as_deref(), format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_with_negative_value() {
        let cli = Cli::try_parse_from(["instrlink", "write", "GAIN", "-1.5"])
            .expect("write args should parse");
        let Command::Write(args) = cli.command else {
            panic!("expected write");
        };
        assert_eq!(args.register, "GAIN");
        assert_eq!(args.value, "-1.5");
    }

    #[test]
    fn parses_capture_subcommand() {
        let cli = Cli::try_parse_from([
            "instrlink",
            "--config",
            "/tmp/kit.json",
            "capture",
            "--output",
            "/tmp/out.bin",
            "--channel",
            "2",
            "--count",
            "10",
        ])
        .expect("capture args should parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/kit.json")));
        let Command::Capture(args) = cli.command else {
            panic!("expected capture");
        };
        assert_eq!(args.channel, 2);
        assert_eq!(args.count, Some(10));
        assert_eq!(args.block_size, 4096);
    }

    #[test]
    fn parses_exec_with_assignments() {
        let cli = Cli::try_parse_from([
            "instrlink", "exec", "tune", "--set", "freq=1e9", "--set", "atten=-3",
        ])
        .expect("exec args should parse");
        let Command::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.command, "tune");
        assert_eq!(args.set, vec!["freq=1e9", "atten=-3"]);
        assert!(args.payload.is_none());
    }

    #[test]
    fn dump_requires_length() {
        let err = Cli::try_parse_from(["instrlink", "dump", "0x100"])
            .expect_err("missing length should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
