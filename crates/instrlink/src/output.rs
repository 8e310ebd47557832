use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use instrlink_kit::{RegisterValue, StreamSummary, WriteAck};
use instrlink_schema::ParamValue;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReadOutput<'a> {
    register: &'a str,
    value: String,
    raw: Option<String>,
}

pub fn print_read(register: &str, value: &RegisterValue, format: OutputFormat) {
    let raw = value.as_word().ok().map(|word| format!("{word:#010x}"));
    match format {
        OutputFormat::Json => {
            let out = ReadOutput {
                register,
                value: value.to_string(),
                raw,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["REGISTER", "VALUE", "RAW"])
                .add_row(vec![
                    register.to_string(),
                    value.to_string(),
                    raw.unwrap_or_else(|| "-".to_string()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{register} = {value}"),
    }
}

#[derive(Serialize)]
struct WriteOutput<'a> {
    register: &'a str,
    address: String,
    written: bool,
}

pub fn print_write(register: &str, ack: &WriteAck, format: OutputFormat) {
    let address = format!("{:#x}", ack.address);
    match format {
        OutputFormat::Json => {
            let out = WriteOutput {
                register,
                address,
                written: true,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["REGISTER", "ADDRESS", "STATUS"])
                .add_row(vec![register.to_string(), address, "written".to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{register} ({address}) written"),
    }
}

#[derive(Serialize)]
struct DumpOutput {
    base: String,
    length: usize,
    words: Vec<String>,
}

/// Block-read bytes as little-endian words, one row per word.
pub fn print_dump(base: u32, data: &[u8], word: usize, increment: bool, format: OutputFormat) {
    let rows: Vec<(String, String)> = data
        .chunks(word)
        .enumerate()
        .map(|(index, chunk)| {
            let offset = if increment { (index * word) as u32 } else { 0 };
            let mut padded = [0u8; 4];
            padded[..chunk.len().min(4)].copy_from_slice(&chunk[..chunk.len().min(4)]);
            (
                format!("{:#010x}", base.wrapping_add(offset)),
                format!("{:#010x}", u32::from_le_bytes(padded)),
            )
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let out = DumpOutput {
                base: format!("{base:#x}"),
                length: data.len(),
                words: rows.into_iter().map(|(_, value)| value).collect(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ADDRESS", "VALUE"]);
            for (address, value) in rows {
                table.add_row(vec![address, value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (address, value) in rows {
                println!("{address}: {value}");
            }
        }
    }
}

#[derive(Serialize)]
struct CaptureOutput<'a> {
    channel: u16,
    transfers: u64,
    bytes: u64,
    end: &'a str,
}

pub fn print_capture(channel: u16, summary: &StreamSummary, format: OutputFormat) {
    let end = match summary.end {
        instrlink_kit::StreamEnd::Stopped => "stopped",
        instrlink_kit::StreamEnd::Cancelled => "cancelled",
        instrlink_kit::StreamEnd::Limit => "limit",
    };
    match format {
        OutputFormat::Json => {
            let out = CaptureOutput {
                channel,
                transfers: summary.transfers,
                bytes: summary.bytes,
                end,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "TRANSFERS", "BYTES", "END"])
                .add_row(vec![
                    channel.to_string(),
                    summary.transfers.to_string(),
                    summary.bytes.to_string(),
                    end.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "channel={channel} transfers={} bytes={} end={end}",
            summary.transfers, summary.bytes
        ),
    }
}

#[derive(Serialize)]
struct ExecOutput<'a> {
    commands: &'a [String],
    params: serde_json::Map<String, serde_json::Value>,
}

fn param_json(value: &ParamValue) -> serde_json::Value {
    match value {
        ParamValue::Int(v) => serde_json::Value::from(*v),
        ParamValue::Float(v) => serde_json::Value::from(*v),
        ParamValue::Text(text) => serde_json::Value::from(text.as_str()),
    }
}

pub fn print_exec(commands: &[String], params: &[(String, ParamValue)], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ExecOutput {
                commands,
                params: params
                    .iter()
                    .map(|(name, value)| (name.clone(), param_json(value)))
                    .collect(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PARAMETER", "VALUE"]);
            for (name, value) in params {
                table.add_row(vec![name.clone(), value.to_string()]);
            }
            println!("ran: {}", commands.join(", "));
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("ran: {}", commands.join(", "));
            for (name, value) in params {
                println!("{name} = {value}");
            }
        }
    }
}
