use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use gluelink_frame::{Command, DecodeEvent, FramingFault};
use gluelink_link::LinkSnapshot;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Lowercase hex without separators, for machine output.
pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Uppercase hex bytes separated by spaces, for people.
pub fn hex_spaced(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn command_name(code: u8) -> &'static str {
    Command::from_code(code).map_or("unknown", Command::name)
}

/// One decoder outcome, flattened for output.
#[derive(Serialize)]
pub struct DecodedRow {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&DecodeEvent> for DecodedRow {
    fn from(event: &DecodeEvent) -> Self {
        let empty = DecodedRow {
            event: "",
            code: None,
            command: None,
            checksum: None,
            payload: None,
            detail: None,
        };
        match event {
            DecodeEvent::Frame(frame) => DecodedRow {
                event: "frame",
                code: Some(frame.code),
                command: Some(command_name(frame.code)),
                checksum: Some(frame.checksum.name()),
                payload: Some(hex(&frame.payload)),
                ..empty
            },
            DecodeEvent::Framing(FramingFault::Garbage { discarded }) => DecodedRow {
                event: "garbage",
                detail: Some(format!("{discarded} bytes discarded")),
                ..empty
            },
            DecodeEvent::Framing(FramingFault::TrailerMismatch { code }) => DecodedRow {
                event: "trailer_mismatch",
                code: Some(*code),
                command: Some(command_name(*code)),
                ..empty
            },
            DecodeEvent::Checksum { code, mode, fault } => DecodedRow {
                event: "checksum_error",
                code: Some(*code),
                command: Some(command_name(*code)),
                checksum: Some(mode.name()),
                detail: Some(fault.to_string()),
                ..empty
            },
            DecodeEvent::Overflow { discarded } => DecodedRow {
                event: "overflow",
                detail: Some(format!("{discarded} bytes discarded")),
                ..empty
            },
        }
    }
}

pub fn print_decoded(rows: &[DecodedRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for row in rows {
                print_json(row);
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["EVENT", "CODE", "COMMAND", "CHECKSUM", "PAYLOAD / DETAIL"]);
            for row in rows {
                table.add_row(vec![
                    row.event.to_string(),
                    row.code.map(|c| format!("0x{c:02X}")).unwrap_or_default(),
                    row.command.unwrap_or_default().to_string(),
                    row.checksum.unwrap_or_default().to_string(),
                    row.payload
                        .clone()
                        .or_else(|| row.detail.clone())
                        .unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for row in rows {
                let mut line = row.event.to_string();
                if let (Some(code), Some(command)) = (row.code, row.command) {
                    line.push_str(&format!(" 0x{code:02X} {command}"));
                }
                if let Some(payload) = &row.payload {
                    line.push_str(&format!(" payload={payload}"));
                }
                if let Some(detail) = &row.detail {
                    line.push_str(&format!(" ({detail})"));
                }
                println!("{line}");
            }
        }
    }
}

pub fn print_snapshot(snapshot: &LinkSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(snapshot),
        OutputFormat::Table => {
            let s = &snapshot.stats;
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            let rtt = s
                .last_rtt_ms
                .map(|ms| format!("{ms:.2} ms"))
                .unwrap_or_else(|| "-".to_string());
            let rows: [(&str, String); 11] = [
                ("link", snapshot.name.clone()),
                ("endpoint", snapshot.endpoint.clone()),
                ("state", snapshot.state.to_string()),
                ("bytes in / out", format!("{} / {}", s.bytes_in, s.bytes_out)),
                ("frames in / out", format!("{} / {}", s.frames_in, s.frames_out)),
                ("heartbeats sent / received", format!("{} / {}", s.heartbeats_sent, s.heartbeats_received)),
                ("last rtt", rtt),
                ("checksum errors", s.checksum_errors.to_string()),
                ("framing errors", s.framing_errors.to_string()),
                ("protocol errors", s.protocol_errors.to_string()),
                ("last error", snapshot.last_error.clone().unwrap_or_else(|| "-".to_string())),
            ];
            for (field, value) in rows {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let s = &snapshot.stats;
            println!("Link {} ({})", snapshot.name, snapshot.endpoint);
            println!("  State:       {}", snapshot.state);
            println!("  Bytes:       {} in / {} out", s.bytes_in, s.bytes_out);
            println!("  Frames:      {} in / {} out", s.frames_in, s.frames_out);
            println!(
                "  Heartbeats:  {} sent / {} received",
                s.heartbeats_sent, s.heartbeats_received
            );
            match s.last_rtt_ms {
                Some(ms) => println!("  RTT:         {ms:.2}ms"),
                None => println!("  RTT:         unavailable"),
            }
            println!(
                "  Errors:      {} checksum, {} framing, {} protocol",
                s.checksum_errors, s.framing_errors, s.protocol_errors
            );
        }
        OutputFormat::Raw => println!("{}", snapshot.state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_forms() {
        assert_eq!(hex(&[0xAA, 0x55, 0x0D]), "aa550d");
        assert_eq!(hex_spaced(&[0xAA, 0x05]), "AA 05");
    }

    #[test]
    fn unknown_codes_are_named() {
        assert_eq!(command_name(0x15), "move_to_position");
        assert_eq!(command_name(0x99), "unknown");
    }
}
