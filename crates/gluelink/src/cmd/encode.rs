use std::str::FromStr;

use bytes::Bytes;
use gluelink_frame::{encode, Command, DispenseParams, Motion, ParamValue, Parameter};
use serde::Serialize;

use crate::cmd::{parse_hex, EncodeArgs};
use crate::exit::{frame_error, CliError, CliResult, SUCCESS};
use crate::output::{command_name, hex, hex_spaced, print_json, print_raw, OutputFormat};

#[derive(Serialize)]
struct EncodeOutput {
    command: &'static str,
    code: u8,
    checksum: &'static str,
    payload_size: usize,
    frame: String,
}

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let code = parse_code(&args.command)?;
    let payload = build_payload(&args)?;
    let wire = encode(code, &payload, args.checksum).map_err(|err| frame_error("encode failed", err))?;

    match format {
        OutputFormat::Json => print_json(&EncodeOutput {
            command: command_name(code),
            code,
            checksum: args.checksum.name(),
            payload_size: payload.len(),
            frame: hex(&wire),
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "{} (0x{code:02X}) {} bytes, {}",
                command_name(code),
                wire.len(),
                args.checksum
            );
            println!("{}", hex_spaced(&wire));
        }
        OutputFormat::Raw => print_raw(&wire),
    }
    Ok(SUCCESS)
}

/// A command name, or any byte as hex so unlisted codes can be exercised.
fn parse_code(input: &str) -> CliResult<u8> {
    if let Ok(command) = Command::from_str(input) {
        return Ok(command.code());
    }
    let hex = input
        .trim()
        .strip_prefix("0x")
        .or_else(|| input.trim().strip_prefix("0X"));
    hex.and_then(|h| u8::from_str_radix(h, 16).ok())
        .ok_or_else(|| CliError::usage(format!("unknown command: {input}")))
}

fn build_payload(args: &EncodeArgs) -> CliResult<Bytes> {
    if let Some(hex) = &args.hex {
        return Ok(Bytes::from(parse_hex(hex)?));
    }
    if let Some(text) = &args.text {
        return Ok(Bytes::copy_from_slice(text.as_bytes()));
    }
    if let Some(m) = &args.motion {
        let [x, y, z, speed] = four("--motion", m)?;
        return Ok(Motion::new(x, y, z, speed).encode());
    }
    if let Some(g) = &args.glue {
        let [volume, pressure, temperature, duration] = four("--glue", g)?;
        return Ok(
            DispenseParams::new(volume as f32, pressure as f32, temperature as f32, duration as i32)
                .encode(),
        );
    }
    if let Some(param) = &args.param {
        let (name, value) = param
            .split_once('=')
            .ok_or_else(|| CliError::usage("parameter must be name=value"))?;
        return Parameter::new(name, infer_value(value))
            .encode()
            .map_err(|err| frame_error("parameter", err));
    }
    Ok(Bytes::new())
}

fn four<T: Copy>(flag: &str, values: &[T]) -> CliResult<[T; 4]> {
    <[T; 4]>::try_from(values)
        .map_err(|_| CliError::usage(format!("{flag} takes exactly 4 values, got {}", values.len())))
}

fn infer_value(raw: &str) -> ParamValue {
    if let Ok(v) = raw.parse::<i32>() {
        return ParamValue::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return ParamValue::Double(v);
    }
    match raw {
        "true" => ParamValue::Bool(true),
        "false" => ParamValue::Bool(false),
        _ => ParamValue::Str(raw.to_string()),
    }
}
