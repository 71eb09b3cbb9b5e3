use gluelink_frame::{DecodeEvent, DecoderConfig, FrameDecoder, MAX_BUFFER_SIZE};
use tracing::debug;

use crate::cmd::{parse_hex, DecodeArgs};
use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_decoded, DecodedRow, OutputFormat};

/// Bytes fed per step, so captures larger than the receive buffer decode
/// the way a live link would see them.
const FEED_CHUNK: usize = 256;

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let data = match (&args.data, &args.file) {
        (Some(hex), _) => parse_hex(hex)?,
        (None, Some(path)) => {
            std::fs::read(path).map_err(|err| io_error(&format!("read {}", path.display()), err))?
        }
        (None, None) => return Err(CliError::usage("no input given")),
    };

    let mut decoder = FrameDecoder::new(DecoderConfig {
        mode: args.checksum,
        accept_alternate: !args.strict,
        max_buffer: MAX_BUFFER_SIZE,
    });
    let mut events = Vec::new();
    for chunk in data.chunks(FEED_CHUNK) {
        events.extend(decoder.decode(chunk));
    }

    let frames = events
        .iter()
        .filter(|e| matches!(e, DecodeEvent::Frame(_)))
        .count();
    debug!(
        bytes = data.len(),
        frames,
        leftover = decoder.buffered(),
        "decode finished"
    );

    let rows: Vec<DecodedRow> = events.iter().map(DecodedRow::from).collect();
    print_decoded(&rows, format);

    if frames == 0 {
        return Err(CliError::new(DATA_INVALID, "no valid frames found"));
    }
    Ok(SUCCESS)
}
