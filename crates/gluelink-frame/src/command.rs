//! Command and error codes.
//!
//! Code ranges are reserved by function:
//! 0x01-0x08 device control, 0x10-0x13 parameters, 0x15-0x18 motion,
//! 0x19-0x1C dispensing, 0x20-0x23 sensors, 0x30-0x34 system,
//! 0x40-0x42 firmware upgrade, 0x80 generic response, 0xFF generic error.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

macro_rules! commands {
    ($($variant:ident = $code:literal, $name:literal;)+) => {
        /// The closed set of protocol commands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[repr(u8)]
        pub enum Command {
            $($variant = $code,)+
        }

        impl Command {
            /// Every command, in code order.
            pub const ALL: &'static [Command] = &[$(Command::$variant,)+];

            /// Look up a command by its wire code.
            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(Command::$variant),)+
                    _ => None,
                }
            }

            /// Stable identifier used in logs and on the command line.
            pub fn name(self) -> &'static str {
                match self {
                    $(Command::$variant => $name,)+
                }
            }
        }
    };
}

commands! {
    DeviceStart = 0x01, "device_start";
    DeviceStop = 0x02, "device_stop";
    DeviceReset = 0x03, "device_reset";
    DeviceStatus = 0x04, "device_status";
    PauseDevice = 0x05, "pause_device";
    ResumeDevice = 0x06, "resume_device";
    HomeDevice = 0x07, "home_device";
    EmergencyStop = 0x08, "emergency_stop";
    ReadParameter = 0x10, "read_parameter";
    WriteParameter = 0x11, "write_parameter";
    ReadAllParameters = 0x12, "read_all_parameters";
    WriteAllParameters = 0x13, "write_all_parameters";
    MoveToPosition = 0x15, "move_to_position";
    JogMove = 0x16, "jog_move";
    SetOrigin = 0x17, "set_origin";
    GetPosition = 0x18, "get_position";
    StartGlue = 0x19, "start_glue";
    StopGlue = 0x1A, "stop_glue";
    SetGlueParameters = 0x1B, "set_glue_parameters";
    GetGlueParameters = 0x1C, "get_glue_parameters";
    ReadSensorData = 0x20, "read_sensor_data";
    ReadAllSensors = 0x21, "read_all_sensors";
    StartDataCollection = 0x22, "start_data_collection";
    StopDataCollection = 0x23, "stop_data_collection";
    GetDeviceInfo = 0x30, "get_device_info";
    GetVersionInfo = 0x31, "get_version_info";
    SetDateTime = 0x32, "set_date_time";
    GetDateTime = 0x33, "get_date_time";
    Heartbeat = 0x34, "heartbeat";
    StartUpgrade = 0x40, "start_upgrade";
    UpgradeData = 0x41, "upgrade_data";
    EndUpgrade = 0x42, "end_upgrade";
    Response = 0x80, "response";
    Error = 0xFF, "error";
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command.code()
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        Command::from_code(code).ok_or(code)
    }
}

impl FromStr for Command {
    type Err = String;

    /// Accepts a command name (`move_to_position`, `MoveToPosition`) or a
    /// hex code (`0x15`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            let code = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("invalid command code: {trimmed}"))?;
            return Command::from_code(code).ok_or_else(|| format!("unknown command code: {trimmed}"));
        }

        let wanted: String = trimmed
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.name().replace('_', "") == wanted)
            .ok_or_else(|| format!("unknown command: {trimmed}"))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.code())
    }
}

/// Error codes carried in the first byte of an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    InvalidCommand = 0x01,
    InvalidParameter = 0x02,
    Checksum = 0x03,
    NotReady = 0x04,
    DataTooLong = 0x05,
    Timeout = 0x06,
    Unknown = 0xFF,
}

impl ErrorCode {
    /// Map a wire code; anything unassigned is `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ErrorCode::None,
            0x01 => ErrorCode::InvalidCommand,
            0x02 => ErrorCode::InvalidParameter,
            0x03 => ErrorCode::Checksum,
            0x04 => ErrorCode::NotReady,
            0x05 => ErrorCode::DataTooLong,
            0x06 => ErrorCode::Timeout,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::None => "no error",
            ErrorCode::InvalidCommand => "invalid command",
            ErrorCode::InvalidParameter => "invalid parameter",
            ErrorCode::Checksum => "checksum error",
            ErrorCode::NotReady => "device not ready",
            ErrorCode::DataTooLong => "data too long",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_lookup() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_code(cmd.code()), Some(*cmd));
        }
        assert_eq!(Command::ALL.len(), 34);
    }

    #[test]
    fn reserved_gaps_are_unknown() {
        for code in [0x00u8, 0x09, 0x14, 0x1D, 0x24, 0x35, 0x43, 0x7F, 0x81, 0xFE] {
            assert_eq!(Command::from_code(code), None, "code 0x{code:02X}");
        }
    }

    #[test]
    fn parse_by_name_or_hex() {
        assert_eq!("move_to_position".parse::<Command>(), Ok(Command::MoveToPosition));
        assert_eq!("MoveToPosition".parse::<Command>(), Ok(Command::MoveToPosition));
        assert_eq!("0x34".parse::<Command>(), Ok(Command::Heartbeat));
        assert!("0x99".parse::<Command>().is_err());
        assert!("fly".parse::<Command>().is_err());
    }

    #[test]
    fn unassigned_error_codes_map_to_unknown() {
        assert_eq!(ErrorCode::from_code(0x04), ErrorCode::NotReady);
        assert_eq!(ErrorCode::from_code(0x42), ErrorCode::Unknown);
        assert_eq!(ErrorCode::Checksum.to_string(), "checksum error");
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(Command::Heartbeat.to_string(), "heartbeat(0x34)");
    }
}
