use std::str::FromStr;

use crate::errors::CommandError;

/// Requests from the remote command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a measurement cycle now.
    Measure,
    LowPower(bool),
    Verbose(bool),
    /// Hours from UTC; validated when applied.
    TimeZone(i32),
}

fn parse_switch(value: Option<&str>, line: &str) -> Result<bool, CommandError> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        _ => Err(CommandError::Unrecognized(line.to_string())),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    /// Accepts `measure`, `low-power on|off`, `verbose on|off`, `timezone <hours>`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().map(str::to_ascii_lowercase);
        let arg = words.next();
        if words.next().is_some() {
            return Err(CommandError::Unrecognized(line.to_string()));
        }

        match name.as_deref() {
            Some("measure") if arg.is_none() => Ok(Command::Measure),
            Some("low-power") => parse_switch(arg, line).map(Command::LowPower),
            Some("verbose") => parse_switch(arg, line).map(Command::Verbose),
            Some("timezone") => arg
                .and_then(|hours| hours.parse().ok())
                .map(Command::TimeZone)
                .ok_or_else(|| CommandError::Unrecognized(line.to_string())),
            _ => Err(CommandError::Unrecognized(line.to_string())),
        }
    }
}
