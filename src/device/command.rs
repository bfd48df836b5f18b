use std::fmt;
use std::str::FromStr;

use crate::device::codec::{encode_text, FramedValue};
use crate::error::CommandError;

/// How many button events the firmware returns per `get/button<N>/<from>-<to>` page.
pub const BUTTON_PAGE_SIZE: u32 = 30;

/// Commands understood by the firmware's text protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetButton {
        button: u8,
        // inclusive, 1-based
        range: Option<(u32, u32)>,
    },
    GetInitialData,
    SetFlowRate(i64),
    SetVolume(i64),
    Stop,
}

impl Command {
    /// Requests page `page` (1-based) of the event history of `button`. `None` if the page lies
    /// beyond the addressable range.
    pub fn button_page(button: u8, page: u32) -> Option<Command> {
        let from = page.max(1).checked_sub(1)?.checked_mul(BUTTON_PAGE_SIZE)?.checked_add(1)?;
        let to = from.checked_add(BUTTON_PAGE_SIZE - 1)?;
        Some(Command::GetButton { button, range: Some((from, to)) })
    }

    pub fn encode(&self) -> FramedValue {
        encode_text(&self.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetButton { button, range: None } => write!(f, "get/button{}", button),
            Command::GetButton { button, range: Some((from, to)) } => write!(f, "get/button{}/{}-{}", button, from, to),
            Command::GetInitialData => write!(f, "get/initialData"),
            Command::SetFlowRate(value) => write!(f, "set/flowRate/{}", value),
            Command::SetVolume(value) => write!(f, "set/volume/{}", value),
            Command::Stop => write!(f, "set/stop"),
        }
    }
}

fn invalid(command: &'static str, argument: &str) -> CommandError {
    CommandError::InvalidArgument { command, argument: argument.to_string() }
}

fn parse_button(argument: &str) -> Result<u8, CommandError> {
    argument
        .strip_prefix("button")
        .and_then(|number| number.parse::<u8>().ok())
        .filter(|number| *number > 0)
        .ok_or_else(|| invalid("get", argument))
}

fn parse_range(argument: &str) -> Result<(u32, u32), CommandError> {
    let (from, to) = argument.split_once('-').ok_or_else(|| invalid("get/button", argument))?;
    match (from.parse::<u32>(), to.parse::<u32>()) {
        (Ok(from), Ok(to)) if from >= 1 && from <= to => Ok((from, to)),
        _ => Err(invalid("get/button", argument)),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CommandError::Empty);
        }

        let parts: Vec<&str> = s.split('/').collect();
        let command = match parts.as_slice() {
            ["get", "initialData"] => Ok(Command::GetInitialData),
            ["get", button] => Ok(Command::GetButton { button: parse_button(button)?, range: None }),
            ["get", button, range] => Ok(Command::GetButton {
                button: parse_button(button)?,
                range: Some(parse_range(range)?),
            }),
            ["set", "flowRate", value] => value
                .parse::<i64>()
                .map(Command::SetFlowRate)
                .map_err(|_| invalid("set/flowRate", value)),
            ["set", "volume", value] => value
                .parse::<i64>()
                .map(Command::SetVolume)
                .map_err(|_| invalid("set/volume", value)),
            ["set", "stop"] => Ok(Command::Stop),
            _ => Err(CommandError::Unknown(s.to_string())),
        }?;

        // only the spelling the builder produces is sent
        let canonical = command.to_string();
        if canonical != s {
            return Err(CommandError::NotCanonical { given: s.to_string(), canonical });
        }

        Ok(command)
    }
}
