use std::fmt;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use time::{OffsetDateTime, UtcOffset};
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::error::DecodeError;

const DISPLAY_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// A characteristic value as it travels between the session and the radio: text, base64 framed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramedValue(String);

impl FramedValue {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        FramedValue(STANDARD.encode(bytes))
    }

    /// Wraps an already framed value, e.g. one received from a peer that frames on its own.
    pub fn from_framed(framed: impl Into<String>) -> Self {
        FramedValue(framed.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(STANDARD.decode(&self.0)?)
    }
}

impl fmt::Display for FramedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn encode_text(text: &str) -> FramedValue {
    FramedValue::from_bytes(text.as_bytes())
}

pub fn decode_text(value: &FramedValue) -> Result<String, DecodeError> {
    Ok(String::from_utf8(value.to_bytes()?)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKey {
    FlowRate,
    Volume,
}

impl ReadingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKey::FlowRate => "flowRate",
            ReadingKey::Volume => "volume",
        }
    }
}

impl fmt::Display for ReadingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// A button event, reported as epoch seconds.
    Timestamp(OffsetDateTime),
    Reading { key: ReadingKey, value: i64 },
}

fn parse_integer(text: &str) -> Result<i64, DecodeError> {
    text.parse::<i64>().map_err(|_| DecodeError::InvalidNumber(text.to_string()))
}

pub fn parse_payload(text: &str) -> Result<Payload, DecodeError> {
    // the firmware sometimes sends C strings including the terminator
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }

    if let Some((key, value)) = text.split_once('/') {
        let key = match key {
            "flowRate" => ReadingKey::FlowRate,
            "volume" => ReadingKey::Volume,
            other => return Err(DecodeError::UnknownKey(other.to_string())),
        };

        return Ok(Payload::Reading { key, value: parse_integer(value)? });
    }

    let seconds = parse_integer(text)?;
    let datetime = OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| DecodeError::TimestampOutOfRange(seconds))?;
    Ok(Payload::Timestamp(datetime))
}

pub fn decode_payload(value: &FramedValue) -> Result<Payload, DecodeError> {
    parse_payload(&decode_text(value)?)
}

/// Renders a timestamp notification the way it is shown to the user.
pub fn format_local(datetime: OffsetDateTime, offset: UtcOffset) -> Result<String, DecodeError> {
    Ok(datetime.to_offset(offset).format(DISPLAY_FORMAT)?)
}
