//! Wire protocol — JSON objects framed by CRLF.
//!
//! Every frame is one of three families, keyed by its discriminant field:
//! commands (`cmd` + `src`), replies (`reply`), and errors (`error` + `msg`).
//! Command names are matched case-insensitively; everything else is exact.
//! [`decode`] is the single entry point for inbound frames: it parses,
//! normalizes the command tag, and applies the schema checks serde alone
//! cannot express (array uniqueness, name syntax).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::nick;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Command(Command),
    Reply(Reply),
    Error(WireError),
}

/// Client↔server commands. `src` names the sender; the broker rejects
/// commands whose `src` is not the sending session's current nickname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    Nick {
        src: String,
        update: String,
    },
    Quit {
        src: String,
        msg: String,
    },
    Join {
        src: String,
        channels: Vec<String>,
    },
    Leave {
        src: String,
        channels: Vec<String>,
        msg: String,
    },
    Channels {
        src: String,
    },
    Users {
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<Vec<String>>,
        #[serde(default)]
        client: bool,
    },
    Msg {
        src: String,
        targets: Vec<String>,
        msg: String,
    },
    Ping {
        src: String,
        msg: String,
    },
    Pong {
        src: String,
        msg: String,
    },
}

/// Server→client replies. `names` and `channels` are chunked five entries at
/// a time and terminated by an empty-array reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "lowercase")]
pub enum Reply {
    Names {
        channel: String,
        names: Vec<String>,
        client: bool,
    },
    Channels {
        channels: Vec<String>,
    },
    Ok,
}

/// Error kinds a broker or client may put on the wire. The broker folds
/// nickname conflicts into `badnick` and never emits `nickinuse` or
/// `badchannel`; both stay recognized so peers that do emit them parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    BadNick,
    NickInUse,
    Schema,
    NoChannel,
    BadChannel,
    NonMember,
    NonExist,
    Member,
}

/// An error frame: `{"error": <kind>, "msg": <human text>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub error: ErrorKind,
    pub msg: String,
}

/// Decode failure: unparseable JSON or a schema violation.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Schema(&'static str),
}

impl Frame {
    pub fn error(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Frame::Error(WireError {
            error: kind,
            msg: msg.into(),
        })
    }

    /// Serialize to the compact JSON put on the wire (without the CRLF).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Frame::Command(cmd) => cmd.validate(),
            Frame::Reply(_) | Frame::Error(_) => Ok(()),
        }
    }
}

impl Command {
    /// The sender this command claims to come from.
    pub fn src(&self) -> &str {
        match self {
            Command::Nick { src, .. }
            | Command::Quit { src, .. }
            | Command::Join { src, .. }
            | Command::Leave { src, .. }
            | Command::Channels { src }
            | Command::Users { src, .. }
            | Command::Msg { src, .. }
            | Command::Ping { src, .. }
            | Command::Pong { src, .. } => src,
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if !nick::is_valid(self.src()) && !nick::is_valid_channel(self.src()) {
            return Err(DecodeError::Schema("src is not a valid nick or channel"));
        }
        match self {
            Command::Join { channels, .. } | Command::Leave { channels, .. } => {
                validate_channels(channels)
            }
            Command::Users {
                channels: Some(channels),
                ..
            } => validate_channels(channels),
            Command::Msg { targets, .. } => {
                if targets.is_empty() {
                    return Err(DecodeError::Schema("targets must not be empty"));
                }
                if !all_unique(targets) {
                    return Err(DecodeError::Schema("targets must be unique"));
                }
                if targets
                    .iter()
                    .any(|t| !nick::is_valid(t) && !nick::is_valid_channel(t))
                {
                    return Err(DecodeError::Schema("target is not a valid nick or channel"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_channels(channels: &[String]) -> Result<(), DecodeError> {
    if channels.is_empty() {
        return Err(DecodeError::Schema("channels must not be empty"));
    }
    if !all_unique(channels) {
        return Err(DecodeError::Schema("channels must be unique"));
    }
    if channels.iter().any(|c| !nick::is_valid_channel(c)) {
        return Err(DecodeError::Schema("invalid channel name"));
    }
    Ok(())
}

fn all_unique(items: &[String]) -> bool {
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().all(|item| seen.insert(item.as_str()))
}

/// Decode one framed line into a validated [`Frame`].
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    // Command names are case-insensitive on the wire.
    if let Some(tag) = value.get_mut("cmd") {
        if let Some(s) = tag.as_str() {
            *tag = serde_json::Value::String(s.to_ascii_lowercase());
        }
    }
    let frame: Frame = serde_json::from_value(value)?;
    frame.validate()?;
    Ok(frame)
}
