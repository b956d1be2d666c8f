//! IRC message codec
//!
//! Encodes a [`Message`] into a wire line and parses a received line back.
//! Lines longer than the protocol limit are cut down and flagged as
//! truncated; callers are expected to carry on with the shortened value.

use std::fmt;
use thiserror::Error;
use winnow::combinator::{opt, preceded};
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

/// Maximum line length on the wire, CRLF included.
pub const MAX_LINE_LEN: usize = 512;

pub const CMD_PING: &str = "PING";
pub const CMD_PONG: &str = "PONG";
pub const REPLY_WELCOME: &str = "001";
pub const ERR_NICKNAME_IN_USE: &str = "433";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty message")]
    Empty,

    #[error("invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("invalid parameter {index}: {param:?}")]
    InvalidParam { index: usize, param: String },

    #[error("malformed line {line:?}: {reason}")]
    Malformed { line: String, reason: String },
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Source prefix, present on server-originated lines
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

/// Result of [`Message::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Wire form, always CRLF-terminated
    pub line: String,
    pub truncated: bool,
}

/// Result of [`parse_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub message: Message,
    pub truncated: bool,
}

impl Message {
    pub fn new<C, I, P>(command: C, params: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            prefix: None,
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.command.eq_ignore_ascii_case(CMD_PING)
    }

    /// Same command and parameters, ignoring the source prefix.
    pub fn same_content(&self, other: &Message) -> bool {
        self.command.eq_ignore_ascii_case(&other.command) && self.params == other.params
    }

    /// The nickname part of a `nick!user@host` prefix.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split_once('!').map_or(p, |(nick, _)| nick))
    }

    pub fn encode(&self) -> Result<Encoded, CodecError> {
        validate_command(&self.command)?;

        let mut line = String::new();
        if let Some(prefix) = &self.prefix {
            if prefix.is_empty() || prefix.contains([' ', '\r', '\n', '\0']) {
                return Err(CodecError::Malformed {
                    line: prefix.clone(),
                    reason: "bad prefix".to_string(),
                });
            }
            line.push(':');
            line.push_str(prefix);
            line.push(' ');
        }
        line.push_str(&self.command);

        let last = self.params.len().saturating_sub(1);
        for (index, param) in self.params.iter().enumerate() {
            if param.contains(['\r', '\n', '\0']) {
                return Err(CodecError::InvalidParam {
                    index,
                    param: param.clone(),
                });
            }
            let needs_colon = param.is_empty() || param.starts_with(':') || param.contains(' ');
            line.push(' ');
            if needs_colon {
                if index != last {
                    return Err(CodecError::InvalidParam {
                        index,
                        param: param.clone(),
                    });
                }
                line.push(':');
            }
            line.push_str(param);
        }

        let truncated = line.len() > MAX_LINE_LEN - 2;
        if truncated {
            let cut = floor_char_boundary(&line, MAX_LINE_LEN - 2);
            line.truncate(cut);
        }
        line.push_str("\r\n");

        Ok(Encoded { line, truncated })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(encoded) => f.write_str(encoded.line.trim_end_matches(['\r', '\n'])),
            Err(_) => write!(f, "{} {:?}", self.command, self.params),
        }
    }
}

/// Parse one line (with or without its terminator) into a [`Message`].
pub fn parse_message(line: &str) -> Result<Parsed, CodecError> {
    let body = line.trim_end_matches(['\r', '\n']);
    if body.trim().is_empty() {
        return Err(CodecError::Empty);
    }

    let truncated = body.len() > MAX_LINE_LEN - 2;
    let body = if truncated {
        &body[..floor_char_boundary(body, MAX_LINE_LEN - 2)]
    } else {
        body
    };

    let message = message_parser
        .parse(body)
        .map_err(|e| CodecError::Malformed {
            line: body.to_string(),
            reason: e.to_string(),
        })?;
    validate_command(&message.command)?;

    Ok(Parsed { message, truncated })
}

fn message_parser(input: &mut &str) -> ModalResult<Message> {
    let prefix = opt(preceded(':', take_till(1.., ' '))).parse_next(input)?;
    if prefix.is_some() {
        let _ = take_while(1.., ' ').parse_next(input)?;
    }

    let command = take_while(1.., |c: char| c.is_ascii_alphanumeric()).parse_next(input)?;

    let mut params = Vec::new();
    while !input.is_empty() {
        let _ = take_while(1.., ' ').parse_next(input)?;
        if input.is_empty() {
            break;
        }
        if let Some(trailing) = input.strip_prefix(':') {
            params.push(trailing.to_string());
            *input = "";
            break;
        }
        let param = take_till(1.., ' ').parse_next(input)?;
        params.push(param.to_string());
    }

    Ok(Message {
        prefix: prefix.map(str::to_string),
        command: command.to_string(),
        params,
    })
}

/// Commands are either all letters or exactly three digits.
fn validate_command(command: &str) -> Result<(), CodecError> {
    let letters = !command.is_empty() && command.chars().all(|c| c.is_ascii_alphabetic());
    let numeric = command.len() == 3 && command.chars().all(|c| c.is_ascii_digit());
    if letters || numeric {
        Ok(())
    } else {
        Err(CodecError::InvalidCommand(command.to_string()))
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut cut = max.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
