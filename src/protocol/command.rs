//! Text protocol commands and replies.
//!
//! ```text
//! S: 220 <servername> <bannertext>
//! C: SUBSCRIBE myportal [password]
//! S: 250 OK
//! C: SUBMIT myportal <base64envelope>
//! S: 250 OK
//! S: ITEM myportal <base64envelope>
//! C: QUIT
//! S: 221 Service closing transmission channel
//! ```

use crate::core::channel_name::ChannelName;
use crate::error::{constants, PortalError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe {
        channel: ChannelName,
        password: Option<String>,
    },
    Unsubscribe {
        channel: ChannelName,
    },
    Submit {
        channel: ChannelName,
        envelope: Bytes,
    },
    Quit,
}

impl Command {
    /// Parse one line (without CRLF)
    pub fn parse(line: &str) -> Result<Self> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, rest)) = args.split_first() else {
            return Err(PortalError::UnsupportedCommand);
        };

        match verb {
            "SUBSCRIBE" => match rest {
                [channel] => Ok(Command::Subscribe {
                    channel: ChannelName::parse(channel)?,
                    password: None,
                }),
                [channel, password] => Ok(Command::Subscribe {
                    channel: ChannelName::parse(channel)?,
                    password: Some((*password).to_string()),
                }),
                _ => Err(argument_count(rest.len())),
            },
            "UNSUBSCRIBE" => match rest {
                [channel] => Ok(Command::Unsubscribe {
                    channel: ChannelName::parse(channel)?,
                }),
                _ => Err(argument_count(rest.len())),
            },
            "SUBMIT" => match rest {
                [channel, encoded] => {
                    let channel = ChannelName::parse(channel)?;
                    let envelope = STANDARD
                        .decode(encoded)
                        .map_err(|_| PortalError::InvalidBase64)?;
                    Ok(Command::Submit {
                        channel,
                        envelope: Bytes::from(envelope),
                    })
                }
                _ => Err(argument_count(rest.len())),
            },
            "QUIT" => Ok(Command::Quit),
            _ => Err(PortalError::UnsupportedCommand),
        }
    }

    /// Render as a protocol line (without CRLF)
    pub fn to_line(&self) -> String {
        match self {
            Command::Subscribe {
                channel,
                password: Some(password),
            } => format!("SUBSCRIBE {channel} {password}"),
            Command::Subscribe {
                channel,
                password: None,
            } => format!("SUBSCRIBE {channel}"),
            Command::Unsubscribe { channel } => format!("UNSUBSCRIBE {channel}"),
            Command::Submit { channel, envelope } => {
                format!("SUBMIT {channel} {}", STANDARD.encode(envelope))
            }
            Command::Quit => "QUIT".to_string(),
        }
    }
}

fn argument_count(found: usize) -> PortalError {
    PortalError::InvalidArguments(format!("{} ({found})", constants::ERR_ARGUMENT_COUNT))
}

/// Server-to-client text line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Greeting { name: String, banner: String },
    Ok,
    Error(String),
    Closing,
    Item { channel: ChannelName, envelope: Bytes },
}

impl Reply {
    /// `550` reply for a failed command
    pub fn from_error(err: &PortalError) -> Self {
        match err {
            PortalError::UnsupportedCommand => Reply::Error(constants::ERR_UNSUPPORTED_COMMAND.into()),
            PortalError::InvalidArguments(reason) => {
                Reply::Error(format!("Invalid arguments: {reason}"))
            }
            other => Reply::Error(format!("Invalid arguments: {}", other.public_reason())),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Reply::Greeting { .. } => 220,
            Reply::Ok => 250,
            Reply::Error(_) => 550,
            Reply::Closing => 221,
            Reply::Item { .. } => 0,
        }
    }

    /// Parse a line received from a relay
    pub fn parse(line: &str) -> Result<Self> {
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        match head {
            "220" => {
                let (name, banner) = rest.split_once(' ').unwrap_or((rest, ""));
                Ok(Reply::Greeting {
                    name: name.to_string(),
                    banner: banner.to_string(),
                })
            }
            "250" => Ok(Reply::Ok),
            "550" => Ok(Reply::Error(rest.to_string())),
            "221" => Ok(Reply::Closing),
            "ITEM" => {
                let (channel, encoded) = rest
                    .split_once(' ')
                    .ok_or_else(|| argument_count(1))?;
                Ok(Reply::Item {
                    channel: ChannelName::parse(channel)?,
                    envelope: Bytes::from(
                        STANDARD
                            .decode(encoded.trim())
                            .map_err(|_| PortalError::InvalidBase64)?,
                    ),
                })
            }
            _ => Err(PortalError::UnsupportedCommand),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Greeting { name, banner } => write!(f, "220 {name} {banner}"),
            Reply::Ok => f.write_str("250 OK"),
            Reply::Error(reason) => write!(f, "550 {reason}"),
            Reply::Closing => write!(f, "221 {}", constants::MSG_CLOSING),
            Reply::Item { channel, envelope } => {
                write!(f, "ITEM {channel} {}", STANDARD.encode(envelope))
            }
        }
    }
}
