//! Command status codes and the crate-wide error type.

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

/// Outcome of a device command.
///
/// Command methods on [`TvDevice`](crate::TvDevice) never propagate transport
/// errors to callers; every path resolves to one of these statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdStatus {
    Ok,
    BadRequest,
    NotFound,
    Timeout,
    ServiceUnavailable,
}

impl CmdStatus {
    pub fn is_ok(self) -> bool {
        self == CmdStatus::Ok
    }

    /// HTTP-style numeric code for hosts that speak status codes.
    pub fn code(self) -> u16 {
        match self {
            CmdStatus::Ok => 200,
            CmdStatus::BadRequest => 400,
            CmdStatus::NotFound => 404,
            CmdStatus::Timeout => 408,
            CmdStatus::ServiceUnavailable => 503,
        }
    }
}

/// Errors surfaced by registry and store operations. Session errors never
/// reach callers (commands resolve to a [`CmdStatus`]) and wake-on-LAN
/// sends are best effort, so only configuration failures flow through here.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type LinkResult<T> = Result<T, LinkError>;
