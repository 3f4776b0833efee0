//! Session transport boundary.
//!
//! The wire protocol itself (websocket handshake, pairing key exchange, SSAP
//! framing) belongs to an external session library. This module defines the
//! narrow surface the connection supervisor drives: connect, disconnect, raw
//! requests, push subscriptions and a combined state report. Keeping the
//! boundary a trait lets the rest of the crate run against in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::TvConfig;

/// Errors surfaced by a [`TvSession`] implementation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("no usable session after connect")]
    Unusable,
    #[error("not connected")]
    NotConnected,
    #[error("request {0} failed: {1}")]
    Request(String, String),
    #[error("request timed out")]
    Timeout,
    #[error("subscription failed: {0}")]
    Subscribe(String),
}

impl SessionError {
    /// Whether the error reflects lost connectivity rather than a command
    /// the TV understood and refused.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SessionError::Connect(_)
                | SessionError::Unusable
                | SessionError::NotConnected
                | SessionError::Timeout
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// An installed application as reported by the TV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppInfo {
    pub id: String,
    pub title: String,
    pub icon: String,
    pub large_icon: String,
}

/// A physical input as reported by the TV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputInfo {
    pub id: String,
    pub app_id: String,
    pub label: String,
}

/// Combined state the session layer caches for one TV.
///
/// `power_on` here reflects the session's own view of the socket and is not
/// trusted for power decisions; the supervisor always confirms with
/// [`TvSession::power_state`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TvReport {
    pub power_on: bool,
    pub volume: Option<u8>,
    pub muted: bool,
    pub current_app_id: Option<String>,
    pub apps: Vec<AppInfo>,
    pub inputs: Vec<InputInfo>,
    pub channel_name: Option<String>,
    pub sound_output: Option<String>,
}

/// Raw power state answer from the TV.
#[derive(Debug, Clone, Default)]
pub struct PowerReport {
    /// e.g. `Active`, `Active Standby`, `Suspend`, `Power Off`, `Unknown`.
    pub state: Option<String>,
}

/// One control session with a TV.
///
/// A session is single-use: after a failed [`connect`](TvSession::connect)
/// the supervisor discards it and asks the [`SessionFactory`] for a new one.
#[async_trait]
pub trait TvSession: Send + Sync {
    async fn connect(&self) -> SessionResult<()>;
    async fn disconnect(&self) -> SessionResult<()>;

    /// Whether the underlying socket is open and paired.
    fn is_usable(&self) -> bool;

    /// Sends a raw SSAP request and returns the response payload.
    async fn request(&self, endpoint: &str, payload: Option<Value>) -> SessionResult<Value>;

    /// Presses a named remote-control button over the input socket.
    async fn button(&self, name: &str) -> SessionResult<()>;

    /// Queries the TV's power state directly.
    async fn power_state(&self) -> SessionResult<PowerReport>;

    /// Last combined state the session observed.
    fn report(&self) -> TvReport;

    /// Registers for push state updates, delivered on `tx` until disconnect.
    async fn subscribe_state(&self, tx: mpsc::Sender<TvReport>) -> SessionResult<()>;

    /// Registers for push sound-output changes, delivered on `tx` until
    /// disconnect.
    async fn subscribe_sound_output(&self, tx: mpsc::Sender<String>) -> SessionResult<()>;
}

/// Creates fresh sessions for a device. One factory serves the whole
/// registry; the config carries address and pairing key.
pub trait SessionFactory: Send + Sync {
    fn create(&self, config: &TvConfig) -> Arc<dyn TvSession>;
}
