//! Deferred-command vocabulary shared by the dispatcher and the buffer.
//!
//! Commands are plain data so they can be queued while a TV is unreachable
//! and replayed verbatim once a session comes back.

use std::fmt;
use std::time::Duration;

/// Bounded wait applied by the default retry policy.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A single outbound TV operation in replayable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TvCommand {
    PowerOn,
    PowerOff,
    SetVolume(u8),
    VolumeUp,
    VolumeDown,
    SetMute(bool),
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Switch to a named source; `delay` postpones execution during replay,
    /// giving a freshly woken TV time before an app launch.
    SelectSource { name: String, delay: Duration },
    SelectSoundOutput { output: String },
    Button(String),
    ScreenOn { webos_ver: String },
    ScreenOff { webos_ver: String },
}

impl fmt::Display for TvCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TvCommand::PowerOn => write!(f, "power_on"),
            TvCommand::PowerOff => write!(f, "power_off"),
            TvCommand::SetVolume(v) => write!(f, "set_volume({v})"),
            TvCommand::VolumeUp => write!(f, "volume_up"),
            TvCommand::VolumeDown => write!(f, "volume_down"),
            TvCommand::SetMute(m) => write!(f, "set_mute({m})"),
            TvCommand::Play => write!(f, "play"),
            TvCommand::Pause => write!(f, "pause"),
            TvCommand::Stop => write!(f, "stop"),
            TvCommand::Next => write!(f, "next"),
            TvCommand::Previous => write!(f, "previous"),
            TvCommand::SelectSource { name, .. } => write!(f, "select_source({name})"),
            TvCommand::SelectSoundOutput { output } => {
                write!(f, "select_sound_output({output})")
            }
            TvCommand::Button(name) => write!(f, "button({name})"),
            TvCommand::ScreenOn { .. } => write!(f, "turn_screen_on"),
            TvCommand::ScreenOff { .. } => write!(f, "turn_screen_off"),
        }
    }
}

/// How the dispatcher handles a command when the device is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for an in-flight reconnect before executing anyway.
    pub timeout: Duration,
    /// Queue the command for replay instead of waiting.
    pub bufferize: bool,
}

impl RetryPolicy {
    /// Wait-bounded execution with the default timeout.
    pub fn wait() -> Self {
        Self { timeout: DEFAULT_COMMAND_TIMEOUT, bufferize: false }
    }

    /// Wait-bounded execution with a custom timeout.
    pub fn wait_for(timeout: Duration) -> Self {
        Self { timeout, bufferize: false }
    }

    /// Queue for replay after the next successful connect.
    pub fn buffered() -> Self {
        Self { timeout: DEFAULT_COMMAND_TIMEOUT, bufferize: true }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::wait()
    }
}
