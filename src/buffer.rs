//! Queue of commands deferred while a TV is unreachable.
//!
//! Entries are timestamped at enqueue time and replayed in insertion order.
//! Anything older than [`BUFFER_LIFETIME`] at drain time is silently dropped
//! so a TV that comes back minutes later does not replay a stale remote
//! control session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::command::TvCommand;

/// Maximum age of a buffered command before it is discarded at drain time.
pub const BUFFER_LIFETIME: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Entry {
    queued_at: Instant,
    command: TvCommand,
}

/// FIFO buffer of deferred commands with lifetime-based expiry.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    entries: VecDeque<Entry>,
}

impl CommandBuffer {
    pub fn push(&mut self, command: TvCommand) {
        self.push_at(Instant::now(), command);
    }

    pub(crate) fn push_at(&mut self, queued_at: Instant, command: TvCommand) {
        log::debug!("buffering command {command} for replay");
        self.entries.push_back(Entry { queued_at, command });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, command: &TvCommand) -> bool {
        self.entries.iter().any(|e| &e.command == command)
    }

    /// Removes and returns all live entries in insertion order, dropping
    /// expired ones. The buffer is empty afterwards either way.
    pub fn drain(&mut self) -> Vec<TvCommand> {
        self.drain_at(Instant::now())
    }

    pub(crate) fn drain_at(&mut self, now: Instant) -> Vec<TvCommand> {
        let mut live = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            let age = now.saturating_duration_since(entry.queued_at);
            if age > BUFFER_LIFETIME {
                log::debug!("dropping expired buffered command {} (age {age:?})", entry.command);
            } else {
                live.push(entry.command);
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_insertion_order() {
        let mut buffer = CommandBuffer::default();
        buffer.push(TvCommand::PowerOn);
        buffer.push(TvCommand::SetVolume(10));
        buffer.push(TvCommand::SetMute(true));

        assert_eq!(buffer.len(), 3);
        assert!(buffer.contains(&TvCommand::SetVolume(10)));

        let drained = buffer.drain();
        assert_eq!(
            drained,
            vec![TvCommand::PowerOn, TvCommand::SetVolume(10), TvCommand::SetMute(true)]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_drops_expired_entries() {
        let now = Instant::now();
        let mut buffer = CommandBuffer::default();
        buffer.push_at(now - BUFFER_LIFETIME - Duration::from_secs(1), TvCommand::PowerOn);
        buffer.push_at(now - Duration::from_secs(5), TvCommand::VolumeUp);

        let drained = buffer.drain_at(now);
        assert_eq!(drained, vec![TvCommand::VolumeUp]);
    }

    #[test]
    fn entry_at_exact_lifetime_is_kept() {
        let now = Instant::now();
        let mut buffer = CommandBuffer::default();
        buffer.push_at(now - BUFFER_LIFETIME, TvCommand::Play);

        assert_eq!(buffer.drain_at(now), vec![TvCommand::Play]);
    }

    #[test]
    fn drain_empties_even_when_everything_expired() {
        let now = Instant::now();
        let mut buffer = CommandBuffer::default();
        buffer.push_at(now - BUFFER_LIFETIME * 2, TvCommand::Stop);

        assert!(buffer.drain_at(now).is_empty());
        assert!(buffer.is_empty());
    }
}
