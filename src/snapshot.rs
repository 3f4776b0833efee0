//! Cached device state and delta computation.
//!
//! [`TvSnapshot`] holds the last known state of one TV.
//! [`TvSnapshot::apply_report`] folds a fresh [`TvReport`] into the cache and
//! returns a [`StateDelta`] containing exactly the fields that changed, so
//! hosts only hear about real transitions. The source catalogue has one
//! deliberate quirk: an empty app and input list usually means the TV was
//! mid-shutdown when queried, so the previous catalogue is retained rather
//! than wiped.

use std::collections::HashMap;

use serde::Serialize;

use crate::endpoints::{self, LIVE_TV_APP_ID, LIVE_TV_TITLE};
use crate::transport::TvReport;

/// Coarse playback state of the TV.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackState {
    #[default]
    Unknown,
    Unavailable,
    Off,
    On,
    Playing,
    Paused,
    Stopped,
}

impl PlaybackState {
    pub fn is_on(self) -> bool {
        matches!(self, PlaybackState::On | PlaybackState::Playing | PlaybackState::Paused)
    }
}

/// What kind of media the active source plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Video,
    TvShow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Application,
    Input,
}

/// One selectable source: an installed app or a physical input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceEntry {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Fields that changed in one state refresh. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PlaybackState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<MediaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_output: Option<String>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self == &StateDelta::default()
    }
}

/// Full attribute view of the cached state, for hosts that want a snapshot
/// rather than deltas.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TvAttributes {
    pub state: PlaybackState,
    pub volume: u8,
    pub muted: bool,
    pub media_kind: MediaKind,
    pub media_title: String,
    pub media_image_url: String,
    pub sound_output_list: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_list: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_output: Option<String>,
}

/// Last known state of one TV plus the source catalogue.
#[derive(Debug, Default)]
pub struct TvSnapshot {
    state: PlaybackState,
    volume: u8,
    muted: bool,
    paused: bool,
    active_source: Option<String>,
    current_app_id: Option<String>,
    sources: HashMap<String, SourceEntry>,
    media_title: String,
    media_image_url: String,
    media_kind: MediaKind,
    sound_output: Option<String>,
}

impl TvSnapshot {
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Overwrites the playback state without producing a delta. Used by the
    /// supervisor when it decides the TV is off on its own evidence.
    pub fn force_state(&mut self, state: PlaybackState) {
        self.state = state;
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn active_source(&self) -> Option<&str> {
        self.active_source.as_deref()
    }

    pub fn current_app_id(&self) -> Option<&str> {
        self.current_app_id.as_deref()
    }

    pub fn source(&self, name: &str) -> Option<&SourceEntry> {
        self.sources.get(name)
    }

    pub fn sources_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Physical inputs only, sorted by name. Used for input cycling.
    pub fn inputs(&self) -> Vec<&SourceEntry> {
        let mut inputs: Vec<&SourceEntry> =
            self.sources.values().filter(|s| s.kind == SourceKind::Input).collect();
        inputs.sort_by(|a, b| a.name.cmp(&b.name));
        inputs
    }

    /// All source names: inputs first, then applications, each sorted.
    pub fn source_list(&self) -> Vec<String> {
        Self::ordered_names(&self.sources)
    }

    /// Raw sound output identifier, as last reported by the TV.
    pub fn sound_output(&self) -> Option<&str> {
        self.sound_output.as_deref()
    }

    /// Display name of the current sound output, falling back to the raw
    /// identifier when the TV reports one we do not know.
    pub fn sound_output_display(&self) -> Option<String> {
        self.sound_output.as_deref().map(|raw| {
            endpoints::sound_output_name(raw).map(str::to_string).unwrap_or_else(|| {
                log::warn!("unknown sound output identifier {raw}");
                raw.to_string()
            })
        })
    }

    /// Records a pushed sound-output change. Returns a delta when it differs
    /// from the cached value.
    pub fn set_sound_output(&mut self, raw: String) -> Option<StateDelta> {
        if self.sound_output.as_deref() == Some(raw.as_str()) {
            return None;
        }
        self.sound_output = Some(raw);
        Some(StateDelta { sound_output: self.sound_output_display(), ..StateDelta::default() })
    }

    /// Folds a state report into the cache. `power_on` is the supervisor's
    /// authoritative power verdict and overrides anything in the report.
    /// Returns the set of fields that changed; applying the same report
    /// twice yields an empty delta.
    pub fn apply_report(&mut self, report: &TvReport, power_on: bool) -> StateDelta {
        let mut delta = StateDelta::default();

        let state = if power_on { PlaybackState::On } else { PlaybackState::Off };
        if state != self.state {
            self.state = state;
            delta.state = Some(state);
        }

        if report.muted != self.muted {
            self.muted = report.muted;
            delta.muted = Some(report.muted);
        }
        if let Some(volume) = report.volume {
            if volume != self.volume {
                self.volume = volume;
                delta.volume = Some(volume);
            }
        }
        if let Some(raw) = &report.sound_output {
            if self.sound_output.as_deref() != Some(raw.as_str()) {
                self.sound_output = Some(raw.clone());
                delta.sound_output = self.sound_output_display();
            }
        }

        self.current_app_id = report.current_app_id.clone();
        self.update_sources(report, &mut delta);
        self.update_media(report, &mut delta);
        delta
    }

    /// Rebuilds the source catalogue, keyed by display name: apps by title,
    /// inputs by id. A Live TV entry is synthesized when neither list
    /// mentions the tuner. Empty lists retain the previous catalogue.
    fn update_sources(&mut self, report: &TvReport, delta: &mut StateDelta) {
        let previous = std::mem::take(&mut self.sources);
        let previous_list = Self::ordered_names(&previous);
        let current_app = report.current_app_id.as_deref();

        let mut active = None;
        let mut found_live_tv = false;

        for app in &report.apps {
            if app.id == LIVE_TV_APP_ID {
                found_live_tv = true;
            }
            if Some(app.id.as_str()) == current_app {
                active = Some(app.title.clone());
            }
            let icon = if app.icon.is_empty() { None } else { Some(app.icon.clone()) };
            self.sources.insert(
                app.title.clone(),
                SourceEntry {
                    id: app.id.clone(),
                    name: app.title.clone(),
                    kind: SourceKind::Application,
                    icon,
                },
            );
        }
        for input in &report.inputs {
            if input.app_id == LIVE_TV_APP_ID {
                found_live_tv = true;
            }
            if Some(input.app_id.as_str()) == current_app {
                active = Some(input.id.clone());
            }
            self.sources.insert(
                input.id.clone(),
                SourceEntry {
                    id: input.id.clone(),
                    name: input.id.clone(),
                    kind: SourceKind::Input,
                    icon: None,
                },
            );
        }

        if self.sources.is_empty() && !previous.is_empty() {
            // the TV was probably mid-shutdown; keep what we had
            log::debug!("empty source report, retaining {} known source(s)", previous.len());
            self.sources = previous;
            return;
        }

        if !found_live_tv && !self.sources.is_empty() {
            if current_app == Some(LIVE_TV_APP_ID) {
                active = Some(LIVE_TV_TITLE.to_string());
            }
            self.sources.insert(
                LIVE_TV_TITLE.to_string(),
                SourceEntry {
                    id: LIVE_TV_APP_ID.to_string(),
                    name: LIVE_TV_TITLE.to_string(),
                    kind: SourceKind::Application,
                    icon: None,
                },
            );
        }

        let current_list = self.source_list();
        if current_list != previous_list {
            delta.source_list = Some(current_list);
        }
        if active != self.active_source {
            self.active_source = active;
            if let Some(name) = &self.active_source {
                delta.source = Some(name.clone());
            }
        }
    }

    fn update_media(&mut self, report: &TvReport, delta: &mut StateDelta) {
        let current_app = report.current_app_id.as_deref();
        let live_tv = current_app == Some(LIVE_TV_APP_ID);

        let kind = if live_tv { MediaKind::TvShow } else { MediaKind::Video };
        if kind != self.media_kind {
            self.media_kind = kind;
            delta.media_kind = Some(kind);
        }

        let title = if live_tv {
            report.channel_name.clone().unwrap_or_default()
        } else {
            String::new()
        };
        if title != self.media_title {
            self.media_title = title.clone();
            delta.media_title = Some(title);
        }

        let image = report
            .apps
            .iter()
            .find(|app| Some(app.id.as_str()) == current_app)
            .map(|app| {
                // large_icon sometimes holds a local file path, not a URL
                if app.large_icon.starts_with("http") {
                    app.large_icon.clone()
                } else {
                    app.icon.clone()
                }
            })
            .unwrap_or_default();
        if image != self.media_image_url {
            self.media_image_url = image.clone();
            delta.media_image_url = Some(image);
        }
    }

    pub fn attributes(&self) -> TvAttributes {
        TvAttributes {
            state: self.state,
            volume: self.volume,
            muted: self.muted,
            media_kind: self.media_kind,
            media_title: self.media_title.clone(),
            media_image_url: self.media_image_url.clone(),
            sound_output_list: endpoints::sound_output_names(),
            source_list: self.source_list(),
            source: self.active_source.clone(),
            sound_output: self.sound_output_display(),
        }
    }

    fn ordered_names(sources: &HashMap<String, SourceEntry>) -> Vec<String> {
        let mut inputs = Vec::new();
        let mut apps = Vec::new();
        for entry in sources.values() {
            match entry.kind {
                SourceKind::Input => inputs.push(entry.name.clone()),
                SourceKind::Application => apps.push(entry.name.clone()),
            }
        }
        inputs.sort();
        apps.sort();
        inputs.extend(apps);
        inputs
    }
}
