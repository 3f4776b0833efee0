//! SSAP endpoint constants and fixed webOS vocabulary.
//!
//! Endpoint URIs are stable across webOS generations with one exception:
//! the screen on/off service moved between webOS 4.x and later firmwares,
//! which is why [`screen_endpoint`] takes a version hint.

/// Application id of the built-in broadcast tuner.
pub const LIVE_TV_APP_ID: &str = "com.webos.app.livetv";
/// Display name synthesized for the tuner when the TV omits it from its app list.
pub const LIVE_TV_TITLE: &str = "Live TV";

pub const POWER_ON: &str = "ssap://system/turnOn";
pub const POWER_OFF: &str = "ssap://system/turnOff";

pub const SET_VOLUME: &str = "ssap://audio/setVolume";
pub const VOLUME_UP: &str = "ssap://audio/volumeUp";
pub const VOLUME_DOWN: &str = "ssap://audio/volumeDown";
pub const SET_MUTE: &str = "ssap://audio/setMute";
pub const CHANGE_SOUND_OUTPUT: &str = "ssap://audio/changeSoundOutput";

pub const MEDIA_PLAY: &str = "ssap://media.controls/play";
pub const MEDIA_PAUSE: &str = "ssap://media.controls/pause";
pub const MEDIA_STOP: &str = "ssap://media.controls/stop";
pub const MEDIA_FAST_FORWARD: &str = "ssap://media.controls/fastForward";
pub const MEDIA_REWIND: &str = "ssap://media.controls/rewind";

pub const CHANNEL_UP: &str = "ssap://tv/channelUp";
pub const CHANNEL_DOWN: &str = "ssap://tv/channelDown";

pub const LAUNCH_APP: &str = "ssap://system.launcher/launch";
pub const SET_INPUT: &str = "ssap://tv/switchInput";

pub const GET_SOFTWARE_INFO: &str = "ssap://com.webos.service.update/getCurrentSWInformation";

const TURN_ON_SCREEN: &str = "ssap://com.webos.service.tvpower/power/turnOnScreen";
const TURN_OFF_SCREEN: &str = "ssap://com.webos.service.tvpower/power/turnOffScreen";
const TURN_ON_SCREEN_WO4: &str = "ssap://com.webos.service.tv.power/turnOnScreen";
const TURN_OFF_SCREEN_WO4: &str = "ssap://com.webos.service.tv.power/turnOffScreen";

/// Screen on/off endpoint for a given webOS major version hint.
///
/// An empty hint selects the current firmware service. Returns `None` for
/// versions whose endpoint is unknown, which callers must reject up front.
pub fn screen_endpoint(on: bool, webos_ver: &str) -> Option<&'static str> {
    match (webos_ver, on) {
        ("", true) => Some(TURN_ON_SCREEN),
        ("", false) => Some(TURN_OFF_SCREEN),
        ("4", true) => Some(TURN_ON_SCREEN_WO4),
        ("4", false) => Some(TURN_OFF_SCREEN_WO4),
        _ => None,
    }
}

/// Sound output identifiers paired with their display names, in menu order.
pub const SOUND_OUTPUTS: &[(&str, &str)] = &[
    ("tv_speaker", "Internal TV speaker"),
    ("external_speaker", "Audio out (optical/HDMI ARC)"),
    ("external_optical", "Audio out (optical)"),
    ("external_arc", "Audio out (HDMI ARC)"),
    ("lineout", "Audio out (line out)"),
    ("headphone", "Headphones"),
    ("tv_external_speaker", "TV speaker and optical"),
    ("tv_speaker_headphone", "TV speaker and headphones"),
    ("bt_soundbar", "Bluetooth soundbar and bluetooth devices"),
    ("soundbar", "Optical soundbar"),
];

/// Display name for a raw sound output identifier.
pub fn sound_output_name(id: &str) -> Option<&'static str> {
    SOUND_OUTPUTS
        .iter()
        .find(|(raw, _)| *raw == id)
        .map(|(_, name)| *name)
}

/// Raw identifier for a sound output display name.
pub fn sound_output_id(name: &str) -> Option<&'static str> {
    SOUND_OUTPUTS
        .iter()
        .find(|(_, display)| *display == name)
        .map(|(raw, _)| *raw)
}

/// All sound output display names, in menu order.
pub fn sound_output_names() -> Vec<String> {
    SOUND_OUTPUTS.iter().map(|(_, name)| name.to_string()).collect()
}
