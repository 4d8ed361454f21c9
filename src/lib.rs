//! BetterMute - Library
//!
//! Mute and volume control for the Windows default audio-capture devices.
//!
//! ## Features
//!
//! - One tracked device per capture role (Console, Multimedia,
//!   Communications), deduplicated when roles share hardware
//! - Mute/unmute/toggle with per-role or main-device targeting
//! - Live tracking of default-device changes and hot-plug events
//! - Status and peak-level fan-out to listeners
//! - JSON settings store with change notification
//! - Single-instance PID-file handshake

pub mod audio;
pub mod instance;
pub mod settings;

pub use audio::{
    AudioError, AudioSystem, Device, EndpointHandle, EventContext, LevelListener, ListenerId,
    MicController, MicStatus, Role, StatusListener, VolumeSink, EMPTY_DEVICE_ID,
};
#[cfg(windows)]
pub use audio::wasapi::{ComGuard, WasapiSystem};
pub use settings::{Config, Corner, SettingsError, SettingsStore};
