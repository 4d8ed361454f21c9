//! Microphone control engine.
//!
//! Tracks one capture device per Windows endpoint role, keeps the bindings
//! valid across hot-plug and default-device changes, and fans status and
//! level updates out to listeners. The OS is reached through the traits in
//! [`system`]; the WASAPI backend in [`wasapi`] is the production
//! implementation.

pub mod controller;
pub mod device;
pub mod level;
pub mod roles;
pub mod sink;
pub mod system;
#[cfg(windows)]
pub mod wasapi;

pub use controller::{LevelListener, ListenerId, MicController, StatusListener};
pub use device::{AudioError, Device, MicStatus, EMPTY_DEVICE_ID};
pub use level::POLL_INTERVAL;
pub use roles::{Role, RoleTable};
pub use sink::{EventContext, VolumeSink, VolumeTarget};
pub use system::{AudioSystem, DeviceChangeListener, EndpointHandle};
