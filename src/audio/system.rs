//! The seam between the control engine and the OS audio subsystem.
//!
//! The engine only ever talks to the OS through these two traits. The
//! production implementation is the WASAPI backend in [`super::wasapi`]
//! (Windows only); tests drive the engine through a mock. This is a test
//! seam, not a cross-platform layer.

use std::sync::Arc;

use super::device::AudioError;
use super::roles::Role;
use super::sink::{EventContext, VolumeSink};

/// Callback invoked when the OS default capture device for a role changes.
/// The id is `None` when the role no longer has a default device.
pub type DeviceChangeListener = Box<dyn Fn(Role, Option<String>) + Send + Sync>;

/// One opened capture endpoint.
///
/// All calls are synchronous and expected to return in well under a
/// millisecond; the engine may issue them while holding its reload lock.
pub trait EndpointHandle: Send + Sync + 'static {
    /// Read the endpoint's current mute state.
    fn get_mute(&self) -> Result<bool, AudioError>;

    /// Write the mute state, tagged with the caller's event context so the
    /// resulting notification can be recognised as self-originated.
    fn set_mute(&self, muted: bool, context: EventContext) -> Result<(), AudioError>;

    /// Instantaneous peak amplitude in `[0.0, 1.0]`.
    fn peak_level(&self) -> Result<f32, AudioError>;

    /// Register the volume-change sink with the OS. At most one subscription
    /// may exist per endpoint; the caller guarantees it never subscribes the
    /// same endpoint twice without unsubscribing first.
    fn subscribe_volume(&self, sink: Arc<VolumeSink>) -> Result<(), AudioError>;

    /// Tear down the volume subscription, if any.
    fn unsubscribe_volume(&self) -> Result<(), AudioError>;
}

/// The OS audio subsystem: default-device resolution, endpoint access and
/// default-device-change notifications.
pub trait AudioSystem: Send + Sync + 'static {
    type Endpoint: EndpointHandle;

    /// Id of the current default capture device for `role`, or `None` when
    /// the role has no default device.
    fn default_device_id(&self, role: Role) -> Option<String>;

    /// Open the endpoint with the given id.
    fn open_endpoint(&self, device_id: &str) -> Result<Self::Endpoint, AudioError>;

    /// Register the process-wide default-device-change subscription. Called
    /// at most once, from [`MicController::start`](super::MicController::start).
    fn subscribe_default_changes(&self, listener: DeviceChangeListener) -> Result<(), AudioError>;

    /// Per-thread setup hook, invoked once at the top of every engine worker
    /// thread. The WASAPI backend initialises COM here; the default is a
    /// no-op.
    fn attach_thread(&self) {}
}
