//! Capture device wrapper and status model.
//!
//! [`Device`] wraps one opened capture endpoint (or the empty sentinel) and
//! carries the engine-side lifecycle: mute control tagged with the process
//! event context, peak-level reads, single volume-sink attachment and
//! destroy-once teardown. Failure policy follows the rest of the engine:
//! nothing here returns an error to the caller, a missing or destroyed
//! device answers with defaults and a warning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use super::roles::Role;
use super::sink::{EventContext, VolumeSink, VolumeTarget};
use super::system::EndpointHandle;

/// Reserved id of the empty sentinel device. Outside the Windows endpoint-id
/// namespace, so it can never collide with a real device.
pub const EMPTY_DEVICE_ID: &str = "bettermute:no-device";

/// Microphone status as exposed to listeners and the UI collaborators.
///
/// `InUse` is reserved for actively-capturing detection, which is not
/// implemented; it is never produced today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicStatus {
    /// No device bound (empty sentinel) or the bound device was destroyed.
    Disabled,
    Unmuted,
    InUse,
    Muted,
}

/// Audio engine error type.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("no default capture device for role {role:?}")]
    NoDefaultDevice { role: Role },

    #[error("volume control not available for device")]
    VolumeNotAvailable,

    #[error("level meter not available for device")]
    MeterNotAvailable,

    #[error("string conversion error: {0}")]
    StringConversion(String),

    #[cfg(windows)]
    #[error("COM initialization failed: {0}")]
    ComInitFailed(#[source] windows::core::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[source] windows::core::Error),
}

/// One capture endpoint under engine control.
///
/// Shared between roles through `Arc` when two roles resolve to the same
/// underlying device, so exactly one OS volume subscription exists per
/// distinct device id. Two devices compare equal iff their ids match.
pub struct Device<E> {
    id: String,
    context: EventContext,
    endpoint: Mutex<Option<E>>,
    sink: Mutex<Option<Arc<VolumeSink>>>,
    destroyed: AtomicBool,
}

impl<E> PartialEq for Device<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for Device<E> {}

impl<E> std::fmt::Debug for Device<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<E: EndpointHandle> Device<E> {
    /// Wrap an opened endpoint.
    pub fn new(id: String, endpoint: E, context: EventContext) -> Self {
        Self {
            id,
            context,
            endpoint: Mutex::new(Some(endpoint)),
            sink: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The empty sentinel: no endpoint behind it, every operation is a safe
    /// warn-and-default.
    pub fn empty(context: EventContext) -> Self {
        Self {
            id: EMPTY_DEVICE_ID.to_string(),
            context,
            endpoint: Mutex::new(None),
            sink: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.id == EMPTY_DEVICE_ID
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Run `f` against the endpoint, or warn and return `default` when the
    /// device is empty or already destroyed.
    fn with_endpoint<R>(
        &self,
        op: &str,
        default: R,
        f: impl FnOnce(&E) -> Result<R, AudioError>,
    ) -> R {
        let guard = self.endpoint.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(endpoint) if !self.is_destroyed() => match f(endpoint) {
                Ok(value) => value,
                Err(e) => {
                    warn!(device = %self.id, error = %e, "{op} failed");
                    default
                }
            },
            _ => {
                warn!(device = %self.id, "{op}: no capture endpoint");
                default
            }
        }
    }

    pub fn mute(&self) {
        self.set_mute(true);
    }

    pub fn unmute(&self) {
        self.set_mute(false);
    }

    /// Write the mute state, tagged with this process's event context so the
    /// echoed OS notification is recognised as self-originated.
    pub fn set_mute(&self, muted: bool) {
        self.with_endpoint("set_mute", (), |endpoint| {
            endpoint.set_mute(muted, self.context)?;
            debug!(device = %self.id, muted, "mute state written");
            Ok(())
        });
    }

    /// Read the current state and write the opposite.
    pub fn toggle(&self) {
        let muted = self.is_muted();
        self.set_mute(!muted);
    }

    /// Current OS mute state; `false` (never "unknown") when no device.
    pub fn is_muted(&self) -> bool {
        self.with_endpoint("is_muted", false, |endpoint| endpoint.get_mute())
    }

    /// Instantaneous peak amplitude in `[0.0, 1.0]`.
    ///
    /// A muted microphone reports 0.0 regardless of the meter reading.
    pub fn level(&self) -> f32 {
        if self.is_muted() {
            return 0.0;
        }
        self.with_endpoint("level", 0.0, |endpoint| {
            endpoint.peak_level().map(|peak| peak.clamp(0.0, 1.0))
        })
    }

    /// Attach or retarget the volume-change sink.
    ///
    /// Idempotent with respect to the OS: the first call registers a sink,
    /// later calls only swap the target of the existing one. A second OS
    /// registration would double-fire every notification.
    pub fn set_volume_callback(&self, target: VolumeTarget) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sink.as_ref() {
            existing.retarget(target);
            return;
        }
        let guard = self.endpoint.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(endpoint) if !self.is_destroyed() => {
                let created = Arc::new(VolumeSink::new(self.context, target));
                match endpoint.subscribe_volume(Arc::clone(&created)) {
                    Ok(()) => *sink = Some(created),
                    Err(e) => {
                        warn!(device = %self.id, error = %e, "volume subscription failed")
                    }
                }
            }
            _ => warn!(device = %self.id, "set_volume_callback: no capture endpoint"),
        }
    }

    /// Unregister the sink, release the endpoint and mark the device
    /// destroyed. Safe to call more than once; only the first call acts.
    /// Every later operation behaves as "no device".
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let endpoint = self
            .endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(_), Some(endpoint)) = (sink.as_ref(), endpoint.as_ref()) {
            if let Err(e) = endpoint.unsubscribe_volume() {
                // The endpoint may already have vanished from the system.
                warn!(device = %self.id, error = %e, "volume unsubscribe failed");
            }
        }
        debug!(device = %self.id, "device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Minimal endpoint double for device-level tests.
    #[derive(Default)]
    struct FakeState {
        muted: AtomicBool,
        peak: Mutex<f32>,
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct FakeEndpoint(Arc<FakeState>);

    impl EndpointHandle for FakeEndpoint {
        fn get_mute(&self) -> Result<bool, AudioError> {
            Ok(self.0.muted.load(Ordering::SeqCst))
        }

        fn set_mute(&self, muted: bool, _context: EventContext) -> Result<(), AudioError> {
            self.0.muted.store(muted, Ordering::SeqCst);
            Ok(())
        }

        fn peak_level(&self) -> Result<f32, AudioError> {
            Ok(*self.0.peak.lock().unwrap())
        }

        fn subscribe_volume(&self, _sink: Arc<VolumeSink>) -> Result<(), AudioError> {
            self.0.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unsubscribe_volume(&self) -> Result<(), AudioError> {
            self.0.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device(id: &str) -> (Device<FakeEndpoint>, FakeEndpoint) {
        let endpoint = FakeEndpoint::default();
        let dev = Device::new(id.into(), endpoint.clone(), EventContext::generate());
        (dev, endpoint)
    }

    #[test]
    fn equality_is_by_id() {
        let (a1, _) = device("A");
        let (a2, _) = device("A");
        let (b, _) = device("B");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn toggle_flips_mute_state() {
        let (dev, _) = device("A");
        assert!(!dev.is_muted());
        dev.toggle();
        assert!(dev.is_muted());
        dev.toggle();
        assert!(!dev.is_muted());
    }

    #[test]
    fn level_is_zero_while_muted() {
        let (dev, endpoint) = device("A");
        *endpoint.0.peak.lock().unwrap() = 0.75;
        assert_eq!(dev.level(), 0.75);
        dev.mute();
        assert_eq!(dev.level(), 0.0);
    }

    #[test]
    fn sentinel_answers_defaults() {
        let dev: Device<FakeEndpoint> = Device::empty(EventContext::generate());
        assert!(dev.is_empty());
        dev.mute();
        dev.toggle();
        assert!(!dev.is_muted());
        assert_eq!(dev.level(), 0.0);
        dev.set_volume_callback(Arc::new(|_| {}));
        dev.destroy();
    }

    #[test]
    fn volume_callback_registers_once() {
        let (dev, endpoint) = device("A");
        dev.set_volume_callback(Arc::new(|_| {}));
        dev.set_volume_callback(Arc::new(|_| {}));
        dev.set_volume_callback(Arc::new(|_| {}));
        assert_eq!(endpoint.0.subscribes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_is_once_and_disables_everything() {
        let (dev, endpoint) = device("A");
        dev.set_volume_callback(Arc::new(|_| {}));
        dev.destroy();
        dev.destroy();
        assert_eq!(endpoint.0.unsubscribes.load(Ordering::SeqCst), 1);
        assert!(dev.is_destroyed());
        // Post-destroy operations must not touch the endpoint.
        dev.mute();
        assert!(!endpoint.0.muted.load(Ordering::SeqCst));
        assert!(!dev.is_muted());
        assert_eq!(dev.level(), 0.0);
    }
}
