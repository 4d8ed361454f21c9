//! WASAPI backend: the production [`AudioSystem`] implementation.
//!
//! Talks to the Windows Core Audio APIs through the MMDevice enumerator,
//! `IAudioEndpointVolume` for mute control, `IAudioMeterInformation` for
//! peak levels, and COM callback objects for volume and default-device
//! notifications. Mute writes carry the engine's event-context GUID so the
//! echoed `OnNotify` can be recognised as self-originated.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;
use windows::core::{implement, GUID, PCWSTR};
use windows::Win32::Media::Audio::Endpoints::{
    IAudioEndpointVolume, IAudioEndpointVolumeCallback, IAudioEndpointVolumeCallback_Impl,
    IAudioMeterInformation,
};
use windows::Win32::Media::Audio::{
    eCapture, eCommunications, eConsole, eMultimedia, EDataFlow, ERole, IMMDevice,
    IMMDeviceEnumerator, IMMNotificationClient, IMMNotificationClient_Impl, MMDeviceEnumerator,
    AUDIO_VOLUME_NOTIFICATION_DATA, DEVICE_STATE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
};
use windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY;
// Re-export windows_core so the implement macro can find it
#[allow(unused_imports)]
use windows_core;

use super::device::AudioError;
use super::roles::Role;
use super::sink::{EventContext, VolumeSink};
use super::system::{AudioSystem, DeviceChangeListener, EndpointHandle};

/// COM initialization guard that uninitializes COM on drop.
pub struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    /// Initialize COM for the current thread. Multithreaded apartment: the
    /// engine calls endpoint methods from its own worker threads.
    pub fn new() -> Result<Self, AudioError> {
        unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED)
                .ok()
                .map_err(AudioError::ComInitFailed)?;
        }
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

thread_local! {
    static THREAD_COM: RefCell<Option<ComGuard>> = const { RefCell::new(None) };
}

fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

fn to_erole(role: Role) -> ERole {
    match role {
        Role::Console => eConsole,
        Role::Multimedia => eMultimedia,
        Role::Communications => eCommunications,
    }
}

fn from_erole(role: ERole) -> Role {
    if role == eConsole {
        Role::Console
    } else if role == eCommunications {
        Role::Communications
    } else {
        Role::Multimedia
    }
}

/// One opened capture endpoint.
pub struct WasapiEndpoint {
    volume: IAudioEndpointVolume,
    meter: Option<IAudioMeterInformation>,
    callback: Mutex<Option<IAudioEndpointVolumeCallback>>,
}

// The endpoint volume and meter objects are free-threaded WASAPI interfaces;
// the engine only calls them under MTA COM.
unsafe impl Send for WasapiEndpoint {}
unsafe impl Sync for WasapiEndpoint {}

impl EndpointHandle for WasapiEndpoint {
    fn get_mute(&self) -> Result<bool, AudioError> {
        unsafe {
            let muted = self.volume.GetMute().map_err(AudioError::WindowsError)?;
            Ok(muted.as_bool())
        }
    }

    fn set_mute(&self, muted: bool, context: EventContext) -> Result<(), AudioError> {
        let guid = GUID::from_u128(context.as_u128());
        unsafe {
            self.volume
                .SetMute(muted, &guid)
                .map_err(AudioError::WindowsError)?;
        }
        Ok(())
    }

    fn peak_level(&self) -> Result<f32, AudioError> {
        let meter = self.meter.as_ref().ok_or(AudioError::MeterNotAvailable)?;
        unsafe { meter.GetPeakValue().map_err(AudioError::WindowsError) }
    }

    fn subscribe_volume(&self, sink: Arc<VolumeSink>) -> Result<(), AudioError> {
        unsafe {
            let client: IAudioEndpointVolumeCallback = VolumeChangeCallback { sink }.into();
            self.volume
                .RegisterControlChangeNotify(&client)
                .map_err(AudioError::WindowsError)?;
            *self
                .callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(client);
        }
        Ok(())
    }

    fn unsubscribe_volume(&self) -> Result<(), AudioError> {
        let client = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            unsafe {
                self.volume
                    .UnregisterControlChangeNotify(&client)
                    .map_err(AudioError::WindowsError)?;
            }
        }
        Ok(())
    }
}

/// COM callback for `IAudioEndpointVolume` change notifications.
#[implement(IAudioEndpointVolumeCallback)]
struct VolumeChangeCallback {
    sink: Arc<VolumeSink>,
}

impl IAudioEndpointVolumeCallback_Impl for VolumeChangeCallback_Impl {
    fn OnNotify(&self, pnotify: *mut AUDIO_VOLUME_NOTIFICATION_DATA) -> windows::core::Result<()> {
        unsafe {
            if let Some(data) = pnotify.as_ref() {
                let source = EventContext::from_u128(data.guidEventContext.to_u128());
                self.sink.notify(source, data.bMuted.as_bool());
            }
        }
        Ok(())
    }
}

/// COM callback for default-device-change notifications. Capture flow only.
#[implement(IMMNotificationClient)]
struct DefaultChangeCallback {
    listener: DeviceChangeListener,
}

impl IMMNotificationClient_Impl for DefaultChangeCallback_Impl {
    fn OnDeviceStateChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnDeviceAdded(&self, _pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnDeviceRemoved(&self, _pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        if flow != eCapture {
            return Ok(());
        }
        unsafe {
            let device_id = if pwstrdefaultdeviceid.is_null() {
                None
            } else {
                pwstrdefaultdeviceid.to_string().ok()
            };
            (self.listener)(from_erole(role), device_id);
        }
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _key: &PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

/// The Windows Core Audio backend.
pub struct WasapiSystem {
    enumerator: IMMDeviceEnumerator,
    notification: Mutex<Option<IMMNotificationClient>>,
}

// MMDevice enumerator is free-threaded; used only under MTA COM.
unsafe impl Send for WasapiSystem {}
unsafe impl Sync for WasapiSystem {}

impl WasapiSystem {
    /// Create the backend. COM must already be initialized on the calling
    /// thread (see [`ComGuard`]).
    pub fn new() -> Result<Self, AudioError> {
        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                    .map_err(AudioError::WindowsError)?;
            Ok(Self {
                enumerator,
                notification: Mutex::new(None),
            })
        }
    }
}

impl AudioSystem for WasapiSystem {
    type Endpoint = WasapiEndpoint;

    fn default_device_id(&self, role: Role) -> Option<String> {
        unsafe {
            let device = self
                .enumerator
                .GetDefaultAudioEndpoint(eCapture, to_erole(role))
                .ok()?;
            let id = device.GetId().ok()?;
            id.to_string().ok()
        }
    }

    fn open_endpoint(&self, device_id: &str) -> Result<WasapiEndpoint, AudioError> {
        unsafe {
            let wide = to_wide(device_id);
            let device: IMMDevice = self
                .enumerator
                .GetDevice(PCWSTR::from_raw(wide.as_ptr()))
                .map_err(|_| AudioError::DeviceNotFound {
                    device_id: device_id.to_string(),
                })?;
            let volume: IAudioEndpointVolume = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|_| AudioError::VolumeNotAvailable)?;
            // The meter is optional; levels read 0.0 without one.
            let meter: Option<IAudioMeterInformation> = device.Activate(CLSCTX_ALL, None).ok();
            Ok(WasapiEndpoint {
                volume,
                meter,
                callback: Mutex::new(None),
            })
        }
    }

    fn subscribe_default_changes(&self, listener: DeviceChangeListener) -> Result<(), AudioError> {
        unsafe {
            let client: IMMNotificationClient = DefaultChangeCallback { listener }.into();
            self.enumerator
                .RegisterEndpointNotificationCallback(&client)
                .map_err(AudioError::WindowsError)?;
            *self
                .notification
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(client);
        }
        Ok(())
    }

    /// Initialize COM once per engine worker thread.
    fn attach_thread(&self) {
        THREAD_COM.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                match ComGuard::new() {
                    Ok(guard) => *slot = Some(guard),
                    Err(e) => warn!(error = %e, "COM initialization failed on worker thread"),
                }
            }
        });
    }
}

impl Drop for WasapiSystem {
    fn drop(&mut self) {
        let client = self
            .notification
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            unsafe {
                if let Err(e) = self
                    .enumerator
                    .UnregisterEndpointNotificationCallback(&client)
                {
                    warn!(error = %e, "failed to unregister device notifications");
                }
            }
        }
    }
}
