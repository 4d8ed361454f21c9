//! Mock audio backend for engine tests.
//!
//! Keeps per-device-id state shared across endpoint opens, counts subscribe
//! and mute-write calls, and lets tests fire the same notifications the OS
//! would: default-device changes and externally-sourced mute changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bettermute::audio::{
    AudioError, AudioSystem, DeviceChangeListener, EndpointHandle, EventContext, Role, VolumeSink,
};

/// Shared state for one device id, surviving across endpoint opens.
#[derive(Default)]
pub struct EndpointState {
    pub muted: AtomicBool,
    pub peak: Mutex<f32>,
    sink: Mutex<Option<Arc<VolumeSink>>>,
    pub subscribe_calls: AtomicUsize,
    pub live_subscriptions: AtomicUsize,
    pub mute_writes: AtomicUsize,
}

pub struct MockEndpoint {
    state: Arc<EndpointState>,
}

impl EndpointHandle for MockEndpoint {
    fn get_mute(&self) -> Result<bool, AudioError> {
        Ok(self.state.muted.load(Ordering::SeqCst))
    }

    fn set_mute(&self, muted: bool, context: EventContext) -> Result<(), AudioError> {
        self.state.mute_writes.fetch_add(1, Ordering::SeqCst);
        let previous = self.state.muted.swap(muted, Ordering::SeqCst);
        // The OS only notifies on an actual change, tagged with the writer's
        // event context.
        if previous != muted {
            let sink = self.state.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink.notify(context, muted);
            }
        }
        Ok(())
    }

    fn peak_level(&self) -> Result<f32, AudioError> {
        Ok(*self.state.peak.lock().unwrap())
    }

    fn subscribe_volume(&self, sink: Arc<VolumeSink>) -> Result<(), AudioError> {
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state.live_subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.state.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn unsubscribe_volume(&self) -> Result<(), AudioError> {
        if self.state.sink.lock().unwrap().take().is_some() {
            self.state.live_subscriptions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockInner {
    defaults: Mutex<HashMap<Role, String>>,
    endpoints: Mutex<HashMap<String, Arc<EndpointState>>>,
    listener: Mutex<Option<DeviceChangeListener>>,
}

/// Cheap-clone mock system; clones share all state, so tests keep a handle
/// after handing one clone to the controller.
#[derive(Clone, Default)]
pub struct MockSystem {
    inner: Arc<MockInner>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a role's default device without firing a notification.
    pub fn set_default(&self, role: Role, id: Option<&str>) {
        let mut defaults = self.inner.defaults.lock().unwrap();
        match id {
            Some(id) => {
                defaults.insert(role, id.to_string());
            }
            None => {
                defaults.remove(&role);
            }
        }
    }

    /// Set a role's default device and fire the OS change notification.
    pub fn change_default(&self, role: Role, id: Option<&str>) {
        self.set_default(role, id);
        let listener = self.inner.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener(role, id.map(String::from));
        }
    }

    /// Per-id state, created on demand.
    pub fn endpoint(&self, id: &str) -> Arc<EndpointState> {
        Arc::clone(
            self.inner
                .endpoints
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default(),
        )
    }

    /// Simulate a mute change made by another application.
    pub fn external_set_mute(&self, id: &str, muted: bool) {
        let state = self.endpoint(id);
        let previous = state.muted.swap(muted, Ordering::SeqCst);
        if previous != muted {
            let sink = state.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                sink.notify(EventContext::EXTERNAL, muted);
            }
        }
    }

    pub fn set_peak(&self, id: &str, peak: f32) {
        *self.endpoint(id).peak.lock().unwrap() = peak;
    }

    pub fn has_device_listener(&self) -> bool {
        self.inner.listener.lock().unwrap().is_some()
    }
}

impl AudioSystem for MockSystem {
    type Endpoint = MockEndpoint;

    fn default_device_id(&self, role: Role) -> Option<String> {
        self.inner.defaults.lock().unwrap().get(&role).cloned()
    }

    fn open_endpoint(&self, device_id: &str) -> Result<MockEndpoint, AudioError> {
        Ok(MockEndpoint {
            state: self.endpoint(device_id),
        })
    }

    fn subscribe_default_changes(&self, listener: DeviceChangeListener) -> Result<(), AudioError> {
        *self.inner.listener.lock().unwrap() = Some(listener);
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
