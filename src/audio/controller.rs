//! The device/role control engine.
//!
//! [`MicController`] binds one device per capture role, keeps the bindings
//! valid across hot-plug and default-device reassignment, and fans status
//! and level changes out to listeners. All public methods are callable from
//! any thread.
//!
//! Threading model: OS notification callbacks only flip a per-role pending
//! flag; the actual reload runs on a dedicated per-role worker thread,
//! serialized with every other reload through the table lock. A change
//! arriving while a reload for the same role is still pending coalesces into
//! it, since the worker re-resolves the current default when it runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::device::{Device, MicStatus, EMPTY_DEVICE_ID};
use super::level::LevelNotifier;
use super::roles::{Role, RoleTable};
use super::sink::EventContext;
use super::system::AudioSystem;

/// Handle returned by `add_*_listener`, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Status fan-out callback. Runs on OS notification threads; must not block.
pub type StatusListener = Arc<dyn Fn(MicStatus) + Send + Sync>;

/// Level fan-out callback, invoked with values in `[0.0, 1.0]`.
pub type LevelListener = Arc<dyn Fn(f32) + Send + Sync>;

/// Depth-1 coalescing queue feeding one reload worker.
#[derive(Default)]
struct ReloadSlot {
    pending: bool,
    stop: bool,
}

#[derive(Default)]
struct ReloadQueue {
    slot: Mutex<ReloadSlot>,
    ready: Condvar,
}

impl ReloadQueue {
    fn push(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending = true;
        self.ready.notify_one();
    }

    fn close(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).stop = true;
        self.ready.notify_all();
    }

    /// Block until work or shutdown; `true` means a reload is due.
    fn wait(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if slot.stop {
                return false;
            }
            if slot.pending {
                slot.pending = false;
                return true;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Orchestrates per-role devices, reloads and listener fan-out.
pub struct MicController<A: AudioSystem> {
    system: A,
    context: EventContext,
    /// The reload lock: guards the role table and serializes reloads.
    table: Mutex<RoleTable<A::Endpoint>>,
    started: AtomicBool,
    status_listeners: Mutex<Vec<(ListenerId, StatusListener)>>,
    level_listeners: Mutex<Vec<(ListenerId, LevelListener)>>,
    next_listener_id: AtomicU64,
    level: LevelNotifier,
    queues: [Arc<ReloadQueue>; 3],
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: AudioSystem> MicController<A> {
    /// Build the controller and resolve the initial device for every role.
    ///
    /// Synchronous queries work immediately; live notifications start with
    /// [`start`](Self::start).
    pub fn new(system: A) -> Arc<Self> {
        let context = EventContext::generate();
        let mut table = RoleTable::new(context);
        for role in Role::PRIORITY {
            let device = Self::resolve_device(&system, &table, role, context);
            table.bind(role, device);
        }
        let controller = Arc::new(Self {
            system,
            context,
            table: Mutex::new(table),
            started: AtomicBool::new(false),
            status_listeners: Mutex::new(Vec::new()),
            level_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            level: LevelNotifier::new(),
            queues: Default::default(),
            workers: Mutex::new(Vec::new()),
        });
        info!(
            main = %controller.device(None).id(),
            "controller initialized"
        );
        controller
    }

    /// One-time activation: spawn the reload workers, register the OS
    /// default-device-change subscription, attach a volume sink to every
    /// role's device and fire an initial status update. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for role in Role::PRIORITY {
            self.spawn_reload_worker(role);
        }
        let weak = Arc::downgrade(self);
        let subscribed = self
            .system
            .subscribe_default_changes(Box::new(move |role, device_id| {
                if let Some(controller) = weak.upgrade() {
                    controller.on_default_device_changed(role, device_id.as_deref());
                }
            }));
        if let Err(e) = subscribed {
            warn!(error = %e, "default-device-change subscription failed");
        }
        for role in Role::PRIORITY {
            self.attach_sink(role);
        }
        self.emit_status();
        info!("controller started");
    }

    /// Mute one role, or every role (deduplicated by device id) when `role`
    /// is omitted.
    pub fn mute(&self, role: Option<Role>) {
        self.apply_mute(role, true);
    }

    /// Unmute one role, or every role when `role` is omitted.
    pub fn unmute(&self, role: Option<Role>) {
        self.apply_mute(role, false);
    }

    /// Toggle one role; with no role, invert the main device's state and
    /// apply that same target state to every role's device.
    pub fn toggle(&self, role: Option<Role>) {
        match role {
            Some(role) => {
                self.device(Some(role)).toggle();
            }
            None => {
                let target = !self.is_muted(None);
                for device in self.devices_for(None) {
                    device.set_mute(target);
                }
            }
        }
        self.emit_status();
    }

    /// Mute state of one role's device, or of the main device.
    pub fn is_muted(&self, role: Option<Role>) -> bool {
        self.device(role).is_muted()
    }

    /// Status of one role's device, or of the main device.
    pub fn status(&self, role: Option<Role>) -> MicStatus {
        Self::status_of(&self.device(role))
    }

    /// Peak level of one role's device, or of the main device.
    pub fn level(&self, role: Option<Role>) -> f32 {
        self.device(role).level()
    }

    /// Whether the device is actively capturing. Detection is not
    /// implemented; always `false`.
    pub fn is_in_use(&self, _role: Option<Role>) -> bool {
        false
    }

    /// The device bound to `role`, or the main device when omitted.
    pub fn device(&self, role: Option<Role>) -> Arc<Device<A::Endpoint>> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match role {
            Some(role) => Arc::clone(table.get(role)),
            None => Arc::clone(table.main_device()),
        }
    }

    /// The role the main device resolves to.
    pub fn main_role(&self) -> Role {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .main_role()
    }

    /// Register a status listener. The current status is delivered
    /// synchronously before this returns.
    pub fn add_status_listener(&self, listener: StatusListener) -> ListenerId {
        let id = self.next_id();
        self.status_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::clone(&listener)));
        let status = self.status(None);
        if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
            error!("status listener panicked");
        }
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) {
        self.status_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(lid, _)| *lid != id);
    }

    /// Register a level listener. The current level is delivered
    /// synchronously before this returns; the first listener starts the
    /// polling thread.
    pub fn add_level_listener(self: &Arc<Self>, listener: LevelListener) -> ListenerId {
        let id = self.next_id();
        let first = {
            let mut listeners = self
                .level_listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let first = listeners.is_empty();
            listeners.push((id, Arc::clone(&listener)));
            first
        };
        if first {
            self.start_level_notifier();
        }
        let level = self.level(None);
        if catch_unwind(AssertUnwindSafe(|| listener(level))).is_err() {
            error!("level listener panicked");
        }
        id
    }

    /// Remove a level listener; the last removal stops and joins the
    /// polling thread.
    pub fn remove_level_listener(&self, id: ListenerId) {
        let empty = {
            let mut listeners = self
                .level_listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|(lid, _)| *lid != id);
            listeners.is_empty()
        };
        if empty {
            self.level.stop();
        }
    }

    /// Rebind `role` to the current OS default device.
    ///
    /// Runs the swap under the table lock: capture the role's previous
    /// status, tear down the outgoing device (unless another role still
    /// binds it), resolve and bind the new default (reusing another role's
    /// instance when the ids match), then re-assert the captured status on
    /// the new device. The status to restore is the role's logical state,
    /// not the new device's native mute bit.
    pub fn reload(self: &Arc<Self>, role: Role) {
        let bound_id;
        {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let old = Arc::clone(table.get(role));
            let old_status = Self::status_of(&old);
            if !old.is_empty() {
                if table.is_shared_elsewhere(role, old.id()) {
                    debug!(role = ?role, device = %old.id(), "outgoing device still bound elsewhere, keeping it alive");
                } else {
                    old.unmute();
                    old.destroy();
                }
            }
            let device = Self::resolve_device(&self.system, &table, role, self.context);
            table.bind(role, Arc::clone(&device));
            match old_status {
                MicStatus::Muted => device.mute(),
                MicStatus::Unmuted => device.unmute(),
                MicStatus::Disabled | MicStatus::InUse => {}
            }
            bound_id = device.id().to_string();
        }
        if self.started.load(Ordering::SeqCst) {
            self.attach_sink(role);
            self.emit_status();
        }
        info!(role = ?role, device = %bound_id, "role reloaded");
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Resolve the default device for `role`: reuse another role's live
    /// instance when the ids match, otherwise open the endpoint; any failure
    /// binds the empty sentinel.
    fn resolve_device(
        system: &A,
        table: &RoleTable<A::Endpoint>,
        role: Role,
        context: EventContext,
    ) -> Arc<Device<A::Endpoint>> {
        let Some(id) = system.default_device_id(role) else {
            debug!(role = ?role, "no default capture device");
            return Arc::new(Device::empty(context));
        };
        if let Some(existing) = table.find_shared(role, &id) {
            debug!(role = ?role, device = %id, "reusing device bound to another role");
            return existing;
        }
        match system.open_endpoint(&id) {
            Ok(endpoint) => Arc::new(Device::new(id, endpoint, context)),
            Err(e) => {
                warn!(role = ?role, device = %id, error = %e, "failed to open endpoint");
                Arc::new(Device::empty(context))
            }
        }
    }

    /// OS default-device-change handler. Must return promptly: it only
    /// detects whether the bound id actually changed and, if so, flags the
    /// role's reload worker.
    fn on_default_device_changed(&self, role: Role, device_id: Option<&str>) {
        let current = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.get(role).id().to_string()
        };
        let announced = device_id.unwrap_or(EMPTY_DEVICE_ID);
        if current == announced {
            debug!(role = ?role, device = %announced, "default unchanged, ignoring");
            return;
        }
        info!(role = ?role, from = %current, to = %announced, "default device changed");
        self.queues[role.index()].push();
    }

    fn spawn_reload_worker(self: &Arc<Self>, role: Role) {
        let queue = Arc::clone(&self.queues[role.index()]);
        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("reload-{}", role.index()))
            .spawn(move || {
                if let Some(controller) = weak.upgrade() {
                    controller.system.attach_thread();
                }
                while queue.wait() {
                    let Some(controller) = weak.upgrade() else {
                        break;
                    };
                    let run = catch_unwind(AssertUnwindSafe(|| controller.reload(role)));
                    if run.is_err() {
                        error!(role = ?role, "reload panicked");
                    }
                }
            });
        match spawned {
            Ok(handle) => self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle),
            Err(e) => error!(role = ?role, error = %e, "failed to spawn reload worker"),
        }
    }

    /// Attach (or retarget) the volume sink for a role's device so external
    /// mute changes are folded back into status updates.
    fn attach_sink(self: &Arc<Self>, role: Role) {
        let device = self.device(Some(role));
        if device.is_empty() {
            return;
        }
        let weak = Arc::downgrade(self);
        device.set_volume_callback(Arc::new(move |muted| {
            if let Some(controller) = weak.upgrade() {
                debug!(muted, "external mute change");
                controller.emit_status();
            }
        }));
    }

    fn apply_mute(&self, role: Option<Role>, muted: bool) {
        for device in self.devices_for(role) {
            device.set_mute(muted);
        }
        self.emit_status();
    }

    /// Target set for a mute write: one role's device, or every bound device
    /// deduplicated by id so a shared device receives a single write.
    fn devices_for(&self, role: Option<Role>) -> Vec<Arc<Device<A::Endpoint>>> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        match role {
            Some(role) => vec![Arc::clone(table.get(role))],
            None => table.distinct_devices(),
        }
    }

    fn status_of(device: &Device<A::Endpoint>) -> MicStatus {
        if device.is_empty() || device.is_destroyed() {
            MicStatus::Disabled
        } else if device.is_muted() {
            MicStatus::Muted
        } else {
            MicStatus::Unmuted
        }
    }

    /// Push the current main status to every status listener. Computed after
    /// any table mutation that triggered the push; a panicking listener is
    /// isolated from the rest.
    fn emit_status(&self) {
        let status = self.status(None);
        let listeners: Vec<StatusListener> = self
            .status_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                error!("status listener panicked");
            }
        }
    }

    fn emit_level(&self, level: f32) {
        let listeners: Vec<LevelListener> = self
            .level_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(level))).is_err() {
                error!("level listener panicked");
            }
        }
    }

    fn start_level_notifier(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let setup_weak = Arc::downgrade(self);
        self.level.start(
            move || {
                if let Some(controller) = setup_weak.upgrade() {
                    controller.system.attach_thread();
                }
            },
            move || {
                let Some(controller) = weak.upgrade() else {
                    return false;
                };
                match catch_unwind(AssertUnwindSafe(|| controller.level(None))) {
                    Ok(level) => controller.emit_level(level),
                    Err(_) => error!("level read panicked"),
                }
                true
            },
        );
    }
}

impl<A: AudioSystem> Drop for MicController<A> {
    fn drop(&mut self) {
        self.level.stop();
        for queue in &self.queues {
            queue.close();
        }
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            let _ = handle.join();
        }
    }
}
