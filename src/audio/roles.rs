//! Capture roles and the role-to-device table.
//!
//! Windows assigns an independent default capture device to each of the
//! three endpoint roles. The engine binds one [`Device`] per role; two roles
//! whose defaults resolve to the same device id share a single `Arc` so the
//! OS volume subscription exists once per physical device.

use std::sync::Arc;

use super::device::Device;
use super::sink::EventContext;
use super::system::EndpointHandle;

/// Audio endpoint role (maps to the Windows `ERole` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Role {
    /// Games, system sounds, most general applications.
    Console = 0,

    /// Music and video players.
    Multimedia = 1,

    /// Teams, Zoom, Discord and other VoIP applications.
    Communications = 2,
}

impl Role {
    /// All roles, in "main device" resolution order: the main device is the
    /// first role in this list with a live device bound.
    pub const PRIORITY: [Role; 3] = [Role::Communications, Role::Multimedia, Role::Console];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Fully-populated mapping from role to its bound device.
///
/// Every slot always holds a device; "nothing bound" is the empty sentinel,
/// never an absent entry. Sharing between slots is explicit `Arc` identity.
pub struct RoleTable<E> {
    slots: [Arc<Device<E>>; 3],
}

impl<E: EndpointHandle> RoleTable<E> {
    /// A table with every role bound to one shared empty sentinel.
    pub fn new(context: EventContext) -> Self {
        let empty = Arc::new(Device::empty(context));
        Self {
            slots: [Arc::clone(&empty), Arc::clone(&empty), empty],
        }
    }

    pub fn get(&self, role: Role) -> &Arc<Device<E>> {
        &self.slots[role.index()]
    }

    pub fn bind(&mut self, role: Role, device: Arc<Device<E>>) {
        self.slots[role.index()] = device;
    }

    /// Live device with the given id bound to some role other than `role`,
    /// for reuse instead of opening the endpoint a second time.
    pub fn find_shared(&self, role: Role, id: &str) -> Option<Arc<Device<E>>> {
        Role::PRIORITY
            .iter()
            .filter(|r| **r != role)
            .map(|r| self.get(*r))
            .find(|d| d.id() == id && !d.is_empty() && !d.is_destroyed())
            .cloned()
    }

    /// Whether a role other than `role` still binds a live device with this
    /// id. Such a device must not be torn down during `role`'s reload.
    pub fn is_shared_elsewhere(&self, role: Role, id: &str) -> bool {
        self.find_shared(role, id).is_some()
    }

    /// The main device: first role in priority order with a live device.
    /// With no live device anywhere, the first non-destroyed slot (normally
    /// the sentinel) keeps the main device defined.
    pub fn main_device(&self) -> &Arc<Device<E>> {
        Role::PRIORITY
            .iter()
            .map(|r| self.get(*r))
            .find(|d| !d.is_empty() && !d.is_destroyed())
            .or_else(|| {
                Role::PRIORITY
                    .iter()
                    .map(|r| self.get(*r))
                    .find(|d| !d.is_destroyed())
            })
            .unwrap_or_else(|| self.get(Role::Communications))
    }

    /// The role the main device is bound to.
    pub fn main_role(&self) -> Role {
        Role::PRIORITY
            .into_iter()
            .find(|r| {
                let d = self.get(*r);
                !d.is_empty() && !d.is_destroyed()
            })
            .unwrap_or(Role::Communications)
    }

    /// Bound devices deduplicated by id, for whole-table mute operations:
    /// a device shared across roles appears once.
    pub fn distinct_devices(&self) -> Vec<Arc<Device<E>>> {
        let mut seen: Vec<Arc<Device<E>>> = Vec::with_capacity(3);
        for role in Role::PRIORITY {
            let device = self.get(role);
            if !seen.iter().any(|d| d.id() == device.id()) {
                seen.push(Arc::clone(device));
            }
        }
        seen
    }
}
