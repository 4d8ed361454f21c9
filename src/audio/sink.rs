//! Volume-change notification sink.
//!
//! [`VolumeSink`] sits between the OS volume callback and the controller. It
//! filters out notifications caused by this process's own mute writes and
//! forwards everything else to a retargetable callback. One sink instance
//! lives for the whole lifetime of an OS subscription; swapping the consumer
//! retargets the existing sink instead of re-registering with the OS, which
//! would double-fire notifications.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, trace};

/// Opaque tag attached to every mute write issued by this process.
///
/// Notification callbacks receive the tag of the write that caused them,
/// letting the sink tell this process's own writes apart from external ones.
/// On Windows this maps to the event-context GUID of
/// `IAudioEndpointVolume::SetMute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext(u128);

impl EventContext {
    /// The null context: a change that carried no event-context tag
    /// (external applications, or the Sound control panel).
    pub const EXTERNAL: EventContext = EventContext(0);

    /// Generate the private context for this process instance.
    ///
    /// Only compared for equality within one process, so pid mixed with the
    /// clock is plenty; the low bit is forced so it can never collide with
    /// [`EventContext::EXTERNAL`].
    pub fn generate() -> Self {
        let pid = u128::from(std::process::id());
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        EventContext(((pid << 96) ^ nanos) | 1)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    pub fn from_u128(raw: u128) -> Self {
        EventContext(raw)
    }
}

/// Callback invoked with the new mute state on externally-sourced changes.
pub type VolumeTarget = Arc<dyn Fn(bool) + Send + Sync>;

/// Adapter bound to one OS volume subscription.
///
/// Holds the current target callback behind a lock so the consumer can be
/// swapped (`retarget`) without touching the OS-side registration.
pub struct VolumeSink {
    context: EventContext,
    target: Mutex<VolumeTarget>,
}

impl VolumeSink {
    pub fn new(context: EventContext, target: VolumeTarget) -> Self {
        Self {
            context,
            target: Mutex::new(target),
        }
    }

    /// Replace the target callback, leaving the OS subscription untouched.
    pub fn retarget(&self, target: VolumeTarget) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target;
    }

    /// Deliver an OS notification to the current target.
    ///
    /// Changes tagged with this process's own context are dropped: the call
    /// site that issued the write already pushes a status update itself, and
    /// forwarding the echo would notify listeners twice. Runs on an OS
    /// notification thread, so a panicking target is caught and logged rather
    /// than unwound into foreign code.
    pub fn notify(&self, source: EventContext, muted: bool) {
        if source == self.context {
            trace!(muted, "dropping self-originated volume notification");
            return;
        }
        let target = Arc::clone(&self.target.lock().unwrap_or_else(PoisonError::into_inner));
        if catch_unwind(AssertUnwindSafe(|| target(muted))).is_err() {
            error!("volume notification target panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn generated_context_is_never_external() {
        assert_ne!(EventContext::generate(), EventContext::EXTERNAL);
    }

    #[test]
    fn drops_same_context_notifications() {
        let ctx = EventContext::generate();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let sink = VolumeSink::new(
            ctx,
            Arc::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sink.notify(ctx, true);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sink.notify(EventContext::EXTERNAL, true);
        sink.notify(EventContext::from_u128(42), false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retarget_swaps_the_consumer() {
        let sink = VolumeSink::new(EventContext::generate(), Arc::new(|_| {}));
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        sink.retarget(Arc::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        sink.notify(EventContext::EXTERNAL, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_target_is_contained() {
        let sink = VolumeSink::new(
            EventContext::generate(),
            Arc::new(|_| panic!("listener bug")),
        );
        // Must not unwind out of notify.
        sink.notify(EventContext::EXTERNAL, true);
    }
}
