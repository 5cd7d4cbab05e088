use parking_lot::Mutex;

use crate::Event;

/// Keeps a shared-ownership object alive until its terminal event fires.
///
/// Network objects frequently outlive the scope that created them: callbacks
/// registered with the reactor are the only thing referencing them. An
/// `Anchor` embedded in the object holds a strong handle to the object
/// itself, released the first time the armed terminal event (conventionally
/// `closed`) is emitted. External references then decide actual
/// deallocation.
pub struct Anchor<T: Send + 'static> {
    slot: Mutex<Slot<T>>,
}

enum Slot<T> {
    Disarmed,
    Armed(Option<T>),
}

impl<T: Send + 'static> Default for Anchor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Anchor<T> {
    /// Create an unarmed anchor.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Disarmed),
        }
    }

    /// Hold `handle` until the first emission of `terminal`.
    ///
    /// Arming an already-armed anchor is a no-op.
    pub fn arm<A: 'static>(self: std::sync::Arc<Self>, terminal: &Event<A>, handle: T) {
        {
            let mut slot = self.slot.lock();
            if matches!(*slot, Slot::Armed(_)) {
                return;
            }
            *slot = Slot::Armed(Some(handle));
        }

        let anchor = std::sync::Arc::downgrade(&self);
        terminal.listen_once(move |_| {
            if let Some(anchor) = anchor.upgrade() {
                anchor.release();
            }
        });
    }

    /// Drop the held handle, if any.
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        if let Slot::Armed(handle) = &mut *slot {
            *handle = None;
        }
    }

    /// Whether the anchor has been armed.
    pub fn is_armed(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Armed(_))
    }
}
