use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use tracing::{event, Level};

/// Identity of a registered listener, used for removal.
pub type ListenerId = u64;

/// Arguments of the `listener_added`/`listener_removed` meta-events.
type MetaArgs = (&'static str, ListenerId);

/// Shared bookkeeping for a set of named [`Event`] slots.
///
/// An `Emitter` does not dispatch anything itself; it hands out typed
/// [`Event`] slots bound to a common listener-id counter, max-listener
/// ceiling, re-entrant emit-depth counter and meta-event listeners. Network
/// objects embed one emitter and expose their events as struct fields.
#[derive(Clone)]
pub struct Emitter {
    shared: Arc<Shared>,
}

struct Shared {
    next_id: AtomicU64,
    max_listeners: AtomicUsize,
    emit_depth: AtomicUsize,
    meta: Mutex<Option<MetaEvents>>,
    /// Every event created from this emitter, for emitter-wide operations.
    events: Mutex<Vec<Weak<dyn EventOps + Send + Sync>>>,
}

struct MetaEvents {
    added: Event<MetaArgs>,
    removed: Event<MetaArgs>,
    max_warning: Event<(&'static str, usize)>,
}

/// Operations available on an event slot without knowing its argument type.
trait EventOps {
    fn name(&self) -> &'static str;
    fn live_count(&self) -> usize;
    fn clear_all(&self);
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    /// Create an emitter with no listener ceiling.
    pub fn new() -> Self {
        Self::with_max_listeners(0)
    }

    /// Create an emitter with an advisory listener ceiling (0 = unlimited).
    pub fn with_max_listeners(max_listeners: usize) -> Self {
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            max_listeners: AtomicUsize::new(max_listeners),
            emit_depth: AtomicUsize::new(0),
            meta: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        });

        let meta = MetaEvents {
            added: Event::new(&shared, "listener_added", true, false),
            removed: Event::new(&shared, "listener_removed", true, false),
            max_warning: Event::new(&shared, "max_listeners_warning", true, false),
        };
        *shared.meta.lock() = Some(meta);

        Self { shared }
    }

    /// Create a named event slot bound to this emitter.
    pub fn event<A: 'static>(&self, name: &'static str) -> Event<A> {
        let event = Event::new(&self.shared, name, false, false);
        self.track(&event);
        event
    }

    /// Create a named event slot that is fatal when emitted unhandled.
    ///
    /// Used for `error` events: emitting with zero registered listeners logs
    /// at `ERROR` and panics instead of silently dropping the failure.
    pub fn fatal_event<A: 'static>(&self, name: &'static str) -> Event<A> {
        let event = Event::new(&self.shared, name, false, true);
        self.track(&event);
        event
    }

    fn track<A: 'static>(&self, event: &Event<A>) {
        let weak = Arc::downgrade(&event.core) as Weak<dyn EventOps + Send + Sync>;
        self.shared.events.lock().push(weak);
    }

    /// Listen for listeners being added to any non-meta event.
    pub fn on_listener_added(
        &self,
        listener: impl Fn(&MetaArgs) + Send + Sync + 'static,
    ) -> ListenerId {
        self.meta(|m| m.added.clone()).listen(listener)
    }

    /// Listen for listeners being removed from any non-meta event.
    pub fn on_listener_removed(
        &self,
        listener: impl Fn(&MetaArgs) + Send + Sync + 'static,
    ) -> ListenerId {
        self.meta(|m| m.removed.clone()).listen(listener)
    }

    /// Listen for the advisory max-listener ceiling being crossed.
    pub fn on_max_listeners_warning(
        &self,
        listener: impl Fn(&(&'static str, usize)) + Send + Sync + 'static,
    ) -> ListenerId {
        self.meta(|m| m.max_warning.clone()).listen(listener)
    }

    fn meta<T>(&self, select: impl FnOnce(&MetaEvents) -> T) -> T {
        let meta = self.shared.meta.lock();
        select(meta.as_ref().expect("emitter meta events not initialized"))
    }

    /// Set the advisory max-listener ceiling (0 = unlimited).
    pub fn set_max_listeners(&self, max_listeners: usize) {
        self.shared
            .max_listeners
            .store(max_listeners, Ordering::Relaxed);
    }

    /// The current re-entrant emit depth across all events of this emitter.
    pub fn emit_depth(&self) -> usize {
        self.shared.emit_depth.load(Ordering::Relaxed)
    }

    /// Count live listeners on the event with the given name.
    pub fn listener_count(&self, name: &str) -> usize {
        self.shared
            .events
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|e| e.name() == name)
            .map(|e| e.live_count())
            .sum()
    }

    /// Remove every listener from one event, or from all events.
    pub fn remove_all_listeners(&self, name: Option<&str>) {
        let events: Vec<_> = self
            .shared
            .events
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for event in events {
            if name.is_none() || name == Some(event.name()) {
                event.clear_all();
            }
        }
    }
}

/// A typed, named event slot with multiple listeners.
///
/// Listeners run synchronously, in registration order, on the emitting
/// thread. Emission iterates a snapshot of the listener list: listeners
/// added during an emission are not delivered that emission, and listeners
/// removed during an emission are skipped if they have not run yet.
pub struct Event<A> {
    core: Arc<EventCore<A>>,
}

impl<A> Clone for Event<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

struct EventCore<A> {
    name: &'static str,
    meta: bool,
    fatal_if_unhandled: bool,
    emitter: Weak<Shared>,
    listeners: Mutex<Vec<Arc<Entry<A>>>>,
}

struct Entry<A> {
    id: ListenerId,
    once: bool,
    /// Set by `remove`; skipped everywhere, swept lazily.
    removed: AtomicBool,
    /// Set when a once listener is handed to an emission snapshot.
    claimed: AtomicBool,
    callback: Box<dyn Fn(&A) + Send + Sync>,
}

impl<A> Entry<A> {
    fn live(&self) -> bool {
        !self.removed.load(Ordering::Acquire) && !(self.once && self.claimed.load(Ordering::Acquire))
    }
}

impl<A: 'static> Event<A> {
    fn new(shared: &Arc<Shared>, name: &'static str, meta: bool, fatal: bool) -> Self {
        Self {
            core: Arc::new(EventCore {
                name,
                meta,
                fatal_if_unhandled: fatal,
                emitter: Arc::downgrade(shared),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The name of this event.
    pub fn name(&self) -> &'static str {
        self.core.name
    }

    /// Register a listener; returns its id for removal.
    pub fn listen(&self, listener: impl Fn(&A) + Send + Sync + 'static) -> ListenerId {
        self.add(Box::new(listener), false)
    }

    /// Register a listener that is removed right before its first invocation.
    pub fn listen_once(&self, listener: impl Fn(&A) + Send + Sync + 'static) -> ListenerId {
        self.add(Box::new(listener), true)
    }

    fn add(&self, callback: Box<dyn Fn(&A) + Send + Sync>, once: bool) -> ListenerId {
        let Some(shared) = self.core.emitter.upgrade() else {
            return 0;
        };
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);

        let at_ceiling = {
            let mut listeners = self.core.listeners.lock();
            listeners.retain(|e| e.live());

            let max = shared.max_listeners.load(Ordering::Relaxed);
            let at_ceiling = max != 0 && listeners.len() >= max;

            // The ceiling is advisory; warn but append regardless.
            listeners.push(Arc::new(Entry {
                id,
                once,
                removed: AtomicBool::new(false),
                claimed: AtomicBool::new(false),
                callback,
            }));
            at_ceiling
        };

        if !self.core.meta {
            if at_ceiling {
                event!(
                    Level::WARN,
                    event = self.core.name,
                    "listener count exceeds max_listeners ceiling"
                );
                let warning = {
                    let meta = shared.meta.lock();
                    meta.as_ref().map(|m| m.max_warning.clone())
                };
                if let Some(warning) = warning {
                    warning.emit(&(self.core.name, shared.max_listeners.load(Ordering::Relaxed)));
                }
            }
            let added = {
                let meta = shared.meta.lock();
                meta.as_ref().map(|m| m.added.clone())
            };
            if let Some(added) = added {
                added.emit(&(self.core.name, id));
            }
        }

        id
    }

    /// Remove a listener by id; emits `listener_removed` when one matched.
    pub fn remove(&self, id: ListenerId) {
        let mut matched = false;
        {
            let mut listeners = self.core.listeners.lock();
            for entry in listeners.iter() {
                if entry.id == id && entry.live() {
                    entry.removed.store(true, Ordering::Release);
                    matched = true;
                }
            }
            listeners.retain(|e| e.live());
        }

        if matched && !self.core.meta {
            let removed = self.core.emitter.upgrade().and_then(|shared| {
                let meta = shared.meta.lock();
                meta.as_ref().map(|m| m.removed.clone())
            });
            if let Some(removed) = removed {
                removed.emit(&(self.core.name, id));
            }
        }
    }

    /// Remove every listener, silently.
    pub fn clear(&self) {
        let mut listeners = self.core.listeners.lock();
        for entry in listeners.iter() {
            entry.removed.store(true, Ordering::Release);
        }
        listeners.clear();
    }

    /// Count live listeners.
    pub fn count(&self) -> usize {
        self.core.listeners.lock().iter().filter(|e| e.live()).count()
    }

    /// Invoke every listener, in registration order, with `args`.
    ///
    /// Listeners may re-entrantly emit, listen and remove on the same event;
    /// once-listeners are claimed before invocation so a re-entrant emission
    /// never re-invokes them.
    ///
    /// # Panics
    ///
    /// Panics when this event was created with [`Emitter::fatal_event`] and
    /// no listener is registered; an unobserved failure must not be dropped.
    pub fn emit(&self, args: &A) {
        let shared = self.core.emitter.upgrade();
        let _depth = shared.as_ref().map(|s| DepthGuard::enter(&s.emit_depth));

        let snapshot: Vec<Arc<Entry<A>>> = {
            let mut listeners = self.core.listeners.lock();
            let snapshot: Vec<_> = listeners.iter().filter(|e| e.live()).cloned().collect();
            // Once-listeners are removed before their invocation begins, so
            // re-entrant emission during a callback skips them.
            for entry in &snapshot {
                if entry.once {
                    entry.claimed.store(true, Ordering::Release);
                }
            }
            listeners.retain(|e| e.live());
            snapshot
        };

        if snapshot.is_empty() {
            if self.core.fatal_if_unhandled {
                event!(Level::ERROR, event = self.core.name, "unhandled error event");
                panic!("unhandled `{}` event with no listeners", self.core.name);
            }
            return;
        }

        for entry in snapshot {
            if entry.removed.load(Ordering::Acquire) {
                continue;
            }
            (entry.callback)(args);
        }
    }
}

impl<A> EventOps for EventCore<A> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn live_count(&self) -> usize {
        self.listeners.lock().iter().filter(|e| e.live()).count()
    }

    fn clear_all(&self) {
        let mut listeners = self.listeners.lock();
        for entry in listeners.iter() {
            entry.removed.store(true, Ordering::Release);
        }
        listeners.clear();
    }
}

struct DepthGuard<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::Relaxed);
        Self { depth }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}
