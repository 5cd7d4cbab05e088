use std::sync::{Arc, Weak};

use tether::{Anchor, Emitter, Event};

#[derive(Clone)]
struct Handle(Arc<Inner>);

struct Inner {
    closed: Event<()>,
    anchor: Arc<Anchor<Handle>>,
}

fn given_anchored_object() -> (Handle, Weak<Inner>) {
    let emitter = Emitter::new();
    let closed = emitter.event("closed");
    let inner = Arc::new(Inner {
        closed: closed.clone(),
        anchor: Arc::new(Anchor::new()),
    });
    let handle = Handle(inner.clone());
    inner.anchor.clone().arm(&closed, handle.clone());

    (handle, Arc::downgrade(&inner))
}

#[test]
fn object_lives_until_terminal_event() {
    let (handle, weak) = given_anchored_object();
    let closed = handle.0.closed.clone();

    // No external references remain, but the anchor keeps it alive.
    drop(handle);
    assert!(weak.upgrade().is_some());

    closed.emit(&());
    assert!(weak.upgrade().is_none());
}

#[test]
fn terminal_event_fires_once_per_instance() {
    let (handle, weak) = given_anchored_object();
    let closed = handle.0.closed.clone();
    drop(handle);

    closed.emit(&());
    // A second emission finds no once-listener left and changes nothing.
    closed.emit(&());
    assert!(weak.upgrade().is_none());
}

#[test]
fn arming_twice_is_a_noop() {
    let (handle, weak) = given_anchored_object();
    let closed = handle.0.closed.clone();
    let anchor = handle.0.anchor.clone();

    assert!(anchor.is_armed());
    anchor.clone().arm(&closed, handle.clone());

    drop(handle);
    closed.emit(&());
    assert!(weak.upgrade().is_none());
}
