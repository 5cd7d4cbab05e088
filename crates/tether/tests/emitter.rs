use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use tether::{Emitter, Event};
use tracing_test::traced_test;

fn given_event(emitter: &Emitter) -> Event<u32> {
    emitter.event::<u32>("data")
}

#[test]
#[traced_test]
fn listeners_run_in_registration_order() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..4 {
        let order = order.clone();
        event.listen(move |value| order.lock().unwrap().push((tag, *value)));
    }

    event.emit(&7);

    let order = order.lock().unwrap();
    assert_eq!(*order, vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
}

#[test]
#[traced_test]
fn once_listener_runs_at_most_once() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        event.listen_once(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    event.emit(&1);
    event.emit(&2);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(event.count(), 0);
}

#[test]
#[traced_test]
fn once_listener_is_removed_before_invocation() {
    // A once-listener that re-entrantly emits its own event must not be
    // re-invoked by the nested emission.
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = count.clone();
        let nested = event.clone();
        event.listen_once(move |value| {
            count.fetch_add(1, Ordering::SeqCst);
            if *value == 0 {
                nested.emit(&1);
            }
        });
    }

    event.emit(&0);

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
#[traced_test]
fn additions_during_emission_are_deferred() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let late_calls = Arc::new(AtomicUsize::new(0));
    {
        let late_calls = late_calls.clone();
        let inner = event.clone();
        event.listen_once(move |_| {
            let late_calls = late_calls.clone();
            inner.listen(move |_| {
                late_calls.fetch_add(1, Ordering::SeqCst);
            });
        });
    }

    event.emit(&1);
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);

    event.emit(&2);
    assert_eq!(late_calls.load(Ordering::SeqCst), 1);
}

#[test]
#[traced_test]
fn removal_during_emission_skips_pending_listener() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let removed_calls = Arc::new(AtomicUsize::new(0));

    // The second listener's id is only known after registration, so route it
    // through a shared slot the first listener reads.
    let victim_id = Arc::new(Mutex::new(None));
    {
        let victim_id = victim_id.clone();
        let inner = event.clone();
        event.listen(move |_| {
            if let Some(id) = *victim_id.lock().unwrap() {
                inner.remove(id);
            }
        });
    }
    {
        let removed_calls = removed_calls.clone();
        let id = event.listen(move |_| {
            removed_calls.fetch_add(1, Ordering::SeqCst);
        });
        *victim_id.lock().unwrap() = Some(id);
    }

    event.emit(&1);

    assert_eq!(removed_calls.load(Ordering::SeqCst), 0);
    assert_eq!(event.count(), 1);
}

#[test]
#[traced_test]
fn meta_events_report_added_and_removed() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let added = Arc::new(Mutex::new(Vec::new()));
    let removed = Arc::new(Mutex::new(Vec::new()));
    {
        let added = added.clone();
        emitter.on_listener_added(move |(name, id)| added.lock().unwrap().push((*name, *id)));
    }
    {
        let removed = removed.clone();
        emitter.on_listener_removed(move |(name, id)| removed.lock().unwrap().push((*name, *id)));
    }

    let id = event.listen(|_| {});
    event.remove(id);

    assert_eq!(*added.lock().unwrap(), vec![("data", id)]);
    assert_eq!(*removed.lock().unwrap(), vec![("data", id)]);
}

#[test]
#[traced_test]
fn max_listeners_ceiling_is_advisory() {
    let emitter = Emitter::with_max_listeners(1);
    let event = given_event(&emitter);

    let warnings = Arc::new(AtomicUsize::new(0));
    {
        let warnings = warnings.clone();
        emitter.on_max_listeners_warning(move |_| {
            warnings.fetch_add(1, Ordering::SeqCst);
        });
    }

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let calls = calls.clone();
        event.listen(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    event.emit(&1);

    // Still appended past the ceiling, but warned for each excess listener.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(warnings.load(Ordering::SeqCst), 2);
}

#[test]
#[traced_test]
fn remove_all_listeners_clears_one_or_all() {
    let emitter = Emitter::new();
    let data = emitter.event::<u32>("data");
    let other = emitter.event::<u32>("other");

    data.listen(|_| {});
    data.listen(|_| {});
    other.listen(|_| {});

    emitter.remove_all_listeners(Some("data"));
    assert_eq!(emitter.listener_count("data"), 0);
    assert_eq!(emitter.listener_count("other"), 1);

    emitter.remove_all_listeners(None);
    assert_eq!(emitter.listener_count("other"), 0);
}

#[test]
#[traced_test]
fn emitting_without_listeners_is_a_noop() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    event.emit(&1);
}

#[test]
#[traced_test]
fn handled_error_event_is_delivered() {
    let emitter = Emitter::new();
    let error = emitter.fatal_event::<tether::Error>("error");

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        error.listen(move |err| seen.lock().unwrap().push(err.description().to_string()));
    }

    error.emit(&tether::Error::new("read failed"));

    assert_eq!(*seen.lock().unwrap(), vec!["read failed".to_string()]);
}

#[test]
#[should_panic(expected = "unhandled `error` event")]
fn unhandled_error_event_is_fatal() {
    let emitter = Emitter::new();
    let error = emitter.fatal_event::<tether::Error>("error");

    error.emit(&tether::Error::new("read failed"));
}

#[test]
#[traced_test]
fn emit_depth_tracks_reentrant_emission() {
    let emitter = Emitter::new();
    let event = given_event(&emitter);

    let observed = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        let inner = event.clone();
        let inner_emitter = emitter.clone();
        event.listen(move |value| {
            if *value == 0 {
                inner.emit(&1);
            } else {
                observed.store(inner_emitter.emit_depth(), Ordering::SeqCst);
            }
        });
    }

    assert_eq!(emitter.emit_depth(), 0);
    event.emit(&0);

    assert_eq!(observed.load(Ordering::SeqCst), 2);
    assert_eq!(emitter.emit_depth(), 0);
}
