use std::io;

use tether::Error;

#[test]
fn pairs_preserve_order_and_duplicates() {
    let mut error = Error::new("connect failed");
    error
        .add("where", "net_stream::connect")
        .add("attempt", "1")
        .add("attempt", "2");

    let names: Vec<&str> = error.pairs().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["description", "where", "attempt", "attempt"]);
    assert_eq!(error.get("attempt"), Some("1"));
    assert_eq!(error.description(), "connect failed");
}

#[test]
#[should_panic(expected = "frozen")]
fn mutating_a_frozen_error_panics() {
    let mut error = Error::new("oops");
    error.freeze();
    error.add("where", "here");
}

#[test]
fn attaching_a_child_freezes_it() {
    let mut child = Error::new("root cause");
    child.add("error_code", "104");
    assert!(!child.is_frozen());

    let mut error = Error::new("request failed");
    error.set_child(child);

    let child = error.child().expect("child attached");
    assert!(child.is_frozen());
    assert_eq!(child.get("error_code"), Some("104"));

    error.clear_child();
    assert!(!error.has_child());
}

#[test]
fn display_nests_children_with_prefix() {
    let mut error = Error::new("request failed");
    error.add("where", "http_connection::start");
    error.set_child(Error::new("root cause"));

    let rendered = error.to_string();
    assert!(rendered.starts_with("Description: request failed\n"));
    assert!(rendered.contains("'where', 'http_connection::start'"));
    assert!(rendered.contains("# Description: root cause"));
}

#[test]
fn io_errors_carry_category_and_code() {
    let io_error = io::Error::from_raw_os_error(104);
    let error = Error::from(io_error);

    assert_eq!(error.get("category"), Some("system"));
    assert_eq!(error.get("error_code"), Some("104"));
    assert!(error.has_exception());
}

#[test]
fn exception_is_found_through_children() {
    let child = Error::with_exception("inner", anyhow::anyhow!("boom"));
    let mut error = Error::new("outer");
    assert!(!error.has_exception());

    error.set_child(child);
    assert!(error.has_exception());
    assert_eq!(error.exception().unwrap().to_string(), "boom");
}

#[test]
fn not_implemented_is_categorized() {
    let error = Error::not_implemented("set_timeout");
    assert_eq!(error.get("category"), Some("not_implemented"));
    assert!(error.description().contains("set_timeout"));
}
