#![deny(missing_docs)]

//! Event substrate for the tether networking toolkit.
//!
//! Every network object in tether is built from the same small set of
//! primitives: a typed multi-listener [`Event`], the structured [`Error`]
//! value those events carry, a [`Semaphore`] tracking in-flight writes, and
//! an [`Anchor`] that keeps shared-ownership objects alive until their
//! terminal event fires.

mod anchor;
mod emitter;
mod encoding;
mod error;
mod semaphore;

pub use self::{
    anchor::Anchor,
    emitter::{Emitter, Event, ListenerId},
    encoding::Encoding,
    error::Error,
    semaphore::Semaphore,
};
