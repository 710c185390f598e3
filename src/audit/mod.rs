//! Violation reporting.
//!
//! The governor reports limit-exceeded events, blacklist transitions and
//! internal failures to a [`ViolationSink`] through the [`ViolationLogger`],
//! which delivers each notification in the background under a timeout. A
//! sink failure never affects an admission decision.

mod event;
mod logger;
mod sink;

pub use event::{Severity, ViolationAction, ViolationEvent};
pub use logger::ViolationLogger;
pub use sink::{RecordingSink, TracingSink, ViolationSink};
