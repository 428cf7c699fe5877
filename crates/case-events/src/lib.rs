//! Domain events raised by the case-management core.
//!
//! Producers build an [`Event`] once and hand it to the notification
//! engine; nothing downstream mutates it.

pub mod events;

pub use events::*;
