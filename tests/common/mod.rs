#![allow(dead_code)]

pub mod drivers;
pub mod fixtures;
pub mod observers;

pub use drivers::{ScriptedDriver, ScriptedParticipant};
pub use fixtures::*;
pub use observers::RecordingObserver;
