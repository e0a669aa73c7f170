//! Command handlers over the shared [`AppState`], organized by domain.
//!
//! - `rules`: per-application rule CRUD and legacy import
//! - `system`: capabilities, status, master switch, toggles, captive bypass
//! - `logic`: pure decision functions (unit-testable)
//! - `state`: shared `AppState` definition

mod logic;
pub(crate) mod rules;
mod state;
pub(crate) mod system;

pub use logic::format_remaining;
pub use state::AppState;
pub use system::{Designation, Status};
