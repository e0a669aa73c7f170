//! Shared data model: rule records, policy state, package lookup.
//!
//! - [`AppRule`] / [`Transport`] / [`ProtocolClass`]: one row of the rule store
//! - [`PolicyState`] / [`Capabilities`]: toggles and probed device capabilities
//! - [`PackageRegistry`]: installed-package lookup for legacy migration

pub mod model;
pub mod packages;
pub mod state;

pub use model::{AppRule, ProtocolClass, Transport};
pub use packages::{PackageRegistry, PackagesList};
pub use state::{unix_now, Capabilities, PolicyState};
