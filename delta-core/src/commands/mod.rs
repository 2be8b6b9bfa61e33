//! Top-level command facade.

pub mod facade;
pub mod registry;

pub use facade::{Facade, LineOutcome};
pub use registry::{CommandRegistry, InternalCommand};
