//! Declarative device state: what the cloud wants (`TargetState`) and what
//! the runtime actually runs (`CurrentState`), plus the normalization rules
//! that keep cosmetic differences from triggering restarts.

mod current;
pub mod normalize;
mod repository;
mod target;

pub use current::{CurrentApp, CurrentService, CurrentState, status};
pub use repository::StateRepository;
pub use target::{App, Service, ServiceConfig, TargetState};
