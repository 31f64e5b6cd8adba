//! Embedded SQLite store: device identity, target snapshot history and
//! the last observed current state.

pub mod entities;
mod device_repository;
mod state_repository;

pub use device_repository::SeaOrmDeviceRepository;
pub use state_repository::SeaOrmStateRepository;
