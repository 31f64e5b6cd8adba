mod identity;
mod repository;

pub use identity::DeviceIdentity;
pub use repository::DeviceRepository;
