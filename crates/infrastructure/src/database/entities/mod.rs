pub mod current_state_cache;
pub mod device;
pub mod target_state_snapshots;
