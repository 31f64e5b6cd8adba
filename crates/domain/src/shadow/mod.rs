//! Device shadow: a named desired/reported/delta document pair synced with
//! the cloud over MQTT. The device writes only `reported`; deltas carry
//! authoritative intent back.

mod document;
mod event;
mod phase;
pub mod topics;

pub use document::{
    DEFAULT_SHADOW_NAME, ShadowAccepted, ShadowDelta, ShadowDocument, ShadowRejected,
    ShadowUpdate, merge_fields,
};
pub use event::ShadowEvent;
pub use phase::ShadowPhase;
