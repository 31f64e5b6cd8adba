use super::{ShadowAccepted, ShadowDelta, ShadowDocument, ShadowRejected};

/// Events the shadow engine emits to its consumers. Explicitly enumerated
/// so every listener handles the full set.
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowEvent {
    /// Cloud observed desired != reported
    Delta(ShadowDelta),
    /// A pending update was accepted
    Accepted(ShadowAccepted),
    /// A pending update was rejected
    Rejected(ShadowRejected),
    /// Full document received on get/accepted
    Documents(ShadowDocument),
    /// The engine shut down
    Stopped,
}

impl ShadowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta(_) => "delta",
            Self::Accepted(_) => "accepted",
            Self::Rejected(_) => "rejected",
            Self::Documents(_) => "documents",
            Self::Stopped => "stopped",
        }
    }
}
