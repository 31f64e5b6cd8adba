use async_trait::async_trait;

use super::{CurrentState, TargetState};
use crate::DomainError;

/// Persistence port for target snapshots and the last observed current
/// state, keyed by device uuid. Reconciliation must survive restarts and
/// offline periods, and the poll loop resumes conditional fetching from
/// the persisted ETag.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Persist an accepted target snapshot (history keyed by version)
    /// together with the ETag it was fetched under.
    async fn save_target<'a>(
        &'a self,
        uuid: &'a str,
        target: &'a TargetState,
        etag: Option<&'a str>,
    ) -> Result<(), DomainError>;

    /// Latest accepted target snapshot and its ETag, if any.
    async fn load_target(
        &self,
        uuid: &str,
    ) -> Result<Option<(TargetState, Option<String>)>, DomainError>;

    /// Persist the most recent current-state observation.
    async fn save_current(&self, uuid: &str, current: &CurrentState) -> Result<(), DomainError>;

    async fn load_current(&self, uuid: &str) -> Result<Option<CurrentState>, DomainError>;
}
