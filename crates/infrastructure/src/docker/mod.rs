//! Docker adapter: translates reconciliation steps into runtime API calls
//! and extracts a normalized current-state view.

pub mod demux;
mod extract;
mod runtime;

pub use demux::{Frame, FrameDecoder};
pub use runtime::DockerRuntime;

/// Labels marking containers and networks as platform-managed.
pub mod labels {
    pub const MANAGED: &str = "io.iris.managed";
    pub const APP_ID: &str = "io.iris.app-id";
    pub const APP_NAME: &str = "io.iris.app-name";
    pub const SERVICE_ID: &str = "io.iris.service-id";
    pub const SERVICE_NAME: &str = "io.iris.service-name";
    pub const NETWORK_NAME: &str = "io.iris.network-name";
}
