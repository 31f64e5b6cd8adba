//! Cloud HTTP adapter: the reqwest client behind the `CloudApi` port and
//! the shared exponential backoff used by every retry loop.

mod backoff;
mod client;

pub use backoff::Backoff;
pub use client::CloudClient;
