//! Events: GitHub webhook payloads in, environment lifecycle events out.
//!
//! Environment status is written only by applying an `EnvironmentEvent`.

pub mod environment;
pub mod github;
