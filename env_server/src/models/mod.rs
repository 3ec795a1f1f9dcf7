//! Control plane data models.

pub mod deployment;
pub mod environment;
pub mod user;
