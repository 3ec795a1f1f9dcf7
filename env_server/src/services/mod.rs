//! Control plane services: records, external clients, background tasks.

pub mod delivery_service;
pub mod deployment_service;
pub mod dispatcher;
pub mod environment_service;
pub mod environment_tasks;
pub mod github_service;
pub mod kubernetes_service;
pub mod sweeper;
pub mod user_service;
