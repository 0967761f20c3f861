//! Npmbridge - automatic Nginx Proxy Manager provisioning for Docker
//!
//! This library watches the Docker event stream and:
//! - Filters for container start events
//! - Polls the started container until its `npmdocker.*` labels appear
//! - Looks up the TLS certificate for the labelled domain in NPM
//! - Creates the matching proxy host through the NPM HTTP API
//! - Optionally reports outcomes to an ntfy push topic

pub mod config;
pub mod docker;
pub mod npm;
pub mod ntfy;
pub mod watcher;
