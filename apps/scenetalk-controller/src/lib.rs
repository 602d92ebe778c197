//! Sidecar controller for the procedural worker.
//!
//! The controller launches the worker, keeps an admin WebSocket open to it,
//! resolves the packages and files the worker asks for against the catalog
//! API, and advertises itself to the catalog while it runs.

pub mod advertise;
pub mod bridge;
pub mod command;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod resolver;
pub mod runtime;
pub mod supervisor;
pub mod work;

pub use config::{Cli, ControllerConfig};
pub use runtime::{run, ControllerContext};
