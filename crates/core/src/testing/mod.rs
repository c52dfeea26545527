//! Shared test utilities for kpvit-core.
//!
//! Tiny model configurations and synthetic inputs for unit and
//! integration tests.

mod tiny_config;

pub use tiny_config::{synthetic_images, tiny_config, tiny_inject_config};
