//! Shared infrastructure for the coreup binaries.

pub mod logging;
