//! patchloop library crate
//!
//! Gates candidate patches against the files a static analyzer reported,
//! then applies, verifies, and reverts them in configured working copies.

pub mod allowlist;
pub mod apply;
pub mod batch;
pub mod config;
pub mod diff;
pub mod gate;
pub mod llm;
pub mod report;
pub mod util;
