//! Common primitives shared by the daemon's crates.
#![deny(warnings)]

pub mod cache;
pub mod deser;
pub mod hash;
pub mod task;
pub mod telemetry;
