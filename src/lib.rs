//! multiview-recorder library crate.
//!
//! Concurrent capture and recording from several USB cameras. The `mvr`
//! binary is a thin layer over [`session::Session`]; everything is exposed
//! here for integration testing.

pub mod ascii;
pub mod camera;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod devices;
pub mod distributor;
pub mod matcher;
pub mod session;
pub mod sim;
pub mod sinks;
