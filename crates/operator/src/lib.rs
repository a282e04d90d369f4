//! Agents operator service
//!
//! Configuration loading and the HTTP probe/metrics surface. The binary in
//! `main.rs` wires these to the operator library.

pub mod api;
pub mod config;
