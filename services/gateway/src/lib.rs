//! Gateway service library crate.
//!
//! # Purpose
//! Exposes the process-level subsystems (config, observability, the
//! permission-backed ACL source) for use by the gateway binary and
//! integration tests.
pub mod acl_source;
pub mod config;
pub mod observability;
