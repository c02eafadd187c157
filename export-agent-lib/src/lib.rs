#![doc(hidden)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Core library for export-agent
//!
//! The agent incrementally extracts linked data (source history, pull requests,
//! issues, users) from third-party developer-tool APIs and delivers a normalized,
//! cross-referenced dataset to a backend. Each integration runs in its own worker
//! process and is reached over a small RPC contract.
//!
//! # Module Organization
//!
//! - [`ids`]: Deterministic, content-addressed identifiers
//! - [`request`]: Throttled and retrying outbound calls, pagination
//! - [`export`]: Incremental sessions, cursors, and the fan-out pipeline
//! - [`plugin`]: Worker process supervision and the RPC contract
//! - [`service`]: Export queue, uploads, and event handling
//! - [`config`]: Agent configuration and on-disk locations
//! - [`commands`]: Command-line front end

pub type Result<T, E = ohno::AppError> = core::result::Result<T, E>;

pub mod commands;
pub mod config;
pub mod export;
pub mod ids;
pub mod plugin;
pub mod request;
pub mod service;

pub use crate::commands::{Host, run};
