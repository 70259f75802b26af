//! Multi-account Matrix channel.
//!
//! This crate lets one process hold several Matrix identities at once. Each
//! account is configured under `channels.matrix.accounts`, authenticates on
//! its own and gets its own long-lived client.
//!
//! # Architecture
//!
//! - [`config`] - YAML configuration with environment overrides and
//!   per-account merging
//! - [`accounts`] - account listing and resolution into effective settings
//! - [`credentials`] - per-account credential files in the state directory
//! - [`homeserver`] - `whoami` and password login against the client-server API
//! - [`auth`] - derivation of the authentication material of an account
//! - [`matrix`] - connection traits and their `matrix_sdk` implementation
//! - [`registry`] - single-flight creation, start and teardown of connections
//! - [`plugin`] - the channel plugin tying everything to a host runtime
//! - [`utils`] - path and environment helpers

#![recursion_limit = "256"]

pub mod accounts;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod homeserver;
pub mod matrix;
pub mod plugin;
pub mod registry;
pub mod utils;

#[cfg(test)]
mod testing;
