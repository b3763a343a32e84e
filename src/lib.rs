//! Purpose: Library crate behind the `tunercard` CLI and its tests.
//! Exports: `api` (ATR parsing, T=1 transport, card sessions, reader registry, handles, errors).
//! Role: Drives a contact smart card through a tuner device's control channel.
//! Invariants: Hardware is only reached through the `api::DeviceControl` family of traits.
//! Invariants: Core modules stay private; `api` is the supported path in.
pub mod api;
mod core;
