// Copyright 2026 UPM Embed Contributors
// SPDX-License-Identifier: MIT

//! UPM embed runtime library: caching network intermediary, embed
//! lifecycle manager, analytics batching and gesture tracking.
//!
//! This library crate exposes the runtime modules for integration testing.

#![allow(clippy::new_without_default)]

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod gesture;
pub mod host;
pub mod intermediary;
pub mod listeners;
pub mod maintenance;
pub mod net;
pub mod schedule;
pub mod telemetry;
