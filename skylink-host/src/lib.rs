//! # skylink-host: screen streaming host
//!
//! Runs a [`skylink_core::ControlServer`] configured from a TOML file:
//! listens for viewers, answers LAN discovery probes, authorizes peers
//! against an allow list and streams the local screen to the active
//! session while injecting its input.

pub mod config;
pub mod service;
