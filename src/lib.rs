//! Core workflows for a tutoring marketplace: matching student demand with
//! tutor supply, converting a match into a binding enrollment, and settling
//! the escrow-backed money movement as that enrollment changes state.
//!
//! The crate is transport-agnostic. It exposes synchronous service facades
//! over an explicit storage session; an HTTP layer (or a background job
//! runner for the expiry sweep) is expected to embed it.

pub mod config;
pub mod telemetry;
pub mod workflows;
