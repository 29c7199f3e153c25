//! fleet-agent: on-device supervision core for a container fleet.
//!
//! Reconciles the applications in a desired-state bundle against the
//! containers running on this host, garbage-collects supervisors and
//! containers that are no longer wanted, and serves hot-reloaded device
//! policy to admission checks.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod logging;
pub mod models;

pub mod supervisor;
pub mod validator;
pub mod variables;
