//! Configuration management for remote Unix hosts over SSH.
//!
//! [`transport`] dials hosts and wraps the connection in retry and a circuit
//! breaker, [`session`] executes commands over it, [`protocol`] turns shell
//! exit codes into typed outcomes and [`resource`] builds the resource
//! clients on top.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod protocol;
pub mod resource;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
