//! Core crate for the textreel render service.

pub mod config;
pub mod encoder;
pub mod error;
pub mod job;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod server;
pub mod service;
pub mod worker;
