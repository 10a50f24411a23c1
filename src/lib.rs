//! Process dashboard backend.
//!
//! Keeps a bounded, age-weighted chart history per monitored process and
//! host, and coalesces every update produced between two ticks into one
//! broadcast batch.

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod export;
pub mod series;
pub mod source;
pub mod store;
