#![doc = include_str!("../README.md")]

mod config;
mod engine;
mod error;
mod item;
mod pool;
pub mod ports;
mod slot;
mod telemetry;

#[cfg(test)]
mod test_support;

pub use crate::config::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::item::*;
pub use crate::pool::*;
pub use crate::slot::*;
