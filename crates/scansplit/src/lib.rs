#![doc = include_str!("../README.md")]

mod config;
mod error;
mod pipeline;
mod ports;
mod queue;
mod types;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::pipeline::*;
pub use crate::ports::*;
pub use crate::queue::*;
pub use crate::types::*;
