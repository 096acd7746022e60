//! ScalpBot Library
//!
//! Signal and risk engine for scalping USDT-margined perpetual futures

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod indicators;
pub mod lifecycle;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod signal;
pub mod types;
