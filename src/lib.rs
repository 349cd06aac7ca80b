//! Bridge relayer
//!
//! Watches a locker chain and a minter chain and relays every confirmed
//! lock as exactly one mint, and every confirmed burn as exactly one unlock.

pub mod api;
pub mod config;
pub mod connector;
pub mod contracts;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod hash;
pub mod manager;
pub mod metrics;
pub mod ops;
pub mod types;
pub mod watermark;
