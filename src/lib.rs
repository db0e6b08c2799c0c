//! prewarm: an application pre-launch accelerator.
//!
//! A long-running daemon (`prewarmd`) keeps one warm booster process per
//! family, each having already paid its family's initialization costs. The
//! invoker (`prewarm`) hands a launch request to the waiting booster over a
//! Unix socket; the booster assumes the target's identity and enters it
//! in-process, while the daemon forks the next booster so the following
//! launch is warm again.

pub mod booster;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod invoker;
pub mod loader;
pub mod process_title;
pub mod protocol;
pub mod signal;
