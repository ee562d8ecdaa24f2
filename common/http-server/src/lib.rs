//! Common HTTP server utilities
//!
//! This crate provides the process-level plumbing HTTP servers need around their
//! request handling:
//!
//! - [`TerminationSignals`] - Stream of SIGTERM/SIGINT deliveries, so a server can start
//!   its graceful shutdown on the first signal and escalate on the following ones
//!
//! # Examples
//!
//! ```no_run
//! use http_server::TerminationSignals;
//!
//! # async fn example() -> std::io::Result<()> {
//! let mut signals = TerminationSignals::install()?;
//! signals.recv().await;
//! // begin graceful shutdown, keep listening for a second signal if needed
//! # Ok(())
//! # }
//! ```

pub mod shutdown;

pub use shutdown::TerminationSignals;
