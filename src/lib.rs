//! Bridges a web socket to a PTY-hosted child process.
//!
//! See `SPEC_FULL.md` for the full module-by-module specification this
//! crate implements; `DESIGN.md` records where each piece is grounded.

pub mod codec;
pub mod config;
pub mod error;
pub mod pty;
pub mod registry;
pub mod session;
pub mod ws;
