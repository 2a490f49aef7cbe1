//! Live voice rooms ("bars") over a small TCP relay.
//!
//! One relay process hosts any number of bars. Clients create or join a bar,
//! chat, and stream short audio chunks that the relay fans out to the other
//! members. Each module has one job:
//!
//! - [`message`] defines the JSON envelopes and the newline-delimited codec.
//! - [`registry`] owns the bars and their members, with per-bar locking.
//! - [`relay`] accepts connections, dispatches envelopes into the registry,
//!   and broadcasts the results.
//! - [`client`] keeps a reconnecting connection to the relay, mirrors the
//!   server state locally, and drives the terminal front end.
//! - [`audio`] captures, chunks, meters and plays audio on the client.
//! - [`config`], [`error`] and [`cli`] hold settings, error types and
//!   argument parsing.
//!
//! Integration tests use this crate directly to exercise the relay, the
//! reconnecting client and the audio path end to end.

pub mod audio;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod relay;
