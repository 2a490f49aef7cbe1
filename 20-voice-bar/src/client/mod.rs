//! Client half: the reconnecting relay connection and the terminal front end.

pub mod backoff;
pub mod connection;
pub mod console;

pub use connection::{ConnectionManager, ConnectionState, LocalIdentity};
pub use console::run;
