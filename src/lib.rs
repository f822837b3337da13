//! `targetd` arbitrates concurrent access to shared build artifacts across a
//! cluster of worker processes.
//!
//! Workers speak a small length-prefixed protocol over TCP: each connection
//! asks to `READ` or `WRIT`e a named target and is told whether it may
//! proceed (`READ`/`WRIT`), must wait for an in-progress producer (`WAIT`),
//! or should disconnect (`EXIT`, sent only on shutdown). A `DONE` tells the
//! coordinator a producer has finished, promoting anyone left waiting.
//!
//! The coordinator itself is a single `arbiter` task holding all claim state;
//! every connection is handled by its own task and the two only ever talk
//! through channels, so the arbiter needs no locking.

pub mod arbiter;
pub mod connection;
pub mod error;
pub mod server;
pub mod shutdown;
pub mod wire;

pub use connection::{Connection, ConnectionStream};
pub use error::{Error, Result};
pub(crate) use shutdown::Shutdown;

/// Default port the coordinator listens on.
pub const DEFAULT_PORT: u16 = 1987;
/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";
