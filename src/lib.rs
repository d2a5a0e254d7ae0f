//! # Buslane
//!
//! A client-side connection engine for the D-Bus IPC protocol. It
//! negotiates a transport, authenticates, and multiplexes method calls,
//! replies, signals and match subscriptions over a single bidirectional
//! byte stream, without ever spawning a thread or blocking inside the
//! engine. Callers either pump [`Connection::process`] themselves, suspend
//! in [`Connection::wait`], or hand the connection to the tokio bridge in
//! [`event`].
//!
//! ```no_run
//! use buslane::{Connection, Message, Timeout};
//!
//! # fn main() -> buslane::Result<()> {
//! let mut conn = Connection::open_user()?;
//! let msg = Message::method_call(
//!     "org.freedesktop.DBus",
//!     "/org/freedesktop/DBus",
//!     "org.freedesktop.DBus",
//!     "ListNames",
//! )?;
//! let reply = conn.call(msg, Timeout::Default)?;
//! println!("first name: {:?}", reply.body_string()?);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod auth;
pub mod connection;
pub mod error;
pub mod event;
pub mod filter;
pub mod match_rule;
pub mod memfd_cache;
pub mod message;
pub mod object;
pub mod queue;
pub mod reply;
pub mod socket_io;
pub mod transport;

pub use connection::{AttachFlags, Connection, DesiredEvents, State};
pub use error::{Error, Result};
pub use filter::{handler, FilterId, Handled, MessageHandler};
pub use match_rule::MatchId;
pub use message::{Message, MessageType};
pub use object::{ObjectId, Vtable};
pub use reply::{Timeout, DEFAULT_CALL_TIMEOUT};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
