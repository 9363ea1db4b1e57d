//! `kvsockd` is a small command-server core: a fixed-capacity ring
//! buffer, a poll-based socket dispatcher, a `key=value` command
//! parser with indexed-key support, and a transparent raw-line/HTTP
//! wire protocol sharing one listening port.
//!
//! ## Wire protocol
//!
//! A connection speaks persistent, newline-terminated `key=value`
//! commands by default (Raw mode). If the first line instead begins
//! with an HTTP method verb (`GET`, `PUT`, `POST`, `PATCH`, `DELETE`)
//! the connection is treated as a single HTTP request: its reply is
//! accumulated and sent back as one HTTP/2.0-labelled response before
//! the socket closes. See [`protocol`] for the detection rules.
//!
//! ## Building a server
//!
//! A caller builds a [`handler::HandlerTable`], registers handlers
//! (built-in typed accessors from [`handler::IntSlot`],
//! [`handler::DoubleSlot`], [`handler::StringSlot`], or custom
//! closures), then hands it to [`server::run`] along with a
//! [`server::ServerConfig`] describing the listening address.

pub mod cli;
pub mod error;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod ringbuf;
pub mod server;
pub mod socket;

pub use error::{Result, SlError};
pub use ringbuf::RingBuffer;
