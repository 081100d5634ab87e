//! TCP command server.
//!
//! Clients send one newline-terminated ASCII command per connection:
//! `S` subscribes to the live stream, `R` reads historical data, `C`
//! carries control commands.  A successful data reply starts with a single
//! NUL byte so clients can distinguish it from a textual error message.

pub mod protocol;
pub mod read;
pub mod server;
pub mod subscribe;

pub use protocol::{Command, ReadRequest, ReadSource};
pub use read::ReadEngine;
pub use server::{Server, ShutdownFlag};
