//! # codecall wire protocol
//!
//! Every message exchanged with a code execution child is a single line of
//! JSON. The host writes requests to the child's stdin; the child answers on
//! dedicated channels:
//!
//! ```text
//!   host ──stdin──────────────▶ child      {"file", "fcn", "args", "cwd", "paths", "forbidden_modules"}
//!   host ◀─fd 1 (stdout)─────── child      free text, captured verbatim
//!   host ◀─fd 2 (stderr)─────── child      free text, captured verbatim
//!   host ◀─fd 3 (data)───────── child      {"present": bool, "val": JSON}
//!   host ◀─fd 4 (restart)────── zygote     {"exited": bool}
//! ```
//!
//! When the child runs inside a container only stdin/stdout/stderr exist, so
//! the in-container relay wraps every chunk from the four child channels in
//! an [`Envelope`] line on its stdout.

mod call;
mod error;
mod framing;
mod message;

pub use call::{CallType, WireRequest};
pub use error::ProtocolError;
pub use framing::{LineBuffer, Utf8Decoder};
pub use message::{Channel, DataMessage, Envelope, RestartConfirmation};

/// Reply the zygote sends for the internal `ping` call.
pub const PING_REPLY: &str = "pong";

/// Reply the forked worker sends for the internal `restart` call.
pub const RESTART_REPLY: &str = "success";
