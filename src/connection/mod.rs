//! Client connections.
//!
//! Each accepted socket gets its own task running a [`ConnectionHandler`]:
//! read bytes, decode every complete request, execute, write the replies
//! back in one flush. A connection that sends `PSYNC` stops being a client
//! and becomes the transport for a replica session; from then on it only
//! writes the snapshot and the propagated write stream.
//!
//! A malformed frame is answered with `-ERR Protocol error: ...` and the
//! connection is closed. Idle clients can be dropped after a timeout, and
//! every handler watches the server's shutdown channel.

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
