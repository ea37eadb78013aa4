//! Wire protocol and transport primitives shared by the keyward parent and
//! its key daemon: the scrubbed expanding buffer, the atom codec, framed
//! socket I/O, the command vocabulary, and the socket-directory and
//! peer-credential helpers.

pub mod buffer;
pub mod frame;
pub mod peer;
pub mod proto;
pub mod socket;

pub use buffer::{WireBuf, WireError};
pub use frame::{read_frame, write_frame, FrameError};
