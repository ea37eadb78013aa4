//! Per-thread daemon connections.
//!
//! The wire is strictly request-response with no multiplexing, so each
//! parent thread owns its own socket to the daemon: no cross-thread
//! serialization on handshake-heavy workloads. The slot is created lazily
//! on a thread's first private-key operation and closed by the
//! thread-local destructor when the thread exits.
//!
//! Transport failure here is fatal to the parent by policy: a daemon that
//! has gone silent cannot be worked around without defeating the
//! privilege separation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;

use keyward_core::buffer::WireBuf;
use keyward_core::frame::{read_frame, write_frame, FrameError};

use crate::{die, KeyDaemon};

struct DaemonConn {
    stream: UnixStream,
}

thread_local! {
    /// One connection per daemon instance, per thread.
    static CONNECTIONS: RefCell<HashMap<u64, DaemonConn>> = RefCell::new(HashMap::new());
}

fn open_conn(daemon: &KeyDaemon) -> DaemonConn {
    let path = daemon.socket_path();
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return DaemonConn { stream },
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => die(&format!(
                "failed to connect to key daemon at {}: {e}",
                path.display()
            )),
        }
    }
}

/// Send the request in `buf` on this thread's connection and replace it
/// with the daemon's response.
pub(crate) fn exchange(daemon: &KeyDaemon, buf: &mut WireBuf) {
    CONNECTIONS.with(|slot| {
        let mut conns = slot.borrow_mut();
        let conn = conns
            .entry(daemon.instance_id())
            .or_insert_with(|| open_conn(daemon));

        if let Err(e) = write_frame(buf, &mut conn.stream) {
            die(&transport_fault("write", e));
        }
        buf.dispose();
        if let Err(e) = read_frame(buf, &mut conn.stream) {
            die(&transport_fault("read", e));
        }
    });
}

fn transport_fault(dir: &str, e: FrameError) -> String {
    match e {
        FrameError::ClosedByPeer => "connection closed by key daemon".to_owned(),
        e => format!("{dir} error on key daemon socket: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_faults_name_the_closed_connection() {
        let msg = transport_fault("read", FrameError::ClosedByPeer);
        assert!(msg.contains("connection closed"));

        let msg = transport_fault(
            "write",
            FrameError::Io(std::io::Error::from(ErrorKind::BrokenPipe)),
        );
        assert!(msg.starts_with("write error"));
    }
}
