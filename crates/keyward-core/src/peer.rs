//! Peer credentials of a connected Unix-socket client.
//!
//! The daemon trusts process identity rather than a handshake: before
//! serving a connection it reads the kernel-reported credentials of the
//! peer and refuses anything not owned by its own uid.

use std::io;
use std::os::unix::io::RawFd;

/// Kernel-reported identity of the process at the other end of a socket.
#[derive(Debug, Clone, Copy)]
pub struct PeerCreds {
    /// Not available on every platform.
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCreds {
    /// Whether the peer runs as the same user as this process.
    pub fn is_same_user(&self) -> bool {
        self.uid == unsafe { libc::getuid() }
    }
}

/// Look up the peer credentials for a connected `AF_UNIX` stream socket.
#[cfg(target_os = "linux")]
pub fn peer_creds(fd: RawFd) -> io::Result<PeerCreds> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCreds {
        pid: Some(ucred.pid),
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

#[cfg(target_os = "macos")]
pub fn peer_creds(fd: RawFd) -> io::Result<PeerCreds> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let rc = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(PeerCreds {
        pid: None,
        uid: uid as u32,
        gid: gid as u32,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn peer_creds(fd: RawFd) -> io::Result<PeerCreds> {
    let _ = fd;
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "peer credential lookup not supported on this platform",
    ))
}
