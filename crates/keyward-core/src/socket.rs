//! Socket directory management.
//!
//! The daemon listens on `<dir>/_` where `<dir>` is a freshly created,
//! owner-only directory under `/tmp`. Directory, socket, and listener are
//! all created before the fork so both processes share them.

use std::io;
use std::path::{Path, PathBuf};

use crate::proto::SOCKET_FILE_NAME;

/// Create the private runtime directory for one daemon instance.
///
/// The directory comes from a `mkdtemp`-style random template and is
/// tightened to `0o700` so only the owning user can reach the socket.
pub fn create_socket_dir() -> io::Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("keyward.")
        .tempdir_in("/tmp")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
    }

    // Ownership passes to the caller; cleanup happens on bootstrap failure
    // or when the daemon notices the parent is gone.
    Ok(dir.keep())
}

/// Path of the listening socket inside a runtime directory.
pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join(SOCKET_FILE_NAME)
}

/// Best-effort recursive removal of a runtime directory.
pub fn remove_socket_dir(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = create_socket_dir().unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(dir.starts_with("/tmp"));
        remove_socket_dir(&dir);
        assert!(!dir.exists());
    }

    #[test]
    fn socket_path_is_inside_the_dir() {
        let p = socket_path(Path::new("/tmp/keyward.abc123"));
        assert_eq!(p, PathBuf::from("/tmp/keyward.abc123/_"));
    }

    #[test]
    fn distinct_instances_get_distinct_dirs() {
        let a = create_socket_dir().unwrap();
        let b = create_socket_dir().unwrap();
        assert_ne!(a, b);
        remove_socket_dir(&a);
        remove_socket_dir(&b);
    }
}
