//! Request vocabulary shared by the proxy and stub sides.
//!
//! Every request frame begins with a command token (a string atom); the
//! remaining atoms are positional and fixed per command:
//!
//! | command    | request atoms                          | response atoms                        |
//! |------------|----------------------------------------|---------------------------------------|
//! | `load_key` | path:str                               | ok:num, handle:num, e:str, n:str, err:str |
//! | `priv_enc` | from:bytes, handle:num, padding:num    | ret:num, to:bytes                     |
//! | `priv_dec` | from:bytes, handle:num, padding:num    | ret:num, to:bytes                     |
//! | `sign`     | type:num, msg:bytes, handle:num        | ret:num, sig:bytes                    |

use std::fmt;

/// Name of the listening socket inside the daemon's private directory.
pub const SOCKET_FILE_NAME: &str = "_";

/// Handle value reported by a failed `load_key`.
pub const NO_HANDLE: u64 = u64::MAX;

/// Bound on in-band error strings sent by the daemon.
pub const ERROR_MESSAGE_MAX: usize = 256;

/// The operations the daemon performs on the parent's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LoadKey,
    PrivEnc,
    PrivDec,
    Sign,
}

impl Command {
    pub fn token(self) -> &'static str {
        match self {
            Self::LoadKey => "load_key",
            Self::PrivEnc => "priv_enc",
            Self::PrivDec => "priv_dec",
            Self::Sign => "sign",
        }
    }

    /// Parse a request's leading command token. Unknown tokens are the
    /// caller's cue to drop the connection.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "load_key" => Some(Self::LoadKey),
            "priv_enc" => Some(Self::PrivEnc),
            "priv_dec" => Some(Self::PrivDec),
            "sign" => Some(Self::Sign),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Truncate an error message to the wire bound, on a char boundary.
pub fn bound_error_message(msg: &str) -> &str {
    if msg.len() <= ERROR_MESSAGE_MAX {
        return msg;
    }
    let mut end = ERROR_MESSAGE_MAX;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    &msg[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        for cmd in [Command::LoadKey, Command::PrivEnc, Command::PrivDec, Command::Sign] {
            assert_eq!(Command::from_token(cmd.token()), Some(cmd));
        }
    }

    #[test]
    fn unknown_token_is_none() {
        assert_eq!(Command::from_token("pub_enc"), None);
        assert_eq!(Command::from_token(""), None);
    }

    #[test]
    fn long_error_messages_are_bounded() {
        let long = "x".repeat(ERROR_MESSAGE_MAX * 2);
        assert_eq!(bound_error_message(&long).len(), ERROR_MESSAGE_MAX);
        assert_eq!(bound_error_message("short"), "short");
    }

    #[test]
    fn bound_respects_char_boundaries() {
        let msg = format!("{}é", "x".repeat(ERROR_MESSAGE_MAX - 1));
        let bounded = bound_error_message(&msg);
        assert!(bounded.len() <= ERROR_MESSAGE_MAX);
        assert!(msg.starts_with(bounded));
    }
}
