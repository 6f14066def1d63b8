//! Endpoint identity -- the well-known name and protocol version that a
//! client and a server must agree on.
//!
//! The endpoint is a system-wide singleton: whichever process binds it first
//! is the primary instance. It is passed explicitly into both roles rather
//! than read from a global.

use std::ffi::OsString;
use std::path::PathBuf;

/// Protocol version. Client and server binaries must match exactly; there is
/// no cross-version negotiation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default endpoint name.
pub const DEFAULT_ENDPOINT_NAME: &str = "Snap.Hutao.PrivateNamedPipe";

/// Subdirectory for socket files under the runtime directory.
const DEFAULT_SUBDIR: &str = "hutao";

/// A named, versioned local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint name, unique per local session.
    pub name: String,
    /// Protocol version written into and expected from every header.
    pub version: u8,
    /// Directory holding the socket file (Unix only).
    pub socket_dir: PathBuf,
}

impl Endpoint {
    /// Endpoint with the compiled-in protocol version and the default
    /// socket directory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: PROTOCOL_VERSION,
            socket_dir: default_socket_dir(),
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Override the protocol version. Only useful for exercising mismatch
    /// handling; production code always speaks [`PROTOCOL_VERSION`].
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Unix domain socket path: `<socket_dir>/<name>.sock`.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.name))
    }

    /// Windows named pipe path: `\\.\pipe\<name>`.
    pub fn pipe_name(&self) -> String {
        format!(r"\\.\pipe\{}", self.name)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT_NAME)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (v{})", self.name, self.version)
    }
}

/// Default socket directory.
///
/// Priority:
/// 1. `XDG_RUNTIME_DIR/hutao` if `XDG_RUNTIME_DIR` is set
/// 2. `<temp dir>/hutao-<uid>` as fallback
pub fn default_socket_dir() -> PathBuf {
    socket_dir_under(std::env::var_os("XDG_RUNTIME_DIR"))
}

fn socket_dir_under(runtime_dir: Option<OsString>) -> PathBuf {
    match runtime_dir.filter(|dir| !dir.is_empty()) {
        Some(dir) => PathBuf::from(dir).join(DEFAULT_SUBDIR),
        // The temp dir is shared by every user
        None => std::env::temp_dir().join(per_user_subdir()),
    }
}

#[cfg(unix)]
fn per_user_subdir() -> String {
    format!("{DEFAULT_SUBDIR}-{}", nix::unistd::getuid().as_raw())
}

#[cfg(not(unix))]
fn per_user_subdir() -> String {
    DEFAULT_SUBDIR.to_string()
}
