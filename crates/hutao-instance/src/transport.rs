//! Channel transport -- exclusive local endpoint, single-shot connect, and
//! packet I/O over one duplex stream.
//!
//! Unix: a Unix domain socket under the endpoint's socket directory.
//! Windows: a named pipe `\\.\pipe\<name>`.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use hutao_ipc_protocol::{Endpoint, Packet, PacketCodec, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::Timeouts;

#[cfg(unix)]
pub use unix_impl::{ClientStream, ServerStream};
#[cfg(unix)]
use unix_impl::{connect_raw, RawListener};

#[cfg(windows)]
pub use windows_impl::{ClientStream, ServerStream};
#[cfg(windows)]
use windows_impl::{connect_raw, RawListener};

/// Read buffer growth step.
const READ_CHUNK: usize = 4 * 1024;

// ============================================================================
// Channel -- packet I/O over one stream
// ============================================================================

/// One duplex connection carrying framed packets.
///
/// The stream is released exactly once: either by [`Channel::close`] or when
/// the channel is dropped.
pub struct Channel<S> {
    stream: Option<S>,
    codec: PacketCodec,
    read_buf: BytesMut,
    read_timeout: Duration,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, version: u8, read_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            codec: PacketCodec::new(version),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            read_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or(ProtocolError::ChannelClosed)
    }

    /// Encode and write one packet. Call [`Channel::flush`] before expecting
    /// the peer to observe it.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(packet, &mut buf)?;
        self.stream()?.write_all(&buf).await?;
        tracing::trace!(packet = packet.name(), bytes = buf.len(), "packet written");
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream()?.flush().await?;
        Ok(())
    }

    /// Read one packet, bounded by the read timeout.
    pub async fn read_packet(&mut self) -> Result<Packet> {
        let timeout = self.read_timeout;
        match tokio::time::timeout(timeout, self.read_packet_unbounded()).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::ChannelTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn read_packet_unbounded(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.read_buf)? {
                tracing::trace!(packet = packet.name(), "packet read");
                return Ok(packet);
            }

            let stream = self.stream.as_mut().ok_or(ProtocolError::ChannelClosed)?;
            self.read_buf.reserve(READ_CHUNK);
            if stream.read_buf(&mut self.read_buf).await? == 0 {
                // Peer hung up: a clean boundary is a closed channel, anything
                // else is a truncated packet.
                return match self.codec.decode_eof(&mut self.read_buf)? {
                    Some(packet) => Ok(packet),
                    None => Err(ProtocolError::ChannelClosed),
                };
            }
        }
    }

    /// Shut down and release the stream. Idempotent, and safe after errors.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "channel shutdown failed");
            }
        }
    }
}

// ============================================================================
// Connect / listen
// ============================================================================

/// Single, non-retrying connect to `endpoint`.
///
/// Returns `None` when no listener is present, the listener is busy, or the
/// attempt exceeds the connect timeout. The caller reads `None` as "this is
/// the first instance"; it is never an error.
pub async fn try_connect_once(
    endpoint: &Endpoint,
    timeouts: &Timeouts,
) -> Option<Channel<ClientStream>> {
    match tokio::time::timeout(timeouts.connect, connect_raw(endpoint)).await {
        Ok(Ok(stream)) => {
            tracing::debug!(endpoint = %endpoint, "connected to running instance");
            Some(Channel::new(stream, endpoint.version, timeouts.read))
        }
        Ok(Err(e)) => {
            tracing::debug!(endpoint = %endpoint, error = %e, "no server on endpoint");
            None
        }
        Err(_) => {
            tracing::debug!(
                endpoint = %endpoint,
                timeout_ms = timeouts.connect.as_millis() as u64,
                "connect timed out"
            );
            None
        }
    }
}

/// Exclusive owner of the endpoint. Dropping it releases the endpoint.
pub struct PipeListener {
    raw: RawListener,
    endpoint: Endpoint,
    read_timeout: Duration,
}

impl PipeListener {
    /// Claim the endpoint. Fails with [`ProtocolError::EndpointInUse`] if
    /// another live process holds it.
    pub async fn bind(endpoint: &Endpoint, timeouts: &Timeouts) -> Result<Self> {
        let raw = RawListener::bind(endpoint).await?;
        tracing::info!(endpoint = %endpoint, "endpoint bound");
        Ok(Self {
            raw,
            endpoint: endpoint.clone(),
            read_timeout: timeouts.read,
        })
    }

    /// Bind, retrying while the endpoint is still held. Used after telling a
    /// previous instance to exit, which releases the endpoint asynchronously.
    pub async fn bind_with_retry(endpoint: &Endpoint, timeouts: &Timeouts) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match Self::bind(endpoint, timeouts).await {
                Err(ProtocolError::EndpointInUse(name))
                    if attempt < timeouts.bind_retry_attempts =>
                {
                    attempt += 1;
                    tracing::debug!(endpoint = %name, attempt, "endpoint still held, retrying");
                    tokio::time::sleep(timeouts.bind_retry_delay).await;
                }
                other => return other,
            }
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Result<Channel<ServerStream>> {
        let stream = self.raw.accept().await?;
        Ok(Channel::new(stream, self.endpoint.version, self.read_timeout))
    }
}

/// Where the accept loop gets its sessions from.
pub trait SessionSource: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn endpoint(&self) -> &Endpoint;

    /// Wait for the next client. An error concerns that one connection
    /// attempt; the source stays usable.
    fn next_session(&mut self) -> impl Future<Output = Result<Channel<Self::Stream>>> + Send;
}

impl SessionSource for PipeListener {
    type Stream = ServerStream;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn next_session(&mut self) -> Result<Channel<ServerStream>> {
        self.accept().await
    }
}

// ============================================================================
// Unix domain sockets
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::{Path, PathBuf};

    use fs2::FileExt;
    use hutao_ipc_protocol::{Endpoint, ProtocolError, Result};
    use tokio::net::{UnixListener, UnixStream};

    pub type ClientStream = UnixStream;
    pub type ServerStream = UnixStream;

    /// Socket file permissions (owner only).
    const SOCKET_MODE: u32 = 0o600;

    /// Socket directory permissions (owner only).
    const DIRECTORY_MODE: u32 = 0o700;

    pub async fn connect_raw(endpoint: &Endpoint) -> io::Result<ClientStream> {
        UnixStream::connect(endpoint.socket_path()).await
    }

    pub struct RawListener {
        listener: UnixListener,
        path: PathBuf,
        /// (device, inode) of the socket file this listener created.
        identity: (u64, u64),
        /// Exclusive lock on `<socket_dir>/<name>.lock`, held while the
        /// listener lives. Released by the kernel if the process dies.
        _lock: File,
    }

    impl RawListener {
        pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
            let path = endpoint.socket_path();
            ensure_directory(&endpoint.socket_dir)?;

            // Liveness check, stale removal and bind all happen under the lock
            let lock = acquire_endpoint_lock(endpoint)?;

            if std::fs::symlink_metadata(&path).is_ok() {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(ProtocolError::EndpointInUse(endpoint.name.clone()));
                }
                cleanup_stale_socket(&path)?;
            }

            let listener = UnixListener::bind(&path).map_err(|e| {
                if e.kind() == io::ErrorKind::AddrInUse {
                    ProtocolError::EndpointInUse(endpoint.name.clone())
                } else {
                    ProtocolError::Io(io::Error::new(
                        e.kind(),
                        format!("failed to bind {}: {e}", path.display()),
                    ))
                }
            })?;

            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
            let metadata = std::fs::metadata(&path)?;

            Ok(Self {
                listener,
                identity: (metadata.dev(), metadata.ino()),
                path,
                _lock: lock,
            })
        }

        pub async fn accept(&mut self) -> io::Result<ServerStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for RawListener {
        fn drop(&mut self) {
            // A successor may already have replaced the file; only remove our own.
            let ours = std::fs::symlink_metadata(&self.path)
                .map(|m| (m.dev(), m.ino()) == self.identity)
                .unwrap_or(false);
            if ours {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::debug!(path = %self.path.display(), error = %e, "failed to remove socket");
                }
            }
        }
    }

    /// Take the endpoint's lock file without waiting. The file itself is
    /// never removed; only the flock matters.
    pub(super) fn acquire_endpoint_lock(endpoint: &Endpoint) -> Result<File> {
        let lock_path = endpoint.socket_dir.join(format!("{}.lock", endpoint.name));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        std::fs::set_permissions(&lock_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                tracing::debug!(path = %lock_path.display(), "endpoint lock held by another process");
                Err(ProtocolError::EndpointInUse(endpoint.name.clone()))
            }
            Err(e) => Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to lock {}: {e}", lock_path.display()),
            ))),
        }
    }

    fn ensure_directory(dir: &Path) -> Result<()> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
            return Ok(());
        }

        let owner = std::fs::metadata(dir)?.uid();
        let euid = nix::unistd::geteuid().as_raw();
        if owner != euid {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "socket directory {} is owned by uid {owner}, not {euid}",
                    dir.display()
                ),
            )));
        }
        Ok(())
    }

    /// Remove a socket file nobody is listening on.
    fn cleanup_stale_socket(path: &Path) -> Result<()> {
        use std::os::unix::fs::FileTypeExt;

        let metadata = std::fs::symlink_metadata(path)?;
        if !metadata.file_type().is_socket() {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("path {} exists but is not a socket", path.display()),
            )));
        }

        std::fs::remove_file(path)?;
        tracing::debug!(path = %path.display(), "removed stale socket file");
        Ok(())
    }
}

// ============================================================================
// Windows named pipes
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use std::io;

    use hutao_ipc_protocol::{Endpoint, ProtocolError, Result};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };
    use windows_sys::Win32::Foundation::ERROR_ACCESS_DENIED;

    pub type ClientStream = NamedPipeClient;
    pub type ServerStream = NamedPipeServer;

    /// Opening a pipe never waits: a busy pipe (`ERROR_PIPE_BUSY`) or a
    /// missing one (`ERROR_FILE_NOT_FOUND`) is reported as an error at once.
    pub async fn connect_raw(endpoint: &Endpoint) -> io::Result<ClientStream> {
        ClientOptions::new().open(endpoint.pipe_name())
    }

    pub struct RawListener {
        pipe_name: String,
        /// Instance waiting for the next client.
        next: NamedPipeServer,
    }

    impl RawListener {
        pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
            let pipe_name = endpoint.pipe_name();
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&pipe_name)
                .map_err(|e| {
                    if e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                        ProtocolError::EndpointInUse(endpoint.name.clone())
                    } else {
                        ProtocolError::Io(e)
                    }
                })?;
            Ok(Self { pipe_name, next })
        }

        pub async fn accept(&mut self) -> io::Result<ServerStream> {
            if let Err(e) = self.next.connect().await {
                // The failed instance cannot be reused; start over with a fresh one
                self.next = ServerOptions::new().create(&self.pipe_name)?;
                return Err(e);
            }
            // Create the following instance before handing this one out so
            // the pipe name is never unowned.
            let following = ServerOptions::new().create(&self.pipe_name)?;
            Ok(std::mem::replace(&mut self.next, following))
        }
    }
}
