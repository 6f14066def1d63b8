//! Server role -- owns the endpoint and serves one session at a time.
//!
//! Per connection: `Listening -> Accepted -> DispatchingRequests ->
//! SessionTerminated -> Listening`. A broken session is logged and dropped;
//! the listener keeps accepting.

use std::sync::Arc;
use std::time::Duration;

use hutao_ipc_protocol::{
    ElevationStatusResponse, Endpoint, HutaoActivationArguments, Packet, ProtocolError, Result,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::transport::{Channel, PipeListener, SessionSource};

/// What the hosting application provides to the server role.
pub trait InstanceHost: Send + Sync + 'static {
    /// Whether this process runs with elevated privileges.
    fn is_current_process_elevated(&self) -> bool;

    /// Handle an activation forwarded by a later launch, as if it had
    /// happened locally.
    fn on_activation_redirected(&self, args: HutaoActivationArguments);
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// `SessionTermination/None`.
    Completed,
    /// `SessionTermination/Exit`: an elevated instance is taking over.
    ExitRequested,
}

/// Why the accept loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The host asked the listener to stop.
    Shutdown,
    /// A client told this instance to exit. The endpoint has been released
    /// and the host should shut the application down.
    ExitRequested,
}

/// Dispatch requests on one session until it is terminated.
pub async fn serve_session<S>(channel: &mut Channel<S>, host: &dyn InstanceHost) -> Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = channel.read_packet().await?;
        tracing::debug!(packet = packet.name(), "session packet");

        match packet {
            Packet::ElevationStatusRequest => {
                let response = ElevationStatusResponse {
                    is_elevated: host.is_current_process_elevated(),
                };
                channel
                    .write_packet(&Packet::ElevationStatusResponse(response))
                    .await?;
                channel.flush().await?;
            }
            Packet::RedirectActivation(args) => {
                tracing::info!(
                    kind = ?args.kind,
                    redirected = args.is_redirected,
                    "received redirected activation"
                );
                host.on_activation_redirected(args);
            }
            Packet::EndSession => return Ok(SessionEnd::Completed),
            Packet::Exit => return Ok(SessionEnd::ExitRequested),
            other @ Packet::ElevationStatusResponse(_) => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "unexpected {} from client",
                    other.name()
                )));
            }
        }
    }
}

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accept loop over an exclusively bound endpoint.
pub struct PipeServer<L = PipeListener> {
    listener: L,
    host: Arc<dyn InstanceHost>,
}

impl<L: SessionSource> PipeServer<L> {
    pub fn new(listener: L, host: Arc<dyn InstanceHost>) -> Self {
        Self { listener, host }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }

    /// Serve sessions until shutdown or until a client requests exit.
    ///
    /// A failed accept only loses that connection: the endpoint stays bound
    /// for as long as the loop runs.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<ListenerExit> {
        tracing::info!(endpoint = %self.listener.endpoint(), "listening for redirected activations");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.next_session() => accepted,
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal, stopping listener");
                    return Ok(ListenerExit::Shutdown);
                }
            };
            let mut channel = match accepted {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed, still listening");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        _ = shutdown.recv() => {
                            tracing::info!("shutdown signal, stopping listener");
                            return Ok(ListenerExit::Shutdown);
                        }
                    }
                    continue;
                }
            };
            tracing::debug!("session accepted");

            let result = serve_session(&mut channel, self.host.as_ref()).await;
            channel.close().await;

            match result {
                Ok(SessionEnd::Completed) => tracing::debug!("session completed"),
                Ok(SessionEnd::ExitRequested) => {
                    tracing::info!("exit requested by an elevated instance, releasing endpoint");
                    drop(self.listener);
                    return Ok(ListenerExit::ExitRequested);
                }
                Err(ProtocolError::ChannelClosed) => {
                    tracing::debug!("client disconnected without terminating the session");
                }
                Err(e) => tracing::warn!(error = %e, "session aborted"),
            }
        }
    }

    /// Run the accept loop on its own task.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let join = tokio::spawn(self.run(shutdown_rx));
        ServerHandle { shutdown_tx, join }
    }
}

/// Handle to a spawned accept loop.
pub struct ServerHandle {
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<Result<ListenerExit>>,
}

impl ServerHandle {
    /// Ask the accept loop to stop after the current session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for the accept loop to stop. Await at most once.
    pub async fn join(&mut self) -> Result<ListenerExit> {
        (&mut self.join)
            .await
            .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))?
    }
}
