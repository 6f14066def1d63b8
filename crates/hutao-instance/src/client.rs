//! Client role -- find a running instance and hand it this activation.
//!
//! States: `Idle -> Connecting -> Connected -> AwaitingElevationResponse ->
//! {Ceding | Redirecting} -> Closed`.
//!
//! An elevated launch preempts a non-elevated primary (it tells the primary
//! to exit and becomes the primary itself); otherwise the launch forwards its
//! arguments and exits.

use hutao_ipc_protocol::{Endpoint, HutaoActivationArguments, Packet, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Timeouts;
use crate::transport::{self, Channel};

/// Result of one redirection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// Nobody is listening: this process is the first instance.
    NoServer,
    /// The activation was delivered; this process should exit.
    Redirected,
    /// The running instance was told to exit; this process takes over.
    Ceded,
}

impl RedirectOutcome {
    pub fn is_redirected(self) -> bool {
        self == RedirectOutcome::Redirected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    Idle,
    Connecting,
    Connected,
    AwaitingElevationResponse,
    Ceding,
    Redirecting,
    Closed,
}

fn transition(from: NegotiationState, to: NegotiationState) -> NegotiationState {
    tracing::debug!(?from, ?to, "redirect negotiation");
    to
}

pub struct PipeClient {
    endpoint: Endpoint,
    timeouts: Timeouts,
    is_elevated: bool,
}

impl PipeClient {
    pub fn new(endpoint: Endpoint, timeouts: Timeouts, is_elevated: bool) -> Self {
        Self {
            endpoint,
            timeouts,
            is_elevated,
        }
    }

    /// Try to hand `args` to a running instance.
    ///
    /// Errors after a successful connect are ambiguous (the activation may
    /// already have been delivered); callers should not start a second
    /// primary instance on error.
    pub async fn try_redirect_activation(
        &self,
        args: &HutaoActivationArguments,
    ) -> Result<RedirectOutcome> {
        let state = transition(NegotiationState::Idle, NegotiationState::Connecting);
        let channel = transport::try_connect_once(&self.endpoint, &self.timeouts).await;
        self.redirect_with(state, channel, args).await
    }

    /// Run the exchange over an already attempted connection. The channel is
    /// closed exactly once before returning, on every path.
    pub async fn redirect_over<S>(
        &self,
        channel: Option<Channel<S>>,
        args: &HutaoActivationArguments,
    ) -> Result<RedirectOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.redirect_with(NegotiationState::Connecting, channel, args)
            .await
    }

    async fn redirect_with<S>(
        &self,
        state: NegotiationState,
        channel: Option<Channel<S>>,
        args: &HutaoActivationArguments,
    ) -> Result<RedirectOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(mut channel) = channel else {
            transition(state, NegotiationState::Closed);
            return Ok(RedirectOutcome::NoServer);
        };
        transition(state, NegotiationState::Connected);

        let result = negotiate(&mut channel, self.is_elevated, args).await;
        channel.close().await;

        match &result {
            Ok(outcome) => {
                tracing::debug!(?outcome, "redirect negotiation closed");
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "redirect negotiation failed");
            }
        }
        result
    }
}

/// Elevation query on a connected channel, then either cede or redirect.
/// Leaves the channel open; closing it is the caller's job.
pub async fn negotiate<S>(
    channel: &mut Channel<S>,
    is_elevated: bool,
    args: &HutaoActivationArguments,
) -> Result<RedirectOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel.write_packet(&Packet::ElevationStatusRequest).await?;
    channel.flush().await?;
    let state = transition(
        NegotiationState::Connected,
        NegotiationState::AwaitingElevationResponse,
    );

    let server = match channel.read_packet().await? {
        Packet::ElevationStatusResponse(status) => status,
        other => {
            return Err(ProtocolError::ProtocolViolation(format!(
                "expected elevation status response, got {}",
                other.name()
            )));
        }
    };

    if is_elevated && !server.is_elevated {
        let state = transition(state, NegotiationState::Ceding);
        channel.write_packet(&Packet::Exit).await?;
        channel.flush().await?;
        tracing::info!("running instance is not elevated, asking it to exit");
        transition(state, NegotiationState::Closed);
        return Ok(RedirectOutcome::Ceded);
    }

    let state = transition(state, NegotiationState::Redirecting);
    channel
        .write_packet(&Packet::RedirectActivation(args.redirected()))
        .await?;
    channel.write_packet(&Packet::EndSession).await?;
    channel.flush().await?;
    tracing::info!(kind = ?args.kind, "activation redirected to running instance");
    transition(state, NegotiationState::Closed);
    Ok(RedirectOutcome::Redirected)
}
