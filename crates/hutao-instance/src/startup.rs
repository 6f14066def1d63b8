//! Startup path: try to redirect, otherwise claim the endpoint.

use std::sync::Arc;

use hutao_ipc_protocol::{Endpoint, HutaoActivationArguments, ProtocolError, Result};

use crate::client::{PipeClient, RedirectOutcome};
use crate::config::{InstanceConfig, Timeouts};
use crate::server::{InstanceHost, PipeServer};
use crate::transport::PipeListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupDecision {
    BecomePrimary,
    Exit,
}

/// Map a redirection attempt to what this process does next.
///
/// A failed negotiation exits: the running instance may already have
/// received the activation, and a second primary must never start.
pub fn decide(outcome: &Result<RedirectOutcome>) -> StartupDecision {
    match outcome {
        Ok(RedirectOutcome::NoServer) | Ok(RedirectOutcome::Ceded) => {
            StartupDecision::BecomePrimary
        }
        Ok(RedirectOutcome::Redirected) | Err(_) => StartupDecision::Exit,
    }
}

/// Result of [`SingleInstance::startup`].
pub enum Startup {
    /// Another instance handles this activation.
    Exit,
    /// This process owns the endpoint. Spawn or run the server.
    Primary(PipeServer),
}

impl Startup {
    pub fn is_primary(&self) -> bool {
        matches!(self, Startup::Primary(_))
    }
}

pub struct SingleInstance {
    endpoint: Endpoint,
    timeouts: Timeouts,
    is_elevated: bool,
}

impl SingleInstance {
    pub fn new(endpoint: Endpoint, timeouts: Timeouts, is_elevated: bool) -> Self {
        Self {
            endpoint,
            timeouts,
            is_elevated,
        }
    }

    pub fn from_config(config: &InstanceConfig, is_elevated: bool) -> Self {
        Self::new(config.endpoint(), config.timeouts(), is_elevated)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Redirect `args` to a running instance, or become the primary one.
    pub async fn startup(
        &self,
        host: Arc<dyn InstanceHost>,
        args: &HutaoActivationArguments,
    ) -> Result<Startup> {
        let client = PipeClient::new(self.endpoint.clone(), self.timeouts, self.is_elevated);
        let mut lost_races = 0;

        loop {
            let outcome = client.try_redirect_activation(args).await;
            if let Err(e) = &outcome {
                tracing::warn!(error = %e, "redirect failed after connecting, exiting");
            }
            if decide(&outcome) == StartupDecision::Exit {
                tracing::info!(endpoint = %self.endpoint, "activation handled by running instance");
                return Ok(Startup::Exit);
            }

            let bound = if matches!(outcome, Ok(RedirectOutcome::Ceded)) {
                PipeListener::bind_with_retry(&self.endpoint, &self.timeouts).await
            } else {
                PipeListener::bind(&self.endpoint, &self.timeouts).await
            };

            match bound {
                Ok(listener) => {
                    tracing::info!(
                        endpoint = %self.endpoint,
                        elevated = self.is_elevated,
                        "became primary instance"
                    );
                    return Ok(Startup::Primary(PipeServer::new(listener, host)));
                }
                // Another first launch bound in between; redirect to it instead
                Err(ProtocolError::EndpointInUse(name))
                    if lost_races < self.timeouts.bind_retry_attempts =>
                {
                    lost_races += 1;
                    tracing::debug!(endpoint = %name, lost_races, "endpoint claimed concurrently");
                    tokio::time::sleep(self.timeouts.bind_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
