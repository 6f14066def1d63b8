//! Client/server negotiation over a real endpoint.

use std::time::{Duration, Instant};

use hutao_instance::{ListenerExit, PipeClient, RedirectOutcome, SingleInstance};
use hutao_ipc_protocol::{ActivationKind, HutaoActivationArguments};

use crate::harness::{recording_host, TestEndpoint, TestServer};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_no_server_is_bounded() {
    let ep = TestEndpoint::new();
    let client = PipeClient::new(ep.endpoint.clone(), ep.timeouts, false);

    let start = Instant::now();
    let outcome = client
        .try_redirect_activation(&HutaoActivationArguments::launch(None))
        .await
        .unwrap();

    assert_eq!(outcome, RedirectOutcome::NoServer);
    assert!(start.elapsed() < ep.timeouts.connect + Duration::from_secs(1));
}

/// Non-elevated client, non-elevated server: handler runs exactly once.
#[tokio::test]
async fn test_redirect_invokes_handler_once() {
    let ep = TestEndpoint::new();
    let mut server = TestServer::start(&ep, false).await.unwrap();

    let args = HutaoActivationArguments::from_command_line(["hutao://achievement/import"], "hutao");
    let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, false)
        .try_redirect_activation(&args)
        .await
        .unwrap();
    assert!(outcome.is_redirected());

    let received = server.next_activation(WAIT).await.unwrap();
    assert!(received.is_redirected);
    assert_eq!(received.kind, ActivationKind::Protocol);
    assert_eq!(
        received.protocol_uri.as_deref(),
        Some("hutao://achievement/import")
    );

    assert_eq!(server.shutdown().await.unwrap(), ListenerExit::Shutdown);
}

#[tokio::test]
async fn test_plain_client_redirects_to_elevated_server() {
    let ep = TestEndpoint::new();
    let mut server = TestServer::start(&ep, true).await.unwrap();

    let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, false)
        .try_redirect_activation(&HutaoActivationArguments::launch(Some("--safe-mode".into())))
        .await
        .unwrap();

    assert_eq!(outcome, RedirectOutcome::Redirected);
    let received = server.next_activation(WAIT).await.unwrap();
    assert_eq!(received.launch_arguments.as_deref(), Some("--safe-mode"));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_equal_elevation_redirects() {
    let ep = TestEndpoint::new();
    let mut server = TestServer::start(&ep, true).await.unwrap();

    let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, true)
        .try_redirect_activation(&HutaoActivationArguments::launch(None))
        .await
        .unwrap();

    assert_eq!(outcome, RedirectOutcome::Redirected);
    assert!(server.next_activation(WAIT).await.unwrap().is_redirected);
    server.shutdown().await.unwrap();
}

/// Elevated client, non-elevated server: the server exits and hands over.
#[tokio::test]
async fn test_elevated_client_cedes() {
    let ep = TestEndpoint::new();
    let mut server = TestServer::start(&ep, false).await.unwrap();

    let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, true)
        .try_redirect_activation(&HutaoActivationArguments::launch(None))
        .await
        .unwrap();

    assert_eq!(outcome, RedirectOutcome::Ceded);
    assert!(!outcome.is_redirected());
    assert_eq!(
        server.wait_exit(WAIT).await.unwrap(),
        ListenerExit::ExitRequested
    );
    assert!(server.drain_activations().is_empty());
}

/// The whole takeover through the startup path.
#[tokio::test]
async fn test_elevated_launch_becomes_primary() {
    let ep = TestEndpoint::new();
    let mut old = TestServer::start(&ep, false).await.unwrap();

    let (host, mut activations) = recording_host(true);
    let startup = SingleInstance::new(ep.endpoint.clone(), ep.timeouts, true)
        .startup(host, &HutaoActivationArguments::launch(None))
        .await
        .unwrap();
    assert!(startup.is_primary());
    assert_eq!(old.wait_exit(WAIT).await.unwrap(), ListenerExit::ExitRequested);

    let hutao_instance::Startup::Primary(server) = startup else {
        unreachable!("checked above")
    };
    let mut handle = server.spawn();

    // Later plain launches now reach the elevated primary
    let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, false)
        .try_redirect_activation(&HutaoActivationArguments::launch(None))
        .await
        .unwrap();
    assert!(outcome.is_redirected());
    assert!(tokio::time::timeout(WAIT, activations.recv())
        .await
        .unwrap()
        .unwrap()
        .is_redirected);

    handle.shutdown();
    assert_eq!(handle.join().await.unwrap(), ListenerExit::Shutdown);
}

#[cfg(unix)]
mod close_once {
    use std::sync::atomic::Ordering;

    use hutao_instance::{Channel, PipeListener};
    use hutao_ipc_protocol::PROTOCOL_VERSION;
    use tokio::net::UnixStream;

    use super::*;
    use crate::harness::TrackedStream;

    async fn tracked_redirect(
        ep: &TestEndpoint,
        is_elevated: bool,
    ) -> (hutao_ipc_protocol::Result<RedirectOutcome>, usize, usize) {
        let stream = TrackedStream::new(
            UnixStream::connect(ep.endpoint.socket_path())
                .await
                .unwrap(),
        );
        let shutdowns = stream.shutdowns.clone();
        let drops = stream.drops.clone();
        let channel = Channel::new(stream, PROTOCOL_VERSION, ep.timeouts.read);

        let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, is_elevated)
            .redirect_over(Some(channel), &HutaoActivationArguments::launch(None))
            .await;
        (
            outcome,
            shutdowns.load(Ordering::SeqCst),
            drops.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn test_closed_once_when_redirected() {
        let ep = TestEndpoint::new();
        let server = TestServer::start(&ep, false).await.unwrap();

        let (outcome, shutdowns, drops) = tracked_redirect(&ep, false).await;
        assert_eq!(outcome.unwrap(), RedirectOutcome::Redirected);
        assert_eq!((shutdowns, drops), (1, 1));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_once_when_ceded() {
        let ep = TestEndpoint::new();
        let _server = TestServer::start(&ep, false).await.unwrap();

        let (outcome, shutdowns, drops) = tracked_redirect(&ep, true).await;
        assert_eq!(outcome.unwrap(), RedirectOutcome::Ceded);
        assert_eq!((shutdowns, drops), (1, 1));
    }

    #[tokio::test]
    async fn test_closed_once_on_error() {
        let ep = TestEndpoint::new();
        // Bound but never accepting, so the elevation query times out
        let _held = PipeListener::bind(&ep.endpoint, &ep.timeouts).await.unwrap();

        let (outcome, shutdowns, drops) = tracked_redirect(&ep, false).await;
        assert!(outcome.is_err());
        assert_eq!((shutdowns, drops), (1, 1));
    }
}
