//! Listener robustness and the startup path.

use std::time::Duration;

use hutao_instance::{
    try_connect_once, ListenerExit, PipeClient, PipeListener, PipeServer, SingleInstance, Startup,
    Timeouts,
};
use hutao_ipc_protocol::{ElevationStatusResponse, HutaoActivationArguments, Packet, ProtocolError};

use crate::harness::{launch, recording_host, FailingFirstAccept, TestEndpoint, TestServer};

const WAIT: Duration = Duration::from_secs(5);

async fn redirect(ep: &TestEndpoint, args: &HutaoActivationArguments) {
    let outcome = PipeClient::new(ep.endpoint.clone(), ep.timeouts, false)
        .try_redirect_activation(args)
        .await
        .unwrap();
    assert!(outcome.is_redirected());
}

#[tokio::test]
async fn test_survives_protocol_violation() {
    let ep = TestEndpoint::new();
    let mut server = TestServer::start(&ep, false).await.unwrap();

    // A client must never send a response
    let mut rogue = try_connect_once(&ep.endpoint, &ep.timeouts)
        .await
        .expect("server is listening");
    rogue
        .write_packet(&Packet::ElevationStatusResponse(ElevationStatusResponse {
            is_elevated: true,
        }))
        .await
        .unwrap();
    rogue.flush().await.unwrap();
    assert!(rogue.read_packet().await.is_err());
    rogue.close().await;

    let args = HutaoActivationArguments::launch(Some("after-violation".into()));
    redirect(&ep, &args).await;

    let received = server.next_activation(WAIT).await.unwrap();
    assert_eq!(received.launch_arguments.as_deref(), Some("after-violation"));
    assert_eq!(server.shutdown().await.unwrap(), ListenerExit::Shutdown);
}

/// A foreign protocol version is rejected on the first byte; its payload is
/// never handed to the host.
#[tokio::test]
async fn test_version_mismatch_never_reaches_host() {
    let ep = TestEndpoint::new();
    let mut server = TestServer::start(&ep, false).await.unwrap();

    let foreign = ep.endpoint.clone().with_version(ep.endpoint.version + 1);
    let mut stranger = try_connect_once(&foreign, &ep.timeouts)
        .await
        .expect("server is listening");
    // One write only: the server hangs up as soon as it sees the version byte
    stranger
        .write_packet(&Packet::RedirectActivation(
            HutaoActivationArguments::launch(Some("from-the-future".into())).redirected(),
        ))
        .await
        .unwrap();
    stranger.flush().await.unwrap();
    assert!(stranger.read_packet().await.is_err());
    stranger.close().await;

    let args = HutaoActivationArguments::launch(Some("current".into()));
    redirect(&ep, &args).await;

    let received = server.next_activation(WAIT).await.unwrap();
    assert_eq!(received.launch_arguments.as_deref(), Some("current"));
    assert!(server.drain_activations().is_empty());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_client_does_not_block_listener() {
    let mut ep = TestEndpoint::new();
    ep.timeouts.read = Duration::from_millis(100);
    let mut server = TestServer::start(&ep, false).await.unwrap();

    // Connects and says nothing until the server's read timeout fires
    let silent = try_connect_once(&ep.endpoint, &ep.timeouts)
        .await
        .expect("server is listening");

    // Patient enough to wait out the silent session
    let patient = Timeouts {
        read: Duration::from_secs(2),
        ..ep.timeouts
    };
    let outcome = PipeClient::new(ep.endpoint.clone(), patient, false)
        .try_redirect_activation(&HutaoActivationArguments::launch(None))
        .await
        .unwrap();
    assert!(outcome.is_redirected());
    assert!(server.next_activation(WAIT).await.unwrap().is_redirected);

    drop(silent);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_launch_redirects_to_first() {
    let ep = TestEndpoint::new();

    let (host, mut activations) = recording_host(false);
    let first = SingleInstance::new(ep.endpoint.clone(), ep.timeouts, false)
        .startup(host, &HutaoActivationArguments::launch(None))
        .await
        .unwrap();
    let Startup::Primary(server) = first else {
        panic!("first launch must become primary");
    };
    let mut handle = server.spawn();

    let (second_host, _unused) = recording_host(false);
    let second = SingleInstance::new(ep.endpoint.clone(), ep.timeouts, false)
        .startup(
            second_host,
            &HutaoActivationArguments::launch(Some("--second".into())),
        )
        .await
        .unwrap();
    assert!(matches!(second, Startup::Exit));

    let received = tokio::time::timeout(WAIT, activations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.launch_arguments.as_deref(), Some("--second"));
    assert!(received.is_redirected);

    handle.shutdown();
    assert_eq!(handle.join().await.unwrap(), ListenerExit::Shutdown);
}

#[tokio::test]
async fn test_endpoint_released_after_shutdown() {
    let ep = TestEndpoint::new();
    let server = TestServer::start(&ep, false).await.unwrap();
    server.shutdown().await.unwrap();

    // The next launch finds nobody and can claim the endpoint
    let again = TestServer::start(&ep, false).await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_second_bind_is_rejected() {
    let ep = TestEndpoint::new();
    let _server = TestServer::start(&ep, false).await.unwrap();

    let err = match TestServer::start(&ep, false).await {
        Ok(_) => panic!("endpoint bound twice"),
        Err(e) => e,
    };
    assert!(matches!(
        err.downcast_ref::<ProtocolError>(),
        Some(ProtocolError::EndpointInUse(_))
    ));
}

#[tokio::test]
async fn test_listener_survives_failed_accept() {
    let ep = TestEndpoint::new();
    let (host, mut activations) = recording_host(false);
    let listener = PipeListener::bind(&ep.endpoint, &ep.timeouts).await.unwrap();
    let mut handle = PipeServer::new(FailingFirstAccept::new(listener), host).spawn();

    redirect(&ep, &HutaoActivationArguments::launch(Some("after-accept-error".into()))).await;
    let received = tokio::time::timeout(WAIT, activations.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.launch_arguments.as_deref(), Some("after-accept-error"));

    // Still the owner: a new launch cannot bind
    assert!(matches!(
        PipeListener::bind(&ep.endpoint, &ep.timeouts).await,
        Err(ProtocolError::EndpointInUse(_))
    ));

    handle.shutdown();
    assert_eq!(handle.join().await.unwrap(), ListenerExit::Shutdown);
}

async fn race_launches(ep: &TestEndpoint, launches: usize) -> usize {
    let tasks: Vec<_> = (0..launches)
        .map(|_| tokio::spawn(launch(ep.endpoint.clone(), ep.timeouts, false)))
        .collect();

    let mut primaries = Vec::new();
    for task in tasks {
        if let Some(handle) = task.await.unwrap() {
            primaries.push(handle);
        }
    }

    let count = primaries.len();
    for mut handle in primaries {
        handle.shutdown();
        handle.join().await.unwrap();
    }
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_launches_have_one_primary() {
    let ep = TestEndpoint::new();
    assert_eq!(race_launches(&ep, 4).await, 1);
}

/// Every launch sees a crashed instance's socket and treats it as stale.
#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_launches_over_stale_socket_have_one_primary() {
    let ep = TestEndpoint::new();
    std::fs::create_dir_all(&ep.endpoint.socket_dir).unwrap();
    drop(std::os::unix::net::UnixListener::bind(ep.endpoint.socket_path()).unwrap());

    assert_eq!(race_launches(&ep, 4).await, 1);
}
