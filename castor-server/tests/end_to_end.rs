//! Full-stack tests: a real daemon runtime talking to a real coordinator
//! over websockets, with pre-declared capabilities and a passthrough job so
//! no encoder binary is needed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use castor_config::{CoordinatorConfig, DaemonConfig};
use castor_contracts::{Capabilities, EsSample, EsSampleBatch, JobSpec, JobState};
use castor_daemon::probe::CapabilityProbe;
use castor_daemon::runtime::WorkerRuntime;
use castor_server::{Coordinator, JobEvent, WorkerState};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval: Duration::from_millis(200),
        unhealthy_grace: Duration::from_secs(2),
        worker_eviction_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

fn override_caps() -> Capabilities {
    Capabilities {
        video_encoders: vec!["libx264".into()],
        video_decoders: vec!["h264".into()],
        audio_encoders: vec!["aac".into()],
        audio_decoders: vec!["aac".into()],
        max_concurrent_jobs: 2,
        ..Default::default()
    }
}

fn daemon_config(addr: SocketAddr, auth_token: Option<String>) -> DaemonConfig {
    DaemonConfig {
        coordinator_url: format!("ws://{addr}/v1/daemon"),
        daemon_id: Some("e2e-worker".into()),
        daemon_name: "e2e".into(),
        auth_token,
        capabilities_override: Some(override_caps()),
        reconnect_base: Duration::from_millis(200),
        reconnect_max: Duration::from_secs(1),
        stats_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

async fn serve(coordinator: &Coordinator) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = coordinator
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

async fn spawn_daemon(
    addr: SocketAddr,
    auth_token: Option<String>,
) -> (tokio::task::JoinHandle<anyhow::Result<()>>, CancellationToken) {
    let config = daemon_config(addr, auth_token);
    let probe = CapabilityProbe::new(&config, 4);
    let capabilities = probe.run().await.unwrap();
    let runtime = WorkerRuntime::new(Arc::new(config), capabilities);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(runtime.run(shutdown.clone()));
    (task, shutdown)
}

async fn wait_connected(coordinator: &Coordinator, worker_id: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(snapshot) = coordinator.get_worker(worker_id).await
            && snapshot.state == WorkerState::Connected
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker never connected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn passthrough_spec() -> JobSpec {
    JobSpec {
        source_video_codec: "h264".into(),
        source_audio_codec: "aac".into(),
        target_video_codec: "copy".into(),
        target_audio_codec: "copy".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn passthrough_job_round_trips_over_real_websockets() {
    let coordinator = Coordinator::new(coordinator_config());
    let addr = serve(&coordinator).await;
    let (daemon, shutdown) = spawn_daemon(addr, None).await;

    wait_connected(&coordinator, "e2e-worker").await;

    let mut handle = coordinator.submit_job(passthrough_spec());

    let mut batch = EsSampleBatch::source(7);
    batch.video.push(EsSample {
        pts: 90_000,
        dts: 88_500,
        payload: vec![0, 0, 0, 1, 0x65, 0xaa, 0xbb],
        is_keyframe: true,
        sequence: 41,
    });
    batch.audio.push(EsSample {
        pts: 90_200,
        dts: 90_200,
        payload: vec![0xff, 0xf1, 0x5c],
        is_keyframe: false,
        sequence: 12,
    });
    handle.inbound.send(batch.clone()).await.unwrap();

    // The passthrough fast path must return payload, timestamps, and the
    // keyframe flag byte-identically.
    let echoed = timeout(WAIT, handle.outbound.recv())
        .await
        .expect("no transcoded batch")
        .expect("outbound closed");
    assert!(!echoed.is_source);
    assert_eq!(echoed.video, batch.video);
    assert_eq!(echoed.audio, batch.audio);

    drop(handle.inbound);
    let deadline = tokio::time::Instant::now() + WAIT;
    let final_state = loop {
        match timeout(WAIT, handle.status.recv()).await {
            Ok(Some(JobEvent::State { state, .. })) if state.is_terminal() => break state,
            Ok(Some(_)) => {}
            Ok(None) => panic!("status closed without a terminal event"),
            Err(_) => panic!("no terminal event"),
        }
        assert!(tokio::time::Instant::now() < deadline);
    };
    assert_eq!(final_state, JobState::Completed);

    // Clean unregister on daemon shutdown, then eviction empties the
    // registry.
    shutdown.cancel();
    let _ = timeout(WAIT, daemon).await.expect("daemon task hung");
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if coordinator.get_worker("e2e-worker").await.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker was never evicted"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn unauthorized_daemons_halt_instead_of_retrying() {
    let coordinator = Coordinator::new(CoordinatorConfig {
        auth_token: Some("secret".into()),
        ..coordinator_config()
    });
    let addr = serve(&coordinator).await;

    let (daemon, _shutdown) = spawn_daemon(addr, Some("wrong".into())).await;
    let result = timeout(WAIT, daemon).await.expect("daemon kept retrying");
    assert!(result.expect("task panicked").is_err());

    // The right token connects fine.
    let (_daemon, shutdown) = spawn_daemon(addr, Some("secret".into())).await;
    wait_connected(&coordinator, "e2e-worker").await;
    shutdown.cancel();
}

#[tokio::test]
async fn severed_transport_fails_the_job_recoverably() {
    let coordinator = Coordinator::new(coordinator_config());
    let addr = serve(&coordinator).await;
    let (daemon, shutdown) = spawn_daemon(addr, None).await;
    wait_connected(&coordinator, "e2e-worker").await;

    let mut handle = coordinator.submit_job(passthrough_spec());
    let mut batch = EsSampleBatch::source(0);
    batch.video.push(EsSample {
        pts: 0,
        dts: 0,
        payload: vec![1, 2, 3],
        is_keyframe: true,
        sequence: 0,
    });
    handle.inbound.send(batch).await.unwrap();
    timeout(WAIT, handle.outbound.recv())
        .await
        .expect("no output")
        .expect("outbound closed");

    // Kill the daemon without an unregister.
    daemon.abort();
    let _ = daemon.await;
    drop(shutdown);

    let error = loop {
        match timeout(WAIT, handle.status.recv()).await {
            Ok(Some(JobEvent::State {
                state: JobState::Failed,
                error,
            })) => break error,
            Ok(Some(JobEvent::State { state, .. })) if state.is_terminal() => {
                panic!("unexpected terminal state {state:?}");
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("status closed"),
            Err(_) => panic!("job never failed after transport loss"),
        }
    };
    assert!(error.expect("terminal error").recoverable);
}
