//! Lifecycle controller: create the tunnel, keep a session running, and
//! take the single shutdown path on interrupt or failure.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::control::{Broker, TunnelDescriptor};
use super::http_relay::HttpRelay;
use super::session::{Session, SessionState};
use super::tcp_forwarder::TcpForwarder;
use crate::config::RelayConfig;
use crate::error::{Result, TunnelError};
use crate::protocol::TunnelProtocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Creating,
    Running,
    Stopping,
    Stopped,
}

/// What the user asked to expose
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: u16,
}

pub struct Controller<B: Broker> {
    broker: B,
    options: TunnelOptions,
    relay: RelayConfig,
    cancel: CancellationToken,
    state: watch::Sender<LifecycleState>,
    link: watch::Sender<SessionState>,
}

impl<B: Broker> Controller<B> {
    pub fn new(broker: B, options: TunnelOptions, relay: RelayConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        let (link, _) = watch::channel(SessionState::Closed);
        Self {
            broker,
            options,
            relay,
            cancel: CancellationToken::new(),
            state,
            link,
        }
    }

    /// Cancelling this token moves a running tunnel to `Stopping`
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// State of the current session channel; `Connecting` again on reconnect
    pub fn subscribe_session(&self) -> watch::Receiver<SessionState> {
        self.link.subscribe()
    }

    fn set_state(&self, state: LifecycleState) {
        info!("Tunnel state: {:?}", state);
        self.state.send_replace(state);
    }

    fn set_link(&self, state: SessionState) {
        debug!("Session state: {:?}", state);
        self.link.send_replace(state);
    }

    /// Run the tunnel to completion. `stop_tunnel` is called exactly once
    /// if creation succeeded, whatever ends the run.
    pub async fn run(self) -> Result<()> {
        self.set_state(LifecycleState::Creating);

        let descriptor = match self.create_with_retry().await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                info!("Interrupted before the tunnel was created");
                self.set_state(LifecycleState::Stopped);
                return Ok(());
            }
            Err(e) => {
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        print_status(&descriptor);
        self.set_state(LifecycleState::Running);

        // The token fires on interrupt and on terminal failure, before the
        // channel and forwarded connections are released.
        let stopping = async {
            self.cancel.cancelled().await;
            self.set_state(LifecycleState::Stopping);
        };
        let relaying = async {
            let result = self.keep_session(&descriptor).await;
            self.cancel.cancel();
            result
        };
        let (result, ()) = tokio::join!(relaying, stopping);

        if let Err(e) = &result {
            error!("Tunnel failed: {}", e);
        }

        match self.broker.stop_tunnel(&descriptor.id).await {
            Ok(()) => info!("Tunnel {} deregistered", descriptor.id),
            Err(e) => warn!("Failed to deregister tunnel {}: {}", descriptor.id, e),
        }

        self.set_state(LifecycleState::Stopped);
        result
    }

    async fn create_with_retry(&self) -> Result<Option<TunnelDescriptor>> {
        let mut attempt = 1;
        loop {
            let created = self
                .broker
                .create_tunnel(
                    self.options.protocol,
                    &self.options.local_host,
                    self.options.local_port,
                )
                .await;

            match created {
                Ok(descriptor) => return Ok(Some(descriptor)),
                Err(e) if e.is_retryable() && attempt < self.relay.create_attempts => {
                    let delay = self.relay.backoff(attempt);
                    warn!(
                        "Could not reach broker ({}), retrying in {:?} ({}/{})",
                        e, delay, attempt, self.relay.create_attempts
                    );
                    if !self.pause(delay).await {
                        return Ok(None);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Keep a session open until cancelled; reconnect on transport failures.
    /// `failures` counts consecutive sessions that failed before becoming
    /// healthy.
    async fn keep_session(&self, descriptor: &TunnelDescriptor) -> Result<()> {
        let channel_url = self.broker.channel_url(&descriptor.id)?;
        let mut failures = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.set_link(SessionState::Connecting);
            let opened = tokio::select! {
                opened = Session::open(descriptor.clone(), &channel_url, self.broker.token()) => opened,
                _ = self.cancel.cancelled() => {
                    self.set_link(SessionState::Closed);
                    return Ok(());
                }
            };

            let outcome = match opened {
                Ok(session) => {
                    self.set_link(SessionState::Open);
                    let (result, healthy) = self.drive(session, failures).await;
                    if healthy {
                        failures = 0;
                    }
                    result
                }
                Err(e) => {
                    self.set_link(SessionState::Closed);
                    Err(e)
                }
            };

            match outcome {
                Err(e) if self.should_retry(&e, failures) => {
                    failures += 1;
                    let delay = self.relay.backoff(failures);
                    warn!(
                        "Channel lost ({}), reconnecting in {:?} ({}/{})",
                        e, delay, failures, self.relay.reconnect_attempts
                    );
                    if !self.pause(delay).await {
                        return Ok(());
                    }
                }
                other => return other,
            }
        }
    }

    fn should_retry(&self, error: &TunnelError, failures: u32) -> bool {
        error.is_retryable() && failures < self.relay.reconnect_attempts
    }

    /// One session with its forwarder. Everything the forwarder spawned
    /// has finished (sockets closed) by the time this returns. The flag
    /// reports whether the session was healthy.
    async fn drive(&self, mut session: Session, failures: u32) -> (Result<()>, bool) {
        let scope = self.cancel.child_token();
        let tasks = TaskTracker::new();
        let sender = session.sender();
        let grace = self.relay.shutdown_grace();
        let opened_at = Instant::now();

        let result = match self.options.protocol {
            TunnelProtocol::Http => {
                match HttpRelay::new(
                    &self.options.local_host,
                    self.options.local_port,
                    self.relay.request_timeout(),
                    sender,
                    tasks.clone(),
                ) {
                    Ok(relay) => session.run(relay, scope.clone(), grace).await,
                    Err(e) => {
                        session.close().await;
                        Err(e)
                    }
                }
            }
            TunnelProtocol::Tcp => {
                let forwarder = TcpForwarder::new(
                    &self.options.local_host,
                    self.options.local_port,
                    sender,
                    scope.clone(),
                    tasks.clone(),
                );
                session.run(forwarder, scope.clone(), grace).await
            }
        };

        let healthy =
            session.frames_received() > 0 || opened_at.elapsed() >= self.relay.stable_session();
        let failures = if healthy { 0 } else { failures };
        let retrying = matches!(&result, Err(e) if self.should_retry(e, failures));
        if !retrying {
            // No session follows this one; release it under Stopping
            self.cancel.cancel();
        }

        scope.cancel();
        self.set_link(session.state());
        debug!(
            tunnel_id = %session.descriptor().id,
            frames = session.frames_received(),
            healthy,
            "Session ended"
        );

        // One grace budget covers the channel drain and the task wait
        let deadline = session
            .drain_deadline()
            .unwrap_or_else(|| Instant::now() + grace);
        // Undelivered frames fail fast once the channel is gone
        drop(session);
        tasks.close();
        if tokio::time::timeout_at(deadline, tasks.wait()).await.is_err() {
            warn!("{} forwarding task(s) still running at shutdown", tasks.len());
        }

        (result, healthy)
    }

    /// Sleep unless cancelled first; false means cancelled
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

fn print_status(descriptor: &TunnelDescriptor) {
    println!();
    println!(
        "Connected, tunneling to: {} -> {}:{}",
        descriptor.public_url(),
        descriptor.local_host,
        descriptor.local_port
    );
    println!("Tunnel id: {}", descriptor.id);
    println!();
    println!("Press Ctrl+C to stop the tunnel.");
    println!();
}

/// Cancel `cancel` on SIGINT or SIGTERM
pub fn spawn_signal_listener(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down tunnel...");
        cancel.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TunnelId;
    use crate::testing::{
        closed_port, spawn_broker, spawn_echo_service, spawn_flapping_broker, spawn_tcp_service,
    };
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use url::Url;

    #[derive(Default)]
    struct Calls {
        creates: AtomicUsize,
        stops: AtomicUsize,
    }

    struct FakeBroker {
        created: Mutex<VecDeque<Result<TunnelDescriptor>>>,
        channel: Url,
        calls: Arc<Calls>,
    }

    impl FakeBroker {
        fn new(created: Vec<Result<TunnelDescriptor>>, channel: Url) -> (Self, Arc<Calls>) {
            let calls = Arc::new(Calls::default());
            let broker = Self {
                created: Mutex::new(created.into()),
                channel,
                calls: calls.clone(),
            };
            (broker, calls)
        }
    }

    impl Broker for FakeBroker {
        async fn create_tunnel(
            &self,
            _protocol: TunnelProtocol,
            _local_host: &str,
            _local_port: u16,
        ) -> Result<TunnelDescriptor> {
            self.calls.creates.fetch_add(1, Ordering::SeqCst);
            self.created
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TunnelError::Network("connection refused".into())))
        }

        async fn stop_tunnel(&self, _id: &TunnelId) -> Result<()> {
            self.calls.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn channel_url(&self, _id: &TunnelId) -> Result<Url> {
            Ok(self.channel.clone())
        }

        fn token(&self) -> &str {
            "secret"
        }
    }

    fn descriptor(protocol: TunnelProtocol, local_port: u16) -> TunnelDescriptor {
        TunnelDescriptor {
            id: TunnelId("t1".into()),
            protocol,
            local_host: "127.0.0.1".into(),
            local_port,
            public_address: "t1.example.com".into(),
        }
    }

    fn options(protocol: TunnelProtocol, local_port: u16) -> TunnelOptions {
        TunnelOptions {
            protocol,
            local_host: "127.0.0.1".into(),
            local_port,
        }
    }

    fn fast_relay() -> RelayConfig {
        RelayConfig {
            request_timeout_secs: 5,
            create_attempts: 3,
            reconnect_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            shutdown_grace_secs: 10,
            stable_session_secs: 60,
        }
    }

    fn unused_url() -> Url {
        Url::parse("ws://127.0.0.1:9/ws/tunnel/t1").unwrap()
    }

    #[tokio::test]
    async fn test_unauthorized_create_is_not_retried() {
        let (broker, calls) = FakeBroker::new(vec![Err(TunnelError::Auth)], unused_url());
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());
        let state = controller.subscribe();

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, TunnelError::Auth));
        assert!(err.to_string().contains("hixtunnel auth"));
        assert_eq!(calls.creates.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 0);
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_broker_rejection_is_terminal() {
        let rejection = TunnelError::Broker {
            status: 400,
            message: "bad protocol".into(),
        };
        let (broker, calls) = FakeBroker::new(vec![Err(rejection)], unused_url());
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());

        match controller.run().await {
            Err(TunnelError::Broker { message, .. }) => assert_eq!(message, "bad protocol"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_errors_retry_up_to_ceiling() {
        let (broker, calls) = FakeBroker::new(vec![], unused_url());
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());

        let err = controller.run().await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(calls.creates.load(Ordering::SeqCst), 3);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_frame_triggers_single_stop() {
        let (url, broker_side) = spawn_broker(None).await;
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Http, 3000))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());
        let state = controller.subscribe();

        let (result, _) = tokio::join!(controller.run(), async {
            let mut side = broker_side.await.unwrap();
            side.send(json!({"type": "error", "message": "tunnel expired"}))
                .await;
            side
        });

        match result {
            Err(TunnelError::SessionClosed { reason }) => assert_eq!(reason, "tunnel expired"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_error_and_interrupt_stop_once() {
        let (url, broker_side) = spawn_broker(None).await;
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Http, 3000))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());
        let cancel = controller.cancel_token();

        let (result, _) = tokio::join!(controller.run(), async {
            let mut side = broker_side.await.unwrap();
            side.send(json!({"type": "error", "message": "gone"})).await;
            cancel.cancel();
            side
        });

        assert!(matches!(
            result,
            Ok(()) | Err(TunnelError::SessionClosed { .. })
        ));
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupt_lets_in_flight_http_finish() {
        let service = spawn_echo_service(Duration::from_millis(300)).await;
        let port = service.address().port();
        let (url, broker_side) = spawn_broker(None).await;
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Http, port))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Http, port), fast_relay());
        let cancel = controller.cancel_token();

        let (result, responses) = tokio::join!(controller.run(), async {
            let mut side = broker_side.await.unwrap();
            for id in ["r1", "r2"] {
                side.send(json!({
                    "type": "data",
                    "payload": {"method": "GET", "path": format!("/slow/{}", id), "correlation_id": id}
                }))
                .await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();

            let mut responses = Vec::new();
            while let Some(payload) = side.next_payload().await {
                responses.push(payload);
            }
            responses
        });

        tokio_test::assert_ok!(result);
        assert_eq!(responses.len(), 2);
        for response in &responses {
            assert_eq!(response["status"], 200);
            let id = response["correlation_id"].as_str().unwrap();
            assert_eq!(
                response["body"],
                json!(format!(r#"{{"path":"/slow/{}"}}"#, id))
            );
        }
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupt_closes_tcp_sockets_before_stop() {
        let (port, mut accepted) = spawn_tcp_service().await;
        let (url, broker_side) = spawn_broker(None).await;
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Tcp, port))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Tcp, port), fast_relay());
        let cancel = controller.cancel_token();

        let (result, (frames, mut local)) = tokio::join!(controller.run(), async {
            let mut side = broker_side.await.unwrap();
            side.send(json!({
                "type": "data",
                "payload": {"event": "open", "connection_id": "c1"}
            }))
            .await;

            let local = accepted.recv().await.unwrap();
            let mut frames = vec![side.next_payload().await.unwrap()];
            cancel.cancel();

            while let Some(payload) = side.next_payload().await {
                frames.push(payload);
            }
            (frames, local)
        });

        tokio_test::assert_ok!(result);
        assert_eq!(frames[0]["event"], "connected");
        // The close frame is only sent once both socket halves are dropped,
        // and the channel drains it before deregistration.
        assert_eq!(
            frames.last().unwrap(),
            &json!({"event": "close", "connection_id": "c1", "reason": "shutdown"})
        );
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), local.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_channel_failure_stops_tunnel() {
        let port = closed_port().await;
        let url = Url::parse(&format!("ws://127.0.0.1:{}/ws/tunnel/t1", port)).unwrap();
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Http, 3000))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());

        let err = controller.run().await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_dropped_after_handshake_counts_as_failure() {
        let (url, accepted) = spawn_flapping_broker().await;
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Http, 3000))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), fast_relay());
        let state = controller.subscribe();
        let link = controller.subscribe_session();

        let result = tokio::time::timeout(Duration::from_secs(5), controller.run())
            .await
            .expect("controller kept reconnecting");

        assert!(matches!(
            result,
            Err(TunnelError::Network(_)) | Err(TunnelError::SessionClosed { .. })
        ));
        // First attempt plus at most `reconnect_attempts` retries
        let handshakes = accepted.load(Ordering::SeqCst);
        assert!((1..=3).contains(&handshakes), "{} handshakes", handshakes);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
        assert_eq!(*link.borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_state_is_stopping_while_draining() {
        let service = spawn_echo_service(Duration::from_millis(800)).await;
        let port = service.address().port();
        let (url, broker_side) = spawn_broker(None).await;
        let (broker, calls) = FakeBroker::new(
            vec![Ok(descriptor(TunnelProtocol::Http, port))],
            url,
        );
        let controller = Controller::new(broker, options(TunnelProtocol::Http, port), fast_relay());
        let cancel = controller.cancel_token();
        let state = controller.subscribe();
        let link = controller.subscribe_session();

        let (result, (during_drain, link_before, responses)) = tokio::join!(controller.run(), async {
            let mut side = broker_side.await.unwrap();
            side.send(json!({
                "type": "data",
                "payload": {"method": "GET", "path": "/slow/d1", "correlation_id": "d1"}
            }))
            .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let link_before = *link.borrow();
            cancel.cancel();

            tokio::time::sleep(Duration::from_millis(300)).await;
            let during_drain = *state.borrow();
            let stops_during_drain = calls.stops.load(Ordering::SeqCst);
            assert_eq!(stops_during_drain, 0);

            let mut responses = Vec::new();
            while let Some(payload) = side.next_payload().await {
                responses.push(payload);
            }
            (during_drain, link_before, responses)
        });

        tokio_test::assert_ok!(result);
        assert_eq!(link_before, SessionState::Open);
        assert_eq!(during_drain, LifecycleState::Stopping);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["correlation_id"], "d1");
        assert_eq!(responses[0]["status"], 200);
        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_interrupt_during_backoff_skips_stop() {
        let (broker, calls) = FakeBroker::new(vec![], unused_url());
        let mut relay = fast_relay();
        relay.backoff_base_ms = 60_000;
        relay.backoff_max_ms = 60_000;
        let controller = Controller::new(broker, options(TunnelProtocol::Http, 3000), relay);
        let cancel = controller.cancel_token();

        let (result, _) = tokio::join!(controller.run(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        tokio_test::assert_ok!(result);
        assert_eq!(calls.creates.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stops.load(Ordering::SeqCst), 0);
    }
}
