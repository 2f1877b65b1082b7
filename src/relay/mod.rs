//! Persistent backend relay connection
//!
//! One connection at a time: dial with the auth token, send `register`,
//! then read and handle one message at a time until the connection drops.
//! Any failure waits the fixed backoff and dials again, forever, until the
//! shutdown signal flips.

pub mod dispatch;
pub mod types;
pub mod ws;

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::peripheral::PeripheralGateway;
use crate::supervisor::Provisioner;
pub use dispatch::CommandDispatcher;
use types::OutboundMessage;
pub use ws::WsConnector;

/// Dials the backend
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self, url: &str, token: &str) -> impl Future<Output = Result<Self::Conn>> + Send;
}

/// An established text-message connection
pub trait Connection: Send {
    fn send(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;

    /// Next text message; `None` once the peer has closed
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// `register` was sent; the backend never acknowledges it
    Registered,
}

enum Ended {
    Shutdown,
    Closed,
    TokenChanged,
}

pub struct RelayClient<K, P, S> {
    connector: K,
    dispatcher: CommandDispatcher<P, S>,
    url: String,
    device_id: String,
    token: watch::Receiver<String>,
    backoff: Duration,
    state: watch::Sender<ConnectionState>,
}

impl<K: Connector, P: PeripheralGateway, S: Provisioner> RelayClient<K, P, S> {
    /// `token` carries the current auth token; a new value re-dials
    pub fn new(
        connector: K,
        dispatcher: CommandDispatcher<P, S>,
        url: impl Into<String>,
        device_id: impl Into<String>,
        token: watch::Receiver<String>,
        backoff: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            dispatcher,
            url: url.into(),
            device_id: device_id.into(),
            token,
            backoff,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` becomes true (or its sender goes away)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            let token = self.token.borrow_and_update().clone();
            info!("Connecting to backend {}", self.url);

            let dialed = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                dialed = self.connector.connect(&self.url, &token) => dialed,
            };

            match dialed {
                Ok(mut conn) => {
                    let ended = self.serve(&mut conn, &mut shutdown).await;
                    // Published before the connection is torn down, on every path
                    self.state.send_replace(ConnectionState::Disconnected);
                    drop(conn);

                    match ended {
                        Ok(Ended::Shutdown) => break,
                        Ok(Ended::TokenChanged) => {
                            info!("Auth token changed, reconnecting");
                            continue;
                        }
                        Ok(Ended::Closed) => warn!("Backend closed the connection"),
                        Err(e) => warn!("Backend connection lost: {:#}", e),
                    }
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!("Backend dial failed: {:#}", e);
                }
            }

            info!("Reconnecting in {:?}", self.backoff);
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("Relay client stopped");
    }

    async fn serve(
        &mut self,
        conn: &mut K::Conn,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Ended> {
        let register = OutboundMessage::Register {
            homebase_id: self.device_id.clone(),
        };
        conn.send(register.to_json()?).await?;
        self.state.send_replace(ConnectionState::Registered);
        info!("Registered with backend as {}", self.device_id);

        let mut token_live = true;
        loop {
            let received = tokio::select! {
                biased;
                _ = stopped(shutdown) => return Ok(Ended::Shutdown),
                changed = self.token.changed(), if token_live => {
                    if changed.is_ok() {
                        return Ok(Ended::TokenChanged);
                    }
                    token_live = false;
                    continue;
                }
                received = conn.recv() => received?,
            };

            let Some(text) = received else {
                return Ok(Ended::Closed);
            };
            debug!("Received {} bytes from backend", text.len());

            // Handled to completion before the next read
            if let Some(reply) = self.dispatcher.dispatch_text(&text).await {
                conn.send(reply.to_json()?).await?;
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch::tests::{FakePeripheral, FakeProvisioner, Reply};
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    enum Outcome {
        Refuse,
        Accept {
            inbound: Vec<&'static str>,
            hang_when_drained: bool,
        },
    }

    /// Shared record of what the relay did
    struct Recorder {
        dials: Mutex<Vec<(Instant, String)>>,
        sent: Mutex<Vec<String>>,
        states_seen: Mutex<Vec<ConnectionState>>,
        observer: Mutex<Option<watch::Receiver<ConnectionState>>>,
        shutdown: watch::Sender<bool>,
    }

    impl Recorder {
        fn observe(&self) {
            if let Some(observer) = self.observer.lock().unwrap().as_ref() {
                let state = *observer.borrow();
                self.states_seen.lock().unwrap().push(state);
            }
        }

        fn sent(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }
    }

    struct FakeConnector {
        script: Mutex<VecDeque<Outcome>>,
        recorder: Arc<Recorder>,
    }

    impl Connector for FakeConnector {
        type Conn = FakeConnection;

        async fn connect(&self, _url: &str, token: &str) -> Result<FakeConnection> {
            self.recorder
                .dials
                .lock()
                .unwrap()
                .push((Instant::now(), token.to_string()));
            self.recorder.observe();

            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Outcome::Accept {
                    inbound,
                    hang_when_drained,
                }) => Ok(FakeConnection {
                    inbound: inbound.into_iter().map(String::from).collect(),
                    hang_when_drained,
                    recorder: Arc::clone(&self.recorder),
                }),
                Some(Outcome::Refuse) => anyhow::bail!("connection refused"),
                None => {
                    // Script exhausted: end the test run
                    self.recorder.shutdown.send_replace(true);
                    anyhow::bail!("no more outcomes")
                }
            }
        }
    }

    struct FakeConnection {
        inbound: VecDeque<String>,
        hang_when_drained: bool,
        recorder: Arc<Recorder>,
    }

    impl Drop for FakeConnection {
        fn drop(&mut self) {
            self.recorder.observe();
        }
    }

    impl Connection for FakeConnection {
        async fn send(&mut self, text: String) -> Result<()> {
            self.recorder.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>> {
            self.recorder.observe();
            match self.inbound.pop_front() {
                Some(text) => Ok(Some(text)),
                None if self.hang_when_drained => std::future::pending().await,
                None => Ok(None),
            }
        }
    }

    struct Harness {
        client: RelayClient<FakeConnector, FakePeripheral, FakeProvisioner>,
        recorder: Arc<Recorder>,
        shutdown: watch::Receiver<bool>,
        token: watch::Sender<String>,
        provisioner: FakeProvisioner,
        peripheral: FakePeripheral,
    }

    fn harness(script: Vec<Outcome>) -> Harness {
        harness_with(script, Reply::Status(200))
    }

    fn harness_with(script: Vec<Outcome>, reply: Reply) -> Harness {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let recorder = Arc::new(Recorder {
            dials: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            states_seen: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            shutdown: shutdown_tx,
        });
        let connector = FakeConnector {
            script: Mutex::new(script.into()),
            recorder: Arc::clone(&recorder),
        };
        let provisioner = FakeProvisioner::default();
        let peripheral = FakePeripheral::new(reply);
        let dispatcher = CommandDispatcher::new(
            peripheral.clone(),
            provisioner.clone(),
            Duration::from_secs(3),
        );
        let (token, token_rx) = watch::channel("jwt-1".to_string());
        let client = RelayClient::new(
            connector,
            dispatcher,
            "ws://backend/relay",
            "hb-1",
            token_rx,
            Duration::from_secs(5),
        );
        *recorder.observer.lock().unwrap() = Some(client.state());

        Harness {
            client,
            recorder,
            shutdown,
            token,
            provisioner,
            peripheral,
        }
    }

    fn accept(inbound: Vec<&'static str>) -> Outcome {
        Outcome::Accept {
            inbound,
            hang_when_drained: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_spaced_by_backoff() {
        let h = harness(vec![Outcome::Refuse, Outcome::Refuse, accept(vec![])]);

        h.client.run(h.shutdown).await;

        let dials = h.recorder.dials.lock().unwrap();
        assert_eq!(dials.len(), 4);
        for pair in dials.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_secs(5));
        }
        assert!(dials.iter().all(|(_, token)| token == "jwt-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_precedes_replies() {
        let h = harness(vec![accept(vec![
            r#"{"type":"pingPi","msgId":"m0"}"#,
            r#"{"type":"sprinklerCmd","lanName":"x","zone":2,"on":true,"key":"k","msgId":"m1"}"#,
            r#"{"type":"pingEsp","lanName":"y","msgId":"m2"}"#,
        ])]);

        h.client.run(h.shutdown).await;

        assert_eq!(
            h.recorder.sent(),
            vec![
                json!({"type": "register", "homebaseId": "hb-1"}),
                json!({"type": "pongPi", "msgId": "m0"}),
                json!({"type": "sprinklerAck", "msgId": "m1", "success": true}),
                json!({"type": "pongEsp", "lanName": "y", "online": true, "msgId": "m2"}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_keeps_connection() {
        let h = harness(vec![accept(vec![
            "not json",
            r#"{"type":"start_provisioning"}"#,
            r#"{"type":"pingPi","msgId":7}"#,
        ])]);

        h.client.run(h.shutdown).await;

        assert_eq!(h.recorder.dials.lock().unwrap().len(), 2);
        assert_eq!(
            h.recorder.sent(),
            vec![
                json!({"type": "register", "homebaseId": "hb-1"}),
                json!({"type": "pongPi", "msgId": 7}),
            ]
        );
        assert_eq!(
            h.provisioner
                .starts
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_follow_connection() {
        let h = harness(vec![accept(vec![r#"{"type":"pingPi","msgId":1}"#])]);
        let state = h.client.state();

        h.client.run(h.shutdown).await;

        // dial, two reads, teardown, redial
        assert_eq!(
            *h.recorder.states_seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Registered,
                ConnectionState::Registered,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
            ]
        );
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_change_redials_immediately() {
        let h = harness(vec![Outcome::Accept {
            inbound: vec![],
            hang_when_drained: true,
        }]);
        let mut state = h.client.state();
        let run = tokio::spawn(h.client.run(h.shutdown));

        state
            .wait_for(|s| *s == ConnectionState::Registered)
            .await
            .unwrap();
        h.token.send_replace("jwt-2".to_string());
        run.await.unwrap();

        let dials = h.recorder.dials.lock().unwrap();
        assert_eq!(dials.len(), 2);
        assert_eq!(dials[0].1, "jwt-1");
        assert_eq!(dials[1].1, "jwt-2");
        assert!(dials[1].0 - dials[0].0 < Duration::from_secs(5));
        assert_eq!(
            *h.recorder.states_seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Registered,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_registered() {
        let h = harness(vec![Outcome::Accept {
            inbound: vec![],
            hang_when_drained: true,
        }]);
        let mut state = h.client.state();
        let run = tokio::spawn(h.client.run(h.shutdown));

        state
            .wait_for(|s| *s == ConnectionState::Registered)
            .await
            .unwrap();
        h.recorder.shutdown.send_replace(true);
        tokio_test::assert_ok!(run.await);

        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert_eq!(h.recorder.dials.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_finishes_current_message() {
        let h = harness_with(
            vec![Outcome::Accept {
                inbound: vec![
                    r#"{"type":"sprinklerCmd","lanName":"x","zone":1,"on":true,"key":"k","msgId":"m1"}"#,
                    r#"{"type":"pingPi","msgId":"m2"}"#,
                ],
                hang_when_drained: true,
            }],
            Reply::Slow(Duration::from_secs(2)),
        );
        let mut state = h.client.state();
        let started = Instant::now();
        let run = tokio::spawn(h.client.run(h.shutdown));

        state
            .wait_for(|s| *s == ConnectionState::Registered)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.peripheral.calls.lock().unwrap().len(), 1);
        h.recorder.shutdown.send_replace(true);
        tokio_test::assert_ok!(run.await);

        // the zone command completes and is acked; the queued ping is never read
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(
            h.recorder.sent(),
            vec![
                json!({"type": "register", "homebaseId": "hb-1"}),
                json!({"type": "sprinklerAck", "msgId": "m1", "success": true}),
            ]
        );
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }
}
