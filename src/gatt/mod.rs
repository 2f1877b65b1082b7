pub mod protocol;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::provisioning::{
    BackendClaimer, CredentialChannel, NetworkJoiner, ProvisioningSession, StatusCode,
};
use protocol::{BridgeFrame, Characteristic};

/// UDP endpoint the BLE peripheral daemon talks to
///
/// Characteristic writes are routed to their credential channel,
/// subscription changes to the session, and status codes coming out of the
/// reporter are sent back to whichever address subscribed last.
pub struct GattBridge<J, C> {
    socket: Arc<UdpSocket>,
    session: ProvisioningSession<J, C>,
    channels: Vec<(Characteristic, CredentialChannel<J, C>)>,
    subscriber: Arc<Mutex<Option<SocketAddr>>>,
    last_status: Arc<AtomicU8>,
}

impl<J: NetworkJoiner, C: BackendClaimer> GattBridge<J, C> {
    pub async fn bind(addr: &str, session: ProvisioningSession<J, C>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("GATT bridge listening on {}", socket.local_addr()?);

        let channels = [
            Characteristic::WifiSsid,
            Characteristic::WifiPassword,
            Characteristic::UserToken,
        ]
        .into_iter()
        .filter_map(|characteristic| {
            let field = characteristic.credential_field()?;
            Some((characteristic, CredentialChannel::new(field, session.clone())))
        })
        .collect();

        Ok(Self {
            socket: Arc::new(socket),
            session,
            channels,
            subscriber: Arc::new(Mutex::new(None)),
            last_status: Arc::new(AtomicU8::new(StatusCode::Idle.as_byte())),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve daemon frames and forward `statuses` as notifications
    pub async fn run(self, statuses: mpsc::UnboundedReceiver<StatusCode>) -> anyhow::Result<()> {
        tokio::spawn(forward_statuses(
            Arc::clone(&self.socket),
            Arc::clone(&self.subscriber),
            Arc::clone(&self.last_status),
            statuses,
        ));

        let mut buf = vec![0u8; 2048];

        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            debug!("Received {} bytes from {}: {}", len, src, hex::encode(&buf[..len]));

            match BridgeFrame::parse(&buf[..len]) {
                Ok(frame) => self.handle_frame(src, frame).await,
                Err(e) => warn!("Failed to parse bridge frame from {}: {}", src, e),
            }
        }
    }

    async fn handle_frame(&self, src: SocketAddr, frame: BridgeFrame) {
        let token = frame.token();

        match frame {
            BridgeFrame::Write {
                characteristic,
                value,
                ..
            } => {
                self.send(&protocol::ack(token), src).await;
                match self.channel(characteristic) {
                    Some(channel) => {
                        // The session runs on its own task; nothing to await here
                        let _ = channel.on_write(&value);
                    }
                    None => warn!(
                        "Write to read-only characteristic {:?} ({})",
                        characteristic,
                        characteristic.uuid()
                    ),
                }
            }
            BridgeFrame::Subscribe { .. } => {
                self.send(&protocol::ack(token), src).await;
                *self.lock_subscriber() = Some(src);
                let _ = self.session.set_subscribed(true);
            }
            BridgeFrame::Unsubscribe { .. } => {
                self.session.set_subscribed(false);
                *self.lock_subscriber() = None;
                self.send(&protocol::ack(token), src).await;
            }
            BridgeFrame::Read { characteristic, .. } => {
                let value = match characteristic {
                    Characteristic::HomebaseId => self.session.device_id().as_bytes().to_vec(),
                    Characteristic::Status => vec![self.last_status.load(Ordering::SeqCst)],
                    _ => {
                        warn!("Read of write-only characteristic {:?}", characteristic);
                        return;
                    }
                };
                self.send(&protocol::read_resp(token, characteristic, &value), src)
                    .await;
            }
        }
    }

    fn channel(&self, characteristic: Characteristic) -> Option<&CredentialChannel<J, C>> {
        self.channels
            .iter()
            .find(|(c, _)| *c == characteristic)
            .map(|(_, channel)| channel)
    }

    fn lock_subscriber(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.subscriber.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, frame: &[u8], dst: SocketAddr) {
        if let Err(e) = self.socket.send_to(frame, dst).await {
            error!("Failed to send frame to {}: {}", dst, e);
        }
    }
}

async fn forward_statuses(
    socket: Arc<UdpSocket>,
    subscriber: Arc<Mutex<Option<SocketAddr>>>,
    last_status: Arc<AtomicU8>,
    mut statuses: mpsc::UnboundedReceiver<StatusCode>,
) {
    while let Some(status) = statuses.recv().await {
        last_status.store(status.as_byte(), Ordering::SeqCst);

        let target = *subscriber.lock().unwrap_or_else(PoisonError::into_inner);
        match target {
            Some(addr) => {
                if let Err(e) = socket.send_to(&protocol::notify(status), addr).await {
                    error!("Failed to notify {} of {}: {}", addr, status, e);
                }
            }
            None => debug!("Status {} has no subscriber address", status),
        }
    }
}
