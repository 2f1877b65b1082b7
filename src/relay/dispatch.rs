//! Routing of backend commands to their handlers

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use super::types::{InboundCommand, OutboundMessage};
use crate::peripheral::PeripheralGateway;
use crate::supervisor::Provisioner;

pub struct CommandDispatcher<P, S> {
    peripheral: P,
    provisioner: S,
    timeout: Duration,
}

impl<P: PeripheralGateway, S: Provisioner> CommandDispatcher<P, S> {
    /// `timeout` bounds every peripheral call
    pub fn new(peripheral: P, provisioner: S, timeout: Duration) -> Self {
        Self {
            peripheral,
            provisioner,
            timeout,
        }
    }

    /// Parse and dispatch one raw backend message. Malformed messages are
    /// logged and produce no reply.
    pub async fn dispatch_text(&self, text: &str) -> Option<OutboundMessage> {
        match InboundCommand::parse(text) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                warn!("Dropping backend message: {}", e);
                None
            }
        }
    }

    /// Handle one command; returns the reply to send, if the command has one
    pub async fn dispatch(&self, command: InboundCommand) -> Option<OutboundMessage> {
        match command {
            InboundCommand::StartProvisioning => {
                info!("Backend requested peripheral provisioning");
                self.provisioner.start();
                None
            }
            InboundCommand::StopProvisioning => {
                info!("Backend cancelled peripheral provisioning");
                self.provisioner.stop();
                None
            }
            InboundCommand::SprinklerCommand {
                lan_name,
                zone,
                on,
                key,
                msg_id,
            } => {
                info!(
                    "Sprinkler {} zone {} -> {}",
                    lan_name,
                    zone,
                    if on { "on" } else { "off" }
                );
                let success = self
                    .bounded(&lan_name, self.peripheral.set_zone(&lan_name, zone, on, &key))
                    .await
                    == Some(200);
                Some(OutboundMessage::SprinklerAck { msg_id, success })
            }
            InboundCommand::PingPeripheral { lan_name, msg_id } => {
                let online = self.bounded(&lan_name, self.peripheral.ping(&lan_name)).await == Some(200);
                info!("Peripheral {} is {}", lan_name, if online { "online" } else { "offline" });
                Some(OutboundMessage::PongPeripheral {
                    lan_name,
                    online,
                    msg_id,
                })
            }
            InboundCommand::PingSelf { msg_id } => Some(OutboundMessage::PongSelf { msg_id }),
        }
    }

    /// Run a peripheral call under the timeout; `None` on error or timeout
    async fn bounded(
        &self,
        lan_name: &str,
        call: impl Future<Output = anyhow::Result<u16>>,
    ) -> Option<u16> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(status)) => {
                if status != 200 {
                    warn!("Peripheral {} answered {}", lan_name, status);
                }
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Peripheral {} call failed: {:#}", lan_name, e);
                None
            }
            Err(_) => {
                warn!("Peripheral {} timed out after {:?}", lan_name, self.timeout);
                None
            }
        }
    }
}
