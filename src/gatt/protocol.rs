//! GATT bridge datagram protocol
//!
//! The BLE peripheral daemon owns the radio and the GATT server. It
//! forwards characteristic writes and subscription changes to the gateway
//! as UDP datagrams, and turns `Notify` frames back into notifications.
//!
//! ```text
//! version (0x01) | token (u16, BE) | kind (u8) | body
//! ```
//!
//! The token is chosen by the sender and echoed in the `Ack`.

use bytes::{Buf, BufMut, BytesMut};

use crate::provisioning::{CredentialField, StatusCode};

pub const PROTOCOL_VERSION: u8 = 0x01;

/// Frame kinds (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Write = 0x00,
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Notify = 0x03,
    Ack = 0x04,
    Read = 0x05,
    ReadResp = 0x06,
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Write),
            0x01 => Ok(FrameKind::Subscribe),
            0x02 => Ok(FrameKind::Unsubscribe),
            0x03 => Ok(FrameKind::Notify),
            0x04 => Ok(FrameKind::Ack),
            0x05 => Ok(FrameKind::Read),
            0x06 => Ok(FrameKind::ReadResp),
            _ => Err(anyhow::anyhow!("Unknown frame kind: 0x{:02x}", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Characteristic {
    WifiSsid = 0x01,
    WifiPassword = 0x02,
    Status = 0x03,
    HomebaseId = 0x04,
    UserToken = 0x05,
}

impl TryFrom<u8> for Characteristic {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Characteristic::WifiSsid),
            0x02 => Ok(Characteristic::WifiPassword),
            0x03 => Ok(Characteristic::Status),
            0x04 => Ok(Characteristic::HomebaseId),
            0x05 => Ok(Characteristic::UserToken),
            _ => Err(anyhow::anyhow!("Unknown characteristic: 0x{:02x}", value)),
        }
    }
}

impl Characteristic {
    pub fn uuid(self) -> &'static str {
        match self {
            Characteristic::WifiSsid => "12345678-1234-5678-1234-56789abcdef1",
            Characteristic::WifiPassword => "12345678-1234-5678-1234-56789abcdef2",
            Characteristic::Status => "12345678-1234-5678-1234-56789abcdef3",
            Characteristic::HomebaseId => "12345678-1234-5678-1234-56789abcdef4",
            Characteristic::UserToken => "12345678-1234-5678-1234-56789abcdef5",
        }
    }

    /// The credential a writable characteristic carries
    pub fn credential_field(self) -> Option<CredentialField> {
        match self {
            Characteristic::WifiSsid => Some(CredentialField::Ssid),
            Characteristic::WifiPassword => Some(CredentialField::Passphrase),
            Characteristic::UserToken => Some(CredentialField::Token),
            Characteristic::Status | Characteristic::HomebaseId => None,
        }
    }
}

/// Frame received from the daemon
#[derive(Debug, PartialEq, Eq)]
pub enum BridgeFrame {
    Write {
        token: u16,
        characteristic: Characteristic,
        value: Vec<u8>,
    },
    Subscribe {
        token: u16,
    },
    Unsubscribe {
        token: u16,
    },
    Read {
        token: u16,
        characteristic: Characteristic,
    },
}

impl BridgeFrame {
    /// Parse a raw datagram from the daemon
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Frame too short: {} bytes", data.len()));
        }

        let mut buf = data;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported protocol version: 0x{:02x}",
                version
            ));
        }

        let token = buf.get_u16();
        let kind = FrameKind::try_from(buf.get_u8())?;

        match kind {
            FrameKind::Write => {
                if !buf.has_remaining() {
                    return Err(anyhow::anyhow!("WRITE without characteristic"));
                }
                let characteristic = Characteristic::try_from(buf.get_u8())?;
                Ok(BridgeFrame::Write {
                    token,
                    characteristic,
                    value: buf.to_vec(),
                })
            }
            FrameKind::Subscribe => Ok(BridgeFrame::Subscribe { token }),
            FrameKind::Unsubscribe => Ok(BridgeFrame::Unsubscribe { token }),
            FrameKind::Read => {
                if !buf.has_remaining() {
                    return Err(anyhow::anyhow!("READ without characteristic"));
                }
                let characteristic = Characteristic::try_from(buf.get_u8())?;
                Ok(BridgeFrame::Read {
                    token,
                    characteristic,
                })
            }
            _ => Err(anyhow::anyhow!(
                "Unexpected frame kind from daemon: {:?}",
                kind
            )),
        }
    }

    pub fn token(&self) -> u16 {
        match self {
            BridgeFrame::Write { token, .. }
            | BridgeFrame::Subscribe { token }
            | BridgeFrame::Unsubscribe { token }
            | BridgeFrame::Read { token, .. } => *token,
        }
    }
}

fn header(token: u16, kind: FrameKind, body_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(token);
    buf.put_u8(kind as u8);
    buf
}

/// Build an ACK for the frame carrying `token`
pub fn ack(token: u16) -> Vec<u8> {
    header(token, FrameKind::Ack, 0).to_vec()
}

/// Build a status NOTIFY (token is always 0)
pub fn notify(status: StatusCode) -> Vec<u8> {
    let mut buf = header(0, FrameKind::Notify, 1);
    buf.put_u8(status.as_byte());
    buf.to_vec()
}

/// Build a READ_RESP carrying a characteristic value
pub fn read_resp(token: u16, characteristic: Characteristic, value: &[u8]) -> Vec<u8> {
    let mut buf = header(token, FrameKind::ReadResp, 1 + value.len());
    buf.put_u8(characteristic as u8);
    buf.put_slice(value);
    buf.to_vec()
}
