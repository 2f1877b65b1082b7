//! WebSocket transport for the relay connection

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Connection, Connector};

pub struct WsConnector;

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// Attach the auth token as the `token` query parameter
pub fn dial_url(url: &str, token: &str) -> Result<String> {
    let mut url = Url::parse(url).with_context(|| format!("invalid backend url {:?}", url))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &str, token: &str) -> Result<WsConnection> {
        let (stream, response) = connect_async(dial_url(url, token)?)
            .await
            .with_context(|| format!("failed to connect to {}", url))?;
        debug!("Backend handshake answered {}", response.status());
        Ok(WsConnection { stream })
    }
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .context("failed to send to backend")
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.stream.next().await {
            match message.context("backend read failed")? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Close(frame) => {
                    debug!("Backend closed the socket: {:?}", frame);
                    return Ok(None);
                }
                Message::Binary(data) => debug!("Ignoring {} byte binary message", data.len()),
                // tungstenite queues the pong for a ping on its own
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }
}
