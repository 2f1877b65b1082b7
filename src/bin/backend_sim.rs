//! Backend Simulator
//!
//! Accepts one relay connection from the gateway, prints its `register`
//! message, then pushes a short script of commands and prints each reply.
//! Point `[backend] url` at `ws://<bind_addr>/relay` to use it.
//!
//! Usage: cargo run --bin backend-sim [bind_addr] [lan_name]

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use std::env;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let bind = args.next().unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let lan_name = args
        .next()
        .unwrap_or_else(|| "esp32-sim.local".to_string());

    println!("☁️  HomeBase Backend Simulator");
    println!("  Listening: ws://{}/relay", bind);
    println!("  Peripheral: {}", lan_name);
    println!();

    let listener = TcpListener::bind(&bind).await?;
    let (tcp, peer) = listener.accept().await?;
    let mut ws = tokio_tungstenite::accept_async(tcp).await?;
    println!("🔌 Gateway connected from {}", peer);

    match next_text(&mut ws).await {
        Some(text) => println!("📥 {}", text),
        None => anyhow::bail!("gateway closed before registering"),
    }
    println!();

    let script = vec![
        ("Ping gateway", json!({"type": "pingPi", "msgId": "sim-1"})),
        (
            "Ping peripheral",
            json!({"type": "pingEsp", "lanName": lan_name, "msgId": "sim-2"}),
        ),
        (
            "Zone 1 on",
            json!({"type": "sprinklerCmd", "lanName": lan_name, "zone": 1, "on": true, "key": "123456", "msgId": "sim-3"}),
        ),
        (
            "Zone 1 off",
            json!({"type": "sprinklerCmd", "lanName": lan_name, "zone": 1, "on": false, "key": "123456", "msgId": "sim-4"}),
        ),
        ("Malformed command (no reply expected)", json!({"type": "sprinklerCmd"})),
        ("Ping gateway", json!({"type": "pingPi", "msgId": {"seq": 5}})),
    ];

    for (desc, command) in script {
        println!("📡 Sending: {}", desc);
        ws.send(Message::Text(command.to_string())).await?;

        match timeout(Duration::from_secs(5), next_text(&mut ws)).await {
            Ok(Some(reply)) => println!("   ✅ {}", reply),
            Ok(None) => {
                println!("   ❌ Gateway disconnected");
                return Ok(());
            }
            Err(_) => println!("   ⏰ No reply"),
        }
        println!();

        sleep(Duration::from_secs(1)).await;
    }

    ws.close(None).await?;
    println!("✨ Simulation complete!");
    Ok(())
}

async fn next_text<S>(ws: &mut S) -> Option<String>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}
