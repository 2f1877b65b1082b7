//! GATT Bridge Simulator
//!
//! Plays the BLE peripheral daemon: subscribes to status notifications,
//! writes the three credential characteristics the way a phone app would,
//! then prints every status the gateway reports. Useful for bench testing
//! the provisioning flow without a BLE adapter.
//!
//! Usage: cargo run --bin gatt-sim [bridge_addr] [ssid] [passphrase] [token]

use std::env;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

const PROTOCOL_VERSION: u8 = 0x01;

const WRITE: u8 = 0x00;
const SUBSCRIBE: u8 = 0x01;
const UNSUBSCRIBE: u8 = 0x02;
const NOTIFY: u8 = 0x03;
const ACK: u8 = 0x04;
const READ: u8 = 0x05;
const READ_RESP: u8 = 0x06;

const WIFI_SSID: u8 = 0x01;
const WIFI_PASSWORD: u8 = 0x02;
const HOMEBASE_ID: u8 = 0x04;
const USER_TOKEN: u8 = 0x05;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let bridge: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7070".to_string())
        .parse()?;
    let ssid = args.next().unwrap_or_else(|| "HomeNet".to_string());
    let passphrase = args.next().unwrap_or_else(|| "hunter22".to_string());
    let token = args.next().unwrap_or_else(|| "sim-user-token".to_string());

    println!("📶 HomeBase GATT Bridge Simulator");
    println!("  Bridge: {}", bridge);
    println!("  SSID: {}", ssid);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut next_token: u16 = 0;
    let mut frame_token = || {
        next_token = next_token.wrapping_add(1);
        next_token
    };

    socket
        .send_to(&build_frame(frame_token(), READ, &[HOMEBASE_ID]), bridge)
        .await?;
    println!("🔎 Reading homebase id");
    socket
        .send_to(&build_frame(frame_token(), SUBSCRIBE, &[]), bridge)
        .await?;
    println!("🔔 Subscribed to status");

    let writes = [
        ("SSID", WIFI_SSID, ssid.as_bytes()),
        ("passphrase", WIFI_PASSWORD, passphrase.as_bytes()),
        ("user token", USER_TOKEN, token.as_bytes()),
    ];
    for (desc, characteristic, value) in writes {
        sleep(Duration::from_millis(500)).await;
        let mut body = vec![characteristic];
        body.extend_from_slice(value);
        socket
            .send_to(&build_frame(frame_token(), WRITE, &body), bridge)
            .await?;
        println!("✏️  Wrote {} ({} bytes)", desc, value.len());
    }
    println!();

    let mut buf = [0u8; 512];
    loop {
        let (len, _) = match timeout(Duration::from_secs(60), socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                println!("⏰ No terminal status within 60s");
                break;
            }
        };
        let datagram = &buf[..len];
        if len < 4 || datagram[0] != PROTOCOL_VERSION {
            println!("⚠️  Unexpected datagram: {}", hex::encode(datagram));
            continue;
        }

        let token = u16::from_be_bytes([datagram[1], datagram[2]]);
        match datagram[3] {
            ACK => println!("   ✅ ACK #{}", token),
            READ_RESP if len > 4 && datagram[4] == HOMEBASE_ID => {
                println!("   🏠 Homebase id: {}", String::from_utf8_lossy(&datagram[5..]))
            }
            NOTIFY if len > 4 => {
                let status = datagram[4];
                println!("   📣 Status 0x{:02x} ({})", status, describe(status));
                if status >= 0x03 {
                    break;
                }
            }
            other => println!("   ⚠️  Unhandled frame kind 0x{:02x}", other),
        }
    }

    socket
        .send_to(&build_frame(frame_token(), UNSUBSCRIBE, &[]), bridge)
        .await?;
    println!();
    println!("✨ Simulation complete!");
    Ok(())
}

fn build_frame(token: u16, kind: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&token.to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(body);
    frame
}

fn describe(status: u8) -> &'static str {
    match status {
        0x00 => "idle",
        0x01 => "joining network",
        0x02 => "network joined",
        0x03 => "claim succeeded",
        0x04 => "network failed",
        0x05 => "claim failed",
        _ => "unknown",
    }
}
