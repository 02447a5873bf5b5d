//! Uplink Stream Simulator
//!
//! Serves a WebSocket uplink feed the way the network server does, so the
//! monitor can be exercised without live gateways. Every client receives the
//! same scripted mix of frames in a loop.
//!
//! Usage: cargo run --bin stream-sim [bind_addr] [interval_ms]

use futures::SinkExt;
use std::env;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Device the telemetry frames are reported for
const DEV_EUI: &str = "eb-9b-d6-ac-12-b6-1e-ed";
/// Some other device on the same feed
const OTHER_DEV_EUI: &str = "70-b3-d5-7e-d0-05-a1-11";

/// Router ids, the last two beyond 2^53
const ROUTERS: [&str; 3] = ["6403564294417357", "9007199254740993", "18446744073709551557"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bind: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7002".to_string())
        .parse()?;
    let interval_ms: u64 = env::args()
        .nth(2)
        .map(|s| s.parse::<u64>())
        .transpose()?
        .unwrap_or(1000);

    println!("📡 Uplink Stream Simulator");
    println!("  Listening: ws://{}/", bind);
    println!("  Device: {}", DEV_EUI);
    println!("  Interval: {} ms", interval_ms);
    println!();

    let listener = TcpListener::bind(bind).await?;
    loop {
        let (tcp, peer) = listener.accept().await?;
        println!("🔌 Client connected: {}", peer);
        tokio::spawn(async move {
            match serve(tcp, Duration::from_millis(interval_ms)).await {
                Ok(()) => println!("   {} done", peer),
                Err(e) => println!("   {} disconnected: {}", peer, e),
            }
        });
    }
}

async fn serve(tcp: TcpStream, interval: Duration) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(tcp).await?;
    let mut round: u32 = 0;

    loop {
        for (desc, frame) in scenario(round) {
            println!("   → {}", desc);
            ws.send(Message::Text(frame)).await?;
            sleep(interval).await;
        }
        round = round.wrapping_add(1);
    }
}

/// One round of frames; RSSI drifts between rounds so deltas are non-zero
fn scenario(round: u32) -> Vec<(&'static str, String)> {
    let drift = (round % 7) as i32 - 3;
    let fcnt = 100 + round;

    vec![
        (
            "Telemetry, 3 routers, prefixed",
            format!("Received: {}", telemetry(DEV_EUI, drift, fcnt, None)),
        ),
        (
            "Telemetry with FRMPayload (unconfirmed)",
            telemetry(DEV_EUI, -drift, fcnt + 1, Some("a1b2c3d4")),
        ),
        (
            "Telemetry from another device",
            telemetry(OTHER_DEV_EUI, drift, fcnt, None),
        ),
        (
            "Payload-only frame",
            format!(r#"{{"DevEui":"{}","FRMPayload":"0102"}}"#, DEV_EUI),
        ),
        ("Status frame (ignored)", r#"{"stat":{"rxnb":47}}"#.to_string()),
        ("Malformed frame", "Received: {\"upinfo\": [".to_string()),
    ]
}

fn telemetry(dev_eui: &str, drift: i32, fcnt: u32, payload: Option<&str>) -> String {
    let upinfo: Vec<String> = ROUTERS
        .iter()
        .enumerate()
        .map(|(i, rid)| {
            let rssi = -70 - 12 * i as i32 + drift;
            let snr = 9.5 - 3.25 * i as f64 + f64::from(drift) / 2.0;
            // Router ids are written as bare JSON integers
            format!(r#"{{"routerid":{},"rssi":{},"snr":{}}}"#, rid, rssi, snr)
        })
        .collect();

    let mut frame = format!(
        r#"{{"DevEui":"{}","DevAddr":"260B1234","FCntUp":"{}","dClass":"A","upinfo":[{}]"#,
        dev_eui,
        fcnt,
        upinfo.join(",")
    );
    if let Some(payload) = payload {
        frame.push_str(&format!(r#","FRMPayload":"{}","confirm":false"#, payload));
    }
    frame.push('}');
    frame
}
