//! End-to-end scenarios over in-memory ports.
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use domobus::bus::{Outbound, Port};
use domobus::config::{CommandSpec, Config};
use domobus::hub::Hub;
use domobus::packet::{Frame, MAX_PACKET_SIZE, PACKET_HEADER};
use domobus::registry::Registry;

const CONFIG: &str = r#"
sim:
  ARDUINO_TEST:
    net: 36097
    config: { LIGHT: 1, SWITCH: 1, DHT: 5 }
    lights:
      one: [0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0]
    SWITCH:
      1: [{ ARDUINO_TEST: { LIGHT: [0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0] } }]
    DHT:
      - { ARDUINO_TEST: { LCDPRINT: [0, 0, 0, "Temp:{temperature}"] } }
      - { ARDUINO_TEST: { LCDPRINT: [0, 1, 0, "Hum:{humidity}"] } }
  SILENT:
    net: 10
"#;

fn hub_with(config: &str) -> (Arc<Hub>, DuplexStream) {
    let config = Config::parse(config).unwrap();
    let registry = Arc::new(Registry::new(&config).unwrap());
    let hub = Arc::new(Hub::new(registry));
    let (near, far) = tokio::io::duplex(4096);
    let (rd, wr) = tokio::io::split(near);
    hub.attach("sim", Box::new(rd), Box::new(wr));
    (hub, far)
}

/// Read one frame the hub wrote: (source, dest, 13-byte payload).
async fn read_frame(far: &mut DuplexStream) -> (u16, u16, Vec<u8>) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[..2], &PACKET_HEADER);
    (
        u16::from_le_bytes([buf[2], buf[3]]),
        u16::from_le_bytes([buf[4], buf[5]]),
        buf[6..19].to_vec(),
    )
}

async fn send_to_hub(far: &mut DuplexStream, source: u16, payload: &[u8]) {
    let frame = Frame {
        source,
        dest: 1,
        data: payload.to_vec(),
    };
    far.write_all(&frame.serialize().unwrap()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn switch_press_turns_on_light() {
    let (hub, mut far) = hub_with(CONFIG);
    send_to_hub(&mut far, 36097, &[0xa3, 1, 0, 0, 0, 0, 0]).await;

    // The hub ACKs the report first.
    let (source, dest, payload) = read_frame(&mut far).await;
    assert_eq!((source, dest), (1, 36097));
    assert_eq!(payload[0], 0x7e);

    // Then the configured reaction goes out.
    let (_, dest, payload) = read_frame(&mut far).await;
    assert_eq!(dest, 36097);
    assert_eq!(&payload[..12], &[0xa4, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0]);

    // The node confirms with its light state; the reply refreshes the
    // cache.
    send_to_hub(&mut far, 36097, &[0xa4, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = hub.query("ARDUINO_TEST").unwrap();
    assert_eq!(state.lights, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn dht_report_prints_on_lcd() {
    let (_hub, mut far) = hub_with(CONFIG);
    send_to_hub(&mut far, 36097, &[0xa0, 0, 0, 0, 0]).await;

    let (_, dest, payload) = read_frame(&mut far).await;
    assert_eq!(dest, 36097);
    assert_eq!(payload[0], 0x7e);

    let (_, _, payload) = read_frame(&mut far).await;
    let mut want = vec![0x92, 0, 0, 0];
    want.extend_from_slice(b"Temp:0.0");
    assert_eq!(&payload[..want.len()], &want[..]);

    // Acknowledge so the driver moves on to the second print.
    send_to_hub(&mut far, 36097, &[0x7e]).await;
    let (_, _, payload) = read_frame(&mut far).await;
    let mut want = vec![0x92, 0, 1, 0];
    want.extend_from_slice(b"Hum:0.0");
    assert_eq!(&payload[..want.len()], &want[..]);
}

#[tokio::test(start_paused = true)]
async fn retry_then_timeout() {
    let (hub, mut far) = hub_with(CONFIG);
    hub.send("SILENT", &CommandSpec::parse("MEM").unwrap()).unwrap();

    let start = tokio::time::Instant::now();
    let mut frames = Vec::new();
    let mut at = Vec::new();
    for _ in 0..3 {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        far.read_exact(&mut buf).await.unwrap();
        frames.push(buf.to_vec());
        at.push(start.elapsed());
    }
    // Three identical writes, spaced at least a second apart.
    assert_eq!(frames[0], frames[1]);
    assert_eq!(frames[1], frames[2]);
    assert!(at[1] - at[0] >= Duration::from_secs(1));
    assert!(at[2] - at[1] >= Duration::from_secs(1));

    // After the retries the packet is gone; nothing else is written.
    let mut byte = [0u8; 1];
    let extra = tokio::time::timeout(Duration::from_secs(30), far.read_exact(&mut byte)).await;
    assert!(extra.is_err());
}

#[tokio::test(start_paused = true)]
async fn broadcast_is_not_awaited() {
    let config = Config::parse(CONFIG).unwrap();
    let registry = Arc::new(Registry::new(&config).unwrap());
    let (near, mut far) = tokio::io::duplex(4096);
    let (rd, wr) = tokio::io::split(near);
    let (router_tx, _router_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let port = Port::spawn(
        "sim",
        Box::new(rd),
        Box::new(wr),
        registry,
        router_tx,
        shutdown_rx,
    );

    port.send(Outbound::new(Frame::new(255, vec![0x84]))).unwrap();
    port.send(Outbound::new(Frame::new(255, vec![0x83]))).unwrap();

    let (_, dest, _) = read_frame(&mut far).await;
    assert_eq!(dest, 255);
    let first = tokio::time::Instant::now();
    let (_, dest, payload) = read_frame(&mut far).await;
    assert_eq!(dest, 255);
    assert_eq!(payload[0], 0x83);
    // No reply wait in between: the second write follows immediately.
    assert!(first.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn scan_walks_every_node() {
    let (hub, mut far) = hub_with(CONFIG);
    hub.scan().unwrap();

    // Nodes are probed in id order; answer each so the queue advances.
    let (_, dest, payload) = read_frame(&mut far).await;
    assert_eq!(dest, 10);
    assert_eq!(payload[0], 0x90);
    send_to_hub(&mut far, 10, &[0x7e]).await;

    let (_, dest, payload) = read_frame(&mut far).await;
    assert_eq!(dest, 36097);
    assert_eq!(payload[0], 0x90);
}
