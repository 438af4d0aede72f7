#![warn(missing_docs)]
/*! Hub for a small RS-485 field bus.

A single master process (the hub, bus id 1) talks to many microcontroller
nodes (sensors, switches, lighting drivers, LCD panels) over one or more
half-duplex serial links. The hub owns the bus: it frames fixed-size binary
packets, addresses nodes by 16-bit id, enforces request/reply semantics with
retries and timeouts, interprets typed payloads into events, and reacts to
events with configured command sequences (a switch press on one node turning
on a light on another).

# Architecture overview

Bytes move through the layers like this:

```text
      serial port
           ↓
  [ packet: deframe + CRC ]
           ↓
  [ bus: correlate with a pending request, or hand over as event ]
           ↓
  [ message: typed parse ]
           ↓
  [ reaction: configured event → command fan-out ]
           ↓
  [ message: command encode ] → [ packet: frame ] → serial port
```

Each serial port gets three cooperative tasks (reader, inbound handler,
outbound driver), driven by [`hub::Hub`]. The same port can be borrowed for
an exclusive [`stk500`] programming session to reflash a node in the field.

# Example

```no_run
use std::sync::Arc;
use domobus::config::Config;
use domobus::registry::Registry;
use domobus::hub::Hub;

# async fn run() -> anyhow::Result<()> {
let config = Config::load("hub.yaml")?;
let registry = Arc::new(Registry::new(&config)?);
let hub = Hub::open(registry)?;
hub.scan()?;
hub.run().await;
# Ok(())
# }
```
*/

pub mod bus;
pub mod config;
pub mod http;
pub mod hub;
pub mod message;
pub mod opcode;
pub mod packet;
pub mod reaction;
pub mod registry;
pub mod shell;
pub mod stk500;

/// Hub error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame body was not the expected 19 bytes.
    #[error("message incomplete: {0} bytes")]
    BadLength(usize),

    /// CRC-16/Modbus mismatch.
    #[error("CRC error: want {want:#06x}, got {got:#06x}")]
    BadCrc {
        /// CRC computed over the received bytes.
        want: u16,
        /// CRC carried by the frame.
        got: u16,
    },

    /// Frame addressed to somebody other than the hub.
    #[error("destination error: frame for {0}, not the hub")]
    WrongDestination(u16),

    /// First payload byte is not in the opcode table.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// A command spec named an opcode that does not exist.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// A bus id with no configured node behind it.
    #[error("unknown node {0}")]
    UnknownNode(u16),

    /// A symbolic device name with no configured node behind it.
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    /// Encoded command exceeds the 13-byte payload.
    #[error("payload of {0} bytes exceeds the maximum of 13")]
    PayloadTooLarge(usize),

    /// All send attempts for a packet timed out.
    #[error("no reply from node {0}, retries exhausted")]
    ReplyTimeout(u16),

    /// STK500 target never got in sync.
    #[error("not in sync")]
    OutOfSync,

    /// STK500 verify found a page that differs from the hex file.
    #[error("page {0} differs from hex file")]
    Verify(u16),

    /// Malformed Intel HEX input.
    #[error("bad hex file: {0}")]
    BadHex(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A frame was routed to a port that is not attached.
    #[error("port {0:?} is not attached")]
    UnknownPort(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration file did not parse.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use config::{CommandSpec, Config};
pub use hub::Hub;
pub use packet::Frame;
pub use registry::Registry;
