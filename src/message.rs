/*! Typed message parser and command encoder.

Inbound: a decoded [`Frame`] becomes an [`Event`]: opcode plus the fields
that opcode carries. Parsing is the single writer of the per-node state
caches: a `LIGHT` frame refreshes the sender's light pattern, a `DHT` frame
its climate reading.

Outbound: a [`CommandSpec`] tree becomes one or more frames. String fields
may carry `{temperature}`-style placeholders that are substituted from an
event before encoding; on lighting nodes a bare string names a scene and is
resolved to its 11-byte pattern.
*/
use chrono::{DateTime, Local};
use log::error;
use std::fmt;

use crate::config::{CommandSpec, Item};
use crate::opcode::Opcode;
use crate::packet::{Frame, MAX_PAYLOAD_SIZE};
use crate::registry::{LIGHT_STATE_LEN, Node, Registry};
use crate::{Error, Result};

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Bus id of the sender.
    pub source: u16,
    /// Message kind.
    pub opcode: Opcode,
    /// When the hub parsed it.
    pub time: DateTime<Local>,
    /// Kind-specific fields.
    pub body: EventBody,
}

/// Fields carried by each message kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// Free memory, bytes.
    Mem(i16),
    /// Firmware version.
    Version(i16),
    /// Light level.
    Lux(i16),
    /// Motion sensor value.
    Pir(i8),
    /// Climate report, already scaled and clamped.
    Dht {
        /// Degrees, clamped at 60.0 from above.
        temperature: f64,
        /// Percent, clamped at 100.0 from above.
        humidity: f64,
    },
    /// Energy meter, two raw floats.
    Ems(f32, f32),
    /// Switch slots, 6 bytes.
    Switch(Vec<u8>),
    /// Light outputs, 11 bytes.
    Light(Vec<u8>),
    /// No payload fields.
    Empty,
}

impl Event {
    /// Placeholder values for template substitution, `{temperature}` etc.
    pub fn format_values(&self) -> Vec<(&'static str, String)> {
        match &self.body {
            EventBody::Dht {
                temperature,
                humidity,
            } => vec![
                ("temperature", fmt_float(*temperature)),
                ("humidity", fmt_float(*humidity)),
            ],
            EventBody::Mem(v) | EventBody::Version(v) | EventBody::Lux(v) => {
                vec![("value", v.to_string())]
            }
            EventBody::Pir(v) => vec![("value", v.to_string())],
            _ => vec![],
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.time.format("%d/%m/%Y %H:%M:%S"),
            self.source,
            self.opcode
        )?;
        match &self.body {
            EventBody::Mem(v) | EventBody::Version(v) | EventBody::Lux(v) => {
                write!(f, " value={v}")
            }
            EventBody::Pir(v) => write!(f, " value={v}"),
            EventBody::Dht {
                temperature,
                humidity,
            } => write!(f, " temperature={temperature} humidity={humidity}"),
            EventBody::Ems(a, b) => write!(f, " value=({a}, {b})"),
            EventBody::Switch(state) | EventBody::Light(state) => {
                write!(f, " state={state:?}")
            }
            EventBody::Empty => Ok(()),
        }
    }
}

// Python-style float text: whole values keep one decimal.
fn fmt_float(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn i16_at(data: &[u8], at: usize, op: u8) -> Result<i16> {
    data.get(at..at + 2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .ok_or(Error::UnknownOpcode(op))
}

fn f32_at(data: &[u8], at: usize, op: u8) -> Result<f32> {
    data.get(at..at + 4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(Error::UnknownOpcode(op))
}

fn slice_at(data: &[u8], at: usize, len: usize, op: u8) -> Result<Vec<u8>> {
    data.get(at..at + len)
        .map(<[u8]>::to_vec)
        .ok_or(Error::UnknownOpcode(op))
}

/// Parse a decoded frame into a typed event, refreshing state caches.
pub fn parse(frame: &Frame, registry: &Registry) -> Result<Event> {
    let op = frame.data.first().copied().unwrap_or_default();
    let opcode = Opcode::from_byte(op)?;
    let data = &frame.data;
    let body = match opcode {
        Opcode::Mem => EventBody::Mem(i16_at(data, 1, op)?),
        Opcode::Version => EventBody::Version(i16_at(data, 1, op)?),
        Opcode::Lux => EventBody::Lux(i16_at(data, 1, op)?),
        Opcode::Pir => EventBody::Pir(
            *data.get(1).ok_or(Error::UnknownOpcode(op))? as i8,
        ),
        Opcode::Dht => {
            let temperature = f64::from(i16_at(data, 1, op)?) / 10.0;
            let humidity = f64::from(i16_at(data, 3, op)?) / 10.0;
            EventBody::Dht {
                temperature: temperature.min(60.0),
                humidity: humidity.min(100.0),
            }
        }
        Opcode::Ems => EventBody::Ems(f32_at(data, 1, op)?, f32_at(data, 5, op)?),
        Opcode::Switch => EventBody::Switch(slice_at(data, 1, 6, op)?),
        Opcode::Light => EventBody::Light(slice_at(data, 1, LIGHT_STATE_LEN, op)?),
        _ => EventBody::Empty,
    };
    match &body {
        EventBody::Light(state) => {
            if let Some(node) = registry.by_id(frame.source) {
                node.set_lights(state.clone());
            }
        }
        EventBody::Dht {
            temperature,
            humidity,
        } => {
            if let Some(node) = registry.by_id(frame.source) {
                node.set_climate(*temperature, *humidity);
            }
        }
        _ => {}
    }
    Ok(Event {
        source: frame.source,
        opcode,
        time: Local::now(),
        body,
    })
}

/// Encode a command spec into frames addressed to `node`.
///
/// `values` are the placeholder substitutions; pass an empty slice when no
/// event context applies. Items that fail to encode (unknown opcode names,
/// payloads over 13 bytes) are logged and dropped without poisoning the
/// rest of the sequence.
pub fn prepare_commands(
    node: &Node,
    spec: &CommandSpec,
    values: &[(&'static str, String)],
) -> Vec<Frame> {
    let mut frames = Vec::new();
    encode_into(node, spec, values, &mut frames);
    frames
}

fn encode_into(node: &Node, spec: &CommandSpec, values: &[(&'static str, String)], out: &mut Vec<Frame>) {
    match spec {
        CommandSpec::Sequence(list) => {
            for s in list {
                encode_into(node, s, values, out);
            }
        }
        CommandSpec::Opcode(name) => match Opcode::from_name(name) {
            Ok(op) => push_payload(node, vec![op as u8], out),
            Err(e) => error!("PREPARE: {e}"),
        },
        CommandSpec::WithInt(name, v) => match Opcode::from_name(name) {
            Ok(op) => push_payload(node, vec![op as u8, *v], out),
            Err(e) => error!("PREPARE: {e}"),
        },
        CommandSpec::WithName(name, arg) => match Opcode::from_name(name) {
            Ok(op) => {
                if node.has_option("LIGHT") {
                    // Scene reference; unknown scenes turn everything off.
                    let pattern = node
                        .scene(arg)
                        .cloned()
                        .unwrap_or_else(|| vec![0; LIGHT_STATE_LEN]);
                    let mut payload = vec![op as u8];
                    payload.extend_from_slice(&pattern);
                    push_payload(node, payload, out);
                } else {
                    let arg = substitute(arg, values);
                    match arg.parse::<u8>() {
                        Ok(b) => push_payload(node, vec![op as u8, b], out),
                        Err(_) => error!(
                            "PREPARE: string argument {arg:?} for {name} on non-lighting node {}",
                            node.name
                        ),
                    }
                }
            }
            Err(e) => error!("PREPARE: {e}"),
        },
        CommandSpec::WithList(name, items) => match Opcode::from_name(name) {
            Ok(op) => {
                let mut payload = vec![op as u8];
                for item in items {
                    match item {
                        Item::Byte(b) => payload.push(*b),
                        Item::Text(t) => {
                            payload.extend_from_slice(substitute(t, values).as_bytes())
                        }
                    }
                }
                push_payload(node, payload, out);
            }
            Err(e) => error!("PREPARE: {e}"),
        },
        CommandSpec::WithMap(name, pairs) => match Opcode::from_name(name) {
            Ok(op) => {
                for (sub, v) in pairs {
                    match Opcode::from_name(sub) {
                        Ok(sub_op) => {
                            push_payload(node, vec![op as u8, sub_op as u8, *v], out)
                        }
                        Err(e) => error!("PREPARE: {e}"),
                    }
                }
            }
            Err(e) => error!("PREPARE: {e}"),
        },
    }
}

fn push_payload(node: &Node, payload: Vec<u8>, out: &mut Vec<Frame>) {
    if payload.len() > MAX_PAYLOAD_SIZE {
        error!(
            "{}",
            Error::PayloadTooLarge(payload.len())
        );
        return;
    }
    out.push(Frame::new(node.id, payload));
}

fn substitute(text: &str, values: &[(&'static str, String)]) -> String {
    let mut out = text.to_string();
    for (k, v) in values {
        out = out.replace(&format!("{{{k}}}"), v);
    }
    out
}
