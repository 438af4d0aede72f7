/*! Configuration model.

The hub consumes one YAML document mapping serial port path → device name →
node settings:

```yaml
/dev/ttyUSB0:
  ARDUINO_TEST:
    net: 36097
    config: { HBT: 1, DHT: 50, LIGHT: 1, SWITCH: 1, LCD: 1 }
    lights:
      all_on: [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]
    SWITCH:
      1: [{ ARDUINO_TEST: { LIGHT: [0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0] } }]
    DHT:
      - { ARDUINO_TEST: { LCDPRINT: [0, 0, 0, "Temp:{temperature}"] } }
```

Command specs are dynamically shaped in the file; [`CommandSpec`] is the
tagged form the encoder dispatches on. Mapping order is preserved, so a
`CONFIG` block pushes its options in the order they were written.
*/
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use crate::{Error, Result};

/// Parsed configuration: port path → device name → settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Config(pub HashMap<String, HashMap<String, NodeSettings>>);

impl Config {
    /// Load from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse from a YAML string.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Per-node settings from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    /// Bus id of the node.
    pub net: u16,

    /// Options pushed with `CONFIG`, order preserved.
    #[serde(default)]
    pub config: Option<NodeOptions>,

    /// Named 11-byte light scenes, for nodes with the `LIGHT` option.
    #[serde(default)]
    pub lights: HashMap<String, Vec<u8>>,

    /// Reactions to switch presses, keyed by 1-based slot index.
    #[serde(rename = "SWITCH", default)]
    pub switch: HashMap<u8, TargetList>,

    /// Reactions to temperature/humidity reports.
    #[serde(rename = "DHT", default)]
    pub dht: TargetList,
}

/// The `config:` block: option name → byte value, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions(pub Vec<(String, u8)>);

impl NodeOptions {
    /// Value of a named option.
    pub fn get(&self, name: &str) -> Option<u8> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}

impl<'de> Deserialize<'de> for NodeOptions {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        let m = v
            .as_mapping()
            .ok_or_else(|| serde::de::Error::custom("config block must be a mapping"))?;
        let mut out = Vec::with_capacity(m.len());
        for (k, val) in m {
            let name = k
                .as_str()
                .ok_or_else(|| serde::de::Error::custom("config option names are strings"))?;
            let b = byte_of(val).map_err(serde::de::Error::custom)?;
            out.push((name.to_string(), b));
        }
        Ok(Self(out))
    }
}

/// One configured reaction: destination device and the command to send it.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetCommand {
    /// Symbolic name of the destination node.
    pub target: String,
    /// What to send.
    pub spec: CommandSpec,
}

/// Reaction list: either one `{target: spec}` mapping or a list of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetList(pub Vec<TargetCommand>);

impl<'de> Deserialize<'de> for TargetList {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        targets_of(&v).map(TargetList).map_err(serde::de::Error::custom)
    }
}

fn targets_of(v: &Value) -> Result<Vec<TargetCommand>> {
    let mut out = Vec::new();
    match v {
        Value::Mapping(m) => {
            for (k, spec) in m {
                out.push(TargetCommand {
                    target: string_key(k)?,
                    spec: CommandSpec::from_value(spec)?,
                });
            }
        }
        Value::Sequence(seq) => {
            for entry in seq {
                out.extend(targets_of(entry)?);
            }
        }
        other => {
            return Err(Error::Config(format!(
                "reaction must be a mapping or list, got {other:?}"
            )));
        }
    }
    Ok(out)
}

/// A command to encode, in the shapes the configuration file allows.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandSpec {
    /// Bare opcode name: `"MEM"`.
    Opcode(String),
    /// Opcode with one byte argument: `{SETID: 5}`.
    WithInt(String, u8),
    /// Opcode with a named argument: `{LIGHT: "all_on"}`, resolved as a
    /// scene on lighting nodes.
    WithName(String, String),
    /// Opcode with a list of bytes and strings:
    /// `{LCDPRINT: [0, 0, 0, "hi"]}`.
    WithList(String, Vec<Item>),
    /// Opcode with nested sub-commands, one packet each, order kept:
    /// `{CONFIG: {HBT: 1, DHT: 50}}`.
    WithMap(String, Vec<(String, u8)>),
    /// Several specs, expanded in order.
    Sequence(Vec<CommandSpec>),
}

/// One element of a list-shaped command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// A single byte.
    Byte(u8),
    /// UTF-8 text, byte-concatenated into the payload.
    Text(String),
}

impl CommandSpec {
    /// Build from a parsed YAML value.
    pub fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::String(s) => Ok(Self::Opcode(s.clone())),
            Value::Sequence(seq) => Ok(Self::Sequence(
                seq.iter().map(Self::from_value).collect::<Result<_>>()?,
            )),
            Value::Mapping(m) => {
                let mut parts = Vec::with_capacity(m.len());
                for (k, val) in m {
                    let name = string_key(k)?;
                    parts.push(match val {
                        Value::Number(_) => Self::WithInt(name, byte_of(val)?),
                        Value::String(s) => Self::WithName(name, s.clone()),
                        Value::Sequence(items) => Self::WithList(
                            name,
                            items.iter().map(item_of).collect::<Result<_>>()?,
                        ),
                        Value::Mapping(sub) => {
                            let mut pairs = Vec::with_capacity(sub.len());
                            for (sk, sv) in sub {
                                pairs.push((string_key(sk)?, byte_of(sv)?));
                            }
                            Self::WithMap(name, pairs)
                        }
                        other => {
                            return Err(Error::Config(format!(
                                "unsupported argument for {name}: {other:?}"
                            )));
                        }
                    });
                }
                if parts.len() == 1 {
                    Ok(parts.pop().expect("len checked"))
                } else {
                    Ok(Self::Sequence(parts))
                }
            }
            other => Err(Error::Config(format!("unsupported command spec: {other:?}"))),
        }
    }

    /// Parse a spec from YAML text, for ad-hoc commands.
    pub fn parse(text: &str) -> Result<Self> {
        let v: Value = serde_yaml::from_str(text)?;
        Self::from_value(&v)
    }
}

fn string_key(k: &Value) -> Result<String> {
    k.as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("expected a string key, got {k:?}")))
}

fn byte_of(v: &Value) -> Result<u8> {
    v.as_u64()
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| Error::Config(format!("expected a byte value, got {v:?}")))
}

fn item_of(v: &Value) -> Result<Item> {
    match v {
        Value::Number(_) => Ok(Item::Byte(byte_of(v)?)),
        Value::String(s) => Ok(Item::Text(s.clone())),
        other => Err(Error::Config(format!(
            "list items must be bytes or strings, got {other:?}"
        ))),
    }
}
