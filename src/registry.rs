/*! Node registry.

Built once at startup from the configuration, then immutable except for the
per-node state caches. Lookups go both ways: symbolic name → node and bus
id → node, and nodes can be enumerated per port for scheduling.

The state cache on each node (last known light pattern, last climate
reading) has a single writer, the typed parser, and is snapshotted for
readers like the HTTP façade.
*/
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{Config, NodeOptions, TargetCommand};
use crate::packet::{BROADCAST_ID, HUB_ID};
use crate::{Error, Result};

/// Number of light outputs in a `LIGHT` state vector.
pub const LIGHT_STATE_LEN: usize = 11;

/// One configured node.
#[derive(Debug)]
pub struct Node {
    /// Unique symbolic name.
    pub name: String,
    /// Bus id.
    pub id: u16,
    /// Serial port this node lives on.
    pub bus: String,
    /// Options for `CONFIG` pushes, if configured.
    pub options: Option<NodeOptions>,
    /// Named light scenes.
    pub lights: HashMap<String, Vec<u8>>,
    /// Switch reactions by 1-based slot.
    pub switch: HashMap<u8, Vec<TargetCommand>>,
    /// DHT reactions.
    pub dht: Vec<TargetCommand>,
    state: Mutex<NodeState>,
}

/// Last known state of a node, as cached by the parser.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    /// Light outputs, 11 bytes for lighting nodes, empty otherwise.
    pub lights: Vec<u8>,
    /// Last reported temperature, degrees.
    pub temperature: Option<f64>,
    /// Last reported relative humidity, percent.
    pub humidity: Option<f64>,
}

impl Node {
    /// Whether the node's config block sets `name` to a non-zero value.
    pub fn has_option(&self, name: &str) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.get(name))
            .is_some_and(|v| v != 0)
    }

    /// The pattern of a named scene.
    pub fn scene(&self, name: &str) -> Option<&Vec<u8>> {
        self.lights.get(name)
    }

    /// Snapshot of the cached state.
    pub fn state(&self) -> NodeState {
        self.state.lock().expect("state lock").clone()
    }

    pub(crate) fn set_lights(&self, lights: Vec<u8>) {
        self.state.lock().expect("state lock").lights = lights;
    }

    pub(crate) fn set_climate(&self, temperature: f64, humidity: f64) {
        let mut s = self.state.lock().expect("state lock");
        s.temperature = Some(temperature);
        s.humidity = Some(humidity);
    }
}

/// All configured nodes, indexed by name and bus id.
#[derive(Debug)]
pub struct Registry {
    by_name: HashMap<String, Arc<Node>>,
    by_id: HashMap<u16, Arc<Node>>,
    buses: Vec<String>,
}

impl Registry {
    /// Build and validate the registry from a parsed configuration.
    ///
    /// Ids must be unique and must avoid the reserved addresses (0, the
    /// hub, broadcast); names must be unique across all ports, so every
    /// node lives on exactly one bus.
    pub fn new(config: &Config) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        let mut buses: Vec<String> = config.0.keys().cloned().collect();
        buses.sort();
        for (bus, nodes) in &config.0 {
            for (name, settings) in nodes {
                if settings.net == 0 || settings.net == HUB_ID || settings.net == BROADCAST_ID {
                    return Err(Error::Config(format!(
                        "node {name}: id {} is reserved",
                        settings.net
                    )));
                }
                let lighting = settings
                    .config
                    .as_ref()
                    .and_then(|o| o.get("LIGHT"))
                    .is_some_and(|v| v != 0);
                let node = Arc::new(Node {
                    name: name.clone(),
                    id: settings.net,
                    bus: bus.clone(),
                    options: settings.config.clone(),
                    lights: settings.lights.clone(),
                    switch: settings
                        .switch
                        .iter()
                        .map(|(slot, list)| (*slot, list.0.clone()))
                        .collect(),
                    dht: settings.dht.0.clone(),
                    state: Mutex::new(NodeState {
                        lights: if lighting { vec![0; LIGHT_STATE_LEN] } else { Vec::new() },
                        ..NodeState::default()
                    }),
                });
                if by_name.insert(name.clone(), Arc::clone(&node)).is_some() {
                    return Err(Error::Config(format!("duplicate node name {name:?}")));
                }
                if let Some(other) = by_id.insert(settings.net, node) {
                    return Err(Error::Config(format!(
                        "nodes {name:?} and {:?} share id {}",
                        other.name, settings.net
                    )));
                }
            }
        }
        Ok(Self {
            by_name,
            by_id,
            buses,
        })
    }

    /// Node by symbolic name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Node>> {
        self.by_name.get(name).cloned()
    }

    /// Node by bus id.
    pub fn by_id(&self, id: u16) -> Option<Arc<Node>> {
        self.by_id.get(&id).cloned()
    }

    /// All nodes, ordered by bus id.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut v: Vec<_> = self.by_id.values().cloned().collect();
        v.sort_by_key(|n| n.id);
        v
    }

    /// Configured port paths, sorted.
    pub fn buses(&self) -> &[String] {
        &self.buses
    }

    /// Nodes on one port, ordered by bus id.
    pub fn nodes_on(&self, bus: &str) -> Vec<Arc<Node>> {
        let mut v: Vec<_> = self
            .by_id
            .values()
            .filter(|n| n.bus == bus)
            .cloned()
            .collect();
        v.sort_by_key(|n| n.id);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let config = Config::parse(
            r#"
simA:
  LIVING: { net: 3 }
  KITCHEN:
    net: 4
    config: { LIGHT: 1 }
simB:
  PORCH: { net: 5 }
"#,
        )
        .unwrap();
        Registry::new(&config).unwrap()
    }

    #[test]
    fn bijection() {
        let r = registry();
        for node in r.nodes() {
            assert_eq!(r.by_name(&node.name).unwrap().id, node.id);
            assert_eq!(r.by_id(node.id).unwrap().name, node.name);
        }
        assert!(r.by_name("NOPE").is_none());
        assert!(r.by_id(99).is_none());
    }

    #[test]
    fn per_bus_enumeration() {
        let r = registry();
        let a: Vec<_> = r.nodes_on("simA").iter().map(|n| n.id).collect();
        assert_eq!(a, vec![3, 4]);
        let b: Vec<_> = r.nodes_on("simB").iter().map(|n| n.id).collect();
        assert_eq!(b, vec![5]);
    }

    #[test]
    fn lighting_state_starts_dark() {
        let r = registry();
        assert_eq!(r.by_name("KITCHEN").unwrap().state().lights, vec![0; 11]);
        assert!(r.by_name("LIVING").unwrap().state().lights.is_empty());
    }

    #[test]
    fn duplicate_id_rejected() {
        let config = Config::parse("p:\n  A: { net: 3 }\n  B: { net: 3 }\n").unwrap();
        assert!(matches!(Registry::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn reserved_ids_rejected() {
        for id in [0, 1, 255] {
            let config = Config::parse(&format!("p:\n  A: {{ net: {id} }}\n")).unwrap();
            assert!(matches!(Registry::new(&config), Err(Error::Config(_))));
        }
    }

    #[test]
    fn duplicate_name_across_ports_rejected() {
        let config = Config::parse("p1:\n  A: { net: 3 }\np2:\n  A: { net: 4 }\n").unwrap();
        assert!(matches!(Registry::new(&config), Err(Error::Config(_))));
    }
}
