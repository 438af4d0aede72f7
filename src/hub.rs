/*! Hub orchestrator.

Owns the node registry and one [`Port`] engine per serial port, and exposes
the public operations: send a command to a device by name or id, probe
every node, push configuration blocks, read cached state, and borrow a port
for firmware programming.

Reaction frames produced by any port's inbound handler funnel through a
single router task here, which looks up the destination node's bus and
queues the frame on the right port, which may differ from the one it arrived on.
*/
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_serial::SerialPortBuilderExt;

use crate::bus::{ExclusiveSession, Outbound, Port, SerialReader, SerialWriter};
use crate::config::{CommandSpec, Item};
use crate::message::{Event, prepare_commands};
use crate::packet::{BROADCAST_ID, Frame};
use crate::registry::{Node, NodeState, Registry};
use crate::{Error, Result};

/// Bus line speed.
pub const BAUD_RATE: u32 = 38400;

/// The hub process: registry plus one engine per port.
pub struct Hub {
    registry: Arc<Registry>,
    ports: Arc<Mutex<HashMap<String, Arc<Port>>>>,
    router_tx: mpsc::UnboundedSender<Frame>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Hub {
    /// Create a hub with no ports attached yet.
    pub fn new(registry: Arc<Registry>) -> Self {
        let ports = Arc::new(Mutex::new(HashMap::new()));
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(route_task(
            router_rx,
            Arc::clone(&registry),
            Arc::clone(&ports),
        ));
        Self {
            registry,
            ports,
            router_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Open every configured serial port and start its engine.
    pub fn open(registry: Arc<Registry>) -> Result<Self> {
        Self::open_filtered(registry, None)
    }

    /// Like [`Hub::open`], restricted to the named ports.
    pub fn open_filtered(registry: Arc<Registry>, only: Option<&[String]>) -> Result<Self> {
        let hub = Self::new(Arc::clone(&registry));
        for bus in registry.buses() {
            if let Some(filter) = only {
                if !filter.iter().any(|f| f == bus) {
                    continue;
                }
            }
            let stream = tokio_serial::new(bus, BAUD_RATE).open_native_async()?;
            let (rd, wr) = tokio::io::split(stream);
            hub.attach(
                bus,
                Box::new(tokio::io::BufReader::new(rd)),
                Box::new(wr),
            );
        }
        Ok(hub)
    }

    /// Attach an already-open port. Tests drive this with in-memory pipes.
    pub fn attach(&self, name: &str, rd: SerialReader, wr: SerialWriter) {
        let port = Port::spawn(
            name,
            rd,
            wr,
            Arc::clone(&self.registry),
            self.router_tx.clone(),
            self.shutdown_rx.clone(),
        );
        self.ports
            .lock()
            .expect("ports lock")
            .insert(name.to_string(), Arc::new(port));
        info!("Reader/Writer created on port {name}");
    }

    /// The node registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Look a device up by symbolic name or numeric bus id.
    pub fn resolve(&self, device: &str) -> Result<Arc<Node>> {
        if let Some(n) = self.registry.by_name(device) {
            return Ok(n);
        }
        if let Ok(id) = device.parse::<u16>() {
            return self.registry.by_id(id).ok_or(Error::UnknownNode(id));
        }
        Err(Error::UnknownDevice(device.to_string()))
    }

    fn port_of(&self, node: &Node) -> Result<Arc<Port>> {
        self.ports
            .lock()
            .expect("ports lock")
            .get(&node.bus)
            .cloned()
            .ok_or_else(|| Error::UnknownPort(node.bus.clone()))
    }

    /// Encode a command spec and queue it for a device.
    pub fn send(&self, device: &str, spec: &CommandSpec) -> Result<()> {
        let node = self.resolve(device)?;
        self.send_node(&node, spec)
    }

    /// Encode a command spec and queue it for an already-resolved node.
    pub fn send_node(&self, node: &Arc<Node>, spec: &CommandSpec) -> Result<()> {
        let port = self.port_of(node)?;
        for frame in prepare_commands(node, spec, &[]) {
            port.send(Outbound::new(frame))?;
        }
        Ok(())
    }

    /// Send one command and wait for the correlated reply.
    ///
    /// Resolves once the outbound driver has either matched a reply or
    /// exhausted its retries.
    pub async fn request(&self, device: &str, spec: &CommandSpec) -> Result<Event> {
        let node = self.resolve(device)?;
        let port = self.port_of(&node)?;
        let mut frames = prepare_commands(&node, spec, &[]);
        let Some(last) = frames.pop() else {
            return Err(Error::UnknownCommand(format!("{spec:?}")));
        };
        for frame in frames {
            port.send(Outbound::new(frame))?;
        }
        let (tx, rx) = oneshot::channel();
        port.send(Outbound {
            frame: last,
            reply: Some(tx),
        })?;
        rx.await.map_err(|_| Error::ReplyTimeout(node.id))
    }

    /// Queue a `MEM` probe to every configured node.
    pub fn scan(&self) -> Result<()> {
        for node in self.registry.nodes() {
            self.send_node(&node, &CommandSpec::Opcode("MEM".to_string()))?;
        }
        Ok(())
    }

    /// Push each node's `config` block as nested `CONFIG` writes.
    pub fn push_config(&self) -> Result<()> {
        for node in self.registry.nodes() {
            if let Some(options) = &node.options {
                let spec = CommandSpec::WithMap("CONFIG".to_string(), options.0.clone());
                self.send_node(&node, &spec)?;
            }
        }
        Ok(())
    }

    /// Assign a new bus id to a device.
    pub fn set_id(&self, device: &str, new_id: u16) -> Result<()> {
        let bytes = new_id.to_le_bytes();
        let spec = CommandSpec::WithList(
            "SETID".to_string(),
            vec![Item::Byte(bytes[0]), Item::Byte(bytes[1])],
        );
        self.send(device, &spec)
    }

    /// Last known cached state of a device.
    pub fn query(&self, device: &str) -> Result<NodeState> {
        Ok(self.resolve(device)?.state())
    }

    /// Borrow a port for an exclusive programming session.
    pub async fn exclusive(&self, bus: &str) -> Result<ExclusiveSession> {
        let port = self
            .ports
            .lock()
            .expect("ports lock")
            .get(bus)
            .cloned()
            .ok_or_else(|| Error::UnknownPort(bus.to_string()))?;
        port.exclusive().await
    }

    /// Run until interrupted, then shut down.
    pub async fn run(&self) {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        self.shutdown().await;
    }

    /// Stop the engines: outbound queues drain without reply waits,
    /// readers stop at the next frame boundary.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        for port in self.ports.lock().expect("ports lock").values() {
            port.abort();
        }
    }
}

async fn route_task(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    registry: Arc<Registry>,
    ports: Arc<Mutex<HashMap<String, Arc<Port>>>>,
) {
    while let Some(frame) = rx.recv().await {
        if frame.dest == BROADCAST_ID {
            for port in ports.lock().expect("ports lock").values() {
                let _ = port.send(Outbound::new(frame.clone()));
            }
            continue;
        }
        let Some(node) = registry.by_id(frame.dest) else {
            error!("route: no node {} configured", frame.dest);
            continue;
        };
        let port = ports.lock().expect("ports lock").get(&node.bus).cloned();
        match port {
            Some(p) => {
                let _ = p.send(Outbound::new(frame));
            }
            None => error!("route: port {:?} not attached", node.bus),
        }
    }
}
