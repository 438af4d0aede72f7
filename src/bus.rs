/*! Per-port bus engine.

Each serial port runs three cooperative tasks:

* **Reader** scans the byte stream for the frame header, decodes frame
  bodies, and dispatches each frame: if it matches the port's pending
  request it goes to the reply channel, otherwise it is an unsolicited
  event for the inbound handler.
* **Inbound handler** parses unsolicited frames, immediately ACKs the
  sender, and hands the derived reaction frames to the hub's router.
* **Outbound driver** writes queued requests one at a time, records the
  pending context, and waits for the correlated reply with a timeout,
  retrying up to [`SEND_RETRY`] attempts. Broadcasts are written once and
  never awaited.

The port can be borrowed whole for an [`ExclusiveSession`] (firmware
programming): the session takes the read half from the reader task at a
frame boundary and holds the write lock, so normal traffic is suspended
until the session drops.
*/
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::message::{self, Event};
use crate::opcode::Opcode;
use crate::packet::{BROADCAST_ID, FRAME_BODY_SIZE, Frame, PACKET_HEADER};
use crate::reaction;
use crate::registry::Registry;
use crate::{Error, Result};

/// How long to wait for the reply to one write.
pub const PACKET_TIMEOUT: Duration = Duration::from_secs(1);

/// Total attempts per packet before it is dropped.
pub const SEND_RETRY: usize = 3;

/// Pause between retries.
pub const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Grace period after startup before the first outbound write, so the
/// nodes behind the port can finish booting.
pub const BOOT_PAUSE: Duration = Duration::from_secs(4);

/// Boxed read half of a port.
pub type SerialReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a port.
pub type SerialWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One queued outbound request.
pub struct Outbound {
    /// The frame to write.
    pub frame: Frame,
    /// Resolved with the parsed reply, when the caller wants it.
    pub reply: Option<oneshot::Sender<Event>>,
}

impl Outbound {
    /// Fire-and-forget request.
    pub fn new(frame: Frame) -> Self {
        Self { frame, reply: None }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Pending {
    dest: u16,
    source: u16,
}

enum ReaderCtl {
    /// Hand the read half to an exclusive session; it comes back on the
    /// second channel when the session ends.
    Lend {
        give: oneshot::Sender<SerialReader>,
        back: oneshot::Receiver<SerialReader>,
    },
}

/// One attached serial port and its task set.
pub struct Port {
    name: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: Arc<AsyncMutex<SerialWriter>>,
    reader_ctl: mpsc::Sender<ReaderCtl>,
    tasks: Vec<JoinHandle<()>>,
}

impl Port {
    /// Spawn the task set for one port.
    ///
    /// Reaction frames derived from inbound events are pushed onto
    /// `router`; the hub routes them to the right port, which may be a
    /// different one than they arrived on.
    pub fn spawn(
        name: &str,
        rd: SerialReader,
        wr: SerialWriter,
        registry: Arc<Registry>,
        router: mpsc::UnboundedSender<Frame>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(None));
        let writer = Arc::new(AsyncMutex::new(wr));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (reply_tx, reply_rx) = mpsc::channel(32);
        let (ctl_tx, ctl_rx) = mpsc::channel(1);
        let tasks = vec![
            tokio::spawn(reader_task(
                name.to_string(),
                rd,
                Arc::clone(&pending),
                reply_tx,
                inbound_tx,
                ctl_rx,
            )),
            tokio::spawn(inbound_task(
                name.to_string(),
                inbound_rx,
                Arc::clone(&registry),
                Arc::clone(&writer),
                router,
            )),
            tokio::spawn(outbound_task(
                name.to_string(),
                outbound_rx,
                Arc::clone(&writer),
                pending,
                reply_rx,
                registry,
                shutdown,
            )),
        ];
        Self {
            name: name.to_string(),
            outbound: outbound_tx,
            writer,
            reader_ctl: ctl_tx,
            tasks,
        }
    }

    /// Port name (the serial device path).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue one outbound request.
    pub fn send(&self, out: Outbound) -> Result<()> {
        self.outbound
            .send(out)
            .map_err(|_| Error::UnknownPort(self.name.clone()))
    }

    /// Suspend normal traffic and take the port for exclusive use.
    ///
    /// Waits for the write lock and for the reader to reach a frame
    /// boundary. Traffic resumes when the session is dropped.
    pub async fn exclusive(&self) -> Result<ExclusiveSession> {
        // Borrow the read half first: a reader parked on a full inbound
        // queue must be released before the write lock is taken, or the
        // inbound handler could never drain it.
        let (give_tx, give_rx) = oneshot::channel();
        let (back_tx, back_rx) = oneshot::channel();
        self.reader_ctl
            .send(ReaderCtl::Lend {
                give: give_tx,
                back: back_rx,
            })
            .await
            .map_err(|_| Error::UnknownPort(self.name.clone()))?;
        let reader = give_rx
            .await
            .map_err(|_| Error::UnknownPort(self.name.clone()))?;
        let writer = Arc::clone(&self.writer).lock_owned().await;
        Ok(ExclusiveSession {
            reader: Some(reader),
            restore: Some(back_tx),
            writer,
        })
    }

    /// Stop the task set immediately.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Exclusive use of one port, suspending the bus engine on it.
pub struct ExclusiveSession {
    reader: Option<SerialReader>,
    restore: Option<oneshot::Sender<SerialReader>>,
    writer: OwnedMutexGuard<SerialWriter>,
}

impl ExclusiveSession {
    /// The raw halves, for a programmer to drive directly.
    pub fn halves(&mut self) -> (&mut SerialReader, &mut SerialWriter) {
        (
            self.reader.as_mut().expect("reader held until drop"),
            &mut *self.writer,
        )
    }
}

impl Drop for ExclusiveSession {
    fn drop(&mut self) {
        // Give the read half back so the reader task resumes.
        if let (Some(rd), Some(tx)) = (self.reader.take(), self.restore.take()) {
            let _ = tx.send(rd);
        }
    }
}

/// Read one frame body from the stream, scanning past noise for the
/// two-byte header.
async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> std::io::Result<[u8; FRAME_BODY_SIZE]> {
    let mut last = rd.read_u8().await?;
    loop {
        if last != PACKET_HEADER[0] {
            last = rd.read_u8().await?;
            continue;
        }
        let next = rd.read_u8().await?;
        if next != PACKET_HEADER[1] {
            // The second byte may itself start a header.
            last = next;
            continue;
        }
        let mut body = [0u8; FRAME_BODY_SIZE];
        rd.read_exact(&mut body).await?;
        return Ok(body);
    }
}

async fn write_frame(writer: &AsyncMutex<SerialWriter>, frame: &Frame) -> Result<()> {
    let wire = frame.serialize()?;
    let mut w = writer.lock().await;
    w.write_all(&wire).await?;
    w.flush().await?;
    Ok(())
}

fn describe(frame: &Frame) -> String {
    let op = match frame.opcode() {
        Some(b) => Opcode::from_byte(b)
            .map(|o| o.name().to_string())
            .unwrap_or_else(|_| format!("{b:#04x}")),
        None => "?".to_string(),
    };
    format!(
        "[{}] {op} {:?}",
        frame.dest,
        frame.data.get(1..).unwrap_or_default()
    )
}

async fn reader_task(
    name: String,
    mut rd: SerialReader,
    pending: Arc<Mutex<Option<Pending>>>,
    reply_tx: mpsc::Sender<Frame>,
    inbound_tx: mpsc::Sender<Frame>,
    mut ctl: mpsc::Receiver<ReaderCtl>,
) {
    enum Step {
        Ctl(Option<ReaderCtl>),
        Body(std::io::Result<[u8; FRAME_BODY_SIZE]>),
    }
    loop {
        let step = {
            let read = read_frame(&mut rd);
            tokio::pin!(read);
            tokio::select! {
                biased;
                m = ctl.recv() => Step::Ctl(m),
                r = &mut read => Step::Body(r),
            }
        };
        match step {
            Step::Ctl(Some(ReaderCtl::Lend { give, back })) => {
                if give.send(rd).is_err() {
                    return;
                }
                rd = match back.await {
                    Ok(rd) => rd,
                    Err(_) => return,
                };
            }
            Step::Ctl(None) => return,
            Step::Body(Ok(body)) => match Frame::deserialize(&body) {
                Ok(frame) => {
                    let correlated = {
                        let mut slot = pending.lock().expect("pending lock");
                        match slot.as_ref() {
                            Some(p) if p.dest == frame.source && p.source == frame.dest => {
                                *slot = None;
                                true
                            }
                            _ => false,
                        }
                    };
                    let tx = if correlated { &reply_tx } else { &inbound_tx };
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(e @ Error::WrongDestination(_)) => info!("{name}: {e}"),
                Err(e) => debug!("{name}: {e}"),
            },
            Step::Body(Err(e)) => {
                warn!("{name}: read failed: {e}");
                return;
            }
        }
    }
}

async fn inbound_task(
    name: String,
    mut inbound_rx: mpsc::Receiver<Frame>,
    registry: Arc<Registry>,
    writer: Arc<AsyncMutex<SerialWriter>>,
    router: mpsc::UnboundedSender<Frame>,
) {
    sleep(BOOT_PAUSE).await;
    while let Some(frame) = inbound_rx.recv().await {
        let event = match message::parse(&frame, &registry) {
            Ok(ev) => ev,
            Err(e) => {
                error!("{name}: {e}");
                continue;
            }
        };
        // The ACK goes out ahead of ordinary queue draining.
        let ack = Frame::new(frame.source, vec![Opcode::Ack as u8]);
        match write_frame(&writer, &ack).await {
            Ok(()) => info!("HUB[REPLY]-> [{}] ACK", frame.source),
            Err(e) => warn!("{name}: ACK write failed: {e}"),
        }
        info!("->HUB {event}");
        for frame in reaction::execute(&event, &registry) {
            if router.send(frame).is_err() {
                return;
            }
        }
    }
}

async fn outbound_task(
    name: String,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    writer: Arc<AsyncMutex<SerialWriter>>,
    pending: Arc<Mutex<Option<Pending>>>,
    mut reply_rx: mpsc::Receiver<Frame>,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) {
    sleep(BOOT_PAUSE).await;
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            item = outbound_rx.recv() => item,
        };
        let Some(Outbound { frame, reply }) = next else {
            break;
        };
        if frame.dest == BROADCAST_ID {
            // Fire and forget; the next packet is immediately due.
            info!("HUB-> {}", describe(&frame));
            if let Err(e) = write_frame(&writer, &frame).await {
                error!("{name}: write failed: {e}");
            }
            continue;
        }
        // A reply that lost the race against a previous timeout would be
        // mis-correlated with this packet; drop leftovers first.
        while reply_rx.try_recv().is_ok() {}
        *pending.lock().expect("pending lock") = Some(Pending {
            dest: frame.dest,
            source: frame.source,
        });
        let mut answer = None;
        for attempt in 0..SEND_RETRY {
            if attempt == 0 {
                info!("HUB-> {}", describe(&frame));
            } else {
                debug!("HUB[+{attempt}]-> {}", describe(&frame));
            }
            if let Err(e) = write_frame(&writer, &frame).await {
                error!("{name}: write failed: {e}");
                break;
            }
            if *shutdown.borrow() {
                break;
            }
            match timeout(PACKET_TIMEOUT, reply_rx.recv()).await {
                Ok(Some(r)) => {
                    answer = Some(r);
                    break;
                }
                Ok(None) => return,
                Err(_) => sleep(RETRY_PAUSE).await,
            }
        }
        match answer {
            Some(r) => match message::parse(&r, &registry) {
                Ok(event) => {
                    info!("->HUB {event}");
                    if let Some(tx) = reply {
                        let _ = tx.send(event);
                    }
                }
                Err(e) => error!("{name}: reply parse failed: {e}"),
            },
            None => {
                info!("HUB->TIMEOUT {}", describe(&frame));
                *pending.lock().expect("pending lock") = None;
            }
        }
    }
    // Shutdown: drain what is queued without waiting on replies.
    while let Ok(Outbound { frame, .. }) = outbound_rx.try_recv() {
        if let Err(e) = write_frame(&writer, &frame).await {
            error!("{name}: write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::message::EventBody;
    use crate::packet::MAX_PACKET_SIZE;

    fn registry() -> Arc<Registry> {
        let config = Config::parse("sim:\n  NODE: { net: 7 }\n").unwrap();
        Arc::new(Registry::new(&config).unwrap())
    }

    struct Harness {
        port: Port,
        far: tokio::io::DuplexStream,
        _router_rx: mpsc::UnboundedReceiver<Frame>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let (near, far) = tokio::io::duplex(4096);
        let (rd, wr) = tokio::io::split(near);
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = Port::spawn(
            "sim",
            Box::new(rd),
            Box::new(wr),
            registry(),
            router_tx,
            shutdown_rx,
        );
        Harness {
            port,
            far,
            _router_rx: router_rx,
            _shutdown: shutdown_tx,
        }
    }

    async fn read_wire(far: &mut tokio::io::DuplexStream) -> (u16, u16, Vec<u8>) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &PACKET_HEADER);
        let source = u16::from_le_bytes([buf[2], buf[3]]);
        let dest = u16::from_le_bytes([buf[4], buf[5]]);
        (source, dest, buf[6..19].to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn request_reply_correlation() {
        let mut h = harness();
        let (tx, rx) = oneshot::channel();
        h.port
            .send(Outbound {
                frame: Frame::new(7, vec![0x90]),
                reply: Some(tx),
            })
            .unwrap();
        let (source, dest, data) = read_wire(&mut h.far).await;
        assert_eq!((source, dest), (1, 7));
        assert_eq!(data[0], 0x90);
        // The node answers with its free memory.
        let mut payload = vec![0x90];
        payload.extend_from_slice(&1234i16.to_le_bytes());
        let reply = Frame {
            source: 7,
            dest: 1,
            data: payload,
        };
        h.far.write_all(&reply.serialize().unwrap()).await.unwrap();
        let event = rx.await.unwrap();
        assert_eq!(event.source, 7);
        assert_eq!(event.body, EventBody::Mem(1234));
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_frame_is_acked() {
        let mut h = harness();
        let hbt = Frame {
            source: 7,
            dest: 1,
            data: vec![0x9f],
        };
        h.far.write_all(&hbt.serialize().unwrap()).await.unwrap();
        let (source, dest, data) = read_wire(&mut h.far).await;
        assert_eq!((source, dest), (1, 7));
        assert_eq!(data[0], 0x7e);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_frames_are_skipped() {
        let mut h = harness();
        // A frame with a broken CRC, then a good heartbeat.
        let mut bad = Frame {
            source: 7,
            dest: 1,
            data: vec![0x9f],
        }
        .serialize()
        .unwrap();
        bad[10] ^= 0xff;
        h.far.write_all(&bad).await.unwrap();
        let good = Frame {
            source: 7,
            dest: 1,
            data: vec![0x9f],
        };
        h.far.write_all(&good.serialize().unwrap()).await.unwrap();
        // Only the good one is acked.
        let (_, dest, data) = read_wire(&mut h.far).await;
        assert_eq!(dest, 7);
        assert_eq!(data[0], 0x7e);
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_session_suspends_and_resumes() {
        let mut h = harness();
        {
            let mut session = h.port.exclusive().await.unwrap();
            let (rd, wr) = session.halves();
            // Bytes written by the node reach the session, not the engine.
            h.far.write_all(b"xyz").await.unwrap();
            let mut got = [0u8; 3];
            rd.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"xyz");
            wr.write_all(b"ok").await.unwrap();
            wr.flush().await.unwrap();
            let mut got = [0u8; 2];
            h.far.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"ok");
        }
        // Dropped session: the engine reads frames again and ACKs.
        let hbt = Frame {
            source: 7,
            dest: 1,
            data: vec![0x9f],
        };
        h.far.write_all(&hbt.serialize().unwrap()).await.unwrap();
        let (_, dest, data) = read_wire(&mut h.far).await;
        assert_eq!(dest, 7);
        assert_eq!(data[0], 0x7e);
    }
}
