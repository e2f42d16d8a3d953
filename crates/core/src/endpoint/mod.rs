pub mod loopback;
pub mod wire;

use crate::{BusError, BusResult};
use bytes::Bytes;
use loopback::LoopbackEndpoint;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Bounded retry for the initial transport connect.
const CONNECT_RETRY_COUNT: u32 = 60;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A received datagram, envelope already decoded.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// None for notify (bus-control) messages.
    pub channel: Option<String>,
    pub payload: Bytes,
}

/// The transport seam behind the Message endpoint variant. Concrete wire
/// transports (message queues, Redis) implement this; frames are complete
/// envelope datagrams.
pub trait DatagramTransport: std::fmt::Debug {
    fn connect(&mut self) -> BusResult<()>;
    fn send(&mut self, frame: Bytes, peer_uid: u32) -> BusResult<()>;
    /// Block up to `timeout`; a timeout returns None and is not an error.
    fn recv(&mut self, timeout: Duration) -> BusResult<Option<Bytes>>;
    fn interrupt(&mut self);
    fn close(&mut self);
}

/// Transport endpoint, variant-dispatched.
#[derive(Debug)]
pub enum Endpoint {
    Message(MessageEndpoint),
    Loopback(LoopbackEndpoint),
    SimBus(MessageEndpoint),
}

impl Endpoint {
    pub fn message(transport: Box<dyn DatagramTransport>, uid: u32, timeout: f64) -> Self {
        Endpoint::Message(MessageEndpoint::new(transport, uid, false, timeout))
    }

    pub fn simbus(transport: Box<dyn DatagramTransport>, uid: u32, timeout: f64) -> Self {
        Endpoint::SimBus(MessageEndpoint::new(transport, uid, true, timeout))
    }

    pub fn uid(&self) -> u32 {
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => m.uid,
            Endpoint::Loopback(l) => l.uid,
        }
    }

    pub fn bus_mode(&self) -> bool {
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => m.bus_mode,
            Endpoint::Loopback(l) => l.bus_mode,
        }
    }

    /// Register a channel name; incoming channel-bound datagrams are
    /// validated against the registered set.
    pub fn create_channel(&mut self, name: &str) -> usize {
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => m.create_channel(name),
            Endpoint::Loopback(_) => 0,
        }
    }

    pub fn start(&mut self) -> BusResult<()> {
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => m.start(),
            Endpoint::Loopback(_) => Ok(()),
        }
    }

    pub fn send(&mut self, channel: Option<&str>, payload: Bytes, peer_uid: u32) -> BusResult<()> {
        let frame = wire::encode_envelope(channel, &payload);
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => m.transport.send(frame, peer_uid),
            Endpoint::Loopback(l) => {
                if l.is_interrupted() {
                    return Err(BusError::Cancelled);
                }
                l.send(frame, peer_uid);
                Ok(())
            }
        }
    }

    /// Receive one datagram, blocking up to the endpoint timeout. Returns
    /// None on timeout. Interrupt surfaces as `Cancelled`.
    pub fn recv(&mut self) -> BusResult<Option<Datagram>> {
        let frame = match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => {
                if m.interrupted {
                    return Err(BusError::Cancelled);
                }
                match m.transport.recv(m.timeout)? {
                    Some(f) => f,
                    None => {
                        if m.interrupted {
                            return Err(BusError::Cancelled);
                        }
                        return Ok(None);
                    }
                }
            }
            Endpoint::Loopback(l) => match LoopbackEndpoint::recv(l, Duration::from_millis(50)) {
                Some(f) => f,
                None => {
                    if l.is_interrupted() {
                        return Err(BusError::Cancelled);
                    }
                    return Ok(None);
                }
            },
        };
        let envelope = wire::decode_envelope(&frame)?;
        if let (Some(name), Endpoint::Message(m) | Endpoint::SimBus(m)) =
            (envelope.channel.as_deref(), &*self)
        {
            if !m.channels.contains_key(name) {
                return Err(BusError::Protocol(format!(
                    "Message for unknown channel '{}'",
                    name
                )));
            }
        }
        Ok(Some(Datagram {
            channel: envelope.channel,
            payload: envelope.payload,
        }))
    }

    pub fn interrupt(&mut self) {
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => {
                m.interrupted = true;
                m.transport.interrupt();
            }
            Endpoint::Loopback(l) => l.interrupt(),
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Endpoint::Message(m) | Endpoint::SimBus(m) => m.transport.close(),
            Endpoint::Loopback(l) => l.disconnect(),
        }
    }
}

/// Envelope-framing endpoint over a pluggable datagram transport.
#[derive(Debug)]
pub struct MessageEndpoint {
    transport: Box<dyn DatagramTransport>,
    pub uid: u32,
    pub bus_mode: bool,
    timeout: Duration,
    channels: HashMap<String, usize>,
    interrupted: bool,
}

impl MessageEndpoint {
    fn new(transport: Box<dyn DatagramTransport>, uid: u32, bus_mode: bool, timeout: f64) -> Self {
        Self {
            transport,
            uid,
            bus_mode,
            timeout: Duration::from_secs_f64(timeout.max(0.0)),
            channels: HashMap::new(),
            interrupted: false,
        }
    }

    fn create_channel(&mut self, name: &str) -> usize {
        let next = self.channels.len();
        *self.channels.entry(name.to_string()).or_insert(next)
    }

    fn start(&mut self) -> BusResult<()> {
        let mut last_err = None;
        for attempt in 0..CONNECT_RETRY_COUNT {
            if self.interrupted {
                return Err(BusError::Cancelled);
            }
            match self.transport.connect() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::info!(
                        "Endpoint connect failed (attempt {}/{}): {}",
                        attempt + 1,
                        CONNECT_RETRY_COUNT,
                        e
                    );
                    last_err = Some(e);
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| BusError::Transport("Endpoint connect failed".to_string())))
    }
}

/// In-memory datagram transport: a pair of crossed queues. Used as the
/// reference implementation of the transport seam and by tests.
#[derive(Debug, Clone)]
pub struct InProcTransport {
    tx: Arc<(Mutex<VecDeque<Bytes>>, Condvar)>,
    rx: Arc<(Mutex<VecDeque<Bytes>>, Condvar)>,
}

impl InProcTransport {
    pub fn pair() -> (Self, Self) {
        let a = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        let b = Arc::new((Mutex::new(VecDeque::new()), Condvar::new()));
        (
            Self {
                tx: a.clone(),
                rx: b.clone(),
            },
            Self { tx: b, rx: a },
        )
    }
}

impl DatagramTransport for InProcTransport {
    fn connect(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn send(&mut self, frame: Bytes, _peer_uid: u32) -> BusResult<()> {
        let (lock, cvar) = &*self.tx;
        lock.lock().unwrap().push_back(frame);
        cvar.notify_all();
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> BusResult<Option<Bytes>> {
        let (lock, cvar) = &*self.rx;
        let mut queue = lock.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = queue.pop_front() {
                return Ok(Some(frame));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = cvar.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    fn interrupt(&mut self) {
        let (_, cvar) = &*self.rx;
        cvar.notify_all();
    }

    fn close(&mut self) {}
}
