// CoBus - Cosimulation Signal Bus
// Copyright (C) 2026 CoBus Team
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// In-process datagram router. Every participant (models, optionally a
/// bus) owns a `LoopbackEndpoint` cloned off one hub; datagrams are moved
/// between per-peer inboxes under a single lock so an entire simulation
/// can run in one address space with the same envelope code paths as a
/// wire transport.
#[derive(Debug, Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<(Mutex<HubInner>, Condvar)>,
}

#[derive(Debug, Default)]
struct HubInner {
    inboxes: HashMap<u32, VecDeque<Bytes>>,
    bus_uid: Option<u32>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint for one peer. At most one bus-mode peer per hub.
    pub fn endpoint(&self, uid: u32, bus_mode: bool) -> LoopbackEndpoint {
        let (lock, _) = &*self.inner;
        let mut hub = lock.lock().unwrap();
        hub.inboxes.entry(uid).or_default();
        if bus_mode {
            hub.bus_uid = Some(uid);
        }
        LoopbackEndpoint {
            hub: self.clone(),
            uid,
            bus_mode,
            interrupted: Arc::new(Mutex::new(false)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    hub: LoopbackHub,
    pub uid: u32,
    pub bus_mode: bool,
    interrupted: Arc<Mutex<bool>>,
}

impl LoopbackEndpoint {
    /// Deliver a frame. A non-bus peer addresses the bus (when one is
    /// attached) or, failing that, the explicit peer. The bus addresses the
    /// explicit peer; peer uid 0 broadcasts to every other inbox.
    pub fn send(&self, frame: Bytes, peer_uid: u32) {
        let (lock, cvar) = &*self.hub.inner;
        let mut hub = lock.lock().unwrap();
        let dest: Vec<u32> = if !self.bus_mode {
            match hub.bus_uid {
                Some(bus) => vec![bus],
                None if peer_uid != 0 => vec![peer_uid],
                None => hub
                    .inboxes
                    .keys()
                    .copied()
                    .filter(|&u| u != self.uid)
                    .collect(),
            }
        } else if peer_uid == 0 {
            hub.inboxes
                .keys()
                .copied()
                .filter(|&u| Some(u) != hub.bus_uid)
                .collect()
        } else {
            vec![peer_uid]
        };
        for uid in dest {
            hub.inboxes.entry(uid).or_default().push_back(frame.clone());
        }
        cvar.notify_all();
    }

    /// Pop the next frame for this peer, blocking up to `timeout`. A
    /// timeout is not an error: returns None. Returns None immediately
    /// after `interrupt`; the caller observes the flag via
    /// `is_interrupted`.
    pub fn recv(&self, timeout: Duration) -> Option<Bytes> {
        let (lock, cvar) = &*self.hub.inner;
        let mut hub = lock.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if *self.interrupted.lock().unwrap() {
                return None;
            }
            if let Some(frame) = hub.inboxes.get_mut(&self.uid).and_then(|q| q.pop_front()) {
                return Some(frame);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = cvar.wait_timeout(hub, deadline - now).unwrap();
            hub = guard;
            if result.timed_out() {
                if let Some(frame) = hub.inboxes.get_mut(&self.uid).and_then(|q| q.pop_front()) {
                    return Some(frame);
                }
                return None;
            }
        }
    }

    pub fn interrupt(&self) {
        *self.interrupted.lock().unwrap() = true;
        let (_, cvar) = &*self.hub.inner;
        cvar.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.lock().unwrap()
    }

    pub fn disconnect(&self) {
        let (lock, _) = &*self.hub.inner;
        let mut hub = lock.lock().unwrap();
        hub.inboxes.remove(&self.uid);
        if hub.bus_uid == Some(self.uid) {
            hub.bus_uid = None;
        }
    }
}

/// A loopback endpoint is also a datagram transport, so the Message
/// endpoint variant (and with it the full bus protocol) can run over the
/// in-process hub.
impl crate::endpoint::DatagramTransport for LoopbackEndpoint {
    fn connect(&mut self) -> crate::BusResult<()> {
        Ok(())
    }

    fn send(&mut self, frame: Bytes, peer_uid: u32) -> crate::BusResult<()> {
        if self.is_interrupted() {
            return Err(crate::BusError::Cancelled);
        }
        LoopbackEndpoint::send(self, frame, peer_uid);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> crate::BusResult<Option<Bytes>> {
        Ok(LoopbackEndpoint::recv(self, timeout))
    }

    fn interrupt(&mut self) {
        LoopbackEndpoint::interrupt(self);
    }

    fn close(&mut self) {
        self.disconnect();
    }
}
