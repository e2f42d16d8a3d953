use crate::endpoint::wire::{self, ChannelUpdate, NotifyKind, NotifyMessage};
use crate::endpoint::{Datagram, Endpoint};
use crate::signal::{fnv1a_hash, Channel};
use crate::{BusError, BusResult};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;

pub const ENV_SIMBUS_TRACE_FILE: &str = "SIMBUS_TRACEFILE";

/// The bus-side adapter: no models of its own, one Channel per configured
/// channel with an expected-model quorum. Advances bus time when every
/// channel has its full register set and every registered model is ready;
/// terminates when every register set has emptied.
#[derive(Debug)]
pub struct SimBusAdapter {
    pub endpoint: Endpoint,
    channels: Vec<Channel>,
    channel_lookup: HashMap<String, usize>,
    registered_models: BTreeSet<u32>,
    pub bus_time: f64,
    pub bus_step_size: f64,
    time_correction: f64,
    exit_run_loop: bool,
    stop_request: bool,
    trace: Option<std::fs::File>,
}

impl SimBusAdapter {
    pub fn new(endpoint: Endpoint, bus_step_size: f64) -> Self {
        let trace = std::env::var(ENV_SIMBUS_TRACE_FILE)
            .ok()
            .and_then(|path| match std::fs::File::create(&path) {
                Ok(f) => {
                    tracing::info!("Create trace file : {}", path);
                    Some(f)
                }
                Err(e) => {
                    tracing::error!("Unable to open SimBus trace file ({}): {}", path, e);
                    None
                }
            });
        Self {
            endpoint,
            channels: Vec::new(),
            channel_lookup: HashMap::new(),
            registered_models: BTreeSet::new(),
            // Will be set to 0.0 on the first cycle.
            bus_time: 0.0 - bus_step_size,
            bus_step_size,
            time_correction: 0.0,
            exit_run_loop: false,
            stop_request: false,
            trace,
        }
    }

    /// Initialise a bus channel with its quorum and (pre-assigned) signal
    /// uids. Signals registered later by models are hashed on arrival.
    pub fn init_channel(
        &mut self,
        channel_name: &str,
        expected_model_count: u32,
        signal_names: &[String],
    ) {
        let idx = match self.channel_lookup.get(channel_name) {
            Some(&i) => i,
            None => {
                let i = self.channels.len();
                self.channels.push(Channel::new(channel_name));
                self.channel_lookup.insert(channel_name.to_string(), i);
                self.endpoint.create_channel(channel_name);
                i
            }
        };
        let channel = &mut self.channels[idx];
        channel.expected_model_count = expected_model_count;
        for name in signal_names {
            let slot = channel.signal(name);
            let sv = channel.get_mut(slot);
            sv.uid = fnv1a_hash(&sv.name);
            tracing::debug!("    [{}] uid={}, name={}", slot, sv.uid, sv.name);
        }
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.channel_lookup.get(name).map(|&i| &self.channels[i])
    }

    pub fn interrupt(&mut self) {
        self.stop_request = true;
        self.endpoint.interrupt();
    }

    /// The bus run loop: wait for messages until every channel's register
    /// set has emptied.
    pub fn run(&mut self) -> BusResult<()> {
        self.endpoint.start()?;
        self.exit_run_loop = false;

        while !self.exit_run_loop {
            if self.stop_request {
                return Err(BusError::Cancelled);
            }
            match self.endpoint.recv() {
                Ok(Some(datagram)) => self.handle_datagram(datagram)?,
                Ok(None) => continue,
                Err(BusError::Cancelled) => return Err(BusError::Cancelled),
                Err(e) => return Err(e),
            }
        }

        tracing::debug!("exit run loop");
        Ok(())
    }

    /// Drain and process any queued messages without blocking on an empty
    /// queue. Used by in-process (loopback hub) compositions to pump the
    /// bus between model turns. Returns false once the run loop would
    /// exit.
    pub fn pump(&mut self) -> BusResult<bool> {
        loop {
            if self.exit_run_loop {
                return Ok(false);
            }
            match self.endpoint.recv()? {
                Some(datagram) => self.handle_datagram(datagram)?,
                None => return Ok(true),
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) -> BusResult<()> {
        match datagram.channel {
            Some(name) => {
                let delta = wire::decode_delta(&datagram.payload)?;
                let ci = *self.channel_lookup.get(&name).ok_or_else(|| {
                    BusError::Protocol(format!("Message for unknown channel '{}'", name))
                })?;
                wire::apply_delta_pending(&mut self.channels[ci], &delta);
                Ok(())
            }
            None => {
                let msg = wire::decode_notify(&datagram.payload)?;
                self.trace_notify("rx", &msg);
                self.handle_notify(msg)
            }
        }
    }

    fn handle_notify(&mut self, msg: NotifyMessage) -> BusResult<()> {
        match msg.kind {
            NotifyKind::Register => self.model_at_register(&msg),
            NotifyKind::Ready => {
                self.model_at_ready(&msg)?;
                if self.network_ready() && self.models_ready() {
                    self.advance()?;
                }
                Ok(())
            }
            NotifyKind::Exit => {
                self.model_at_exit(msg.model_uid);
                Ok(())
            }
            NotifyKind::Start => Err(BusError::Protocol(
                "Bus received a Start notify".to_string(),
            )),
        }
    }

    fn model_at_register(&mut self, msg: &NotifyMessage) -> BusResult<()> {
        for update in &msg.channels {
            let ci = *self.channel_lookup.get(&update.name).ok_or_else(|| {
                BusError::Protocol(format!(
                    "Register for unknown channel '{}'",
                    update.name
                ))
            })?;
            let channel = &mut self.channels[ci];
            for (signal, uid) in &update.lookups {
                let expect = if *uid != 0 { *uid } else { fnv1a_hash(signal) };
                // The uid must not be claimed by a differently-named
                // signal anywhere on the channel; deltas address slots
                // purely by uid.
                if let Some(other) = channel.find_by_uid(expect) {
                    if channel.get(other).name != *signal {
                        return Err(BusError::Config(format!(
                            "Signal uid collision on channel '{}': '{}' and '{}' both hash to {}",
                            update.name,
                            channel.get(other).name,
                            signal,
                            expect
                        )));
                    }
                }
                let slot = channel.signal(signal);
                let sv = channel.get_mut(slot);
                if sv.uid == 0 {
                    sv.uid = expect;
                } else if sv.uid != expect {
                    return Err(BusError::Protocol(format!(
                        "SignalLookup mismatch for '{}' on '{}': {} != {}",
                        signal, update.name, sv.uid, expect
                    )));
                }
            }
            channel.model_register_set.insert(msg.model_uid);
            tracing::debug!(
                "Model {} registered on '{}' ({}/{})",
                msg.model_uid,
                update.name,
                channel.model_register_set.len(),
                channel.expected_model_count
            );
        }
        self.registered_models.insert(msg.model_uid);
        Ok(())
    }

    fn model_at_ready(&mut self, msg: &NotifyMessage) -> BusResult<()> {
        for update in &msg.channels {
            let ci = *self.channel_lookup.get(&update.name).ok_or_else(|| {
                BusError::Protocol(format!("Ready for unknown channel '{}'", update.name))
            })?;
            let channel = &mut self.channels[ci];
            wire::apply_delta_pending(channel, &update.delta);
            channel.model_ready_set.insert(msg.model_uid);
        }
        Ok(())
    }

    fn model_at_exit(&mut self, model_uid: u32) {
        for channel in &mut self.channels {
            channel.model_register_set.remove(&model_uid);
            channel.model_ready_set.remove(&model_uid);
        }
        self.registered_models.remove(&model_uid);
        if self
            .channels
            .iter()
            .all(|ch| ch.model_register_set.is_empty())
        {
            self.exit_run_loop = true;
        }
    }

    /// Every channel has its expected register quorum.
    fn network_ready(&self) -> bool {
        self.channels
            .iter()
            .all(|ch| ch.model_register_set.len() as u32 == ch.expected_model_count)
    }

    /// Every registered model has declared ready on every channel.
    fn models_ready(&self) -> bool {
        self.channels
            .iter()
            .all(|ch| ch.model_ready_set.len() == ch.model_register_set.len())
    }

    /// Progress bus time, publish the merged per-channel deltas with a
    /// Start notify, and clear the ready sets for the next cycle.
    fn advance(&mut self) -> BusResult<()> {
        let y = self.bus_step_size - self.time_correction;
        let t = self.bus_time + y;
        self.time_correction = (t - self.bus_time) - y;
        self.bus_time = t;

        let mut updates = Vec::with_capacity(self.channels.len());
        for channel in &mut self.channels {
            let delta = wire::channel_delta(channel);
            channel.commit_scalars();
            channel.model_ready_set.clear();
            updates.push(ChannelUpdate {
                name: channel.name.clone(),
                lookups: Vec::new(),
                delta,
            });
        }

        let msg = NotifyMessage {
            kind: NotifyKind::Start,
            model_uid: self.endpoint.uid(),
            time: self.bus_time,
            channels: updates,
        };
        self.trace_notify("tx", &msg);
        tracing::debug!(
            "Bus advance: bus_time={} ({} model(s))",
            self.bus_time,
            self.registered_models.len()
        );
        let payload = wire::encode_notify(&msg);
        self.endpoint.send(None, payload, 0)
    }

    fn trace_notify(&mut self, dir: &str, msg: &NotifyMessage) {
        let Some(trace) = self.trace.as_mut() else {
            return;
        };
        let line = serde_json::json!({
            "dir": dir,
            "kind": msg.kind,
            "model_uid": msg.model_uid,
            "time": msg.time,
            "channels": msg.channels.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        });
        let _ = writeln!(trace, "{}", line);
    }
}
