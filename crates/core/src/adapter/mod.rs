pub mod simbus;

use crate::endpoint::wire::{
    self, ChannelUpdate, NotifyKind, NotifyMessage,
};
use crate::endpoint::Endpoint;
use crate::signal::{fnv1a_hash, Channel};
use crate::{BusError, BusResult};
use std::collections::HashMap;

/// Attempts at draining the endpoint while waiting for the bus start
/// acknowledgement before giving up.
const START_WAIT_RETRIES: u32 = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterVariant {
    Message,
    Loopback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Created,
    Registered,
    Ready,
    Running,
    Exited,
}

/// A model's view of the bus: identity, clock, and the channels it maps
/// (borrowed by index from the adapter's channel arena).
#[derive(Debug)]
pub struct AdapterModel {
    pub model_uid: u32,
    pub name: String,
    pub model_time: f64,
    pub stop_time: f64,
    pub state: ModelState,
    pub channels: Vec<usize>,
    time_correction: f64,
}

/// The peer-side state machine coupling local models to the bus protocol.
/// The Loopback variant keeps the full handshake without a wire; the
/// Message variant speaks the envelope protocol through the endpoint.
#[derive(Debug)]
pub struct Adapter {
    pub endpoint: Endpoint,
    variant: AdapterVariant,
    channels: Vec<Channel>,
    channel_lookup: HashMap<String, usize>,
    models: Vec<AdapterModel>,
    model_lookup: HashMap<u32, usize>,
    step_size: f64,
    stop_request: bool,
}

impl Adapter {
    pub fn new(endpoint: Endpoint) -> Self {
        let variant = match &endpoint {
            Endpoint::Loopback(_) => AdapterVariant::Loopback,
            Endpoint::Message(_) | Endpoint::SimBus(_) => AdapterVariant::Message,
        };
        Self {
            endpoint,
            variant,
            channels: Vec::new(),
            channel_lookup: HashMap::new(),
            models: Vec::new(),
            model_lookup: HashMap::new(),
            step_size: 0.0,
            stop_request: false,
        }
    }

    pub fn variant(&self) -> AdapterVariant {
        self.variant
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /* Model management. */

    pub fn create_model(&mut self, model_uid: u32, name: &str) -> usize {
        if let Some(&idx) = self.model_lookup.get(&model_uid) {
            return idx;
        }
        let idx = self.models.len();
        self.models.push(AdapterModel {
            model_uid,
            name: name.to_string(),
            model_time: 0.0,
            stop_time: 0.0,
            state: ModelState::Created,
            channels: Vec::new(),
            time_correction: 0.0,
        });
        self.model_lookup.insert(model_uid, idx);
        idx
    }

    pub fn model(&self, model_uid: u32) -> BusResult<&AdapterModel> {
        self.model_lookup
            .get(&model_uid)
            .map(|&i| &self.models[i])
            .ok_or_else(|| BusError::Config(format!("Unknown model uid {}", model_uid)))
    }

    fn model_mut(&mut self, model_uid: u32) -> BusResult<&mut AdapterModel> {
        let idx = *self
            .model_lookup
            .get(&model_uid)
            .ok_or_else(|| BusError::Config(format!("Unknown model uid {}", model_uid)))?;
        Ok(&mut self.models[idx])
    }

    /* Channel management. */

    /// Initialise a channel for a model: get-or-create the arena entry and
    /// lazily create every named signal.
    pub fn init_channel(
        &mut self,
        model_uid: u32,
        channel_name: &str,
        signal_names: &[String],
    ) -> BusResult<usize> {
        let ch_idx = match self.channel_lookup.get(channel_name) {
            Some(&i) => i,
            None => {
                let i = self.channels.len();
                self.channels.push(Channel::new(channel_name));
                self.channel_lookup.insert(channel_name.to_string(), i);
                self.endpoint.create_channel(channel_name);
                i
            }
        };
        for name in signal_names {
            self.channels[ch_idx].signal(name);
        }
        let am = self.model_mut(model_uid)?;
        if !am.channels.contains(&ch_idx) {
            am.channels.push(ch_idx);
        }
        Ok(ch_idx)
    }

    pub fn channel(&self, idx: usize) -> &Channel {
        &self.channels[idx]
    }

    pub fn channel_mut(&mut self, idx: usize) -> &mut Channel {
        &mut self.channels[idx]
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.channel_lookup.get(name).map(|&i| &self.channels[i])
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channel_lookup.get(name).copied()
    }

    /* Handshake. */

    /// Associate with the simulation: record the step size and bring up
    /// the transport (bounded retries inside the endpoint).
    pub fn connect(&mut self, step_size: f64) -> BusResult<()> {
        self.step_size = step_size;
        if self.variant == AdapterVariant::Message {
            self.endpoint.start()?;
        }
        Ok(())
    }

    /// Assign signal uids (FNV-1a of the name unless pre-assigned) and, in
    /// message mode, publish the SignalLookup for each channel. After a
    /// successful register every SignalValue has uid != 0.
    pub fn register(&mut self, model_uid: u32) -> BusResult<()> {
        let channel_indices = self.model(model_uid)?.channels.clone();
        for &ci in &channel_indices {
            let channel = &mut self.channels[ci];
            let channel_name = channel.name.clone();
            tracing::debug!("SignalIndex <-- [{}]", channel_name);
            let mut seen: HashMap<u32, String> = HashMap::new();
            for sv in channel.values_mut() {
                if sv.uid == 0 {
                    sv.uid = fnv1a_hash(&sv.name);
                }
                if let Some(other) = seen.insert(sv.uid, sv.name.clone()) {
                    if other != sv.name {
                        return Err(BusError::Config(format!(
                            "Signal uid collision on channel '{}': '{}' and '{}' both hash to {}",
                            channel_name, other, sv.name, sv.uid
                        )));
                    }
                }
                tracing::debug!("    SignalLookup: {} [UID={}]", sv.name, sv.uid);
            }
        }

        if self.variant == AdapterVariant::Message {
            let am = self.model(model_uid)?;
            let time = am.model_time;
            let channels = channel_indices
                .iter()
                .map(|&ci| {
                    let ch = &self.channels[ci];
                    ChannelUpdate {
                        name: ch.name.clone(),
                        lookups: ch
                            .values()
                            .iter()
                            .map(|sv| (sv.name.clone(), sv.uid))
                            .collect(),
                        delta: Vec::new(),
                    }
                })
                .collect();
            self.send_notify(NotifyKind::Register, model_uid, time, channels)?;
        }

        self.model_mut(model_uid)?.state = ModelState::Registered;
        Ok(())
    }

    /// Declare the model's outputs for `model_time` complete and emit the
    /// delta. In loopback mode emission and application are the same
    /// moment: pending scalars commit locally (binary buffers stay for the
    /// in-process readers).
    pub fn ready(&mut self, model_uid: u32) -> BusResult<()> {
        let am = self.model(model_uid)?;
        if matches!(am.state, ModelState::Created | ModelState::Exited) {
            return Err(BusError::Protocol(format!(
                "Model {} signalled ready in state {:?}",
                model_uid, am.state
            )));
        }
        let model_time = am.model_time;
        let channel_indices = am.channels.clone();
        tracing::debug!("Notify/ModelReady --> [{}]", model_uid);
        tracing::debug!("    model_time={}", model_time);

        match self.variant {
            AdapterVariant::Loopback => {
                for &ci in &channel_indices {
                    self.channels[ci].commit_scalars();
                }
            }
            AdapterVariant::Message => {
                let mut updates = Vec::with_capacity(channel_indices.len());
                for &ci in &channel_indices {
                    let channel = &mut self.channels[ci];
                    updates.push(ChannelUpdate {
                        name: channel.name.clone(),
                        lookups: Vec::new(),
                        delta: wire::channel_delta(channel),
                    });
                }
                self.send_notify(NotifyKind::Ready, model_uid, model_time, updates)?;
            }
        }

        self.model_mut(model_uid)?.state = ModelState::Ready;
        Ok(())
    }

    /// Obtain the bus acknowledgement: merge incoming deltas and stamp
    /// `stop_time <- model_time + step_size` (Kahan-corrected). Returns the
    /// new stop time.
    pub fn start(&mut self, model_uid: u32) -> BusResult<f64> {
        if self.stop_request {
            return Err(BusError::Cancelled);
        }
        if self.variant == AdapterVariant::Message {
            self.wait_for_start(model_uid)?;
        } else {
            let channel_indices = self.model(model_uid)?.channels.clone();
            for &ci in &channel_indices {
                let channel = &mut self.channels[ci];
                for sv in channel.values_mut() {
                    if sv.current != sv.final_value {
                        tracing::debug!(
                            "    SignalValue: {} = {} [name={}]",
                            sv.uid,
                            sv.final_value,
                            sv.name
                        );
                        sv.current = sv.final_value;
                    }
                }
            }
        }

        let step_size = self.step_size;
        let am = self.model_mut(model_uid)?;
        let y = step_size - am.time_correction;
        let t = am.model_time + y;
        am.time_correction = (t - am.model_time) - y;
        am.stop_time = t;
        am.state = ModelState::Running;
        tracing::debug!("Notify/ModelStart <-- [{}]", model_uid);
        tracing::debug!("    model_time={}", am.model_time);
        tracing::debug!("    stop_time={}", am.stop_time);
        Ok(am.stop_time)
    }

    /// Leave the bus.
    pub fn exit(&mut self, model_uid: u32) -> BusResult<()> {
        let time = self.model(model_uid)?.model_time;
        if self.variant == AdapterVariant::Message {
            self.send_notify(NotifyKind::Exit, model_uid, time, Vec::new())?;
        }
        self.model_mut(model_uid)?.state = ModelState::Exited;
        Ok(())
    }

    /// Safe from a signal context: flags the endpoint and the handshake
    /// loops.
    pub fn interrupt(&mut self) {
        self.stop_request = true;
        self.endpoint.interrupt();
    }

    pub fn advance_model_time(&mut self, model_uid: u32, model_time: f64) -> BusResult<()> {
        let am = self.model_mut(model_uid)?;
        am.model_time = model_time;
        Ok(())
    }

    /* Message-mode internals. */

    fn send_notify(
        &mut self,
        kind: NotifyKind,
        model_uid: u32,
        time: f64,
        channels: Vec<ChannelUpdate>,
    ) -> BusResult<()> {
        let msg = NotifyMessage {
            kind,
            model_uid,
            time,
            channels,
        };
        let payload = wire::encode_notify(&msg);
        self.endpoint.send(None, payload, 0)
    }

    fn wait_for_start(&mut self, model_uid: u32) -> BusResult<()> {
        for _ in 0..START_WAIT_RETRIES {
            if self.stop_request {
                return Err(BusError::Cancelled);
            }
            let Some(datagram) = self.endpoint.recv()? else {
                continue;
            };
            match datagram.channel {
                Some(name) => {
                    let delta = wire::decode_delta(&datagram.payload)?;
                    let ci = self.channel_index(&name).ok_or_else(|| {
                        BusError::Protocol(format!("Message for unknown channel '{}'", name))
                    })?;
                    wire::apply_delta(&mut self.channels[ci], &delta);
                }
                None => {
                    let msg = wire::decode_notify(&datagram.payload)?;
                    match msg.kind {
                        NotifyKind::Start => {
                            for update in &msg.channels {
                                if let Some(ci) = self.channel_index(&update.name) {
                                    wire::apply_delta(&mut self.channels[ci], &update.delta);
                                }
                            }
                            tracing::debug!(
                                "Notify/ModelStart <-- [{}] (bus_time={})",
                                model_uid,
                                msg.time
                            );
                            return Ok(());
                        }
                        other => {
                            tracing::debug!("Ignoring notify {:?} while waiting for start", other);
                        }
                    }
                }
            }
        }
        Err(BusError::Transport(
            "Timed out waiting for bus start".to_string(),
        ))
    }
}
