pub mod transform;

use crate::adapter::Adapter;
use crate::codec::CodecRegistry;
use crate::signal::vector::SignalVector;
use crate::signal::{Channel, SignalMap};
use crate::{BusError, BusResult, Model, ModelDesc, ModelInfo};
use cobus_config::{InstanceSpec, LinearTransform, VectorType};
use std::collections::HashMap;

/// The controller-side projection of one configured channel: the link
/// between a model's SignalVector and the adapter's channel store, with
/// optional per-signal linear transforms.
#[derive(Debug)]
pub struct ModelFunctionChannel {
    pub channel_name: String,
    pub function_name: String,
    /// Index of the paired vector in the model's ModelDesc.
    pub sv_index: usize,
    /// Index of the channel in the adapter's channel arena.
    pub channel_index: usize,
    pub is_binary: bool,
    signal_names: Vec<String>,
    pub(crate) signal_map: SignalMap,
    pub transforms: Option<Vec<LinearTransform>>,
    /// Gateway change detection: the scalar values as last marshalled to
    /// the vector. Host writes are published only where they differ.
    gateway_shadow: Vec<f64>,
}

impl ModelFunctionChannel {
    pub fn new(
        channel_name: &str,
        function_name: &str,
        sv_index: usize,
        channel_index: usize,
        is_binary: bool,
        signal_names: Vec<String>,
        transforms: Option<Vec<LinearTransform>>,
    ) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            function_name: function_name.to_string(),
            sv_index,
            channel_index,
            is_binary,
            gateway_shadow: vec![0.0; signal_names.len()],
            signal_names,
            signal_map: SignalMap::default(),
            transforms,
        }
    }

    pub fn signal_count(&self) -> usize {
        self.signal_names.len()
    }

    /// Regenerate the cached slot map when the channel index has been
    /// invalidated by an insert.
    pub(crate) fn refresh_signal_map(&mut self, channel: &mut Channel) {
        if self.signal_map.slots.is_empty() || self.signal_map.is_stale(channel) {
            self.signal_map = channel.signal_map(&self.signal_names);
        }
    }
}

/// One model instance owned by the controller: the model code, its
/// descriptor (with the signal vectors) and the channel projections.
pub struct ControllerModel {
    pub uid: u32,
    pub name: String,
    pub desc: ModelDesc,
    pub model: Box<dyn Model>,
    pub mfcs: Vec<ModelFunctionChannel>,
    /// Gateways publish host-written values before the handshake instead
    /// of after the step.
    pub gateway: bool,
}

/// Owns the model instances and drives the per-cycle work: marshalling,
/// model stepping, and the ready/start handshake with the adapter.
pub struct Controller {
    pub adapter: Adapter,
    pub models: Vec<ControllerModel>,
    pub sequential_cosim: bool,
    codec_registry: CodecRegistry,
}

impl Controller {
    pub fn new(adapter: Adapter, sequential_cosim: bool, codec_registry: CodecRegistry) -> Self {
        Self {
            adapter,
            models: Vec::new(),
            sequential_cosim,
            codec_registry,
        }
    }

    pub fn model_index(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|m| m.name == name)
    }

    /// Configure one model instance: allocate its SignalVectors (the
    /// configured signal order is authoritative), build the adapter
    /// channels, and seed `initial_value` annotations into the store.
    pub fn configure_instance(
        &mut self,
        spec: &InstanceSpec,
        model: Box<dyn Model>,
    ) -> BusResult<()> {
        self.adapter.create_model(spec.uid, &spec.name);

        let mut desc = ModelDesc {
            info: ModelInfo {
                uid: spec.uid,
                name: spec.name.clone(),
            },
            sv: Vec::new(),
        };
        let mut mfcs = Vec::new();

        for cfg in &spec.channels {
            let signal_names: Vec<String> = cfg.signals.iter().map(|s| s.name.clone()).collect();
            let is_binary = cfg.vector_type == VectorType::Binary;
            let channel_index =
                self.adapter
                    .init_channel(spec.uid, &cfg.name, &signal_names)?;

            // Seed initial values (scalar channels only).
            if !is_binary {
                let channel = self.adapter.channel_mut(channel_index);
                for sc in &cfg.signals {
                    if let Some(v) = sc.initial_value() {
                        let slot = channel.signal(&sc.name);
                        let sv = channel.get_mut(slot);
                        sv.current = v;
                        sv.final_value = v;
                    }
                }
            }

            let vector_name = cfg.alias.as_deref().unwrap_or(&cfg.name);
            let mut sv = SignalVector::new(
                vector_name,
                &cfg.name,
                "step",
                is_binary,
                signal_names.clone(),
            );
            for (i, sc) in cfg.signals.iter().enumerate() {
                let annotations: HashMap<String, String> = sc
                    .annotations
                    .keys()
                    .filter_map(|k| Some((k.clone(), sc.annotation_str(k)?)))
                    .collect();
                sv.set_annotations(i, annotations);
                if is_binary && sv.mime_type(i).is_some() {
                    // Best effort: the registry may not carry this grammar.
                    if let Err(e) = sv.ensure_codec(i, &self.codec_registry) {
                        tracing::debug!("No codec attached for '{}': {}", sc.name, e);
                    }
                }
            }

            let transforms = if cfg.signals.iter().any(|s| s.transform().is_some()) {
                Some(
                    cfg.signals
                        .iter()
                        .map(|s| s.transform().unwrap_or_default())
                        .collect(),
                )
            } else {
                None
            };

            let sv_index = desc.sv.len();
            desc.sv.push(sv);
            mfcs.push(ModelFunctionChannel::new(
                &cfg.name,
                "step",
                sv_index,
                channel_index,
                is_binary,
                signal_names,
                transforms,
            ));
        }

        self.models.push(ControllerModel {
            uid: spec.uid,
            name: spec.name.clone(),
            desc,
            model,
            mfcs,
            gateway: spec.model.gateway || spec.model.kind.as_deref() == Some("gateway"),
        });
        Ok(())
    }

    /// Call `model_create` on every instance and publish initial values
    /// into the store. Vectors are marshalled from the store first, so a
    /// model that leaves a signal untouched publishes the configured
    /// initial value back unchanged.
    pub fn create_models(&mut self) -> BusResult<()> {
        for cm in &mut self.models {
            for mfc in &mut cm.mfcs {
                let channel = self.adapter.channel_mut(mfc.channel_index);
                transform::transform_to_model(mfc, &mut cm.desc.sv[mfc.sv_index], channel);
                if cm.gateway && !mfc.is_binary {
                    mfc.gateway_shadow
                        .copy_from_slice(cm.desc.sv[mfc.sv_index].scalars());
                }
            }
            cm.model
                .create(&mut cm.desc)
                .map_err(|e| BusError::model(&cm.name, e.to_string()))?;
            for mfc in &mut cm.mfcs {
                let channel = self.adapter.channel_mut(mfc.channel_index);
                transform::transform_from_model(mfc, &mut cm.desc.sv[mfc.sv_index], channel);
            }
        }
        Ok(())
    }

    /// Register every model with the bus (uids assigned here).
    pub fn register_models(&mut self) -> BusResult<()> {
        for i in 0..self.models.len() {
            self.adapter.register(self.models[i].uid)?;
        }
        Ok(())
    }

    /// One sub-step of one model: the ready/start handshake around the
    /// transform-step-transform sequence.
    pub fn step_model_cycle(&mut self, idx: usize) -> BusResult<()> {
        let cm = &mut self.models[idx];
        let uid = cm.uid;

        if cm.gateway {
            // Publish host-written values ahead of the handshake; only
            // signals that moved since the last marshal are published, so
            // a quiet gateway never regresses the store.
            for mfc in &mut cm.mfcs {
                let channel = self.adapter.channel_mut(mfc.channel_index);
                gateway_publish(mfc, &mut cm.desc.sv[mfc.sv_index], channel);
            }
        }

        self.adapter.ready(uid)?;
        let stop_time = self.adapter.start(uid)?;

        let cm = &mut self.models[idx];
        for mfc in &mut cm.mfcs {
            let channel = self.adapter.channel_mut(mfc.channel_index);
            transform::transform_to_model(mfc, &mut cm.desc.sv[mfc.sv_index], channel);
            if cm.gateway && !mfc.is_binary {
                mfc.gateway_shadow
                    .copy_from_slice(cm.desc.sv[mfc.sv_index].scalars());
            }
        }

        let mut model_time = self.adapter.model(uid)?.model_time;
        if let Err(e) = cm.model.step(&mut cm.desc, &mut model_time, stop_time) {
            let reason = e.to_string();
            cm.model.destroy(&mut cm.desc);
            return Err(BusError::model(&cm.name, reason));
        }

        if !cm.gateway {
            for mfc in &mut cm.mfcs {
                let channel = self.adapter.channel_mut(mfc.channel_index);
                transform::transform_from_model(mfc, &mut cm.desc.sv[mfc.sv_index], channel);
            }
        }

        self.adapter.advance_model_time(uid, model_time)?;
        Ok(())
    }

    /// One bus cycle: every model advances one sub-step, in instance
    /// order.
    pub fn step_cycle(&mut self) -> BusResult<()> {
        for idx in 0..self.models.len() {
            self.step_model_cycle(idx)?;
        }
        self.commit_all_channels();
        Ok(())
    }

    /// Cycle-boundary commit: after the last model of a cycle has
    /// published, no scalar delta stays pending.
    pub fn commit_all_channels(&mut self) {
        for cm in &self.models {
            for mfc in &cm.mfcs {
                self.adapter.channel_mut(mfc.channel_index).commit_scalars();
            }
        }
    }

    /// Exit every model: destroy the model code, then leave the bus.
    pub fn exit(&mut self) -> BusResult<()> {
        for idx in 0..self.models.len() {
            let cm = &mut self.models[idx];
            cm.model.destroy(&mut cm.desc);
            self.adapter.exit(self.models[idx].uid)?;
        }
        Ok(())
    }
}

/// Publish host-written gateway values: scalars that differ from the last
/// marshalled snapshot go through the inverse transform into the pending
/// `final`; a non-empty binary buffer replaces the store payload.
fn gateway_publish(
    mfc: &mut ModelFunctionChannel,
    sv: &mut SignalVector,
    channel: &mut Channel,
) {
    mfc.refresh_signal_map(channel);
    if mfc.is_binary {
        for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
            if sv.length(i) > 0 {
                let store = &mut channel.get_mut(slot).binary;
                store.clear();
                store.extend_from_slice(sv.read(i));
            }
        }
        return;
    }
    for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
        let value = sv.scalars()[i];
        if value == mfc.gateway_shadow[i] {
            continue;
        }
        let t = mfc.transforms.as_ref().map(|ts| ts[i]);
        channel.get_mut(slot).final_value = match t {
            Some(t) if t.factor != 0.0 => (value - t.offset) / t.factor,
            _ => value,
        };
    }
}
