pub mod gateway;

use crate::adapter::Adapter;
use crate::codec::CodecRegistry;
use crate::controller::Controller;
use crate::endpoint::loopback::LoopbackHub;
use crate::endpoint::Endpoint;
use crate::signal::SignalValue;
use crate::{BusResult, Model};
use cobus_config::{InstanceSpec, SimulationSpec};

/// Resolves a configured model definition to runnable model code. The
/// dynamic-library loader implements this; tests inject closures.
pub trait ModelResolver {
    fn resolve(&self, instance: &InstanceSpec) -> BusResult<Box<dyn Model>>;
}

impl<F> ModelResolver for F
where
    F: Fn(&InstanceSpec) -> BusResult<Box<dyn Model>>,
{
    fn resolve(&self, instance: &InstanceSpec) -> BusResult<Box<dyn Model>> {
        self(instance)
    }
}

/// The in-process simulation driver: composes the loopback endpoint,
/// adapter and controller, runs the register handshake, and steps models
/// with Kahan-summed time progression until the end time.
pub struct Runtime {
    pub controller: Controller,
    pub sim: SimulationSpec,
    pub model_time: f64,
    time_correction: f64,
}

impl Runtime {
    pub fn new(sim: SimulationSpec, resolver: &dyn ModelResolver) -> BusResult<Self> {
        Self::with_codecs(sim, resolver, CodecRegistry::new())
    }

    pub fn with_codecs(
        sim: SimulationSpec,
        resolver: &dyn ModelResolver,
        codec_registry: CodecRegistry,
    ) -> BusResult<Self> {
        let hub = LoopbackHub::new();
        let endpoint = Endpoint::Loopback(hub.endpoint(sim.uid, false));
        let mut adapter = Adapter::new(endpoint);
        adapter.connect(sim.step_size)?;

        let mut controller = Controller::new(adapter, sim.sequential_cosim, codec_registry);
        for instance in &sim.instances {
            tracing::info!("Create model instance: {} (uid={})", instance.name, instance.uid);
            let model = resolver.resolve(instance)?;
            controller.configure_instance(instance, model)?;
        }
        controller.create_models()?;
        controller.register_models()?;

        Ok(Self {
            controller,
            sim,
            model_time: 0.0,
            time_correction: 0.0,
        })
    }

    /// Advance the simulation to `stop_time`, sub-stepping by the
    /// simulation step size with Kahan summation, never overshooting
    /// beyond `step_size / 100`. On return `*model_time` snaps to the
    /// caller's stop time. A failing sub-step returns immediately with
    /// the last-good model time preserved in `self.model_time`.
    pub fn step(&mut self, model_time: &mut f64, stop_time: f64) -> BusResult<()> {
        let epsilon = self.sim.step_size * 0.01;

        if self.sim.sequential_cosim {
            // Step each instance fully to the target before the next.
            for idx in 0..self.controller.models.len() {
                loop {
                    let uid = self.controller.models[idx].uid;
                    let at = self.controller.adapter.model(uid)?.model_time;
                    if at >= stop_time {
                        break;
                    }
                    if at + self.sim.step_size > stop_time + epsilon {
                        break;
                    }
                    self.controller.step_model_cycle(idx)?;
                }
            }
            self.controller.commit_all_channels();
            self.model_time = stop_time;
            *model_time = stop_time;
            return Ok(());
        }

        loop {
            if self.model_time >= stop_time {
                break;
            }
            let y = self.sim.step_size - self.time_correction;
            let t = self.model_time + y;
            if t > stop_time + epsilon {
                break;
            }
            tracing::trace!(
                "runtime step: model_time={}, stop_time={}",
                self.model_time,
                t
            );
            self.controller.step_cycle()?;
            // Only a committed sub-step updates the correction term, so
            // an overshoot break (or a failing cycle) leaves the Kahan
            // state consistent for the next call.
            self.time_correction = (t - self.model_time) - y;
            self.model_time = t;
        }
        *model_time = stop_time;
        Ok(())
    }

    /// Step until the configured end time.
    pub fn run_to_end(&mut self) -> BusResult<()> {
        let end_time = self.sim.end_time;
        let mut time = self.model_time;
        self.step(&mut time, end_time)
    }

    /// Exit every model and leave the bus.
    pub fn exit(&mut self) -> BusResult<()> {
        self.controller.exit()?;
        self.controller.adapter.endpoint.disconnect();
        Ok(())
    }

    pub fn interrupt(&mut self) {
        self.controller.adapter.interrupt();
    }

    /// Introspection: the store record for a signal, by channel and name.
    pub fn signal_value(&self, channel: &str, signal: &str) -> Option<&SignalValue> {
        let ch = self.controller.adapter.channel_by_name(channel)?;
        let slot = ch.find(signal)?;
        Some(ch.get(slot))
    }
}

