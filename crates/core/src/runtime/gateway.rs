use crate::runtime::{ModelResolver, Runtime};
use crate::signal::vector::SignalVector;
use crate::{BusError, BusResult};
use anyhow::Context;
use std::path::PathBuf;

/// Lets a foreign simulation loop drive the in-process simulation by
/// time. The gateway appears in the stack as a model instance (gateway
/// flag set); the host writes that instance's signal vectors, calls
/// `sync`, and reads the merged values back.
pub struct Gateway {
    runtime: Runtime,
    gw_index: usize,
    gw_uid: u32,
    /// Clock tolerance; the host clock is allowed to trail by this much.
    pub clock_epsilon: f64,
}

impl Gateway {
    /// Parse the YAML files, build the loopback runtime and locate the
    /// gateway instance by name.
    pub fn setup(
        name: &str,
        yaml_files: &[PathBuf],
        step_size: Option<f64>,
        end_time: Option<f64>,
        resolver: &dyn ModelResolver,
    ) -> anyhow::Result<Self> {
        let docs = cobus_config::DocumentSet::from_files(yaml_files)?;
        let overrides = cobus_config::SimulationOverrides {
            step_size,
            end_time,
            ..Default::default()
        };
        let sim = cobus_config::resolve_simulation(&docs, &overrides)?;
        let clock_epsilon = sim.step_size * 0.01;
        let runtime = Runtime::new(sim, resolver).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let gw_index = runtime
            .controller
            .model_index(name)
            .with_context(|| format!("Gateway instance '{}' not found in the Stack", name))?;
        if !runtime.controller.models[gw_index].gateway {
            anyhow::bail!("Model instance '{}' is not a gateway", name);
        }
        let gw_uid = runtime.controller.models[gw_index].uid;
        Ok(Self {
            runtime,
            gw_index,
            gw_uid,
            clock_epsilon,
        })
    }

    /// Synchronise the simulation with the host clock. Returns
    /// `GatewayBehind` when `time` trails the adapter's model time; the
    /// caller advances its clock and retries - this is a normal outcome,
    /// never fatal. Otherwise sub-steps until the gateway model reaches
    /// `time`.
    pub fn sync(&mut self, time: f64) -> BusResult<()> {
        let adjusted = time + self.clock_epsilon;
        let model_time = self.runtime.controller.adapter.model(self.gw_uid)?.model_time;
        if adjusted < model_time {
            return Err(BusError::GatewayBehind {
                requested: time,
                model_time,
            });
        }

        while self.runtime.controller.adapter.model(self.gw_uid)?.model_time <= adjusted {
            tracing::debug!(
                "Gateway steps the simulation; model at {}, target is {}",
                self.runtime.controller.adapter.model(self.gw_uid)?.model_time,
                adjusted
            );
            self.runtime.controller.step_cycle()?;
            self.runtime.model_time = self
                .runtime
                .controller
                .adapter
                .model(self.gw_uid)?
                .model_time;
        }
        Ok(())
    }

    /// The gateway instance's signal vectors, for host reads and writes.
    pub fn signal_vectors_mut(&mut self) -> &mut [SignalVector] {
        &mut self.runtime.controller.models[self.gw_index].desc.sv
    }

    pub fn signal_vectors(&self) -> &[SignalVector] {
        &self.runtime.controller.models[self.gw_index].desc.sv
    }

    pub fn model_time(&self) -> f64 {
        self.runtime
            .controller
            .adapter
            .model(self.gw_uid)
            .map(|m| m.model_time)
            .unwrap_or(0.0)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Terminate the gateway and the underlying simulation.
    pub fn exit(&mut self) -> BusResult<()> {
        self.runtime.exit()
    }
}
