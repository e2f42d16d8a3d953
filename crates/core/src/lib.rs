pub mod adapter;
pub mod codec;
pub mod controller;
pub mod endpoint;
pub mod runtime;
pub mod signal;

mod tests;

pub use signal::vector::{ModelSignalIndex, SignalVector};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Model '{model}' failed: {reason}")]
    Model { model: String, reason: String },
    #[error("Gateway behind: requested {requested}, adapter at {model_time}")]
    GatewayBehind { requested: f64, model_time: f64 },
    #[error("Operation cancelled")]
    Cancelled,
}

pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    pub fn model(model: impl Into<String>, reason: impl Into<String>) -> Self {
        BusError::Model {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

/// Identity of a model instance, handed to the model code.
#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
    pub uid: u32,
    pub name: String,
}

/// The model-facing descriptor: instance identity plus the configured
/// signal vectors. Models mutate the vectors in `step`; the controller
/// marshals them against the adapter's channel store around each call.
#[derive(Debug, Default)]
pub struct ModelDesc {
    pub info: ModelInfo,
    pub sv: Vec<SignalVector>,
}

impl ModelDesc {
    /// Locate a signal (or a whole vector when `signal` is None) by name.
    /// O(1) per lookup after the first: vectors carry their own name index.
    pub fn index(&self, vector: &str, signal: Option<&str>) -> Option<ModelSignalIndex> {
        let (vi, sv) = self
            .sv
            .iter()
            .enumerate()
            .find(|(_, sv)| sv.name == vector || sv.channel_name == vector)?;
        match signal {
            None => Some(ModelSignalIndex {
                vector: vi,
                signal: None,
            }),
            Some(name) => {
                let si = sv.signal_index(name)?;
                Some(ModelSignalIndex {
                    vector: vi,
                    signal: Some(si),
                })
            }
        }
    }

    pub fn scalar(&self, idx: &ModelSignalIndex) -> Option<f64> {
        let sv = self.sv.get(idx.vector)?;
        sv.scalar(idx.signal?)
    }

    pub fn scalar_mut(&mut self, idx: &ModelSignalIndex) -> Option<&mut f64> {
        let sv = self.sv.get_mut(idx.vector)?;
        sv.scalar_mut(idx.signal?)
    }
}

/// The model interface. `step` is mandatory and must leave
/// `*model_time == stop_time` on success; `create` and `destroy` have
/// identity defaults.
pub trait Model {
    fn create(&mut self, _desc: &mut ModelDesc) -> BusResult<()> {
        Ok(())
    }

    fn step(&mut self, desc: &mut ModelDesc, model_time: &mut f64, stop_time: f64)
        -> BusResult<()>;

    fn destroy(&mut self, _desc: &mut ModelDesc) {}
}
