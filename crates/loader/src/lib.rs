use anyhow::{Context, Result};
use cobus_config::InstanceSpec;
use cobus_core::runtime::ModelResolver;
use cobus_core::{BusError, BusResult, Model, ModelDesc, ModelSignalIndex};
use libloading::Library;
use std::path::Path;
use tracing::{debug, info};

pub const MODEL_CREATE_FUNC: &[u8] = b"model_create";
pub const MODEL_STEP_FUNC: &[u8] = b"model_step";
pub const MODEL_DESTROY_FUNC: &[u8] = b"model_destroy";
/* Legacy function-registration interface. */
pub const MODEL_SETUP_FUNC: &[u8] = b"model_setup";
pub const MODEL_EXIT_FUNC: &[u8] = b"model_exit";

type ModelCreateFn = unsafe extern "Rust" fn(&mut ModelDesc) -> i32;
type ModelStepFn = unsafe extern "Rust" fn(&mut ModelDesc, &mut f64, f64) -> i32;
type ModelDestroyFn = unsafe extern "Rust" fn(&mut ModelDesc);
type ModelSetupFn = unsafe extern "Rust" fn(&mut ModelDesc) -> i32;
type ModelExitFn = unsafe extern "Rust" fn(&mut ModelDesc) -> i32;

/// A dynamically loaded user model. The library handle is held for the
/// model's lifetime; symbols are bound once at load.
pub struct DynlibModel {
    _lib: Library,
    create_fn: Option<ModelCreateFn>,
    step_fn: ModelStepFn,
    destroy_fn: Option<ModelDestroyFn>,
    setup_fn: Option<ModelSetupFn>,
    exit_fn: Option<ModelExitFn>,
}

/// Load a model library and bind the model interface. `model_step` is
/// mandatory; the other symbols are optional.
pub fn load_model(path: &Path) -> Result<DynlibModel> {
    info!("Loading dynamic model: {:?} ...", path);
    let lib = unsafe { Library::new(path) }
        .with_context(|| format!("Failed to load model library: {:?}", path))?;

    let step_fn = unsafe {
        lib.get::<ModelStepFn>(MODEL_STEP_FUNC)
            .map(|s| *s)
            .with_context(|| format!("Mandatory symbol 'model_step' missing in {:?}", path))?
    };
    let create_fn = unsafe { lib.get::<ModelCreateFn>(MODEL_CREATE_FUNC).map(|s| *s).ok() };
    let destroy_fn = unsafe {
        lib.get::<ModelDestroyFn>(MODEL_DESTROY_FUNC)
            .map(|s| *s)
            .ok()
    };
    let setup_fn = unsafe { lib.get::<ModelSetupFn>(MODEL_SETUP_FUNC).map(|s| *s).ok() };
    let exit_fn = unsafe { lib.get::<ModelExitFn>(MODEL_EXIT_FUNC).map(|s| *s).ok() };
    debug!(
        "Symbols bound: create={}, destroy={}, setup={}, exit={}",
        create_fn.is_some(),
        destroy_fn.is_some(),
        setup_fn.is_some(),
        exit_fn.is_some()
    );

    Ok(DynlibModel {
        _lib: lib,
        create_fn,
        step_fn,
        destroy_fn,
        setup_fn,
        exit_fn,
    })
}

impl Model for DynlibModel {
    fn create(&mut self, desc: &mut ModelDesc) -> BusResult<()> {
        if let Some(setup) = self.setup_fn {
            let rc = unsafe { setup(desc) };
            if rc != 0 {
                return Err(BusError::model(
                    &desc.info.name,
                    format!("model_setup returned {}", rc),
                ));
            }
        }
        if let Some(create) = self.create_fn {
            let rc = unsafe { create(desc) };
            if rc != 0 {
                return Err(BusError::model(
                    &desc.info.name,
                    format!("model_create returned {}", rc),
                ));
            }
        }
        Ok(())
    }

    fn step(
        &mut self,
        desc: &mut ModelDesc,
        model_time: &mut f64,
        stop_time: f64,
    ) -> BusResult<()> {
        let rc = unsafe { (self.step_fn)(desc, model_time, stop_time) };
        if rc != 0 {
            return Err(BusError::model(
                &desc.info.name,
                format!("model_step returned {}", rc),
            ));
        }
        Ok(())
    }

    fn destroy(&mut self, desc: &mut ModelDesc) {
        if let Some(destroy) = self.destroy_fn {
            unsafe { destroy(desc) };
        }
        if let Some(exit) = self.exit_fn {
            unsafe {
                exit(desc);
            }
        }
    }
}

/*
Built-in models
---------------
*/

/// The built-in counter: increments a scalar named "counter" each step,
/// seeded from its `initial_value` annotation.
#[derive(Debug, Default)]
pub struct CounterModel {
    idx: Option<ModelSignalIndex>,
}

impl Model for CounterModel {
    fn create(&mut self, desc: &mut ModelDesc) -> BusResult<()> {
        for (vi, sv) in desc.sv.iter().enumerate() {
            if let Some(si) = sv.signal_index("counter") {
                self.idx = Some(ModelSignalIndex {
                    vector: vi,
                    signal: Some(si),
                });
                break;
            }
        }
        let idx = self.idx.ok_or_else(|| {
            BusError::Config("Built-in counter: no signal named 'counter'".to_string())
        })?;
        if let Some(text) = desc.sv[idx.vector].annotation(idx.signal.unwrap(), "initial_value") {
            if let Ok(v) = text.parse::<f64>() {
                *desc.scalar_mut(&idx).unwrap() = v;
            }
        }
        Ok(())
    }

    fn step(
        &mut self,
        desc: &mut ModelDesc,
        model_time: &mut f64,
        stop_time: f64,
    ) -> BusResult<()> {
        let idx = self.idx.unwrap();
        *desc.scalar_mut(&idx).unwrap() += 1.0;
        *model_time = stop_time;
        Ok(())
    }
}

/// The gateway identity model: the controller handles the marshalling,
/// the model itself only advances time.
#[derive(Debug, Default)]
pub struct GatewayModel;

impl Model for GatewayModel {
    fn step(
        &mut self,
        _desc: &mut ModelDesc,
        model_time: &mut f64,
        stop_time: f64,
    ) -> BusResult<()> {
        *model_time = stop_time;
        Ok(())
    }
}

/// Resolve a configured model definition: a dynlib path loads the user
/// library, otherwise the built-in registry applies.
#[derive(Debug, Default)]
pub struct DefaultResolver;

impl ModelResolver for DefaultResolver {
    fn resolve(&self, instance: &InstanceSpec) -> BusResult<Box<dyn Model>> {
        if let Some(path) = &instance.model.dynlib {
            let model = load_model(path)
                .map_err(|e| BusError::Config(format!("{:#}", e)))?;
            return Ok(Box::new(model));
        }
        if instance.model.gateway {
            return Ok(Box::<GatewayModel>::default());
        }
        match instance.model.kind.as_deref() {
            Some("gateway") => Ok(Box::<GatewayModel>::default()),
            Some("counter") => Ok(Box::<CounterModel>::default()),
            Some(kind @ ("mcl" | "lua")) => Err(BusError::Config(format!(
                "Model kind '{}' requires an extension runtime that is not linked in",
                kind
            ))),
            Some(other) => Err(BusError::Config(format!("Unknown model kind '{}'", other))),
            None => Err(BusError::Config(format!(
                "Model '{}' declares neither a dynlib nor a kind",
                instance.model.name
            ))),
        }
    }
}
