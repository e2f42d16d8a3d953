use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const TRANSPORT_LOOPBACK: &str = "loopback";
pub const TRANSPORT_MESSAGE: &str = "message";

pub const DEFAULT_TIMEOUT: f64 = 60.0;
pub const DEFAULT_STEP_SIZE: f64 = 0.005;
pub const DEFAULT_END_TIME: f64 = 3600.0;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No Stack document found in the provided YAML files")]
    MissingStack,
    #[error("Model document '{0}' not found")]
    MissingModel(String),
    #[error("No SignalGroup document matches channel '{0}'")]
    MissingSignalGroup(String),
    #[error("Model instance '{0}' not found in the Stack")]
    MissingInstance(String),
    #[error("Unknown vector_type '{0}' (expected 'scalar' or 'binary')")]
    BadVectorType(String),
}

/*
YAML document schema
--------------------
Stack, Model and SignalGroup documents may be spread over several files;
each file may hold a multi-document stream. Documents are selected by the
`kind` field.
*/

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind")]
pub enum Document {
    Stack(StackDoc),
    Model(ModelDoc),
    SignalGroup(SignalGroupDoc),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StackDoc {
    pub metadata: Metadata,
    pub spec: StackSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StackSpec {
    #[serde(default)]
    pub connection: ConnectionSpec,
    #[serde(default)]
    pub runtime: StackRuntime,
    pub models: Vec<StackModel>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionSpec {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

fn default_transport() -> String {
    TRANSPORT_LOOPBACK.to_string()
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            uri: String::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StackRuntime {
    #[serde(default)]
    pub sequential_cosim: bool,
    #[serde(default)]
    pub stepsize: Option<f64>,
    #[serde(default)]
    pub endtime: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StackModel {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    pub model: String,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, rename = "expectedModelCount")]
    pub expected_model_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelDoc {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ModelSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModelSpec {
    #[serde(default)]
    pub runtime: ModelRuntime,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ModelRuntime {
    /// Path to a dynamically loaded model library.
    #[serde(default)]
    pub dynlib: Option<DynlibSpec>,
    /// Built-in model kind ("counter", "gateway", ...).
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub gateway: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DynlibSpec {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalGroupDoc {
    pub metadata: Metadata,
    pub spec: SignalGroupSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalGroupSpec {
    pub signals: Vec<SignalSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalSpec {
    pub signal: String,
    #[serde(default)]
    pub annotations: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
pub struct LinearTransform {
    /// Disabled when factor == 0 (the default).
    #[serde(default)]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorType {
    #[default]
    Scalar,
    Binary,
}

/*
Resolved simulation configuration
---------------------------------
*/

#[derive(Debug, Clone)]
pub struct SimulationSpec {
    pub transport: String,
    pub uri: String,
    pub uid: u32,
    pub timeout: f64,
    pub step_size: f64,
    pub end_time: f64,
    pub mode_loopback: bool,
    pub sequential_cosim: bool,
    pub instances: Vec<InstanceSpec>,
}

#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub uid: u32,
    pub name: String,
    pub model: ModelDefinition,
    pub channels: Vec<InstanceChannel>,
}

#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub name: String,
    pub dynlib: Option<PathBuf>,
    pub kind: Option<String>,
    pub gateway: bool,
}

#[derive(Debug, Clone)]
pub struct InstanceChannel {
    pub name: String,
    pub alias: Option<String>,
    pub expected_model_count: u32,
    pub vector_type: VectorType,
    pub signals: Vec<SignalConfig>,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub name: String,
    pub annotations: HashMap<String, serde_yaml::Value>,
}

impl SignalConfig {
    pub fn annotation(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.annotations.get(key)
    }

    pub fn annotation_str(&self, key: &str) -> Option<String> {
        match self.annotations.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn initial_value(&self) -> Option<f64> {
        self.annotations.get("initial_value")?.as_f64()
    }

    pub fn mime_type(&self) -> Option<String> {
        self.annotation_str("mime_type")
    }

    pub fn transform(&self) -> Option<LinearTransform> {
        let v = self.annotations.get("transform")?;
        let t: TransformAnnotation = serde_yaml::from_value(v.clone()).ok()?;
        Some(t.linear)
    }
}

#[derive(Debug, Deserialize)]
struct TransformAnnotation {
    #[serde(default)]
    linear: LinearTransform,
}

/*
Loading and resolution
----------------------
*/

/// All documents parsed from a set of YAML files, order preserved.
#[derive(Debug, Default, Clone)]
pub struct DocumentSet {
    pub documents: Vec<Document>,
}

impl DocumentSet {
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut set = DocumentSet::default();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read YAML file: {:?}", path))?;
            set.parse_str(&text)
                .with_context(|| format!("Failed to parse YAML file: {:?}", path))?;
        }
        Ok(set)
    }

    pub fn parse_str(&mut self, text: &str) -> Result<()> {
        for de in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(de).context("Invalid YAML document")?;
            if value.is_null() {
                continue;
            }
            let doc: Document =
                serde_yaml::from_value(value).context("Unrecognised document schema")?;
            self.documents.push(doc);
        }
        Ok(())
    }

    pub fn stack(&self) -> Option<&StackDoc> {
        self.documents.iter().find_map(|d| match d {
            Document::Stack(s) => Some(s),
            _ => None,
        })
    }

    pub fn model(&self, name: &str) -> Option<&ModelDoc> {
        self.documents.iter().find_map(|d| match d {
            Document::Model(m) if m.metadata.name == name => Some(m),
            _ => None,
        })
    }

    /// Locate the SignalGroup for a channel. A group matches when its
    /// `channel` label, or failing that its name, equals the channel name.
    pub fn signal_group(&self, channel: &str) -> Option<&SignalGroupDoc> {
        let by_label = self.documents.iter().find_map(|d| match d {
            Document::SignalGroup(g)
                if g.metadata.labels.get("channel").map(String::as_str) == Some(channel) =>
            {
                Some(g)
            }
            _ => None,
        });
        by_label.or_else(|| {
            self.documents.iter().find_map(|d| match d {
                Document::SignalGroup(g) if g.metadata.name == channel => Some(g),
                _ => None,
            })
        })
    }
}

impl SignalGroupDoc {
    pub fn vector_type(&self) -> Result<VectorType, ResolveError> {
        match self.metadata.annotations.get("vector_type") {
            None => Ok(VectorType::Scalar),
            Some(serde_yaml::Value::String(s)) => match s.as_str() {
                "scalar" | "vector_double" => Ok(VectorType::Scalar),
                "binary" | "vector_binary" => Ok(VectorType::Binary),
                other => Err(ResolveError::BadVectorType(other.to_string())),
            },
            Some(other) => Err(ResolveError::BadVectorType(format!("{:?}", other))),
        }
    }
}

/// Overrides taken from the command line; `None` leaves the Stack value.
#[derive(Debug, Default, Clone)]
pub struct SimulationOverrides {
    pub transport: Option<String>,
    pub uri: Option<String>,
    pub uid: Option<u32>,
    pub timeout: Option<f64>,
    pub step_size: Option<f64>,
    pub end_time: Option<f64>,
    /// Restrict the instance list to these names (stacked model selection).
    pub names: Vec<String>,
}

/// Assemble a SimulationSpec from parsed documents plus CLI overrides.
pub fn resolve_simulation(
    docs: &DocumentSet,
    overrides: &SimulationOverrides,
) -> Result<SimulationSpec> {
    let stack = docs.stack().ok_or(ResolveError::MissingStack)?;

    let transport = overrides
        .transport
        .clone()
        .unwrap_or_else(|| stack.spec.connection.transport.clone());
    let uri = overrides
        .uri
        .clone()
        .unwrap_or_else(|| stack.spec.connection.uri.clone());
    let timeout = overrides.timeout.unwrap_or(stack.spec.connection.timeout);
    let step_size = overrides
        .step_size
        .or(stack.spec.runtime.stepsize)
        .unwrap_or(DEFAULT_STEP_SIZE);
    let end_time = overrides
        .end_time
        .or(stack.spec.runtime.endtime)
        .unwrap_or(DEFAULT_END_TIME);

    let mut instances = Vec::new();
    for sm in &stack.spec.models {
        if !overrides.names.is_empty() && !overrides.names.iter().any(|n| n == &sm.name) {
            continue;
        }
        let model_doc = docs
            .model(&sm.model)
            .ok_or_else(|| ResolveError::MissingModel(sm.model.clone()))?;
        let model = ModelDefinition {
            name: model_doc.metadata.name.clone(),
            dynlib: model_doc.spec.runtime.dynlib.as_ref().map(|d| d.path.clone()),
            kind: model_doc.spec.runtime.kind.clone(),
            gateway: model_doc.spec.runtime.gateway,
        };

        let mut channels = Vec::new();
        for ch in &sm.channels {
            let group = docs
                .signal_group(&ch.name)
                .ok_or_else(|| ResolveError::MissingSignalGroup(ch.name.clone()))?;
            let vector_type = group.vector_type()?;
            let signals = group
                .spec
                .signals
                .iter()
                .map(|s| SignalConfig {
                    name: s.signal.clone(),
                    annotations: s.annotations.clone(),
                })
                .collect();
            channels.push(InstanceChannel {
                name: ch.name.clone(),
                alias: ch.alias.clone(),
                expected_model_count: ch.expected_model_count.unwrap_or(1),
                vector_type,
                signals,
            });
        }

        instances.push(InstanceSpec {
            uid: sm.uid.unwrap_or_else(|| fnv1a_hash(&sm.name)),
            name: sm.name.clone(),
            model,
            channels,
        });
    }

    if !overrides.names.is_empty() && instances.is_empty() {
        return Err(ResolveError::MissingInstance(overrides.names.join(";")).into());
    }

    Ok(SimulationSpec {
        mode_loopback: transport == TRANSPORT_LOOPBACK,
        transport,
        uri,
        uid: overrides.uid.unwrap_or(0),
        timeout,
        step_size,
        end_time,
        sequential_cosim: stack.spec.runtime.sequential_cosim,
        instances,
    })
}

// FNV-1a, used for defaulted model instance uids. Signal uids are hashed by
// the core at register time with the same function.
fn fnv1a_hash(key: &str) -> u32 {
    let mut h: u32 = 2166136261;
    for b in key.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(16777619);
    }
    h
}
