// CoBus - Cosimulation Signal Bus
// Copyright (C) 2026 CoBus Team
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::signal::stream::BinarySignalStream;
use crate::{BusError, BusResult};

/// A parsed MIME type: essence plus `key=value` parameters, as used to
/// select and configure a codec (e.g.
/// `application/x-cobus-frame; bus=can; node_id=2`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimeType {
    pub essence: String,
    pub params: Vec<(String, String)>,
}

impl MimeType {
    pub fn parse(text: &str) -> Self {
        let mut parts = text.split(';');
        let essence = parts.next().unwrap_or("").trim().to_string();
        let params = parts
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect();
        Self { essence, params }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A network codec attached to a binary signal. The core routes frames
/// through this interface and otherwise treats the handle as opaque; the
/// frame grammar belongs to the codec implementation.
///
/// A consumer may reconfigure a codec at runtime (e.g. set `node_id` for
/// RX filtering) and read the active configuration back via `stat`.
pub trait Codec: std::fmt::Debug {
    /// Read the next frame from the stream; `None` at end of stream.
    fn read(&mut self, stream: &mut BinarySignalStream) -> BusResult<Option<Vec<u8>>>;

    /// Stage a frame for transmission. Returns the frame length.
    fn write(&mut self, stream: &mut BinarySignalStream, frame: &[u8]) -> BusResult<usize>;

    /// Emit staged frames to the stream.
    fn flush(&mut self, stream: &mut BinarySignalStream) -> BusResult<()>;

    /// Drop staged frames and restart the stream message.
    fn truncate(&mut self, stream: &mut BinarySignalStream) -> BusResult<()>;

    fn config(&mut self, key: &str, value: &str);

    fn stat(&self, key: &str) -> Option<String>;
}

type CodecFactory = Box<dyn Fn(&MimeType) -> Box<dyn Codec>>;

/// Codec factories keyed by MIME essence. The registry ships empty; frame
/// and PDU grammars are provided by the embedding application.
#[derive(Default)]
pub struct CodecRegistry {
    factories: Vec<(String, CodecFactory)>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field(
                "essences",
                &self.factories.iter().map(|(e, _)| e).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, essence: &str, factory: F)
    where
        F: Fn(&MimeType) -> Box<dyn Codec> + 'static,
    {
        self.factories
            .push((essence.to_string(), Box::new(factory)));
    }

    pub fn open(&self, mime_type: &str) -> BusResult<Box<dyn Codec>> {
        let mt = MimeType::parse(mime_type);
        let factory = self
            .factories
            .iter()
            .find(|(e, _)| *e == mt.essence)
            .map(|(_, f)| f)
            .ok_or_else(|| BusError::Config(format!("No codec for MIME type '{}'", mime_type)))?;
        Ok(factory(&mt))
    }
}
