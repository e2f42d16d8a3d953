use crate::codec::{Codec, CodecRegistry};
use crate::signal::stream::BinarySignalStream;
use crate::{BusError, BusResult};
use std::collections::HashMap;

/// Result of a `ModelDesc::index` lookup. When `signal` is None only the
/// vector is resolved, so the caller can iterate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSignalIndex {
    pub vector: usize,
    pub signal: Option<usize>,
}

/// The model-facing view of one configured channel: ordered signal names
/// and either scalar values or growable binary buffers, plus the behavior
/// surface models use (append/reset/release/annotation/codec).
#[derive(Debug, Default)]
pub struct SignalVector {
    /// Model-side vector name (the channel alias, or the channel name).
    pub name: String,
    /// The adapter channel this vector maps onto.
    pub channel_name: String,
    pub function_name: String,
    pub is_binary: bool,

    signals: Vec<String>,
    index: HashMap<String, usize>,

    scalar: Vec<f64>,
    binary: Vec<Vec<u8>>,
    pub(crate) stream_pos: Vec<usize>,
    pub(crate) reset_called: Vec<bool>,
    mime_type: Vec<Option<String>>,
    annotations: Vec<HashMap<String, String>>,
    codecs: Vec<Option<Box<dyn Codec>>>,
}

impl SignalVector {
    pub fn new(
        name: &str,
        channel_name: &str,
        function_name: &str,
        is_binary: bool,
        signals: Vec<String>,
    ) -> Self {
        let count = signals.len();
        let index = signals
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self {
            name: name.to_string(),
            channel_name: channel_name.to_string(),
            function_name: function_name.to_string(),
            is_binary,
            signals,
            index,
            scalar: vec![0.0; count],
            binary: vec![Vec::new(); count],
            stream_pos: vec![0; count],
            reset_called: vec![false; count],
            mime_type: vec![None; count],
            annotations: vec![HashMap::new(); count],
            codecs: std::iter::repeat_with(|| None).take(count).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.signals.len()
    }

    pub fn signal_name(&self, i: usize) -> &str {
        &self.signals[i]
    }

    pub fn signal_names(&self) -> &[String] {
        &self.signals
    }

    pub fn signal_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn set_annotations(&mut self, i: usize, annotations: HashMap<String, String>) {
        self.mime_type[i] = annotations.get("mime_type").cloned();
        self.annotations[i] = annotations;
    }

    /* Scalar access. */

    pub fn scalar(&self, i: usize) -> Option<f64> {
        if self.is_binary {
            return None;
        }
        self.scalar.get(i).copied()
    }

    pub fn scalar_mut(&mut self, i: usize) -> Option<&mut f64> {
        if self.is_binary {
            return None;
        }
        self.scalar.get_mut(i)
    }

    pub fn scalars(&self) -> &[f64] {
        &self.scalar
    }

    pub fn scalars_mut(&mut self) -> &mut [f64] {
        &mut self.scalar
    }

    /* Binary access. */

    pub fn read(&self, i: usize) -> &[u8] {
        &self.binary[i]
    }

    pub fn length(&self, i: usize) -> usize {
        self.binary[i].len()
    }

    pub fn buffer_size(&self, i: usize) -> usize {
        self.binary[i].capacity()
    }

    /// Append bytes, growing the buffer geometrically as needed.
    pub fn append(&mut self, i: usize, data: &[u8]) {
        let buf = &mut self.binary[i];
        if buf.capacity() < buf.len() + data.len() {
            let want = (buf.len() + data.len()).next_power_of_two();
            buf.reserve(want - buf.len());
        }
        buf.extend_from_slice(data);
    }

    /// Truncate to empty, retaining the buffer. Arms the one-shot
    /// `reset_called` flag observed by codec stream seek semantics.
    pub fn reset(&mut self, i: usize) {
        self.binary[i].clear();
        self.stream_pos[i] = 0;
        self.reset_called[i] = true;
    }

    /// Free the buffer entirely.
    pub fn release(&mut self, i: usize) {
        self.binary[i] = Vec::new();
        self.stream_pos[i] = 0;
    }

    /// One-shot observer of the reset flag.
    pub fn take_reset_called(&mut self, i: usize) -> bool {
        std::mem::take(&mut self.reset_called[i])
    }

    /// Replace the buffer content (marshalling entry point).
    pub(crate) fn set_binary(&mut self, i: usize, data: &[u8]) {
        let buf = &mut self.binary[i];
        buf.clear();
        buf.extend_from_slice(data);
    }

    /* Annotations. */

    pub fn annotation(&self, i: usize, key: &str) -> Option<&str> {
        self.annotations[i].get(key).map(String::as_str)
    }

    pub fn mime_type(&self, i: usize) -> Option<&str> {
        self.mime_type[i].as_deref()
    }

    /* Codec attachment. */

    /// Lazily construct the codec attached to a binary signal from its
    /// `mime_type` annotation. No-op when already constructed.
    pub fn ensure_codec(&mut self, i: usize, registry: &CodecRegistry) -> BusResult<()> {
        if !self.is_binary {
            return Err(BusError::Config(format!(
                "Signal '{}' is not binary, no codec possible",
                self.signals[i]
            )));
        }
        if self.codecs[i].is_some() {
            return Ok(());
        }
        let mime_type = self.mime_type[i].clone().ok_or_else(|| {
            BusError::Config(format!("Signal '{}' has no mime_type", self.signals[i]))
        })?;
        self.codecs[i] = Some(registry.open(&mime_type)?);
        Ok(())
    }

    /// The attached codec, for runtime configuration (`config`/`stat`).
    /// None for scalar signals or before `ensure_codec`.
    pub fn codec(&mut self, i: usize) -> Option<&mut (dyn Codec + '_)> {
        match self.codecs.get_mut(i) {
            Some(Some(c)) => Some(c.as_mut()),
            _ => None,
        }
    }

    pub fn stream(&mut self, i: usize) -> BinarySignalStream<'_> {
        BinarySignalStream::new(self, i)
    }

    pub fn codec_read(&mut self, i: usize) -> BusResult<Option<Vec<u8>>> {
        self.with_codec(i, |codec, stream| codec.read(stream))
    }

    pub fn codec_write(&mut self, i: usize, frame: &[u8]) -> BusResult<usize> {
        self.with_codec(i, |codec, stream| codec.write(stream, frame))
    }

    pub fn codec_flush(&mut self, i: usize) -> BusResult<()> {
        self.with_codec(i, |codec, stream| codec.flush(stream))
    }

    pub fn codec_truncate(&mut self, i: usize) -> BusResult<()> {
        self.with_codec(i, |codec, stream| codec.truncate(stream))
    }

    fn with_codec<T>(
        &mut self,
        i: usize,
        f: impl FnOnce(&mut dyn Codec, &mut BinarySignalStream) -> BusResult<T>,
    ) -> BusResult<T> {
        let mut codec = self.codecs[i].take().ok_or_else(|| {
            BusError::Config(format!("Signal '{}' has no attached codec", self.signals[i]))
        })?;
        let result = {
            let mut stream = BinarySignalStream::new(self, i);
            f(codec.as_mut(), &mut stream)
        };
        self.codecs[i] = Some(codec);
        result
    }

    pub(crate) fn binary_mut(&mut self, i: usize) -> &mut Vec<u8> {
        &mut self.binary[i]
    }
}
