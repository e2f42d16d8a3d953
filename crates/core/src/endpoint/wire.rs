use crate::signal::Channel;
use crate::{BusError, BusResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TAG_CHANNEL: [u8; 4] = *b"SBCH";
pub const TAG_NOTIFY: [u8; 4] = *b"SBNO";

/// One signal's entry in a delta.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaValue {
    Scalar(f64),
    Binary(Vec<u8>),
}

/// The minimal set of signal changes for one channel in one cycle:
/// parallel (uid, value) pairs.
pub type Delta = Vec<(u32, DeltaValue)>;

const VALUE_SCALAR: u8 = 0;
const VALUE_BINARY: u8 = 1;

/// A decoded datagram envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// None for notify (bus-control) messages.
    pub channel: Option<String>,
    pub payload: Bytes,
}

/*
Envelope
--------
Three concatenated fields: 4-byte tag (SBCH channel-bound, SBNO notify),
length-prefixed channel name (empty for SBNO), length-prefixed payload.
*/

pub fn encode_envelope(channel: Option<&str>, payload: &[u8]) -> Bytes {
    let name = channel.unwrap_or("");
    let mut buf = BytesMut::with_capacity(4 + 4 + name.len() + 4 + payload.len());
    if channel.is_some() {
        buf.put_slice(&TAG_CHANNEL);
    } else {
        buf.put_slice(&TAG_NOTIFY);
    }
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode_envelope(frame: &[u8]) -> BusResult<Envelope> {
    let mut buf = frame;
    if buf.remaining() < 4 {
        return Err(BusError::Protocol("Envelope too short".to_string()));
    }
    let mut tag = [0u8; 4];
    buf.copy_to_slice(&mut tag);
    let is_channel = match tag {
        TAG_CHANNEL => true,
        TAG_NOTIFY => false,
        _ => {
            return Err(BusError::Protocol(format!(
                "Unknown envelope tag {:?}",
                tag
            )))
        }
    };
    let name = take_string(&mut buf)?;
    let payload = take_bytes(&mut buf)?;
    let channel = if is_channel {
        if name.is_empty() {
            return Err(BusError::Protocol(
                "Channel message with empty channel name".to_string(),
            ));
        }
        Some(name)
    } else {
        None
    };
    Ok(Envelope {
        channel,
        payload: Bytes::from(payload),
    })
}

/*
Delta payload
-------------
A pair of equal-length arrays: the uids of changed signals, then their
values. Values are tagged so a decoder without the channel schema can
still walk the payload.
*/

pub fn encode_delta(delta: &Delta) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(delta.len() as u32);
    for (uid, _) in delta {
        buf.put_u32(*uid);
    }
    for (_, value) in delta {
        match value {
            DeltaValue::Scalar(v) => {
                buf.put_u8(VALUE_SCALAR);
                buf.put_f64(*v);
            }
            DeltaValue::Binary(data) => {
                buf.put_u8(VALUE_BINARY);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
    buf.freeze()
}

pub fn decode_delta(payload: &[u8]) -> BusResult<Delta> {
    let mut buf = payload;
    let count = take_u32(&mut buf)? as usize;
    let mut uids = Vec::with_capacity(count);
    for _ in 0..count {
        uids.push(take_u32(&mut buf)?);
    }
    let mut delta = Vec::with_capacity(count);
    for uid in uids {
        if buf.remaining() < 1 {
            return Err(BusError::Protocol(
                "Delta value array shorter than uid array".to_string(),
            ));
        }
        let kind = buf.get_u8();
        let value = match kind {
            VALUE_SCALAR => {
                if buf.remaining() < 8 {
                    return Err(BusError::Protocol("Truncated scalar value".to_string()));
                }
                DeltaValue::Scalar(buf.get_f64())
            }
            VALUE_BINARY => DeltaValue::Binary(take_bytes(&mut buf)?),
            other => {
                return Err(BusError::Protocol(format!(
                    "Unknown delta value kind {}",
                    other
                )))
            }
        };
        delta.push((uid, value));
    }
    Ok(delta)
}

/// Enumerate a channel's changed signals into a delta. Signals with an
/// unassigned uid are skipped. Writing a binary entry consumes the buffer.
pub fn channel_delta(channel: &mut Channel) -> Delta {
    let mut delta = Delta::new();
    for sv in channel.values_mut() {
        if sv.uid == 0 || !sv.changed() {
            continue;
        }
        if !sv.binary.is_empty() {
            delta.push((sv.uid, DeltaValue::Binary(std::mem::take(&mut sv.binary))));
        } else {
            delta.push((sv.uid, DeltaValue::Scalar(sv.final_value)));
        }
    }
    delta
}

/// Merge a received delta into a channel store. Scalars apply as
/// `current <- final <- value`; binary payloads concatenate, so payloads
/// from several peers within one cycle are all observed. Unknown uids are
/// logged and skipped (the sender may carry signals this peer never
/// mapped).
pub fn apply_delta(channel: &mut Channel, delta: &Delta) {
    for (uid, value) in delta {
        let Some(slot) = channel.find_by_uid(*uid) else {
            tracing::warn!(
                "Delta for unknown signal uid {} on channel '{}'",
                uid,
                channel.name
            );
            continue;
        };
        let sv = channel.get_mut(slot);
        match value {
            DeltaValue::Scalar(v) => {
                sv.final_value = *v;
                sv.current = *v;
            }
            DeltaValue::Binary(data) => {
                sv.binary.extend_from_slice(data);
            }
        }
    }
}

/// Bus-side merge: scalar values land in `final` only (pending, so the
/// next bus delta re-emits them), binary payloads concatenate. The commit
/// to `current` happens when the bus writes its own outgoing delta.
pub fn apply_delta_pending(channel: &mut Channel, delta: &Delta) {
    for (uid, value) in delta {
        let Some(slot) = channel.find_by_uid(*uid) else {
            tracing::warn!(
                "Delta for unknown signal uid {} on channel '{}'",
                uid,
                channel.name
            );
            continue;
        };
        let sv = channel.get_mut(slot);
        match value {
            DeltaValue::Scalar(v) => sv.final_value = *v,
            DeltaValue::Binary(data) => sv.binary.extend_from_slice(data),
        }
    }
}

/*
Notify messages
---------------
Bus-control handshake, sent with an SBNO envelope. Register carries the
per-channel SignalLookup; Ready and Start carry per-channel deltas.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum NotifyKind {
    Register,
    Ready,
    Start,
    Exit,
}

impl NotifyKind {
    fn to_u8(self) -> u8 {
        match self {
            NotifyKind::Register => 1,
            NotifyKind::Ready => 2,
            NotifyKind::Start => 3,
            NotifyKind::Exit => 4,
        }
    }

    fn from_u8(v: u8) -> BusResult<Self> {
        match v {
            1 => Ok(NotifyKind::Register),
            2 => Ok(NotifyKind::Ready),
            3 => Ok(NotifyKind::Start),
            4 => Ok(NotifyKind::Exit),
            other => Err(BusError::Protocol(format!(
                "Unknown notify kind {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub name: String,
    /// SignalLookup entries (Register only): name -> uid.
    pub lookups: Vec<(String, u32)>,
    pub delta: Delta,
}

#[derive(Debug, Clone)]
pub struct NotifyMessage {
    pub kind: NotifyKind,
    pub model_uid: u32,
    pub time: f64,
    pub channels: Vec<ChannelUpdate>,
}

pub fn encode_notify(msg: &NotifyMessage) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(msg.kind.to_u8());
    buf.put_u32(msg.model_uid);
    buf.put_f64(msg.time);
    buf.put_u32(msg.channels.len() as u32);
    for ch in &msg.channels {
        buf.put_u32(ch.name.len() as u32);
        buf.put_slice(ch.name.as_bytes());
        buf.put_u32(ch.lookups.len() as u32);
        for (name, uid) in &ch.lookups {
            buf.put_u32(name.len() as u32);
            buf.put_slice(name.as_bytes());
            buf.put_u32(*uid);
        }
        let delta = encode_delta(&ch.delta);
        buf.put_u32(delta.len() as u32);
        buf.put_slice(&delta);
    }
    buf.freeze()
}

pub fn decode_notify(payload: &[u8]) -> BusResult<NotifyMessage> {
    let mut buf = payload;
    if buf.remaining() < 1 + 4 + 8 + 4 {
        return Err(BusError::Protocol("Notify message too short".to_string()));
    }
    let kind = NotifyKind::from_u8(buf.get_u8())?;
    let model_uid = buf.get_u32();
    let time = buf.get_f64();
    let channel_count = buf.get_u32() as usize;
    let mut channels = Vec::with_capacity(channel_count);
    for _ in 0..channel_count {
        let name = take_string(&mut buf)?;
        let lookup_count = take_u32(&mut buf)? as usize;
        let mut lookups = Vec::with_capacity(lookup_count);
        for _ in 0..lookup_count {
            let signal = take_string(&mut buf)?;
            let uid = take_u32(&mut buf)?;
            lookups.push((signal, uid));
        }
        let delta_bytes = take_bytes(&mut buf)?;
        let delta = decode_delta(&delta_bytes)?;
        channels.push(ChannelUpdate {
            name,
            lookups,
            delta,
        });
    }
    Ok(NotifyMessage {
        kind,
        model_uid,
        time,
        channels,
    })
}

fn take_u32(buf: &mut &[u8]) -> BusResult<u32> {
    if buf.remaining() < 4 {
        return Err(BusError::Protocol("Truncated message".to_string()));
    }
    Ok(buf.get_u32())
}

fn take_bytes(buf: &mut &[u8]) -> BusResult<Vec<u8>> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(BusError::Protocol("Truncated message body".to_string()));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn take_string(buf: &mut &[u8]) -> BusResult<String> {
    let bytes = take_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| BusError::Protocol("Invalid UTF-8 string".to_string()))
}
