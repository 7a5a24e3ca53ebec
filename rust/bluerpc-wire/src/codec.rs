use std::collections::BTreeMap;

use bluerpc_types::{ErrorValue, StreamHandle, StreamMode, Value};
use bytes::Bytes;
use ciborium::Value as Cbor;

use crate::{DecodeError, EncodeError, Incrementor};

/// CBOR tag wrapping an 8-byte stream handle payload.
pub const STREAM_TAG: u64 = 40960;

/// CBOR tag wrapping an error map.
pub const ERROR_TAG: u64 = 40961;

const STREAM_PAYLOAD_LEN: usize = 8;
const OCTET_FLAG: u8 = 0b1;

const BAD_STREAM: &str = "Invalid Stream type received (not an 8-byte string)";
const ERROR_NOT_MAP: &str = "Invalid Error type received (not a Map)";
const ERROR_NO_MESSAGE: &str = "Invalid Error type received (no \"message\" key)";
const ERROR_BAD_MESSAGE: &str = "Invalid Error type received (non-string \"message\")";

/// Result of [`Codec::encode`]: the bytes, plus every stream the value
/// carried, keyed by the ID it was sent under.
#[derive(Debug)]
pub struct Encoded {
    pub bytes: Bytes,
    pub streams: Vec<(u32, StreamHandle)>,
}

/// Result of [`Codec::decode`]: the value, plus every stream it referenced.
#[derive(Debug)]
pub struct Decoded {
    pub value: Value,
    pub streams: BTreeMap<u32, StreamHandle>,
}

/// Connection-scoped encoder/decoder.
///
/// The only state shared between calls is the stream ID counter; the
/// handle-to-ID correlation is scoped to a single encode or decode call.
#[derive(Debug, Default)]
pub struct Codec {
    stream_ids: Incrementor,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a value, assigning IDs to the streams it contains.
    ///
    /// `in_use` reports IDs held by streams this side is still sending; they
    /// are skipped when assigning. A stream received from the peer keeps the
    /// ID it arrived with unless that ID is taken.
    pub fn encode(
        &mut self,
        value: &Value,
        in_use: impl Fn(u32) -> bool,
    ) -> Result<Encoded, EncodeError> {
        let mut assigner = Assigner {
            ids: &mut self.stream_ids,
            in_use: &in_use,
            assigned: Vec::new(),
        };
        let cbor = to_cbor(value, &mut Some(&mut assigner))?;
        let bytes = write_cbor(&cbor)?;
        Ok(Encoded {
            bytes,
            streams: assigner.assigned,
        })
    }

    /// Encode a value that must not contain streams.
    pub fn encode_inert(&self, value: &Value) -> Result<Bytes, EncodeError> {
        let cbor = to_cbor(value, &mut None)?;
        write_cbor(&cbor)
    }

    /// Decode bytes, materializing stream handles for stream references.
    ///
    /// A stream ID referenced more than once in the same value resolves to
    /// one handle.
    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        let mut reader = bytes;
        let cbor: Cbor = ciborium::from_reader(&mut reader)
            .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
        if !reader.is_empty() {
            return Err(DecodeError::InvalidEncoding(format!(
                "{} trailing bytes",
                reader.len()
            )));
        }
        let mut streams = BTreeMap::new();
        let value = from_cbor(cbor, &mut streams)?;
        Ok(Decoded { value, streams })
    }

    /// Decode an object-stream chunk, which may not reference streams.
    pub fn decode_inert(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        let decoded = self.decode(bytes)?;
        if !decoded.streams.is_empty() {
            return Err(DecodeError::NestedStream);
        }
        Ok(decoded.value)
    }
}

struct Assigner<'a> {
    ids: &'a mut Incrementor,
    in_use: &'a dyn Fn(u32) -> bool,
    assigned: Vec<(u32, StreamHandle)>,
}

impl Assigner<'_> {
    fn id_for(&mut self, stream: &StreamHandle) -> Result<u32, EncodeError> {
        if let Some((id, _)) = self.assigned.iter().find(|(_, s)| s.same_stream(stream)) {
            return Ok(*id);
        }
        if stream.is_locked() {
            return Err(EncodeError::IllegalDoubleSend);
        }
        let id = match stream.wire_id() {
            Some(id) if !self.taken(id) => id,
            _ => loop {
                let id = self.ids.next_id();
                if !self.taken(id) {
                    break id;
                }
            },
        };
        self.assigned.push((id, stream.clone()));
        Ok(id)
    }

    fn taken(&self, id: u32) -> bool {
        (self.in_use)(id) || self.assigned.iter().any(|(used, _)| *used == id)
    }
}

fn write_cbor(cbor: &Cbor) -> Result<Bytes, EncodeError> {
    let mut out = Vec::new();
    ciborium::into_writer(cbor, &mut out).map_err(|e| EncodeError::Serialize(e.to_string()))?;
    Ok(Bytes::from(out))
}

fn to_cbor(value: &Value, streams: &mut Option<&mut Assigner<'_>>) -> Result<Cbor, EncodeError> {
    Ok(match value {
        Value::Nil => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Int(i) => Cbor::Integer((*i).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::Str(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.to_vec()),
        Value::Array(items) => Cbor::Array(
            items
                .iter()
                .map(|item| to_cbor(item, streams))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => Cbor::Map(
            map.iter()
                .map(|(k, v)| Ok((Cbor::Text(k.clone()), to_cbor(v, streams)?)))
                .collect::<Result<_, EncodeError>>()?,
        ),
        Value::Error(err) => {
            let mut entries = vec![(
                Cbor::Text("message".into()),
                Cbor::Text(err.message().to_string()),
            )];
            for (k, v) in err.fields() {
                if k == "expose" {
                    continue;
                }
                entries.push((Cbor::Text(k.clone()), to_cbor(v, streams)?));
            }
            Cbor::Tag(ERROR_TAG, Box::new(Cbor::Map(entries)))
        }
        Value::Stream(stream) => {
            let Some(assigner) = streams.as_mut() else {
                return Err(EncodeError::IllegalNestedStream);
            };
            let id = assigner.id_for(stream)?;
            let mut payload = [0u8; STREAM_PAYLOAD_LEN];
            payload[..4].copy_from_slice(&id.to_be_bytes());
            if stream.is_octets() {
                payload[4] = OCTET_FLAG;
            }
            Cbor::Tag(STREAM_TAG, Box::new(Cbor::Bytes(payload.to_vec())))
        }
    })
}

fn from_cbor(
    cbor: Cbor,
    streams: &mut BTreeMap<u32, StreamHandle>,
) -> Result<Value, DecodeError> {
    Ok(match cbor {
        Cbor::Null => Value::Nil,
        Cbor::Bool(b) => Value::Bool(b),
        Cbor::Integer(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => {
                return Err(DecodeError::InvalidEncoding(format!(
                    "integer {} is out of range",
                    i128::from(i)
                )));
            }
        },
        Cbor::Float(f) => Value::Float(f),
        Cbor::Text(s) => Value::Str(s),
        Cbor::Bytes(b) => Value::Bytes(Bytes::from(b)),
        Cbor::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| from_cbor(item, streams))
                .collect::<Result<_, _>>()?,
        ),
        Cbor::Map(entries) => Value::Map(map_from_cbor(entries, streams)?),
        Cbor::Tag(STREAM_TAG, inner) => Value::Stream(stream_from_cbor(*inner, streams)?),
        Cbor::Tag(ERROR_TAG, inner) => Value::from(error_from_cbor(*inner, streams)?),
        Cbor::Tag(tag, _) => {
            return Err(DecodeError::InvalidEncoding(format!("unknown tag {tag}")));
        }
        other => {
            return Err(DecodeError::InvalidEncoding(format!(
                "unsupported item {other:?}"
            )));
        }
    })
}

fn map_from_cbor(
    entries: Vec<(Cbor, Cbor)>,
    streams: &mut BTreeMap<u32, StreamHandle>,
) -> Result<BTreeMap<String, Value>, DecodeError> {
    let mut map = BTreeMap::new();
    for (k, v) in entries {
        let Cbor::Text(key) = k else {
            return Err(DecodeError::InvalidEncoding("map keys must be strings".into()));
        };
        map.insert(key, from_cbor(v, streams)?);
    }
    Ok(map)
}

fn stream_from_cbor(
    inner: Cbor,
    streams: &mut BTreeMap<u32, StreamHandle>,
) -> Result<StreamHandle, DecodeError> {
    let Cbor::Bytes(payload) = inner else {
        return Err(DecodeError::InvalidExtension(BAD_STREAM));
    };
    if payload.len() != STREAM_PAYLOAD_LEN {
        return Err(DecodeError::InvalidExtension(BAD_STREAM));
    }
    let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mode = if payload[4] & OCTET_FLAG != 0 {
        StreamMode::Octets
    } else {
        StreamMode::Objects
    };
    Ok(streams
        .entry(id)
        .or_insert_with(|| StreamHandle::incoming(mode, id))
        .clone())
}

fn error_from_cbor(
    inner: Cbor,
    streams: &mut BTreeMap<u32, StreamHandle>,
) -> Result<ErrorValue, DecodeError> {
    let Cbor::Map(entries) = inner else {
        return Err(DecodeError::InvalidExtension(ERROR_NOT_MAP));
    };
    let mut fields = map_from_cbor(entries, streams)?;
    let message = match fields.remove("message") {
        None => return Err(DecodeError::InvalidExtension(ERROR_NO_MESSAGE)),
        Some(Value::Str(message)) => message,
        Some(_) => return Err(DecodeError::InvalidExtension(ERROR_BAD_MESSAGE)),
    };
    Ok(ErrorValue::from_parts(message, fields))
}
