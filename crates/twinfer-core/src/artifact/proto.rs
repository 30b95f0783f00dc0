//! Wire-level access to ONNX model files.
//!
//! ONNX artifacts are `ModelProto` protobuf messages. Only a handful of
//! fields matter for portability (the graph, its initializers and their
//! external-data markers), so instead of decoding the full schema we walk the
//! wire format with `prost`'s primitives and copy every other field through
//! byte-for-byte. A rewrite that changes nothing therefore reproduces the
//! input exactly.

use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};

use crate::error::PortabilityError;

pub(crate) const MODEL_IR_VERSION: u32 = 1;
pub(crate) const MODEL_PRODUCER_NAME: u32 = 2;
pub(crate) const MODEL_GRAPH: u32 = 7;
pub(crate) const MODEL_OPSET_IMPORT: u32 = 8;

pub(crate) const OPSET_DOMAIN: u32 = 1;
pub(crate) const OPSET_VERSION: u32 = 2;

pub(crate) const GRAPH_NODE: u32 = 1;
pub(crate) const GRAPH_NAME: u32 = 2;
pub(crate) const GRAPH_INITIALIZER: u32 = 5;

pub(crate) const TENSOR_DIMS: u32 = 1;
pub(crate) const TENSOR_DATA_TYPE: u32 = 2;
pub(crate) const TENSOR_NAME: u32 = 8;
pub(crate) const TENSOR_RAW_DATA: u32 = 9;
pub(crate) const TENSOR_EXTERNAL_DATA: u32 = 13;
pub(crate) const TENSOR_DATA_LOCATION: u32 = 14;

pub(crate) const ENTRY_KEY: u32 = 1;
pub(crate) const ENTRY_VALUE: u32 = 2;

/// `TensorProto.DataLocation.EXTERNAL`
pub(crate) const DATA_LOCATION_EXTERNAL: u64 = 1;

/// Decoded payload of one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value<'a> {
    Varint(u64),
    Fixed64(&'a [u8]),
    Fixed32(&'a [u8]),
    Bytes(&'a [u8]),
}

/// One field of a message, with its original encoding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field<'a> {
    pub number: u32,
    pub value: Value<'a>,
    /// Key and payload exactly as they appeared in the input.
    pub raw: &'a [u8],
}

impl<'a> Field<'a> {
    pub fn bytes(&self) -> Option<&'a [u8]> {
        match self.value {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn varint(&self) -> Option<u64> {
        match self.value {
            Value::Varint(v) => Some(v),
            _ => None,
        }
    }

    pub fn string(&self) -> Result<&'a str, PortabilityError> {
        let bytes = self.bytes().ok_or_else(|| {
            PortabilityError::Malformed(format!("field {} is not length-delimited", self.number))
        })?;
        std::str::from_utf8(bytes)
            .map_err(|e| PortabilityError::Malformed(format!("field {}: {}", self.number, e)))
    }

    /// Require a length-delimited payload, the encoding of every sub-message.
    pub fn message(&self) -> Result<&'a [u8], PortabilityError> {
        self.bytes().ok_or_else(|| {
            PortabilityError::Malformed(format!(
                "field {} should hold a message",
                self.number
            ))
        })
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize, number: u32) -> Result<&'a [u8], PortabilityError> {
    if buf.len() < n {
        return Err(PortabilityError::Malformed(format!(
            "field {} truncated: needs {} bytes, {} left",
            number,
            n,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Split a message into its fields, in wire order.
pub(crate) fn fields(message: &[u8]) -> Result<Vec<Field<'_>>, PortabilityError> {
    let mut buf = message;
    let mut out = Vec::new();

    while !buf.is_empty() {
        let start = message.len() - buf.len();
        let (number, wire_type) = decode_key(&mut buf)?;

        let value = match wire_type {
            WireType::Varint => Value::Varint(decode_varint(&mut buf)?),
            WireType::SixtyFourBit => Value::Fixed64(take(&mut buf, 8, number)?),
            WireType::ThirtyTwoBit => Value::Fixed32(take(&mut buf, 4, number)?),
            WireType::LengthDelimited => {
                let len = decode_varint(&mut buf)?;
                let len = usize::try_from(len).map_err(|_| {
                    PortabilityError::Malformed(format!("field {} length overflows", number))
                })?;
                Value::Bytes(take(&mut buf, len, number)?)
            }
            WireType::StartGroup | WireType::EndGroup => {
                return Err(PortabilityError::Malformed(format!(
                    "field {} uses deprecated group encoding",
                    number
                )));
            }
        };

        let end = message.len() - buf.len();
        out.push(Field {
            number,
            value,
            raw: &message[start..end],
        });
    }

    Ok(out)
}

/// Append a length-delimited field.
pub(crate) fn put_bytes(out: &mut Vec<u8>, number: u32, payload: &[u8]) {
    encode_key(number, WireType::LengthDelimited, out);
    encode_varint(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// Append a varint field.
pub(crate) fn put_varint(out: &mut Vec<u8>, number: u32, value: u64) {
    encode_key(number, WireType::Varint, out);
    encode_varint(value, out);
}

/// Encode a `StringStringEntryProto`.
pub(crate) fn entry(key: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + value.len() + 4);
    put_bytes(&mut out, ENTRY_KEY, key.as_bytes());
    put_bytes(&mut out, ENTRY_VALUE, value.as_bytes());
    out
}

/// Decode packed or unpacked repeated int64 values of one field.
pub(crate) fn push_int64s(field: &Field<'_>, out: &mut Vec<i64>) -> Result<(), PortabilityError> {
    match field.value {
        Value::Varint(v) => out.push(v as i64),
        Value::Bytes(mut packed) => {
            while !packed.is_empty() {
                out.push(decode_varint(&mut packed)? as i64);
            }
        }
        _ => {
            return Err(PortabilityError::Malformed(format!(
                "field {} is not an integer",
                field.number
            )));
        }
    }
    Ok(())
}

/// Rebuild a `ModelProto`, offering every graph initializer to `rewrite`.
///
/// `rewrite` returns `Some(new_tensor)` to replace an initializer or `None`
/// to keep it. When nothing is replaced the original bytes come back.
pub(crate) fn rewrite_initializers<F>(model: &[u8], mut rewrite: F) -> Result<Vec<u8>, PortabilityError>
where
    F: FnMut(&[u8]) -> Result<Option<Vec<u8>>, PortabilityError>,
{
    let mut changed = false;
    let mut out = Vec::with_capacity(model.len());

    for field in fields(model)? {
        if field.number != MODEL_GRAPH {
            out.extend_from_slice(field.raw);
            continue;
        }

        let graph = field.message()?;
        let mut new_graph = Vec::with_capacity(graph.len());
        for graph_field in fields(graph)? {
            if graph_field.number == GRAPH_INITIALIZER {
                if let Some(tensor) = rewrite(graph_field.message()?)? {
                    put_bytes(&mut new_graph, GRAPH_INITIALIZER, &tensor);
                    changed = true;
                    continue;
                }
            }
            new_graph.extend_from_slice(graph_field.raw);
        }
        put_bytes(&mut out, MODEL_GRAPH, &new_graph);
    }

    Ok(if changed { out } else { model.to_vec() })
}

/// Copy a tensor without its data and location fields, then append new ones.
fn strip_data(tensor: &[u8]) -> Result<Vec<u8>, PortabilityError> {
    let mut out = Vec::with_capacity(tensor.len());
    for field in fields(tensor)? {
        match field.number {
            TENSOR_RAW_DATA | TENSOR_EXTERNAL_DATA | TENSOR_DATA_LOCATION => {}
            _ => out.extend_from_slice(field.raw),
        }
    }
    Ok(out)
}

/// Tensor with `data` embedded as `raw_data` and no external markers.
pub(crate) fn inline_tensor(tensor: &[u8], data: &[u8]) -> Result<Vec<u8>, PortabilityError> {
    let mut out = strip_data(tensor)?;
    put_bytes(&mut out, TENSOR_RAW_DATA, data);
    Ok(out)
}

/// Tensor pointing at `length` bytes of `location` starting at `offset`.
pub(crate) fn external_tensor(
    tensor: &[u8],
    location: &str,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, PortabilityError> {
    let mut out = strip_data(tensor)?;
    put_bytes(&mut out, TENSOR_EXTERNAL_DATA, &entry("location", location));
    put_bytes(&mut out, TENSOR_EXTERNAL_DATA, &entry("offset", &offset.to_string()));
    put_bytes(&mut out, TENSOR_EXTERNAL_DATA, &entry("length", &length.to_string()));
    put_varint(&mut out, TENSOR_DATA_LOCATION, DATA_LOCATION_EXTERNAL);
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fields_keep_raw_encoding() {
        let model = add_model(&[1.0, 2.0]);
        let parsed = fields(&model).unwrap();
        let rebuilt: Vec<u8> = parsed.iter().flat_map(|f| f.raw.to_vec()).collect();
        assert_eq!(rebuilt, model);
        assert_eq!(parsed[0].number, MODEL_IR_VERSION);
        assert_eq!(parsed[0].varint(), Some(7));
    }

    #[test]
    fn test_noop_rewrite_is_identity() {
        let model = add_model(&[1.0, 2.0, 3.0]);
        let out = rewrite_initializers(&model, |_| Ok(None)).unwrap();
        assert_eq!(out, model);
    }

    #[test]
    fn test_external_then_inline_roundtrip() {
        let tensor = float_tensor("w", &[1.0, 2.0]);
        let external = external_tensor(&tensor, "w.bin", 0, 8).unwrap();
        let numbers: Vec<u32> = fields(&external).unwrap().iter().map(|f| f.number).collect();
        assert!(!numbers.contains(&TENSOR_RAW_DATA));
        assert!(numbers.contains(&TENSOR_DATA_LOCATION));

        let raw: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let inlined = inline_tensor(&external, &raw).unwrap();
        assert_eq!(inlined, tensor);
    }

    #[test]
    fn test_truncated_message() {
        let model = add_model(&[1.0]);
        let err = fields(&model[..model.len() - 3]).unwrap_err();
        assert!(matches!(err, PortabilityError::Malformed(_)));
    }

    #[test]
    fn test_packed_dims() {
        let mut packed = Vec::new();
        encode_varint(3, &mut packed);
        encode_varint(224, &mut packed);
        let mut msg = Vec::new();
        put_bytes(&mut msg, TENSOR_DIMS, &packed);

        let parsed = fields(&msg).unwrap();
        let mut dims = Vec::new();
        push_int64s(&parsed[0], &mut dims).unwrap();
        assert_eq!(dims, vec![3, 224]);
    }
}
