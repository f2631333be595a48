//! Document model and binary serialization.
//!
//! A document is an ordered mapping from field names to typed values.
//! Iteration follows the natural (lexicographic) order of the field
//! names. Nested documents are shared by reference.
//!
//! Wire format of a serialized document:
//! ```text
//! total_size: u32 (includes this prefix and the terminator)
//! repeat per element:
//!   type_tag: u8
//!   key: cstring (bytes + 0x00)
//!   payload (tag-dependent)
//! terminator: 0x00
//! ```
//! Strings are encoded as `len: u32` (including the NUL) followed by the
//! bytes and a trailing 0x00; nested documents embed the full format
//! recursively.

use crate::{NimbusError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Type tags used in the serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Boolean = 0x08,
    Null = 0x0A,
    Int32 = 0x10,
    Int64 = 0x12,
}

impl TryFrom<u8> for ValueTag {
    type Error = NimbusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ValueTag::Double),
            0x02 => Ok(ValueTag::String),
            0x03 => Ok(ValueTag::Document),
            0x08 => Ok(ValueTag::Boolean),
            0x0A => Ok(ValueTag::Null),
            0x10 => Ok(ValueTag::Int32),
            0x12 => Ok(ValueTag::Int64),
            _ => Err(NimbusError::DocumentCorrupted(format!(
                "unknown type tag: {:#04x}",
                value
            ))),
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit IEEE-754 float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Nested document, shared by reference.
    Document(Arc<Document>),
    /// Boolean.
    Boolean(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// Null.
    Null,
}

impl Value {
    /// Returns the wire tag for this value.
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Double(_) => ValueTag::Double,
            Value::String(_) => ValueTag::String,
            Value::Document(_) => ValueTag::Document,
            Value::Boolean(_) => ValueTag::Boolean,
            Value::Int32(_) => ValueTag::Int32,
            Value::Int64(_) => ValueTag::Int64,
            Value::Null => ValueTag::Null,
        }
    }

    /// Human-readable type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Document(_) => "document",
            Value::Boolean(_) => "boolean",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Null => "null",
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(Arc::new(v))
    }
}

/// An ordered document: field names mapped to values, iterated in
/// lexicographic key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    elements: BTreeMap<String, Value>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.elements.insert(key.into(), value.into());
        self
    }

    /// Returns the value of a field, if present.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.elements.get(key)
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterates fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.elements.iter()
    }

    /// Removes a field, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.elements.remove(key)
    }

    /// Overwrites fields of `self` with the fields of `fragment`,
    /// preserving fields not mentioned by it.
    pub fn merge(&mut self, fragment: &Document) {
        for (key, value) in fragment.iter() {
            self.elements.insert(key.clone(), value.clone());
        }
    }

    /// Serializes the document to its wire format.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32_le(0); // size placeholder

        for (key, value) in self.elements.iter() {
            buf.put_u8(value.tag() as u8);
            put_cstring(buf, key);

            match value {
                Value::Double(v) => buf.put_f64_le(*v),
                Value::String(v) => put_string(buf, v),
                Value::Document(v) => v.serialize_into(buf),
                Value::Boolean(v) => buf.put_u8(if *v { 0x01 } else { 0x00 }),
                Value::Int32(v) => buf.put_i32_le(*v),
                Value::Int64(v) => buf.put_i64_le(*v),
                Value::Null => {}
            }
        }

        buf.put_u8(0x00);

        let total_size = (buf.len() - start) as u32;
        buf[start..start + 4].copy_from_slice(&total_size.to_le_bytes());
    }

    /// Deserializes a document from its wire format.
    pub fn deserialize(data: &[u8]) -> Result<Document> {
        let (doc, _) = Self::deserialize_at(data)?;
        Ok(doc)
    }

    /// Deserializes a document from the front of `data`, returning the
    /// document and the number of bytes consumed.
    fn deserialize_at(data: &[u8]) -> Result<(Document, usize)> {
        if data.len() < 5 {
            return Err(NimbusError::DocumentCorrupted(
                "buffer shorter than minimum document".to_string(),
            ));
        }

        let doc_size = (&data[..4]).get_u32_le() as usize;
        if doc_size < 5 || doc_size > data.len() {
            return Err(NimbusError::DocumentCorrupted(format!(
                "size prefix {} out of range for buffer of {}",
                doc_size,
                data.len()
            )));
        }

        let mut doc = Document::new();
        let mut offset = 4;

        while offset < doc_size - 1 {
            let tag_byte = data[offset];
            offset += 1;
            if tag_byte == 0x00 {
                break;
            }
            let tag = ValueTag::try_from(tag_byte)?;

            let key = read_cstring(data, &mut offset, doc_size)?;

            let value = match tag {
                ValueTag::Double => {
                    let v = read_fixed(data, &mut offset, doc_size, 8)?;
                    Value::Double(f64::from_le_bytes(v.try_into().unwrap_or([0u8; 8])))
                }
                ValueTag::String => Value::String(read_string(data, &mut offset, doc_size)?),
                ValueTag::Document => {
                    let (sub, consumed) = Document::deserialize_at(&data[offset..doc_size])?;
                    offset += consumed;
                    Value::Document(Arc::new(sub))
                }
                ValueTag::Boolean => {
                    let v = read_fixed(data, &mut offset, doc_size, 1)?;
                    Value::Boolean(v[0] == 0x01)
                }
                ValueTag::Null => Value::Null,
                ValueTag::Int32 => {
                    let v = read_fixed(data, &mut offset, doc_size, 4)?;
                    Value::Int32(i32::from_le_bytes(v.try_into().unwrap_or([0u8; 4])))
                }
                ValueTag::Int64 => {
                    let v = read_fixed(data, &mut offset, doc_size, 8)?;
                    Value::Int64(i64::from_le_bytes(v.try_into().unwrap_or([0u8; 8])))
                }
            };

            doc.elements.insert(key, value);
        }

        Ok((doc, doc_size))
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0x00);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32 + 1);
    put_cstring(buf, s);
}

fn read_cstring(data: &[u8], offset: &mut usize, limit: usize) -> Result<String> {
    let start = *offset;
    let end = data[start..limit]
        .iter()
        .position(|&b| b == 0x00)
        .map(|p| start + p)
        .ok_or_else(|| {
            NimbusError::DocumentCorrupted("unterminated field name".to_string())
        })?;

    let s = std::str::from_utf8(&data[start..end])
        .map_err(|_| NimbusError::DocumentCorrupted("field name is not UTF-8".to_string()))?
        .to_string();
    *offset = end + 1;
    Ok(s)
}

fn read_string(data: &[u8], offset: &mut usize, limit: usize) -> Result<String> {
    let len_bytes = read_fixed(data, offset, limit, 4)?;
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap_or([0u8; 4])) as usize;
    if len == 0 || *offset + len > limit {
        return Err(NimbusError::DocumentCorrupted(
            "string length out of range".to_string(),
        ));
    }
    let s = std::str::from_utf8(&data[*offset..*offset + len - 1])
        .map_err(|_| NimbusError::DocumentCorrupted("string is not UTF-8".to_string()))?
        .to_string();
    *offset += len;
    Ok(s)
}

fn read_fixed<'a>(data: &'a [u8], offset: &mut usize, limit: usize, n: usize) -> Result<&'a [u8]> {
    if *offset + n > limit {
        return Err(NimbusError::DocumentCorrupted(
            "value payload truncated".to_string(),
        ));
    }
    let out = &data[*offset..*offset + n];
    *offset += n;
    Ok(out)
}
