//! Payload tree for multiplexing packets
//!
//! Mirrors JSON with two extra leaf kinds: raw binary attachments and the
//! indexed placeholder markers that replace them on the wire. Object entries
//! keep document order so attachment numbering is deterministic.

use bytes::Bytes;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A JSON-like payload value
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    /// Raw binary attachment. Never serialized directly; the deconstruction
    /// pass replaces it with a placeholder before encoding.
    Binary(Bytes),
    /// Wire marker `{"_placeholder":true,"num":<i>}` referencing attachment i
    Placeholder(usize),
    Array(Vec<Data>),
    /// Object entries in document order
    Object(Vec<(String, Data)>),
}

impl Data {
    /// Whether the tree contains any raw binary leaf
    pub fn contains_binary(&self) -> bool {
        match self {
            Data::Binary(_) => true,
            Data::Array(items) => items.iter().any(Data::contains_binary),
            Data::Object(entries) => entries.iter().any(|(_, v)| v.contains_binary()),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Data]> {
        match self {
            Data::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, Data)]> {
        match self {
            Data::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up an entry of an object value by key
    pub fn get(&self, key: &str) -> Option<&Data> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

impl From<&str> for Data {
    fn from(v: &str) -> Self {
        Data::Text(v.to_owned())
    }
}

impl From<String> for Data {
    fn from(v: String) -> Self {
        Data::Text(v)
    }
}

impl From<bool> for Data {
    fn from(v: bool) -> Self {
        Data::Bool(v)
    }
}

impl From<i64> for Data {
    fn from(v: i64) -> Self {
        Data::Number(v.into())
    }
}

impl From<u64> for Data {
    fn from(v: u64) -> Self {
        Data::Number(v.into())
    }
}

impl From<Bytes> for Data {
    fn from(v: Bytes) -> Self {
        Data::Binary(v)
    }
}

impl From<Vec<Data>> for Data {
    fn from(v: Vec<Data>) -> Self {
        Data::Array(v)
    }
}

/// Detect the wire placeholder shape: exactly the `_placeholder` flag set to
/// true plus a numeric `num` entry.
fn placeholder_index(entries: &[(String, Data)]) -> Option<usize> {
    if entries.len() != 2 {
        return None;
    }
    let mut marked = false;
    let mut num = None;
    for (key, value) in entries {
        match (key.as_str(), value) {
            ("_placeholder", Data::Bool(true)) => marked = true,
            ("num", Data::Number(n)) => num = n.as_u64(),
            _ => return None,
        }
    }
    if marked {
        num.map(|n| n as usize)
    } else {
        None
    }
}

impl Serialize for Data {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Data::Null => serializer.serialize_unit(),
            Data::Bool(b) => serializer.serialize_bool(*b),
            Data::Number(n) => n.serialize(serializer),
            Data::Text(s) => serializer.serialize_str(s),
            Data::Binary(_) => Err(S::Error::custom(
                "raw binary must be deconstructed before serialization",
            )),
            Data::Placeholder(num) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("_placeholder", &true)?;
                map.serialize_entry("num", num)?;
                map.end()
            }
            Data::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Data::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct DataVisitor;

impl<'de> Visitor<'de> for DataVisitor {
    type Value = Data;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("any JSON value")
    }

    fn visit_unit<E>(self) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Null)
    }

    fn visit_none<E>(self) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Data, D::Error>
    where
        D: Deserializer<'de>,
    {
        Data::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Number(v.into()))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Number(v.into()))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(serde_json::Number::from_f64(v)
            .map(Data::Number)
            .unwrap_or(Data::Null))
    }

    fn visit_str<E>(self, v: &str) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Text(v.to_owned()))
    }

    fn visit_string<E>(self, v: String) -> Result<Data, E>
    where
        E: serde::de::Error,
    {
        Ok(Data::Text(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Data, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Data::Array(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Data, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries: Vec<(String, Data)> = Vec::new();
        while let Some((key, value)) = map.next_entry()? {
            entries.push((key, value));
        }
        if let Some(num) = placeholder_index(&entries) {
            return Ok(Data::Placeholder(num));
        }
        Ok(Data::Object(entries))
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D>(deserializer: D) -> Result<Data, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DataVisitor)
    }
}
