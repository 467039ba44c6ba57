use std::fmt;

use bytes::Bytes;
use serde_json::Value;

/// A single document read from the input and written to the store.
///
/// The body is kept in its serialized form; cloning a `Document` for a redispatch only
/// bumps a reference count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    sequence: u64,
    id: Option<String>,
    body: Bytes,
}

impl Document {
    pub fn new(sequence: u64, id: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            id,
            body: body.into(),
        }
    }

    /// Builds a document from one line of JSON, taking its identity from a string `"id"`
    /// field when there is one.
    pub fn from_json_line(sequence: u64, line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let id = value.get("id").and_then(Value::as_str).map(str::to_owned);
        Ok(Self::new(sequence, id, Bytes::copy_from_slice(line.as_bytes())))
    }

    /// Position of the document in the input, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "#{} ({})", self.sequence, id),
            None => write!(f, "#{}", self.sequence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_identity_from_id_field() {
        let doc = Document::from_json_line(3, r#"{"id":"a","n":1}"#).unwrap();
        assert_eq!(doc.sequence(), 3);
        assert_eq!(doc.id(), Some("a"));
        assert_eq!(doc.body().as_ref(), br#"{"id":"a","n":1}"#);
        assert_eq!(doc.to_string(), "#3 (a)");
    }

    #[test]
    fn non_string_id_is_not_an_identity() {
        let doc = Document::from_json_line(0, r#"{"id":7}"#).unwrap();
        assert_eq!(doc.id(), None);
        assert_eq!(doc.json().unwrap()["id"], 7);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(Document::from_json_line(0, "{not json").is_err());
    }
}
