//! Wire framing.
//!
//! Every message travels as one JSON text frame:
//!
//! ```text
//! { "reqID": "<uuid v4>", "name": "<event name>", "data": <any> }
//! ```
//!
//! `reqID` is a fresh correlation id per outbound frame, `name` routes
//! the frame to a handler, `data` is an arbitrary JSON payload.
//!
//! Peers disagree on how `data` is shaped: some send native JSON, some
//! send a JSON document encoded *again* as a string. Inbound handling
//! accepts both; [`Frame::decoded_data`] unwraps the string form when
//! it parses and falls back to the raw string when it does not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "reqID", default)]
    req_id: String,
    name: String,
    #[serde(default)]
    data: Value,
}

impl Frame {
    /// Build an outbound frame with a fresh correlation id.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            req_id: Uuid::new_v4().to_string(),
            name: name.into(),
            data,
        }
    }

    /// Correlation id. Unique per outbound frame.
    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    /// Event name the frame routes to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw payload exactly as carried on the wire.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Payload after tolerant decoding.
    ///
    /// A string payload that parses as JSON is unwrapped one level; any
    /// other payload (including a string that does not parse) is
    /// returned as-is.
    pub fn decoded_data(&self) -> Value {
        match &self.data {
            Value::String(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| self.data.clone())
            }
            other => other.clone(),
        }
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedFrame`] if the correlation id is empty
    /// or serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        // Invariant: outbound frames always carry a correlation id.
        if self.req_id.is_empty() {
            return Err(ProtocolError::MalformedFrame);
        }
        serde_json::to_string(self).map_err(|_| ProtocolError::MalformedFrame)
    }

    /// Decode an inbound text frame.
    ///
    /// Inbound frames must name an event; a missing `reqID` or `data`
    /// is tolerated.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedFrame`] if the text is not a JSON
    /// object of this shape or the event name is empty.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame =
            serde_json::from_str(text).map_err(|_| ProtocolError::MalformedFrame)?;
        if frame.name.is_empty() {
            return Err(ProtocolError::MalformedFrame);
        }
        Ok(frame)
    }
}
