//! Decoded device responses.
//!
//! The wire codec lives elsewhere; this store only sees a response that has
//! already been split into an ordered list of protocol operations.

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

/// Operation verb.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Status,
    Results,
    /// Any verb this store does not track (Alert, Replace, Get, ...).
    Other(String),
}

/// Class of the command an operation refers to, as tagged by the decoder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    /// An atomic configuration change (a profile install).
    Atomic,
    /// The session header. Statuses for it are protocol bookkeeping.
    Header,
    Other(String),
}

/// One operation from a device response.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolOp {
    pub verb: Verb,
    /// Identifier of the command this operation answers.
    pub cmd_ref: Option<String>,
    /// Payload data (a status code for Status, the item data for Results).
    pub data: Option<String>,
    pub cmd_class: Option<CommandClass>,
    /// The operation as it was encoded in the response.
    #[serde_as(as = "Hex")]
    #[serde(default)]
    pub encoded: Vec<u8>,
}

impl ProtocolOp {
    pub fn status(cmd_ref: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            verb: Verb::Status,
            cmd_ref: Some(cmd_ref.into()),
            data: Some(code.into()),
            cmd_class: None,
            encoded: Vec::new(),
        }
    }

    pub fn results(cmd_ref: impl Into<String>, data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            verb: Verb::Results,
            cmd_ref: Some(cmd_ref.into()),
            encoded: data.as_bytes().to_vec(),
            data: Some(data),
            cmd_class: None,
        }
    }

    pub fn with_class(mut self, class: CommandClass) -> Self {
        self.cmd_class = Some(class);
        self
    }

    pub fn with_encoded(mut self, encoded: impl Into<Vec<u8>>) -> Self {
        self.encoded = encoded.into();
        self
    }

    /// Whether this operation carries an outcome worth recording.
    ///
    /// Only Status and Results are tracked, and statuses for the session
    /// header are not.
    pub fn is_trackable(&self) -> bool {
        match self.verb {
            Verb::Status => self.cmd_class != Some(CommandClass::Header),
            Verb::Results => true,
            Verb::Other(_) => false,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.cmd_class == Some(CommandClass::Atomic)
    }
}

/// A full device response: the raw bytes plus the decoded operations in
/// protocol order.
#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResponse {
    #[serde_as(as = "Hex")]
    pub raw: Vec<u8>,
    pub ops: Vec<ProtocolOp>,
}

impl DeviceResponse {
    pub fn new(raw: impl Into<Vec<u8>>, ops: Vec<ProtocolOp>) -> Self {
        Self {
            raw: raw.into(),
            ops,
        }
    }

    /// Trackable operations that reference a command, in protocol order.
    pub fn tracked_ops(&self) -> impl Iterator<Item = (&str, &ProtocolOp)> {
        self.ops.iter().filter_map(|op| {
            let cmd_ref = op.cmd_ref.as_deref()?;
            op.is_trackable().then_some((cmd_ref, op))
        })
    }
}
