//! Canonical encode/decode of state-mutating commands to bytes suitable for
//! the replicated log. The wire shape is the textual `{type, key?, value?}`
//! record from the design: `key`/`value` absent fields are omitted rather
//! than emitted as `null`, and `REG`/`ENDEL` nest their own JSON payload
//! inside `value` so that every command still fits the one three-field
//! envelope the log (and the HTTP boundary) already speaks.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub service: String,
    pub host: String,
    pub port: u16,
    /// Stamped once by the adapter that accepted the heartbeat, then carried
    /// unchanged through the log so every replica applies the same value.
    pub last_beat_ms: u64,
    /// Sampled once by the adapter that accepted this heartbeat, same as
    /// `last_beat_ms`. The FSM only consults this on a first registration;
    /// on a lease renewal it preserves the instance's existing `created`
    /// regardless of what is carried here, so every replica lands on the
    /// same value without needing to know in advance whether this is a
    /// renewal.
    pub created_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelRequest {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put { key: String, value: String },
    Del { key: String },
    Reg(InstanceRegistration),
    Endel(DelRequest),
}

impl Command {
    fn tag(&self) -> &'static str {
        match self {
            Command::Put { .. } => "PUT",
            Command::Del { .. } => "DEL",
            Command::Reg(_) => "REG",
            Command::Endel(_) => "ENDEL",
        }
    }

    /// Encode to the canonical bytes written to the replicated log.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = match self {
            Command::Put { key, value } => CommandWire {
                ty: self.tag().to_string(),
                key: Some(key.clone()),
                value: Some(value.clone()),
            },
            Command::Del { key } => CommandWire {
                ty: self.tag().to_string(),
                key: Some(key.clone()),
                value: None,
            },
            Command::Reg(reg) => CommandWire {
                ty: self.tag().to_string(),
                key: None,
                value: Some(serde_json::to_string(reg)?),
            },
            Command::Endel(req) => CommandWire {
                ty: self.tag().to_string(),
                key: None,
                value: Some(serde_json::to_string(req)?),
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode a committed log entry back into a command.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: CommandWire = serde_json::from_slice(bytes)
            .map_err(|e| Error::Decode(format!("invalid command envelope: {e}")))?;
        match wire.ty.as_str() {
            "PUT" => {
                let key = wire.key.ok_or_else(|| Error::Decode("PUT missing key".into()))?;
                let value = wire.value.ok_or_else(|| Error::Decode("PUT missing value".into()))?;
                Ok(Command::Put { key, value })
            }
            "DEL" => {
                let key = wire.key.ok_or_else(|| Error::Decode("DEL missing key".into()))?;
                Ok(Command::Del { key })
            }
            "REG" => {
                let value = wire.value.ok_or_else(|| Error::Decode("REG missing value".into()))?;
                let reg: InstanceRegistration = serde_json::from_str(&value)
                    .map_err(|e| Error::Decode(format!("invalid REG payload: {e}")))?;
                Ok(Command::Reg(reg))
            }
            "ENDEL" => {
                let value = wire.value.ok_or_else(|| Error::Decode("ENDEL missing value".into()))?;
                let req: DelRequest = serde_json::from_str(&value)
                    .map_err(|e| Error::Decode(format!("invalid ENDEL payload: {e}")))?;
                Ok(Command::Endel(req))
            }
            other => Err(Error::Decode(format!("unrecognized command type {other:?}"))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CommandWire {
    #[serde(rename = "type")]
    ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}
