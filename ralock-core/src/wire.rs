//! Text wire format. One message per connection, no framing:
//!
//! ```text
//! REQ:<requester>:<timestamp>
//! GRANT:<granter>
//! ```

use crate::error::WireError;
use crate::types::{Message, NodeId, RequestRecord, Timestamp};
use std::fmt;
use std::str::FromStr;

/// Upper bound on an inbound payload. Anything past it is not read.
pub const MAX_MESSAGE_BYTES: usize = 1024;

const REQUEST_TAG: &str = "REQ";
const GRANT_TAG: &str = "GRANT";

impl Message {
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Decodes a raw payload as received from the socket.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(raw).map_err(|_| WireError::NotUtf8)?;
        text.parse()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(record) => {
                write!(f, "{REQUEST_TAG}:{}:{}", record.requester, record.timestamp)
            }
            Message::Grant { granter } => write!(f, "{GRANT_TAG}:{granter}"),
        }
    }
}

impl FromStr for Message {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(WireError::Empty);
        }

        let fields: Vec<&str> = s.split(':').collect();
        match fields[0] {
            REQUEST_TAG => {
                expect_fields(REQUEST_TAG, &fields, 3)?;
                let requester = parse_node_id(fields[1])?;
                let timestamp = parse_timestamp(fields[2])?;
                Ok(Message::Request(RequestRecord::new(requester, timestamp)))
            }
            GRANT_TAG => {
                expect_fields(GRANT_TAG, &fields, 2)?;
                let granter = parse_node_id(fields[1])?;
                Ok(Message::Grant { granter })
            }
            other => Err(WireError::UnknownKind(other.to_string())),
        }
    }
}

fn expect_fields(kind: &'static str, fields: &[&str], expected: usize) -> Result<(), WireError> {
    if fields.len() == expected {
        Ok(())
    } else {
        Err(WireError::FieldCount {
            kind,
            expected,
            got: fields.len(),
        })
    }
}

fn parse_node_id(field: &str) -> Result<NodeId, WireError> {
    field
        .parse::<u32>()
        .ok()
        .and_then(NodeId::new)
        .ok_or_else(|| WireError::InvalidNodeId(field.to_string()))
}

fn parse_timestamp(field: &str) -> Result<Timestamp, WireError> {
    field
        .parse::<f64>()
        .ok()
        .and_then(Timestamp::from_secs)
        .ok_or_else(|| WireError::InvalidTimestamp(field.to_string()))
}
