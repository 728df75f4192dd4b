//! Transition keys and magic strings.
//!
//! Every dispatched resource op carries a transition key naming the graph
//! and action that scheduled it plus the rc the scheduler expects; the
//! recorded result additionally carries the observed status and rc. These
//! strings are the sole correlation between result events and graph
//! actions, so their format is stable across peers.

use std::fmt;

/// Identifies one action of one transition graph, scheduled by one leader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionKey {
    pub action_id: u32,
    pub graph_id: u32,
    pub target_rc: i32,
    pub dc_uuid: String,
}

/// The full magic string recorded with an op result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionMagic {
    pub op_status: i32,
    pub op_rc: i32,
    pub key: TransitionKey,
}

/// Errors from parsing keys and magic strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParseError {
    pub input: String,
}

impl fmt::Display for KeyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Malformed transition key or magic '{}'", self.input)
    }
}

impl std::error::Error for KeyParseError {}

impl TransitionKey {
    pub fn new(action_id: u32, graph_id: u32, target_rc: i32, dc_uuid: &str) -> Self {
        TransitionKey {
            action_id,
            graph_id,
            target_rc,
            dc_uuid: dc_uuid.to_string(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, KeyParseError> {
        let err = || KeyParseError { input: input.to_string() };
        let mut parts = input.splitn(4, ':');
        let action_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let graph_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let target_rc = parts.next().and_then(|p| p.parse().ok()).ok_or_else(err)?;
        let dc_uuid = parts.next().filter(|p| !p.is_empty()).ok_or_else(err)?;
        Ok(TransitionKey {
            action_id,
            graph_id,
            target_rc,
            dc_uuid: dc_uuid.to_string(),
        })
    }
}

impl fmt::Display for TransitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.action_id, self.graph_id, self.target_rc, self.dc_uuid
        )
    }
}

impl TransitionMagic {
    pub fn new(op_status: i32, op_rc: i32, key: TransitionKey) -> Self {
        TransitionMagic { op_status, op_rc, key }
    }

    pub fn parse(input: &str) -> Result<Self, KeyParseError> {
        let err = || KeyParseError { input: input.to_string() };
        let (head, key) = input.split_once(';').ok_or_else(err)?;
        let (status, rc) = head.split_once(':').ok_or_else(err)?;
        Ok(TransitionMagic {
            op_status: status.parse().map_err(|_| err())?,
            op_rc: rc.parse().map_err(|_| err())?,
            key: TransitionKey::parse(key)?,
        })
    }
}

impl fmt::Display for TransitionMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};{}", self.op_status, self.op_rc, self.key)
    }
}
