//! # DHT Messages
//!
//! Request and response types exchanged through [`DhtRpc`](crate::DhtRpc).
//! Encoding is left to the transport; everything derives serde so any
//! format can carry it.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong` |
//! | `FindNode` | `Nodes` |
//! | `GetValue` | `Value` |
//! | `GetProviders` | `Providers` |
//! | `PutValue` | `Ack` |
//! | `AddProvider` | `Ack` |
//!
//! Any request may be answered with `Error` when the receiver refuses it.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::record::Record;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode {
        key: Vec<u8>,
    },
    GetValue {
        key: Vec<u8>,
    },
    GetProviders {
        key: Vec<u8>,
    },
    PutValue {
        record: Record,
    },
    AddProvider {
        key: Vec<u8>,
        provider: PeerId,
    },
}

impl DhtRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "PING",
            DhtRequest::FindNode { .. } => "FIND_NODE",
            DhtRequest::GetValue { .. } => "GET_VALUE",
            DhtRequest::GetProviders { .. } => "GET_PROVIDERS",
            DhtRequest::PutValue { .. } => "PUT_VALUE",
            DhtRequest::AddProvider { .. } => "ADD_PROVIDER",
        }
    }

    /// Whether `response` is the kind of answer this request calls for.
    /// `Error` is never a valid answer.
    pub fn accepts(&self, response: &DhtResponse) -> bool {
        matches!(
            (self, response),
            (DhtRequest::Ping, DhtResponse::Pong)
                | (DhtRequest::FindNode { .. }, DhtResponse::Nodes { .. })
                | (DhtRequest::GetValue { .. }, DhtResponse::Value { .. })
                | (DhtRequest::GetProviders { .. }, DhtResponse::Providers { .. })
                | (DhtRequest::PutValue { .. }, DhtResponse::Ack)
                | (DhtRequest::AddProvider { .. }, DhtResponse::Ack)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong,
    Nodes {
        closer: Vec<PeerId>,
    },
    Value {
        record: Option<Record>,
        closer: Vec<PeerId>,
    },
    Providers {
        providers: Vec<PeerId>,
        closer: Vec<PeerId>,
    },
    Ack,
    Error {
        message: String,
    },
}

impl DhtResponse {
    pub fn name(&self) -> &'static str {
        match self {
            DhtResponse::Pong => "PONG",
            DhtResponse::Nodes { .. } => "NODES",
            DhtResponse::Value { .. } => "VALUE",
            DhtResponse::Providers { .. } => "PROVIDERS",
            DhtResponse::Ack => "ACK",
            DhtResponse::Error { .. } => "ERROR",
        }
    }

    /// Peers the responder reported as closer to the requested key.
    pub fn closer(&self) -> &[PeerId] {
        match self {
            DhtResponse::Nodes { closer }
            | DhtResponse::Value { closer, .. }
            | DhtResponse::Providers { closer, .. } => closer,
            DhtResponse::Pong | DhtResponse::Ack | DhtResponse::Error { .. } => &[],
        }
    }
}
