use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::error::RpcError;

pub const RELAY_URI_SCHEME: &str = "wc:";
pub const STACKS_NAMESPACE: &str = "stacks";

pub const METHOD_SIGN_MESSAGE: &str = "stacks_signMessage";
pub const METHOD_SIGN_TRANSACTION: &str = "stacks_signTransaction";
pub const METHOD_STX_TRANSFER: &str = "stacks_stxTransfer";
pub const METHOD_CONTRACT_CALL: &str = "stacks_contractCall";
pub const METHOD_CONTRACT_DEPLOY: &str = "stacks_contractDeploy";

pub const STACKS_METHODS: [&str; 5] = [
    METHOD_SIGN_MESSAGE,
    METHOD_SIGN_TRANSACTION,
    METHOD_STX_TRANSFER,
    METHOD_CONTRACT_CALL,
    METHOD_CONTRACT_DEPLOY,
];

pub const STACKS_EVENTS: [&str; 2] = ["accountsChanged", "chainChanged"];

/// Namespace keys under which providers group stacks addresses.
pub const STACKS_ADDRESS_KEYS: [&str; 2] = ["stx", "stacks"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressEntry {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl AddressEntry {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: None,
            purpose: None,
            symbol: None,
        }
    }
}

/// The two response shapes seen across the provider ecosystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressBook {
    Flat(Vec<AddressEntry>),
    Namespaced(BTreeMap<String, Vec<AddressEntry>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub addresses: AddressBook,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingUriError {
    #[error("pairing uri must start with 'wc:'")]
    WrongScheme,
    #[error("pairing uri is malformed: {0}")]
    Malformed(String),
    #[error("pairing uri has no topic")]
    MissingTopic,
    #[error("pairing uri has invalid version '{0}'")]
    BadVersion(String),
    #[error("pairing uri is missing '{0}'")]
    MissingParam(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingUri {
    pub topic: String,
    pub version: u32,
    pub relay_protocol: String,
    pub sym_key: String,
    pub expiry: Option<DateTime<Utc>>,
    raw: String,
}

impl PairingUri {
    pub fn parse(raw: &str) -> Result<Self, PairingUriError> {
        let raw = raw.trim();
        if !raw.starts_with(RELAY_URI_SCHEME) {
            return Err(PairingUriError::WrongScheme);
        }
        let url = Url::parse(raw).map_err(|err| PairingUriError::Malformed(err.to_string()))?;

        let (topic, version) = url
            .path()
            .split_once('@')
            .ok_or(PairingUriError::MissingTopic)?;
        if topic.is_empty() {
            return Err(PairingUriError::MissingTopic);
        }
        let version = version
            .parse::<u32>()
            .map_err(|_| PairingUriError::BadVersion(version.to_string()))?;

        let mut relay_protocol = None;
        let mut sym_key = None;
        let mut expiry = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay-protocol" => relay_protocol = Some(value.into_owned()),
                "symKey" => sym_key = Some(value.into_owned()),
                "expiryTimestamp" => {
                    expiry = value
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                }
                _ => {}
            }
        }

        Ok(Self {
            topic: topic.to_string(),
            version,
            relay_protocol: relay_protocol.unwrap_or_else(|| "irn".to_string()),
            sym_key: sym_key
                .filter(|key| !key.is_empty())
                .ok_or(PairingUriError::MissingParam("symKey"))?,
            expiry,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProposalNamespace {
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionNamespace {
    pub chains: Vec<String>,
    pub accounts: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    pub id: u64,
    pub pairing_topic: String,
    #[serde(default)]
    pub proposer: PeerMetadata,
    #[serde(default)]
    pub required_namespaces: BTreeMap<String, ProposalNamespace>,
    #[serde(default)]
    pub optional_namespaces: BTreeMap<String, ProposalNamespace>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub id: u64,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub request: RpcRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<RpcError>) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayEvent {
    SessionProposal(SessionProposal),
    SessionRequest(SessionRequest),
    SessionDelete { topic: String },
}

impl RelayEvent {
    pub fn topic(&self) -> &str {
        match self {
            RelayEvent::SessionProposal(proposal) => &proposal.pairing_topic,
            RelayEvent::SessionRequest(request) => &request.topic,
            RelayEvent::SessionDelete { topic } => topic,
        }
    }
}

/// A session as reported by the relay client itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySessionInfo {
    pub topic: String,
    #[serde(default)]
    pub namespaces: BTreeMap<String, SessionNamespace>,
}
