use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Leather,
    Xverse,
    Hiro,
    #[serde(alias = "walletconnect")]
    Relay,
}

impl ProviderKind {
    /// Fixed enumeration order; listings never follow installation order.
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Leather,
        ProviderKind::Xverse,
        ProviderKind::Hiro,
        ProviderKind::Relay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Leather => "leather",
            ProviderKind::Xverse => "xverse",
            ProviderKind::Hiro => "hiro",
            ProviderKind::Relay => "relay",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProviderKind::Leather => "Leather Wallet",
            ProviderKind::Xverse => "Xverse Wallet",
            ProviderKind::Hiro => "Hiro Wallet",
            ProviderKind::Relay => "WalletConnect",
        }
    }

    pub fn download_url(self) -> &'static str {
        match self {
            ProviderKind::Leather => "https://leather.io/install-extension",
            ProviderKind::Xverse => "https://www.xverse.app/download",
            ProviderKind::Hiro => "https://wallet.hiro.so/",
            ProviderKind::Relay => "https://walletconnect.com/",
        }
    }

    /// Whether this kind is reached through the injected global slot.
    pub fn is_injectable(self) -> bool {
        !matches!(self, ProviderKind::Relay)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider kind '{0}'")]
pub struct UnknownProviderKind(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProviderKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leather" => Ok(ProviderKind::Leather),
            "xverse" => Ok(ProviderKind::Xverse),
            "hiro" => Ok(ProviderKind::Hiro),
            "relay" | "walletconnect" => Ok(ProviderKind::Relay),
            other => Err(UnknownProviderKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub label: String,
    pub installed: bool,
    pub download_url: String,
}

impl ProviderDescriptor {
    pub fn new(kind: ProviderKind, installed: bool) -> Self {
        Self {
            kind,
            label: kind.label().to_string(),
            installed,
            download_url: kind.download_url().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StacksNetwork {
    #[default]
    Mainnet,
    Testnet,
}

impl StacksNetwork {
    pub fn chain_id(self) -> &'static str {
        match self {
            StacksNetwork::Mainnet => "stacks:1",
            StacksNetwork::Testnet => "stacks:2147483648",
        }
    }
}

impl fmt::Display for StacksNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StacksNetwork::Mainnet => f.write_str("mainnet"),
            StacksNetwork::Testnet => f.write_str("testnet"),
        }
    }
}

impl FromStr for StacksNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(StacksNetwork::Mainnet),
            "testnet" => Ok(StacksNetwork::Testnet),
            other => Err(format!("unknown stacks network '{other}'")),
        }
    }
}

/// c32 version prefixes: SP/SM on mainnet, ST/SN on testnet.
const STACKS_ADDRESS_PREFIXES: [&str; 4] = ["SP", "SM", "ST", "SN"];

pub fn has_stacks_prefix(address: &str) -> bool {
    STACKS_ADDRESS_PREFIXES
        .iter()
        .any(|prefix| address.starts_with(prefix))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address '{0}' does not use a stacks version prefix")]
    BadPrefix(String),
    #[error("address '{0}' contains non-alphanumeric characters")]
    BadCharacters(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StacksAddress(String);

impl StacksAddress {
    pub fn parse(raw: impl Into<String>) -> Result<Self, AddressError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        if !has_stacks_prefix(trimmed) {
            return Err(AddressError::BadPrefix(trimmed.to_string()));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AddressError::BadCharacters(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StacksAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StacksAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<StacksAddress> for String {
    fn from(value: StacksAddress) -> Self {
        value.0
    }
}

/// `{chain_id}:{address}`, the account form used inside relay namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainAccount(String);

impl ChainAccount {
    pub fn new(network: StacksNetwork, address: &StacksAddress) -> Self {
        Self(format!("{}:{}", network.chain_id(), address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing address segment, if it is a well-formed stacks address.
    pub fn address(&self) -> Option<StacksAddress> {
        self.0
            .rsplit(':')
            .next()
            .and_then(|raw| StacksAddress::parse(raw).ok())
    }
}

impl fmt::Display for ChainAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        address: StacksAddress,
        kind: ProviderKind,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Begin,
    Succeeded {
        address: StacksAddress,
        kind: ProviderKind,
    },
    Failed {
        message: String,
    },
    /// Abandon the attempt and return to a previously observed state.
    Restore(ConnectionState),
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid connection transition from {from} on {event}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub event: &'static str,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Error { .. } => "error",
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn address(&self) -> Option<&StacksAddress> {
        match self {
            ConnectionState::Connected { address, .. } => Some(address),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ProviderKind> {
        match self {
            ConnectionState::Connected { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConnectionState::Error { message } => Some(message),
            _ => None,
        }
    }

    pub fn apply(&self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        let event_name = event.name();
        match (self, event) {
            (_, ConnectionEvent::Reset) => Ok(ConnectionState::Disconnected),
            (ConnectionState::Connecting, ConnectionEvent::Begin) => Err(InvalidTransition {
                from: self.name(),
                event: event_name,
            }),
            (_, ConnectionEvent::Begin) => Ok(ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionEvent::Succeeded { address, kind }) => {
                Ok(ConnectionState::Connected { address, kind })
            }
            (ConnectionState::Connecting, ConnectionEvent::Failed { message }) => {
                Ok(ConnectionState::Error { message })
            }
            (ConnectionState::Connecting, ConnectionEvent::Restore(previous))
                if !previous.is_connecting() =>
            {
                Ok(previous)
            }
            _ => Err(InvalidTransition {
                from: self.name(),
                event: event_name,
            }),
        }
    }
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Begin => "begin",
            ConnectionEvent::Succeeded { .. } => "succeeded",
            ConnectionEvent::Failed { .. } => "failed",
            ConnectionEvent::Restore(_) => "restore",
            ConnectionEvent::Reset => "reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> StacksAddress {
        StacksAddress::parse("SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7").expect("address")
    }

    #[test]
    fn provider_kind_parses_legacy_relay_name() {
        assert_eq!(
            "walletconnect".parse::<ProviderKind>().expect("kind"),
            ProviderKind::Relay
        );
        assert_eq!("Leather".parse::<ProviderKind>().expect("kind"), ProviderKind::Leather);
        assert!("metamask".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn stacks_address_rejects_foreign_prefixes() {
        assert!(StacksAddress::parse("ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM").is_ok());
        assert_eq!(StacksAddress::parse("  "), Err(AddressError::Empty));
        assert!(matches!(
            StacksAddress::parse("bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh"),
            Err(AddressError::BadPrefix(_))
        ));
        assert!(matches!(
            StacksAddress::parse("SP2J6-ZY48"),
            Err(AddressError::BadCharacters(_))
        ));
    }

    #[test]
    fn chain_account_round_trips_address() {
        let account = ChainAccount::new(StacksNetwork::Mainnet, &address());
        assert_eq!(
            account.as_str(),
            "stacks:1:SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7"
        );
        assert_eq!(account.address(), Some(address()));
    }

    #[test]
    fn second_begin_while_connecting_is_rejected() {
        let connecting = ConnectionState::Disconnected
            .apply(ConnectionEvent::Begin)
            .expect("begin");
        let err = connecting
            .apply(ConnectionEvent::Begin)
            .expect_err("double begin");
        assert_eq!(err.from, "connecting");
    }

    #[test]
    fn outcome_events_require_connecting() {
        assert!(ConnectionState::Disconnected
            .apply(ConnectionEvent::Succeeded {
                address: address(),
                kind: ProviderKind::Leather,
            })
            .is_err());
        assert!(ConnectionState::Error {
            message: "x".into()
        }
        .apply(ConnectionEvent::Failed {
            message: "y".into()
        })
        .is_err());
    }

    #[test]
    fn restore_returns_previous_connected_state() {
        let previous = ConnectionState::Connected {
            address: address(),
            kind: ProviderKind::Hiro,
        };
        let restored = previous
            .apply(ConnectionEvent::Begin)
            .and_then(|s| s.apply(ConnectionEvent::Restore(previous.clone())))
            .expect("restore");
        assert_eq!(restored, previous);
    }

    #[test]
    fn reset_is_always_legal() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Error {
                message: "boom".into(),
            },
        ] {
            assert_eq!(
                state.apply(ConnectionEvent::Reset),
                Ok(ConnectionState::Disconnected)
            );
        }
    }
}
