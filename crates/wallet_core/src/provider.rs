use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::StacksAddress,
    protocol::{AddressBook, ConnectResponse, STACKS_ADDRESS_KEYS},
};

/// The connect/authorize surface of whichever extension owns the global slot.
#[async_trait]
pub trait InjectedProvider: Send + Sync {
    async fn connect(&self) -> Result<ConnectResponse>;
    /// Authorization left over from an earlier visit, if the provider kept one.
    async fn existing_session(&self) -> Result<Option<ConnectResponse>>;
    async fn disconnect(&self) -> Result<()>;
}

pub struct MissingInjectedProvider;

#[async_trait]
impl InjectedProvider for MissingInjectedProvider {
    async fn connect(&self) -> Result<ConnectResponse> {
        Err(anyhow!("injected provider is unavailable"))
    }

    async fn existing_session(&self) -> Result<Option<ConnectResponse>> {
        Ok(None)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Pulls the stacks address out of either response shape.
///
/// A namespace grouping wins when present and yields its first entry;
/// a flat list yields the first entry carrying a stacks prefix.
pub fn extract_stacks_address(response: &ConnectResponse) -> Option<StacksAddress> {
    match &response.addresses {
        AddressBook::Namespaced(groups) => STACKS_ADDRESS_KEYS
            .iter()
            .find_map(|key| groups.get(*key))
            .and_then(|entries| entries.first())
            .and_then(|entry| StacksAddress::parse(entry.address.as_str()).ok()),
        AddressBook::Flat(entries) => entries
            .iter()
            .find_map(|entry| StacksAddress::parse(entry.address.as_str()).ok()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use shared::protocol::AddressEntry;

    use super::*;

    const STX: &str = "SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7";

    fn flat(addresses: &[&str]) -> ConnectResponse {
        ConnectResponse {
            addresses: AddressBook::Flat(addresses.iter().map(|a| AddressEntry::new(*a)).collect()),
        }
    }

    fn grouped(key: &str, addresses: &[&str]) -> ConnectResponse {
        let mut groups = BTreeMap::new();
        groups.insert(
            key.to_string(),
            addresses.iter().map(|a| AddressEntry::new(*a)).collect(),
        );
        ConnectResponse {
            addresses: AddressBook::Namespaced(groups),
        }
    }

    #[test]
    fn both_shapes_yield_the_same_address() {
        let from_flat = extract_stacks_address(&flat(&[
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
            STX,
        ]));
        let from_grouped = extract_stacks_address(&grouped("stx", &[STX]));
        assert_eq!(from_flat, from_grouped);
        assert_eq!(from_flat.map(|a| a.to_string()), Some(STX.to_string()));
    }

    #[test]
    fn flat_list_accepts_testnet_prefix() {
        let address = extract_stacks_address(&flat(&["ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM"]));
        assert!(address.is_some());
    }

    #[test]
    fn grouping_under_stacks_key_is_recognized() {
        assert!(extract_stacks_address(&grouped("stacks", &[STX])).is_some());
    }

    #[test]
    fn missing_address_yields_none() {
        assert_eq!(extract_stacks_address(&flat(&[])), None);
        assert_eq!(
            extract_stacks_address(&flat(&["bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"])),
            None
        );
        assert_eq!(extract_stacks_address(&grouped("btc", &["bc1q"])), None);
        assert_eq!(extract_stacks_address(&grouped("stx", &[])), None);
    }
}
