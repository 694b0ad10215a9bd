use std::{collections::HashMap, fs, path::Path};

use relay_integration::RelayClientOptions;
use serde::{Deserialize, Serialize};
use shared::{domain::StacksNetwork, protocol::PeerMetadata};
use tracing::warn;

pub const SETTINGS_FILE: &str = "wallet.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSettings {
    pub network: StacksNetwork,
    pub relay_project_id: String,
    pub app_name: String,
    pub app_description: String,
    pub app_url: String,
    pub preferences_database_url: String,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            network: StacksNetwork::Mainnet,
            relay_project_id: "YOUR_PROJECT_ID".into(),
            app_name: "StacksStamp".into(),
            app_description: "Digital ticketing on Stacks blockchain".into(),
            app_url: "http://localhost:5173".into(),
            preferences_database_url: "sqlite://./data/wallet_preferences.db".into(),
        }
    }
}

impl WalletSettings {
    pub fn relay_client_options(&self) -> RelayClientOptions {
        let origin = self.app_url.trim_end_matches('/');
        RelayClientOptions {
            project_id: self.relay_project_id.clone(),
            metadata: PeerMetadata {
                name: self.app_name.clone(),
                description: self.app_description.clone(),
                url: origin.to_string(),
                icons: vec![format!("{origin}/logo.svg")],
            },
        }
    }
}

/// Defaults, then `wallet.toml` in the working directory, then environment.
pub fn load_settings() -> WalletSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> WalletSettings {
    let mut settings = WalletSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => warn!("config: ignoring unreadable {}: {err}", path.display()),
        }
    }

    apply_overrides(&mut settings, |key| {
        env(&format!("APP__{}", key.to_ascii_uppercase()))
    });
    if let Some(v) = env("WALLETCONNECT_PROJECT_ID") {
        settings.relay_project_id = v;
    }

    settings
}

fn apply_overrides(settings: &mut WalletSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("network") {
        match v.parse::<StacksNetwork>() {
            Ok(network) => settings.network = network,
            Err(err) => warn!("config: {err}; keeping {}", settings.network),
        }
    }
    if let Some(v) = lookup("relay_project_id") {
        settings.relay_project_id = v;
    }
    if let Some(v) = lookup("app_name") {
        settings.app_name = v;
    }
    if let Some(v) = lookup("app_description") {
        settings.app_description = v;
    }
    if let Some(v) = lookup("app_url") {
        settings.app_url = v;
    }
    if let Some(v) = lookup("preferences_database_url") {
        settings.preferences_database_url = v;
    }
}
