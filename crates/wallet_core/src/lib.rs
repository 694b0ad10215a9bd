use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{ConnectionEvent, ConnectionState, InvalidTransition, ProviderKind, StacksAddress},
    protocol::{PairingUriError, RELAY_URI_SCHEME},
};
use storage::PreferenceStore;
use tokio::{
    sync::{broadcast, Mutex, OnceCell},
    time::error::Elapsed,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod provider;
pub mod registry;
pub mod relay_session_manager;

pub use config::{load_settings, WalletSettings};
pub use error::{classify_provider_error, classify_provider_failure, ConnectError};
pub use provider::{extract_stacks_address, InjectedProvider, MissingInjectedProvider};
pub use registry::{HeadlessEnvironment, ProviderEnvironment, ProviderRegistry};
pub use relay_session_manager::{
    MissingRelayConnector, RelayError, RelaySessionManager, SigningDelegate,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    StateChanged(ConnectionState),
}

/// The connection surface UI collaborators drive.
#[async_trait]
pub trait WalletHandle: Send + Sync {
    async fn connect(&self, requested: Option<ProviderKind>) -> Result<StacksAddress, ConnectError>;
    async fn connect_via_relay(&self, uri: &str) -> Result<(), ConnectError>;
    async fn disconnect(&self);
    async fn state(&self) -> ConnectionState;
    fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent>;
}

pub struct ConnectionOrchestrator {
    registry: ProviderRegistry,
    provider: Arc<dyn InjectedProvider>,
    relay: Arc<RelaySessionManager>,
    preferences: Arc<dyn PreferenceStore>,
    state: Mutex<ConnectionState>,
    startup_probe: OnceCell<()>,
    events: broadcast::Sender<WalletEvent>,
}

impl ConnectionOrchestrator {
    /// An orchestrator with no signing surface wired; only preferences are live.
    pub fn new(preferences: Arc<dyn PreferenceStore>, settings: &WalletSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            ProviderRegistry::default(),
            Arc::new(MissingInjectedProvider),
            RelaySessionManager::new(
                Arc::new(MissingRelayConnector),
                settings.relay_client_options(),
                settings.network,
            ),
            preferences,
        )
    }

    pub fn new_with_dependencies(
        registry: ProviderRegistry,
        provider: Arc<dyn InjectedProvider>,
        relay: Arc<RelaySessionManager>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            registry,
            provider,
            relay,
            preferences,
            state: Mutex::new(ConnectionState::Disconnected),
            startup_probe: OnceCell::new(),
            events,
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<RelaySessionManager> {
        &self.relay
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }

    /// Applies `event` to the current state and publishes the result.
    async fn transition(
        &self,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, InvalidTransition> {
        let mut state = self.state.lock().await;
        let next = state.apply(event)?;
        *state = next.clone();
        self.publish(&next);
        Ok(next)
    }

    fn publish(&self, state: &ConnectionState) {
        debug!(state = state.name(), "wallet: state changed");
        let _ = self.events.send(WalletEvent::StateChanged(state.clone()));
    }

    /// Moves to `Connecting`, returning the state it left.
    async fn begin(&self) -> Result<ConnectionState, ConnectError> {
        let mut state = self.state.lock().await;
        let previous = state.clone();
        let next = state
            .apply(ConnectionEvent::Begin)
            .map_err(|_| ConnectError::ConcurrentConnectAttempt)?;
        *state = next.clone();
        self.publish(&next);
        Ok(previous)
    }

    /// Connects through the injected provider, checking it is `requested` when given.
    ///
    /// Reconnecting while relay-bound closes the relay sessions first. If the
    /// attempt is reset by [`Self::disconnect`] before it completes, it fails
    /// with [`ConnectError::UserCancelled`] and nothing is persisted.
    pub async fn connect(
        &self,
        requested: Option<ProviderKind>,
    ) -> Result<StacksAddress, ConnectError> {
        let previous = match self.begin().await {
            Ok(previous) => previous,
            Err(err) => {
                warn!("wallet: connect refused, another attempt is in flight");
                return Err(err);
            }
        };
        if previous.kind() == Some(ProviderKind::Relay) || self.relay.has_active_session().await {
            self.release_relay().await;
        }

        match self.attempt_provider_connect(requested).await {
            Ok((address, kind)) => {
                let succeeded = ConnectionEvent::Succeeded {
                    address: address.clone(),
                    kind,
                };
                if let Err(err) = self.transition(succeeded).await {
                    warn!(address = %address, "wallet: connect result discarded: {err}");
                    return Err(ConnectError::UserCancelled);
                }
                info!(address = %address, kind = %kind, "wallet: connected");
                self.remember_kind(kind).await;
                Ok(address)
            }
            Err(err) => {
                warn!(requested = ?requested, "wallet: connect failed: {err}");
                let failed = ConnectionEvent::Failed {
                    message: err.to_string(),
                };
                if let Err(transition) = self.transition(failed).await {
                    warn!("wallet: connect failure discarded: {transition}");
                }
                Err(err)
            }
        }
    }

    async fn attempt_provider_connect(
        &self,
        requested: Option<ProviderKind>,
    ) -> Result<(StacksAddress, ProviderKind), ConnectError> {
        let active = self.registry.active_provider().map(|provider| provider.kind);
        let kind = match (requested, active) {
            (Some(requested), Some(active)) if requested != active => {
                return Err(ConnectError::ProviderMismatch { requested, active });
            }
            (_, Some(active)) => active,
            (_, None) => return Err(ConnectError::NoProviderInstalled),
        };

        let response = self
            .provider
            .connect()
            .await
            .map_err(|err| classify_provider_error(&err))?;
        let address =
            extract_stacks_address(&response).ok_or(ConnectError::AddressExtractionFailed)?;
        Ok((address, kind))
    }

    /// Runs `connect` in the background and stops waiting after `timeout`.
    ///
    /// On elapse the attempt keeps running and its outcome still lands in the
    /// state machine; only the caller stops waiting.
    pub async fn connect_with_timeout(
        self: &Arc<Self>,
        requested: Option<ProviderKind>,
        timeout: Duration,
    ) -> Result<Result<StacksAddress, ConnectError>, Elapsed> {
        let orchestrator = Arc::clone(self);
        let attempt = tokio::spawn(async move { orchestrator.connect(requested).await });

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(join)) => Ok(Err(ConnectError::Unclassified(format!(
                "connect attempt aborted: {join}"
            )))),
            Err(elapsed) => {
                warn!(?timeout, "wallet: connect still pending after caller timeout");
                Err(elapsed)
            }
        }
    }

    /// Pairs a relay peer on top of the current connection.
    pub async fn connect_via_relay(&self, uri: &str) -> Result<(), ConnectError> {
        let (previous, address) = {
            let mut state = self.state.lock().await;
            if state.is_connecting() {
                return Err(ConnectError::ConcurrentConnectAttempt);
            }
            let Some(address) = state.address().cloned() else {
                return Err(ConnectError::NotYetConnected);
            };
            if !uri.trim_start().starts_with(RELAY_URI_SCHEME) {
                warn!("wallet: relay uri refused before pairing");
                return Err(ConnectError::ProtocolError(
                    PairingUriError::WrongScheme.to_string(),
                ));
            }
            let previous = state.clone();
            let next = state
                .apply(ConnectionEvent::Begin)
                .map_err(|_| ConnectError::ConcurrentConnectAttempt)?;
            *state = next.clone();
            self.publish(&next);
            (previous, address)
        };

        self.relay.start_event_loop().await;
        match self.relay.pair(uri, &address).await {
            Ok(()) => {
                let succeeded = ConnectionEvent::Succeeded {
                    address: address.clone(),
                    kind: ProviderKind::Relay,
                };
                if let Err(err) = self.transition(succeeded).await {
                    warn!("wallet: relay result discarded: {err}");
                    self.release_relay().await;
                    return Err(ConnectError::UserCancelled);
                }
                info!(address = %address, "wallet: relay paired");
                self.remember_kind(ProviderKind::Relay).await;
                if let Err(err) = self.preferences.bind_relay_address(&address).await {
                    warn!("wallet: failed to persist relay address: {err:#}");
                }
                Ok(())
            }
            Err(err) => {
                warn!("wallet: relay pairing failed: {err}");
                if let Err(transition) = self.transition(ConnectionEvent::Restore(previous)).await
                {
                    warn!("wallet: relay failure discarded: {transition}");
                }
                Err(ConnectError::ProtocolError(err.to_string()))
            }
        }
    }

    /// Clears every session and the stored preference; never fails locally.
    pub async fn disconnect(&self) {
        let current = self.state().await;
        let stored = match self.preferences.load().await {
            Ok(kind) => kind,
            Err(err) => {
                warn!("wallet: failed to read preference during disconnect: {err:#}");
                None
            }
        };

        if current.kind() == Some(ProviderKind::Relay)
            || stored == Some(ProviderKind::Relay)
            || self.relay.has_active_session().await
        {
            if let Err(err) = self.relay.disconnect_all().await {
                warn!("wallet: relay teardown failed: {err}");
            }
        }
        if let Err(err) = self.provider.disconnect().await {
            warn!("wallet: provider disconnect failed: {err:#}");
        }

        if let Err(err) = self.transition(ConnectionEvent::Reset).await {
            warn!("wallet: reset refused: {err}");
        }
        if let Err(err) = self.preferences.clear().await {
            warn!("wallet: failed to clear preference: {err:#}");
        }
        if let Err(err) = self.preferences.clear_relay_address().await {
            warn!("wallet: failed to clear relay address: {err:#}");
        }
        info!("wallet: disconnected");
    }

    /// Adopts sessions left over from an earlier run. Only the first call probes.
    ///
    /// Relay sessions bound in an earlier run are always restored so a later
    /// disconnect can close them, even when the provider session wins adoption.
    pub async fn initialize(&self) -> ConnectionState {
        self.startup_probe
            .get_or_init(|| async {
                let adopted = self.probe_provider_session().await;
                self.probe_relay_session(!adopted).await;
            })
            .await;
        self.state().await
    }

    async fn probe_provider_session(&self) -> bool {
        let response = match self.provider.existing_session().await {
            Ok(Some(response)) => response,
            Ok(None) => return false,
            Err(err) => {
                warn!("wallet: existing session probe failed: {err:#}");
                return false;
            }
        };
        let Some(address) = extract_stacks_address(&response) else {
            warn!("wallet: existing session has no stacks address");
            return false;
        };

        let kind = match self.registry.active_provider() {
            Some(active) => Some(active.kind),
            None => self
                .load_preference()
                .await
                .filter(|kind| kind.is_injectable()),
        };
        let Some(kind) = kind else {
            debug!("wallet: existing session found but provider kind unknown, skipping");
            return false;
        };
        self.adopt(address, kind).await
    }

    async fn probe_relay_session(&self, adopt: bool) {
        let address = match self.preferences.relay_address().await {
            Ok(Some(address)) => address,
            Ok(None) => return,
            Err(err) => {
                warn!("wallet: failed to read relay address: {err:#}");
                return;
            }
        };
        match self.relay.restore().await {
            Ok(sessions) if !sessions.is_empty() => {
                self.relay.start_event_loop().await;
                if adopt {
                    self.adopt(address, ProviderKind::Relay).await;
                } else {
                    debug!(
                        sessions = sessions.len(),
                        "wallet: relay sessions restored behind provider session"
                    );
                }
            }
            Ok(_) => debug!("wallet: relay address stored but no live session"),
            Err(err) => warn!("wallet: relay restore failed: {err}"),
        }
    }

    /// Moves an idle orchestrator straight to `Connected`.
    async fn adopt(&self, address: StacksAddress, kind: ProviderKind) -> bool {
        let mut state = self.state.lock().await;
        if !matches!(*state, ConnectionState::Disconnected) {
            debug!(state = state.name(), "wallet: skipping adoption, state already set");
            return false;
        }
        let adopted = state.apply(ConnectionEvent::Begin).and_then(|connecting| {
            connecting.apply(ConnectionEvent::Succeeded {
                address: address.clone(),
                kind,
            })
        });
        match adopted {
            Ok(next) => {
                *state = next.clone();
                self.publish(&next);
                info!(address = %address, kind = %kind, "wallet: adopted existing session");
                true
            }
            Err(err) => {
                warn!("wallet: adoption refused: {err}");
                false
            }
        }
    }

    /// Closes relay sessions and forgets the relay binding, logging failures.
    async fn release_relay(&self) {
        if let Err(err) = self.relay.disconnect_all().await {
            warn!("wallet: relay teardown failed: {err}");
        }
        if let Err(err) = self.preferences.clear_relay_address().await {
            warn!("wallet: failed to clear relay address: {err:#}");
        }
    }

    async fn remember_kind(&self, kind: ProviderKind) {
        if let Err(err) = self.preferences.save(kind).await {
            warn!(kind = %kind, "wallet: failed to persist preference: {err:#}");
        }
    }

    async fn load_preference(&self) -> Option<ProviderKind> {
        match self.preferences.load().await {
            Ok(kind) => kind,
            Err(err) => {
                warn!("wallet: failed to load preference: {err:#}");
                None
            }
        }
    }
}

#[async_trait]
impl WalletHandle for ConnectionOrchestrator {
    async fn connect(&self, requested: Option<ProviderKind>) -> Result<StacksAddress, ConnectError> {
        ConnectionOrchestrator::connect(self, requested).await
    }

    async fn connect_via_relay(&self, uri: &str) -> Result<(), ConnectError> {
        ConnectionOrchestrator::connect_via_relay(self, uri).await
    }

    async fn disconnect(&self) {
        ConnectionOrchestrator::disconnect(self).await
    }

    async fn state(&self) -> ConnectionState {
        ConnectionOrchestrator::state(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        ConnectionOrchestrator::subscribe_events(self)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
