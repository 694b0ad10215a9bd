use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_integration::{
    RelayClient, RelayClientOptions, RelayConnector, RelayEventReceiver, RelayEventSender,
};
use serde_json::Value;
use shared::{
    domain::{ChainAccount, StacksAddress, StacksNetwork},
    error::{RpcErrorCode, SdkReason},
    protocol::{
        JsonRpcResponse, PairingUri, PairingUriError, ProposalNamespace, RelayEvent,
        RelaySessionInfo, SessionNamespace, SessionProposal, SessionRequest,
        METHOD_CONTRACT_CALL, METHOD_SIGN_MESSAGE, METHOD_SIGN_TRANSACTION, METHOD_STX_TRANSFER,
        STACKS_EVENTS, STACKS_METHODS, STACKS_NAMESPACE,
    },
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid pairing uri: {0}")]
    InvalidUri(#[from] PairingUriError),
    #[error("pairing uri expired at {0}")]
    ExpiredUri(DateTime<Utc>),
    #[error("relay client unavailable: {0}")]
    ClientUnavailable(String),
    #[error("relay pairing failed: {0}")]
    Pairing(String),
    #[error("failed to close {failed} of {attempted} relay sessions; last error: {last}")]
    Teardown {
        attempted: usize,
        failed: usize,
        last: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    #[error("proposal does not request the stacks namespace")]
    MissingNamespace,
    #[error("unsupported namespace '{0}'")]
    UnsupportedNamespace(String),
    #[error("unsupported chain '{0}'")]
    UnsupportedChain(String),
    #[error("unsupported method '{0}'")]
    UnsupportedMethod(String),
    #[error("unsupported event '{0}'")]
    UnsupportedEvent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    Paired,
    Active,
    Rejected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySession {
    pub topic: String,
    pub account: Option<ChainAccount>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    pub active: bool,
    pub established_at: DateTime<Utc>,
}

impl RelaySession {
    fn from_info(info: &RelaySessionInfo) -> Self {
        let stacks = info.namespaces.get(STACKS_NAMESPACE);
        Self {
            topic: info.topic.clone(),
            account: stacks
                .and_then(|ns| ns.accounts.first())
                .and_then(|account| parse_chain_account(account)),
            methods: stacks.map(|ns| ns.methods.clone()).unwrap_or_default(),
            events: stacks.map(|ns| ns.events.clone()).unwrap_or_default(),
            active: true,
            established_at: Utc::now(),
        }
    }
}

fn parse_chain_account(raw: &str) -> Option<ChainAccount> {
    let (chain, address) = raw.rsplit_once(':')?;
    let network = [StacksNetwork::Mainnet, StacksNetwork::Testnet]
        .into_iter()
        .find(|network| network.chain_id() == chain)?;
    let address = StacksAddress::parse(address).ok()?;
    Some(ChainAccount::new(network, &address))
}

/// An inbound request that has been received but not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelayRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub topic: String,
    pub chain_id: Option<String>,
}

impl From<SessionRequest> for PendingRelayRequest {
    fn from(value: SessionRequest) -> Self {
        Self {
            id: value.id,
            method: value.request.method,
            params: value.request.params,
            topic: value.topic,
            chain_id: value.chain_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SigningDecision {
    Approved(Value),
    Declined,
}

/// Produces signatures for relay requests on behalf of the connected signer.
#[async_trait]
pub trait SigningDelegate: Send + Sync {
    async fn handle(&self, request: &PendingRelayRequest) -> Result<SigningDecision>;
}

/// Declines every signing request; no signer is wired to the relay path yet.
pub struct UnwiredSigningDelegate;

#[async_trait]
impl SigningDelegate for UnwiredSigningDelegate {
    async fn handle(&self, request: &PendingRelayRequest) -> Result<SigningDecision> {
        debug!(
            topic = %request.topic,
            id = request.id,
            method = %request.method,
            "relay: declining signing request, no signer wired"
        );
        Ok(SigningDecision::Declined)
    }
}

pub struct MissingRelayConnector;

#[async_trait]
impl RelayConnector for MissingRelayConnector {
    async fn connect(
        &self,
        _options: RelayClientOptions,
        _events: RelayEventSender,
    ) -> Result<Arc<dyn RelayClient>> {
        Err(anyhow!("relay connector is unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEventOutcome {
    ProposalApproved {
        proposal_id: u64,
        topic: String,
    },
    ProposalRejected {
        proposal_id: u64,
        reason: String,
    },
    RequestAnswered {
        topic: String,
        id: u64,
        response: JsonRpcResponse,
    },
    /// The response could not be delivered to the relay.
    RequestFailed {
        topic: String,
        id: u64,
        error: String,
    },
    SessionClosed {
        topic: String,
    },
    /// No relay client could be obtained to act on the event.
    Unhandled {
        topic: String,
        reason: String,
    },
}

/// Builds the namespace grant for a proposal.
///
/// The grant is always exactly the fixed stacks capability set on the
/// configured chain for the single bound account. A proposal whose
/// requirements fall outside that set is refused rather than narrowed.
pub fn build_approved_namespaces(
    proposal: &SessionProposal,
    network: StacksNetwork,
    account: &ChainAccount,
) -> Result<BTreeMap<String, SessionNamespace>, GrantError> {
    let chain = network.chain_id();
    let mut requested_stacks = false;

    for (key, required) in &proposal.required_namespaces {
        let chains = namespace_chains(key, required)?;
        requested_stacks = true;
        if let Some(unsupported) = chains.iter().find(|c| c.as_str() != chain) {
            return Err(GrantError::UnsupportedChain(unsupported.clone()));
        }
        if let Some(method) = required
            .methods
            .iter()
            .find(|m| !STACKS_METHODS.contains(&m.as_str()))
        {
            return Err(GrantError::UnsupportedMethod(method.clone()));
        }
        if let Some(event) = required
            .events
            .iter()
            .find(|e| !STACKS_EVENTS.contains(&e.as_str()))
        {
            return Err(GrantError::UnsupportedEvent(event.clone()));
        }
    }

    requested_stacks |= proposal
        .optional_namespaces
        .keys()
        .any(|key| is_stacks_namespace_key(key));

    if !requested_stacks {
        return Err(GrantError::MissingNamespace);
    }

    let mut namespaces = BTreeMap::new();
    namespaces.insert(
        STACKS_NAMESPACE.to_string(),
        SessionNamespace {
            chains: vec![chain.to_string()],
            accounts: vec![account.to_string()],
            methods: STACKS_METHODS.iter().map(|m| m.to_string()).collect(),
            events: STACKS_EVENTS.iter().map(|e| e.to_string()).collect(),
        },
    );
    Ok(namespaces)
}

fn is_stacks_namespace_key(key: &str) -> bool {
    key == STACKS_NAMESPACE
        || key
            .strip_prefix(STACKS_NAMESPACE)
            .is_some_and(|rest| rest.starts_with(':'))
}

/// Chains a required namespace asks for; `stacks:1` style keys name their chain.
fn namespace_chains(key: &str, namespace: &ProposalNamespace) -> Result<Vec<String>, GrantError> {
    if key == STACKS_NAMESPACE {
        Ok(namespace.chains.clone())
    } else if is_stacks_namespace_key(key) {
        Ok(vec![key.to_string()])
    } else {
        Err(GrantError::UnsupportedNamespace(key.to_string()))
    }
}

#[derive(Default)]
struct RelayState {
    bound_account: Option<ChainAccount>,
    pairings: HashMap<String, PairingPhase>,
    sessions: HashMap<String, RelaySession>,
    session_pairings: HashMap<String, String>,
    pending: BTreeMap<(String, u64), PendingRelayRequest>,
}

impl RelayState {
    fn close_session(&mut self, topic: &str) -> bool {
        let Some(session) = self.sessions.get_mut(topic) else {
            return false;
        };
        let was_active = session.active;
        session.active = false;
        if let Some(pairing_topic) = self.session_pairings.get(topic) {
            self.pairings
                .insert(pairing_topic.clone(), PairingPhase::Closed);
        }
        was_active
    }
}

pub struct RelaySessionManager {
    connector: Arc<dyn RelayConnector>,
    options: RelayClientOptions,
    network: StacksNetwork,
    signer: Arc<dyn SigningDelegate>,
    client: OnceCell<Arc<dyn RelayClient>>,
    events_tx: RelayEventSender,
    events_rx: Mutex<RelayEventReceiver>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<RelayState>,
}

impl RelaySessionManager {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        options: RelayClientOptions,
        network: StacksNetwork,
    ) -> Arc<Self> {
        Self::new_with_signing_delegate(
            connector,
            options,
            network,
            Arc::new(UnwiredSigningDelegate),
        )
    }

    pub fn new_with_signing_delegate(
        connector: Arc<dyn RelayConnector>,
        options: RelayClientOptions,
        network: StacksNetwork,
        signer: Arc<dyn SigningDelegate>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connector,
            options,
            network,
            signer,
            client: OnceCell::new(),
            events_tx,
            events_rx: Mutex::new(events_rx),
            event_loop: Mutex::new(None),
            state: Mutex::new(RelayState::default()),
        })
    }

    pub fn network(&self) -> StacksNetwork {
        self.network
    }

    pub fn is_initialized(&self) -> bool {
        self.client.initialized()
    }

    /// Returns the relay client, building it on first use.
    pub async fn init(&self) -> Result<Arc<dyn RelayClient>, RelayError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                info!(
                    project_id = %self.options.project_id,
                    app = %self.options.metadata.name,
                    "relay: initializing client"
                );
                self.connector
                    .connect(self.options.clone(), self.events_tx.clone())
                    .await
            })
            .await
            .map_err(|err| RelayError::ClientUnavailable(err.to_string()))?;
        Ok(Arc::clone(client))
    }

    /// Arms the client to receive a proposal for `uri`, bound to `address`.
    pub async fn pair(&self, uri: &str, address: &StacksAddress) -> Result<(), RelayError> {
        let uri = PairingUri::parse(uri)?;
        if let Some(expiry) = uri.expiry.filter(|_| uri.is_expired_at(Utc::now())) {
            return Err(RelayError::ExpiredUri(expiry));
        }
        let client = self.init().await?;

        // Bound before pairing: a proposal may be queued before `pair` returns.
        let previous = {
            let mut state = self.state.lock().await;
            state
                .bound_account
                .replace(ChainAccount::new(self.network, address))
        };

        if let Err(err) = client.pair(&uri).await {
            self.state.lock().await.bound_account = previous;
            warn!(topic = %uri.topic, "relay: pairing failed: {err}");
            return Err(RelayError::Pairing(err.to_string()));
        }

        self.state
            .lock()
            .await
            .pairings
            .insert(uri.topic.clone(), PairingPhase::Paired);
        info!(
            topic = %uri.topic,
            version = uri.version,
            account = %ChainAccount::new(self.network, address),
            "relay: paired, awaiting proposal"
        );
        Ok(())
    }

    /// Adopts sessions the relay client already holds, e.g. from a previous run.
    pub async fn restore(&self) -> Result<Vec<RelaySession>, RelayError> {
        let client = self.init().await?;
        let live = client
            .active_sessions()
            .await
            .map_err(|err| RelayError::ClientUnavailable(err.to_string()))?;

        let mut state = self.state.lock().await;
        for info in &live {
            state
                .sessions
                .entry(info.topic.clone())
                .or_insert_with(|| RelaySession::from_info(info));
        }
        if !live.is_empty() {
            info!(sessions = live.len(), "relay: restored live sessions");
        }
        let mut restored: Vec<_> = state
            .sessions
            .values()
            .filter(|session| session.active)
            .cloned()
            .collect();
        restored.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(restored)
    }

    pub async fn active_sessions(&self) -> Vec<RelaySession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|session| session.active)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.topic.cmp(&b.topic));
        sessions
    }

    pub async fn has_active_session(&self) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .any(|session| session.active)
    }

    pub async fn session(&self, topic: &str) -> Option<RelaySession> {
        self.state.lock().await.sessions.get(topic).cloned()
    }

    pub async fn pairing_phase(&self, pairing_topic: &str) -> PairingPhase {
        self.state
            .lock()
            .await
            .pairings
            .get(pairing_topic)
            .copied()
            .unwrap_or(PairingPhase::Idle)
    }

    /// Requests received but not yet answered.
    pub async fn pending_request_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Waits for the next inbound event and handles it completely.
    ///
    /// Returns `None` once the event source is gone.
    pub async fn process_next_event(&self) -> Option<RelayEventOutcome> {
        let mut events = self.events_rx.lock().await;
        let event = events.recv().await?;
        Some(self.handle_event(event).await)
    }

    /// Handles every event already queued, in arrival order.
    pub async fn drain_pending_events(&self) -> Vec<RelayEventOutcome> {
        let mut events = self.events_rx.lock().await;
        let mut outcomes = Vec::new();
        while let Ok(event) = events.try_recv() {
            outcomes.push(self.handle_event(event).await);
        }
        outcomes
    }

    /// Starts the background task that consumes inbound events.
    ///
    /// At most one loop runs per manager; calling this while it is alive does
    /// nothing. While the loop runs it owns the event queue, so
    /// [`Self::process_next_event`] and [`Self::drain_pending_events`] wait
    /// for it to stop.
    pub async fn start_event_loop(self: &Arc<Self>) {
        let mut slot = self.event_loop.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            while let Some(outcome) = manager.process_next_event().await {
                debug!(?outcome, "relay: event handled");
            }
            debug!("relay: event source closed");
        }));
        debug!("relay: event loop started");
    }

    pub async fn stop_event_loop(&self) {
        if let Some(task) = self.event_loop.lock().await.take() {
            task.abort();
            debug!("relay: event loop stopped");
        }
    }

    pub async fn is_event_loop_running(&self) -> bool {
        self.event_loop
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn handle_event(&self, event: RelayEvent) -> RelayEventOutcome {
        let client = match self.init().await {
            Ok(client) => client,
            Err(err) => {
                error!(topic = %event.topic(), "relay: dropping event without client: {err}");
                return RelayEventOutcome::Unhandled {
                    topic: event.topic().to_string(),
                    reason: err.to_string(),
                };
            }
        };

        match event {
            RelayEvent::SessionProposal(proposal) => {
                self.handle_proposal(client.as_ref(), proposal).await
            }
            RelayEvent::SessionRequest(request) => {
                self.handle_request(client.as_ref(), request).await
            }
            RelayEvent::SessionDelete { topic } => self.handle_delete(topic).await,
        }
    }

    async fn handle_proposal(
        &self,
        client: &dyn RelayClient,
        proposal: SessionProposal,
    ) -> RelayEventOutcome {
        info!(
            proposal_id = proposal.id,
            pairing_topic = %proposal.pairing_topic,
            peer = %proposal.proposer.name,
            "relay: session proposal received"
        );

        let account = self.state.lock().await.bound_account.clone();
        let grant = match account {
            Some(account) => build_approved_namespaces(&proposal, self.network, &account)
                .map_err(|err| err.to_string()),
            None => Err("no account bound to the pairing".to_string()),
        };

        let namespaces = match grant {
            Ok(namespaces) => namespaces,
            Err(reason) => return self.reject_proposal(client, &proposal, reason).await,
        };

        match client.approve_session(proposal.id, namespaces).await {
            Ok(info) => {
                let topic = info.topic.clone();
                let mut state = self.state.lock().await;
                state
                    .sessions
                    .insert(topic.clone(), RelaySession::from_info(&info));
                state
                    .session_pairings
                    .insert(topic.clone(), proposal.pairing_topic.clone());
                state
                    .pairings
                    .insert(proposal.pairing_topic.clone(), PairingPhase::Active);
                info!(
                    proposal_id = proposal.id,
                    topic = %topic,
                    "relay: session approved"
                );
                RelayEventOutcome::ProposalApproved {
                    proposal_id: proposal.id,
                    topic,
                }
            }
            Err(err) => {
                warn!(proposal_id = proposal.id, "relay: approval failed: {err}");
                self.reject_proposal(client, &proposal, err.to_string())
                    .await
            }
        }
    }

    async fn reject_proposal(
        &self,
        client: &dyn RelayClient,
        proposal: &SessionProposal,
        reason: String,
    ) -> RelayEventOutcome {
        warn!(
            proposal_id = proposal.id,
            pairing_topic = %proposal.pairing_topic,
            "relay: rejecting proposal: {reason}"
        );
        if let Err(err) = client
            .reject_session(proposal.id, SdkReason::user_rejected())
            .await
        {
            error!(proposal_id = proposal.id, "relay: rejection not delivered: {err}");
        }
        self.state
            .lock()
            .await
            .pairings
            .insert(proposal.pairing_topic.clone(), PairingPhase::Rejected);
        RelayEventOutcome::ProposalRejected {
            proposal_id: proposal.id,
            reason,
        }
    }

    async fn handle_request(
        &self,
        client: &dyn RelayClient,
        request: SessionRequest,
    ) -> RelayEventOutcome {
        let pending = PendingRelayRequest::from(request);
        let key = (pending.topic.clone(), pending.id);
        info!(
            topic = %pending.topic,
            id = pending.id,
            method = %pending.method,
            "relay: session request received"
        );
        self.state
            .lock()
            .await
            .pending
            .insert(key.clone(), pending.clone());

        let response = self.dispatch(&pending).await;
        let delivered = client
            .respond_session_request(&pending.topic, response.clone())
            .await;
        self.state.lock().await.pending.remove(&key);

        match delivered {
            Ok(()) => RelayEventOutcome::RequestAnswered {
                topic: pending.topic,
                id: pending.id,
                response,
            },
            Err(err) => {
                error!(
                    topic = %pending.topic,
                    id = pending.id,
                    "relay: response not delivered: {err}"
                );
                RelayEventOutcome::RequestFailed {
                    topic: pending.topic,
                    id: pending.id,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, request: &PendingRelayRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            METHOD_SIGN_MESSAGE | METHOD_SIGN_TRANSACTION | METHOD_STX_TRANSFER
            | METHOD_CONTRACT_CALL => match self.signer.handle(request).await {
                Ok(SigningDecision::Approved(result)) => {
                    JsonRpcResponse::success(request.id, result)
                }
                Ok(SigningDecision::Declined) => {
                    JsonRpcResponse::failure(request.id, RpcErrorCode::UserRejected)
                }
                Err(err) => {
                    error!(
                        topic = %request.topic,
                        id = request.id,
                        "relay: signing delegate failed: {err}"
                    );
                    JsonRpcResponse::failure(request.id, RpcErrorCode::Internal)
                }
            },
            other => {
                warn!(topic = %request.topic, id = request.id, "relay: unsupported method {other}");
                JsonRpcResponse::failure(request.id, RpcErrorCode::MethodNotSupported)
            }
        }
    }

    async fn handle_delete(&self, topic: String) -> RelayEventOutcome {
        let was_active = self.state.lock().await.close_session(&topic);
        if was_active {
            info!(topic = %topic, "relay: session deleted by peer");
        } else {
            debug!(topic = %topic, "relay: delete for unknown or closed session");
        }
        RelayEventOutcome::SessionClosed { topic }
    }

    /// Closes one session; a topic that is unknown or already closed is a no-op.
    pub async fn disconnect_session(&self, topic: &str) -> Result<(), RelayError> {
        let is_active = self
            .state
            .lock()
            .await
            .sessions
            .get(topic)
            .is_some_and(|session| session.active);
        if !is_active {
            return Ok(());
        }
        let Some(client) = self.client.get().cloned() else {
            return Ok(());
        };

        let result = client
            .disconnect_session(topic, SdkReason::user_disconnected())
            .await;
        self.state.lock().await.close_session(topic);
        result.map_err(|err| RelayError::Teardown {
            attempted: 1,
            failed: 1,
            last: err.to_string(),
        })
    }

    /// Closes every active session, attempting all of them even when some fail.
    ///
    /// Builds the client when needed so sessions left over from an earlier
    /// process are closed too. Stops the event loop afterwards.
    pub async fn disconnect_all(&self) -> Result<(), RelayError> {
        let client = match self.init().await {
            Ok(client) => client,
            Err(err) => {
                self.stop_event_loop().await;
                return Err(err);
            }
        };

        let mut topics: BTreeSet<String> = {
            let state = self.state.lock().await;
            state
                .sessions
                .values()
                .filter(|session| session.active)
                .map(|session| session.topic.clone())
                .collect()
        };
        match client.active_sessions().await {
            Ok(live) => {
                let state = self.state.lock().await;
                topics.extend(
                    live.into_iter()
                        .map(|info| info.topic)
                        .filter(|topic| !state.sessions.get(topic).is_some_and(|s| !s.active)),
                );
            }
            Err(err) => warn!("relay: could not list live sessions, using local view: {err}"),
        }

        let mut failed = 0;
        let mut last_error = None;
        for topic in &topics {
            match client
                .disconnect_session(topic, SdkReason::user_disconnected())
                .await
            {
                Ok(()) => info!(topic = %topic, "relay: session disconnected"),
                Err(err) => {
                    warn!(topic = %topic, "relay: session close failed: {err}");
                    failed += 1;
                    last_error = Some(err.to_string());
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            for topic in &topics {
                state.close_session(topic);
            }
            for phase in state.pairings.values_mut() {
                *phase = PairingPhase::Closed;
            }
            state.bound_account = None;
        }
        self.stop_event_loop().await;

        match last_error {
            Some(last) => Err(RelayError::Teardown {
                attempted: topics.len(),
                failed,
                last,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "tests/relay_session_manager_tests.rs"]
mod tests;
