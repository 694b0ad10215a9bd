use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relay_integration::{RelayClient, RelayClientOptions, RelayConnector, RelayEventSender};
use shared::{
    error::SdkReason,
    protocol::{
        AddressBook, AddressEntry, ConnectResponse, JsonRpcResponse, PairingUri, PeerMetadata,
        ProposalNamespace, RelayEvent, RelaySessionInfo, RpcRequest, SessionNamespace,
        SessionProposal, SessionRequest, STACKS_EVENTS,
    },
};
use storage::PreferenceStore;
use tokio::sync::{Mutex, Notify};

use crate::{
    registry::{EnvironmentSnapshot, InjectedMarkers, ProviderEnvironment},
    relay_session_manager::{PendingRelayRequest, SigningDecision, SigningDelegate},
    InjectedProvider,
};

pub const STX: &str = "SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7";
pub const STX_TESTNET: &str = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM";

pub struct FakeEnvironment {
    snapshot: StdMutex<EnvironmentSnapshot>,
}

impl FakeEnvironment {
    fn with_slot(slot: Option<InjectedMarkers>) -> Self {
        Self {
            snapshot: StdMutex::new(EnvironmentSnapshot {
                stacks_provider: slot,
                xverse_providers: false,
            }),
        }
    }

    pub fn headless() -> Self {
        Self::with_slot(None)
    }

    pub fn leather() -> Self {
        Self::with_slot(Some(InjectedMarkers {
            is_leather: true,
            is_hiro: false,
        }))
    }

    pub fn unbranded() -> Self {
        Self::with_slot(Some(InjectedMarkers::default()))
    }

    pub fn xverse() -> Self {
        let env = Self::unbranded();
        env.set_xverse_providers(true);
        env
    }

    pub fn inject_hiro(&self) {
        self.update(|snapshot| {
            snapshot.stacks_provider = Some(InjectedMarkers {
                is_leather: false,
                is_hiro: true,
            })
        });
    }

    pub fn set_xverse_providers(&self, present: bool) {
        self.update(|snapshot| snapshot.xverse_providers = present);
    }

    pub fn remove_slot(&self) {
        self.update(|snapshot| snapshot.stacks_provider = None);
    }

    fn update(&self, f: impl FnOnce(&mut EnvironmentSnapshot)) {
        let mut snapshot = self.snapshot.lock().expect("environment lock");
        f(&mut snapshot);
    }
}

impl ProviderEnvironment for FakeEnvironment {
    fn snapshot(&self) -> EnvironmentSnapshot {
        *self.snapshot.lock().expect("environment lock")
    }
}

pub fn stx_response(address: &str) -> ConnectResponse {
    let mut groups = BTreeMap::new();
    groups.insert("stx".to_string(), vec![AddressEntry::new(address)]);
    ConnectResponse {
        addresses: AddressBook::Namespaced(groups),
    }
}

pub fn flat_response(addresses: &[&str]) -> ConnectResponse {
    ConnectResponse {
        addresses: AddressBook::Flat(addresses.iter().map(|a| AddressEntry::new(*a)).collect()),
    }
}

pub struct FakeInjectedProvider {
    connect_result: Mutex<Result<ConnectResponse, String>>,
    failure_context: Option<String>,
    existing: Mutex<Option<ConnectResponse>>,
    gate: Option<Arc<Notify>>,
    pub connect_calls: Arc<Mutex<u32>>,
    pub disconnect_calls: Arc<Mutex<u32>>,
}

impl FakeInjectedProvider {
    pub fn returning(response: ConnectResponse) -> Self {
        Self::with_result(Ok(response))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_result(Err(message.into()))
    }

    /// Fails with `message` wrapped in `context`, the way a provider adapter
    /// reports which call went wrong.
    pub fn failing_in_context(message: impl Into<String>, context: impl Into<String>) -> Self {
        let mut provider = Self::failing(message);
        provider.failure_context = Some(context.into());
        provider
    }

    fn with_result(result: Result<ConnectResponse, String>) -> Self {
        Self {
            connect_result: Mutex::new(result),
            failure_context: None,
            existing: Mutex::new(None),
            gate: None,
            connect_calls: Arc::new(Mutex::new(0)),
            disconnect_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_existing_session(mut self, response: ConnectResponse) -> Self {
        self.existing = Mutex::new(Some(response));
        self
    }

    /// `connect` blocks until the returned handle is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub async fn connect_count(&self) -> u32 {
        *self.connect_calls.lock().await
    }
}

#[async_trait]
impl InjectedProvider for FakeInjectedProvider {
    async fn connect(&self) -> Result<ConnectResponse> {
        *self.connect_calls.lock().await += 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let result = self.connect_result.lock().await.clone();
        result.map_err(|err| match &self.failure_context {
            Some(context) => anyhow!(err).context(context.clone()),
            None => anyhow!(err),
        })
    }

    async fn existing_session(&self) -> Result<Option<ConnectResponse>> {
        Ok(self.existing.lock().await.clone())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.disconnect_calls.lock().await += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRelayClient {
    events: StdMutex<Option<RelayEventSender>>,
    pub fail_pair: AtomicBool,
    pub fail_approve: AtomicBool,
    pub fail_respond: AtomicBool,
    pub fail_disconnect: StdMutex<HashSet<String>>,
    pub live_sessions: Mutex<Vec<RelaySessionInfo>>,
    pub paired: Mutex<Vec<String>>,
    pub approved: Mutex<Vec<(u64, BTreeMap<String, SessionNamespace>)>>,
    pub rejected: Mutex<Vec<(u64, SdkReason)>>,
    pub responses: Mutex<Vec<(String, JsonRpcResponse)>>,
    pub disconnected: Mutex<Vec<(String, SdkReason)>>,
}

impl FakeRelayClient {
    pub fn fail_disconnect_for(&self, topic: &str) {
        self.fail_disconnect
            .lock()
            .expect("failure set lock")
            .insert(topic.to_string());
    }

    /// Pushes an inbound event as the relay transport would.
    pub fn emit(&self, event: RelayEvent) {
        let sender = self.events.lock().expect("events lock").clone();
        sender
            .expect("client connected before emitting")
            .send(event)
            .expect("manager still listening");
    }
}

#[async_trait]
impl RelayClient for FakeRelayClient {
    async fn pair(&self, uri: &PairingUri) -> Result<()> {
        if self.fail_pair.load(Ordering::SeqCst) {
            return Err(anyhow!("relay unreachable"));
        }
        self.paired.lock().await.push(uri.topic.clone());
        Ok(())
    }

    async fn approve_session(
        &self,
        proposal_id: u64,
        namespaces: BTreeMap<String, SessionNamespace>,
    ) -> Result<RelaySessionInfo> {
        if self.fail_approve.load(Ordering::SeqCst) {
            return Err(anyhow!("approval timed out"));
        }
        self.approved
            .lock()
            .await
            .push((proposal_id, namespaces.clone()));
        let info = RelaySessionInfo {
            topic: format!("session-{proposal_id}"),
            namespaces,
        };
        self.live_sessions.lock().await.push(info.clone());
        Ok(info)
    }

    async fn reject_session(&self, proposal_id: u64, reason: SdkReason) -> Result<()> {
        self.rejected.lock().await.push((proposal_id, reason));
        Ok(())
    }

    async fn respond_session_request(
        &self,
        topic: &str,
        response: JsonRpcResponse,
    ) -> Result<()> {
        if self.fail_respond.load(Ordering::SeqCst) {
            return Err(anyhow!("socket closed"));
        }
        self.responses
            .lock()
            .await
            .push((topic.to_string(), response));
        Ok(())
    }

    async fn disconnect_session(&self, topic: &str, reason: SdkReason) -> Result<()> {
        self.disconnected
            .lock()
            .await
            .push((topic.to_string(), reason));
        if self
            .fail_disconnect
            .lock()
            .expect("failure set lock")
            .contains(topic)
        {
            return Err(anyhow!("relay refused to close {topic}"));
        }
        self.live_sessions
            .lock()
            .await
            .retain(|session| session.topic != topic);
        Ok(())
    }

    async fn active_sessions(&self) -> Result<Vec<RelaySessionInfo>> {
        Ok(self.live_sessions.lock().await.clone())
    }
}

pub struct FakeRelayConnector {
    pub client: Arc<FakeRelayClient>,
    pub connects: Arc<Mutex<u32>>,
    pub options_seen: Arc<Mutex<Vec<RelayClientOptions>>>,
}

impl FakeRelayConnector {
    pub fn new() -> Self {
        Self {
            client: Arc::new(FakeRelayClient::default()),
            connects: Arc::new(Mutex::new(0)),
            options_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl RelayConnector for FakeRelayConnector {
    async fn connect(
        &self,
        options: RelayClientOptions,
        events: RelayEventSender,
    ) -> Result<Arc<dyn RelayClient>> {
        *self.connects.lock().await += 1;
        self.options_seen.lock().await.push(options);
        *self.client.events.lock().expect("events lock") = Some(events);
        Ok(self.client.clone())
    }
}

pub struct FakeSigningDelegate {
    outcome: Result<SigningDecision, String>,
    pub seen: Mutex<Vec<PendingRelayRequest>>,
}

impl FakeSigningDelegate {
    pub fn approving(result: serde_json::Value) -> Self {
        Self {
            outcome: Ok(SigningDecision::Approved(result)),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SigningDelegate for FakeSigningDelegate {
    async fn handle(&self, request: &PendingRelayRequest) -> Result<SigningDecision> {
        self.seen.lock().await.push(request.clone());
        self.outcome.clone().map_err(|err| anyhow!(err))
    }
}

/// A store whose backing medium is unavailable.
pub struct FailingPreferenceStore;

#[async_trait]
impl PreferenceStore for FailingPreferenceStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(anyhow!("storage quota exceeded"))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(anyhow!("storage quota exceeded"))
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Err(anyhow!("storage quota exceeded"))
    }
}

pub fn relay_options() -> RelayClientOptions {
    RelayClientOptions {
        project_id: "test-project".to_string(),
        metadata: peer("StacksStamp"),
    }
}

pub fn peer(name: &str) -> PeerMetadata {
    PeerMetadata {
        name: name.to_string(),
        description: format!("{name} dapp"),
        url: "https://dapp.example".to_string(),
        icons: Vec::new(),
    }
}

pub fn pairing_uri(topic: &str) -> String {
    format!("wc:{topic}@2?relay-protocol=irn&symKey=7f6e5d4c3b2a")
}

pub fn namespace(chains: &[&str], methods: &[&str]) -> ProposalNamespace {
    ProposalNamespace {
        chains: chains.iter().map(|c| c.to_string()).collect(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        events: STACKS_EVENTS.iter().map(|e| e.to_string()).collect(),
    }
}

pub fn proposal(id: u64, pairing_topic: &str, required: ProposalNamespace) -> SessionProposal {
    let mut required_namespaces = BTreeMap::new();
    required_namespaces.insert("stacks".to_string(), required);
    SessionProposal {
        id,
        pairing_topic: pairing_topic.to_string(),
        proposer: peer("Ticket Scanner"),
        required_namespaces,
        optional_namespaces: BTreeMap::new(),
    }
}

pub fn session_request(id: u64, topic: &str, method: &str) -> SessionRequest {
    SessionRequest {
        id,
        topic: topic.to_string(),
        chain_id: Some("stacks:1".to_string()),
        request: RpcRequest {
            method: method.to_string(),
            params: serde_json::json!({ "message": "hello" }),
        },
    }
}
