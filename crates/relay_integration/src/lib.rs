use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    error::SdkReason,
    protocol::{
        JsonRpcResponse, PairingUri, PeerMetadata, RelayEvent, RelaySessionInfo, SessionNamespace,
    },
};
use tokio::sync::mpsc;

pub type RelayEventSender = mpsc::UnboundedSender<RelayEvent>;
pub type RelayEventReceiver = mpsc::UnboundedReceiver<RelayEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayClientOptions {
    pub project_id: String,
    pub metadata: PeerMetadata,
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn pair(&self, uri: &PairingUri) -> anyhow::Result<()>;
    async fn approve_session(
        &self,
        proposal_id: u64,
        namespaces: BTreeMap<String, SessionNamespace>,
    ) -> anyhow::Result<RelaySessionInfo>;
    async fn reject_session(&self, proposal_id: u64, reason: SdkReason) -> anyhow::Result<()>;
    async fn respond_session_request(
        &self,
        topic: &str,
        response: JsonRpcResponse,
    ) -> anyhow::Result<()>;
    async fn disconnect_session(&self, topic: &str, reason: SdkReason) -> anyhow::Result<()>;
    /// Sessions the transport already holds, including ones restored from a previous run.
    async fn active_sessions(&self) -> anyhow::Result<Vec<RelaySessionInfo>>;
}

/// Builds the relay client. Inbound proposal, request and delete events must
/// be pushed into `events` in arrival order.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        options: RelayClientOptions,
        events: RelayEventSender,
    ) -> anyhow::Result<Arc<dyn RelayClient>>;
}
