//! RPC transport seam.
//!
//! The runtime that actually moves bytes is an external collaborator;
//! this module pins down its contract: typed request/response bodies, a
//! [`Transport`] trait for issuing calls and registering endpoints, and
//! [`LocalSwitch`], an in-process implementation used by the test suite
//! and by single-process deployments.

use crate::codec::WireView;
use crate::gossip::GossipEvent;
use crate::types::{FlockError, MemberId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Identity probe issued during the handle handshake.
    Identity,
    /// View synchronization. The provider skips the payload when the
    /// caller's digest already matches.
    GetView { known_digest: u64 },
    /// Direct liveness probe with piggybacked gossip.
    Ping { sender: MemberId, incarnation: u64, gossip: Vec<GossipEvent> },
    /// Ask a relay to probe `target` on the sender's behalf.
    PingReq { target: MemberId, incarnation: u64, gossip: Vec<GossipEvent> },
    /// Targeted join/leave broadcast.
    Announce { event: GossipEvent, gossip: Vec<GossipEvent> },
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Identity => "identity",
            RpcRequest::GetView { .. } => "get_view",
            RpcRequest::Ping { .. } => "ping",
            RpcRequest::PingReq { .. } => "ping_req",
            RpcRequest::Announce { .. } => "announce",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    Identity { name: String },
    View { no_change: bool, view: Option<WireView> },
    Pong { incarnation: u64, gossip: Vec<GossipEvent> },
    PingReqAck { target_responded: bool, incarnation: u64, gossip: Vec<GossipEvent> },
    Ack,
}

/// Server side of one `(address, provider_id)` endpoint.
#[async_trait]
pub trait RpcServer: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, FlockError>;
}

/// Client and registration surface of the RPC runtime.
///
/// A call that exceeds its deadline fails with `FlockError::Transport`;
/// the failure detector treats that as a normal "no response", not an
/// error.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address other members use to reach this process.
    fn self_address(&self) -> &str;

    /// Protocol tag recorded in serialized views.
    fn protocol(&self) -> &str;

    async fn call(
        &self,
        address: &str,
        provider_id: u16,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, FlockError>;

    fn register(&self, provider_id: u16, server: Arc<dyn RpcServer>) -> Result<(), FlockError>;

    fn deregister(&self, provider_id: u16);
}

// =============================================================================
// IN-PROCESS SWITCH
// =============================================================================

#[derive(Default)]
struct SwitchInner {
    endpoints: HashMap<(String, u16), Arc<dyn RpcServer>>,
    /// `(from, to)` address pairs whose calls are silently dropped.
    dropped_links: HashSet<(String, String)>,
    /// Addresses that neither receive nor send. Simulates a hard crash.
    dead: HashSet<String>,
}

/// In-memory router connecting [`LocalEndpoint`]s by address string.
///
/// Cheap to clone; all clones share one routing table. Per-link drop
/// rules and hard-kill switches let tests express lossy and partitioned
/// topologies without a real network.
#[derive(Clone, Default)]
pub struct LocalSwitch {
    inner: Arc<Mutex<SwitchInner>>,
}

impl LocalSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport endpoint for one simulated process.
    pub fn endpoint(&self, address: impl Into<String>) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint { switch: self.clone(), address: address.into() })
    }

    /// Silently drop every call from `from` to `to`. One-directional.
    pub fn drop_link(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.dropped_links.insert((from.to_string(), to.to_string()));
    }

    pub fn restore_link(&self, from: &str, to: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.dropped_links.remove(&(from.to_string(), to.to_string()));
    }

    /// Hard-kill an address: all calls to or from it time out.
    pub fn kill(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.dead.insert(address.to_string());
    }

    fn route(
        &self,
        from: &str,
        to: &str,
        provider_id: u16,
    ) -> Option<Arc<dyn RpcServer>> {
        let inner = self.inner.lock().unwrap();
        if inner.dead.contains(from) || inner.dead.contains(to) {
            return None;
        }
        if inner.dropped_links.contains(&(from.to_string(), to.to_string())) {
            return None;
        }
        inner.endpoints.get(&(to.to_string(), provider_id)).cloned()
    }
}

/// One process's attachment to a [`LocalSwitch`].
pub struct LocalEndpoint {
    switch: LocalSwitch,
    address: String,
}

#[async_trait]
impl Transport for LocalEndpoint {
    fn self_address(&self) -> &str {
        &self.address
    }

    fn protocol(&self) -> &str {
        "mem"
    }

    async fn call(
        &self,
        address: &str,
        provider_id: u16,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, FlockError> {
        let method = request.method();
        match self.switch.route(&self.address, address, provider_id) {
            Some(server) => tokio::time::timeout(timeout, server.handle(request))
                .await
                .map_err(|_| {
                    FlockError::Transport(format!("{method} to {address}#{provider_id} timed out"))
                })?,
            None => {
                // unreachable targets look like packet loss: the caller
                // waits out its deadline
                tokio::time::sleep(timeout).await;
                Err(FlockError::Transport(format!(
                    "{method} to {address}#{provider_id} timed out"
                )))
            }
        }
    }

    fn register(&self, provider_id: u16, server: Arc<dyn RpcServer>) -> Result<(), FlockError> {
        let mut inner = self.switch.inner.lock().unwrap();
        let key = (self.address.clone(), provider_id);
        if inner.endpoints.contains_key(&key) {
            return Err(FlockError::InvalidArgs(format!(
                "provider id {provider_id} already registered at {}",
                self.address
            )));
        }
        inner.endpoints.insert(key, server);
        Ok(())
    }

    fn deregister(&self, provider_id: u16) {
        let mut inner = self.switch.inner.lock().unwrap();
        inner.endpoints.remove(&(self.address.clone(), provider_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcServer for Echo {
        async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, FlockError> {
            match request {
                RpcRequest::Identity => Ok(RpcResponse::Identity { name: "echo".into() }),
                _ => Err(FlockError::Unsupported("echo")),
            }
        }
    }

    #[tokio::test]
    async fn test_call_reaches_registered_endpoint() {
        let switch = LocalSwitch::new();
        let a = switch.endpoint("mem://a");
        let b = switch.endpoint("mem://b");
        b.register(0, Arc::new(Echo)).unwrap();

        let response = a
            .call("mem://b", 0, RpcRequest::Identity, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(response, RpcResponse::Identity { name } if name == "echo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_target_times_out() {
        let switch = LocalSwitch::new();
        let a = switch.endpoint("mem://a");

        let err = a
            .call("mem://ghost", 0, RpcRequest::Identity, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FlockError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_is_one_directional() {
        let switch = LocalSwitch::new();
        let a = switch.endpoint("mem://a");
        let b = switch.endpoint("mem://b");
        a.register(0, Arc::new(Echo)).unwrap();
        b.register(0, Arc::new(Echo)).unwrap();

        switch.drop_link("mem://a", "mem://b");

        let timeout = Duration::from_millis(50);
        assert!(a.call("mem://b", 0, RpcRequest::Identity, timeout).await.is_err());
        assert!(b.call("mem://a", 0, RpcRequest::Identity, timeout).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let switch = LocalSwitch::new();
        let a = switch.endpoint("mem://a");
        a.register(0, Arc::new(Echo)).unwrap();
        assert!(a.register(0, Arc::new(Echo)).is_err());

        a.deregister(0);
        assert!(a.register(0, Arc::new(Echo)).is_ok());
    }
}
