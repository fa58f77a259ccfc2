//! Pluggable membership backends.
//!
//! Every backend implements the same small contract: initialize from a
//! moved-in view, expose the view and configuration under a lock, accept
//! (or refuse) metadata mutations, and tear down cleanly. A process-wide
//! registry maps backend names to factories so providers can be
//! configured by name.

pub mod centralized;
pub mod static_backend;
pub mod swim;

use crate::transport::{RpcRequest, RpcResponse, Transport};
use crate::types::{FlockError, UpdateKind, MAX_REGISTERED_BACKENDS};
use crate::view::GroupView;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};

/// Membership-change callback: `(kind, address, provider_id)`.
pub type MemberUpdateFn = Arc<dyn Fn(UpdateKind, &str, u16) + Send + Sync>;

/// Metadata-change callback: `(key, value)`.
pub type MetadataUpdateFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Non-owning back-reference from a backend to whoever hosts it.
///
/// The provider owns the backend; the backend reaches back only through
/// these callbacks, which keeps destruction single-rooted.
#[derive(Clone)]
pub struct UpdateCallbacks {
    pub member: MemberUpdateFn,
    pub metadata: MetadataUpdateFn,
}

impl UpdateCallbacks {
    pub fn noop() -> Self {
        Self {
            member: Arc::new(|_, _, _| {}),
            metadata: Arc::new(|_, _| {}),
        }
    }
}

/// Everything a backend needs to initialize.
pub struct BackendInitArgs {
    pub transport: Arc<dyn Transport>,
    pub provider_id: u16,
    /// Backend-specific options from the provider configuration.
    pub config: serde_json::Value,
    /// Initial membership, moved into the backend.
    pub initial_view: GroupView,
    pub callbacks: UpdateCallbacks,
    /// Whether this process should announce itself into the group.
    pub join: bool,
}

#[async_trait]
pub trait GroupBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Invoke `visitor` with the backend's JSON configuration while
    /// holding its lock.
    fn get_config(&self, visitor: &mut dyn FnMut(&serde_json::Value));

    /// Invoke `visitor` with a borrow of the backend's view while holding
    /// its lock. The visitor must not block.
    fn get_view(&self, visitor: &mut dyn FnMut(&GroupView));

    /// Bring the locally served view up to date before a read. Backends
    /// that own their view need nothing here.
    async fn refresh(&self) -> Result<(), FlockError> {
        Ok(())
    }

    async fn add_metadata(&self, _key: &str, _value: &str) -> Result<(), FlockError> {
        Err(FlockError::Unsupported("add_metadata"))
    }

    async fn remove_metadata(&self, _key: &str) -> Result<(), FlockError> {
        Err(FlockError::Unsupported("remove_metadata"))
    }

    /// Handle a backend-specific RPC delivered through the provider's
    /// endpoint.
    async fn handle_rpc(&self, _request: RpcRequest) -> Result<RpcResponse, FlockError> {
        Err(FlockError::Unsupported("rpc"))
    }

    /// Release all resources. Backends with an active protocol announce
    /// their departure here unless configured otherwise.
    async fn destroy(&self) -> Result<(), FlockError>;
}

impl std::fmt::Debug for dyn GroupBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupBackend").field("name", &self.name()).finish()
    }
}

/// Boxed future returned by backend factories.
pub type GroupFactoryFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn GroupBackend>, FlockError>> + Send>>;

/// Factory producing one backend instance from init args.
pub type BackendFactory = fn(BackendInitArgs) -> GroupFactoryFuture;

static REGISTRY: OnceLock<Mutex<HashMap<&'static str, BackendFactory>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<&'static str, BackendFactory>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, BackendFactory> = HashMap::new();
        map.insert("static", static_backend::StaticBackend::factory);
        map.insert("centralized", centralized::CentralizedBackend::factory);
        map.insert("swim", swim::SwimBackend::factory);
        Mutex::new(map)
    })
}

/// Register a backend factory under a name. Re-registering a name
/// replaces the previous factory.
pub fn register_backend(name: &'static str, factory: BackendFactory) -> Result<(), FlockError> {
    let mut map = registry().lock().unwrap();
    if !map.contains_key(name) && map.len() >= MAX_REGISTERED_BACKENDS {
        return Err(FlockError::InvalidArgs(format!(
            "backend registry full ({MAX_REGISTERED_BACKENDS} entries)"
        )));
    }
    map.insert(name, factory);
    Ok(())
}

/// Instantiate the named backend.
pub async fn create_backend(
    name: &str,
    args: BackendInitArgs,
) -> Result<Arc<dyn GroupBackend>, FlockError> {
    let factory = {
        let map = registry().lock().unwrap();
        map.get(name).copied()
    }
    .ok_or_else(|| FlockError::InvalidBackend(name.to_string()))?;

    factory(args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalSwitch;

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let switch = LocalSwitch::new();
        let args = BackendInitArgs {
            transport: switch.endpoint("mem://a"),
            provider_id: 0,
            config: serde_json::json!({}),
            initial_view: GroupView::new(),
            callbacks: UpdateCallbacks::noop(),
            join: false,
        };
        let err = create_backend("raft", args).await.unwrap_err();
        assert!(matches!(err, FlockError::InvalidBackend(name) if name == "raft"));
    }

    #[tokio::test]
    async fn test_builtins_registered() {
        for name in ["static", "centralized", "swim"] {
            assert!(registry().lock().unwrap().contains_key(name), "{name} missing");
        }
    }
}
