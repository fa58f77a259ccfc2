//! Provider: the per-process endpoint hosting one backend instance.
//!
//! Registers the view-sync RPC on the transport, fans membership-change
//! notifications out to registered callbacks, and keeps the on-disk
//! group file in sync with live membership when this process owns
//! position 0 of the view.

use crate::backend::{
    create_backend, BackendInitArgs, GroupBackend, UpdateCallbacks,
};
use crate::codec::{self, WireView};
use crate::config::ProviderConfig;
use crate::transport::{RpcRequest, RpcResponse, RpcServer, Transport};
use crate::types::{Credentials, FlockError, UpdateKind, PROVIDER_IDENTITY};
use crate::view::GroupView;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info, warn};

struct CallbackRegistration {
    key: u64,
    callbacks: UpdateCallbacks,
}

struct ProviderInner {
    transport: Arc<dyn Transport>,
    provider_id: u16,
    // set once at registration; OnceLock breaks the init-order knot
    // between the backend and the callbacks that reference us
    backend: OnceLock<Arc<dyn GroupBackend>>,
    file: Option<PathBuf>,
    credentials: Credentials,
    callbacks: RwLock<Vec<CallbackRegistration>>,
}

impl ProviderInner {
    fn backend_ref(&self) -> Result<Arc<dyn GroupBackend>, FlockError> {
        self.backend.get().cloned().ok_or(FlockError::InvalidGroup)
    }

    /// Deliver one membership change to every registration, then bring
    /// the group file up to date.
    fn on_member_update(&self, kind: UpdateKind, address: &str, provider_id: u16) {
        debug!("membership update {kind:?} for {address}#{provider_id}");
        {
            let registrations = self.callbacks.read().unwrap();
            for registration in registrations.iter() {
                (registration.callbacks.member)(kind, address, provider_id);
            }
        }
        self.sync_group_file();
    }

    fn on_metadata_update(&self, key: &str, value: &str) {
        let registrations = self.callbacks.read().unwrap();
        for registration in registrations.iter() {
            (registration.callbacks.metadata)(key, value);
        }
    }

    /// Rewrite the group file when configured and when this provider is
    /// member 0 of the current view. Write failures are logged, not
    /// propagated: membership has already changed.
    fn sync_group_file(&self) {
        let Some(path) = &self.file else { return };
        let Ok(backend) = self.backend_ref() else { return };

        let mut snapshot: Option<WireView> = None;
        backend.get_view(&mut |view| {
            let owned = view
                .member_at(0)
                .is_some_and(|m| {
                    m.address == self.transport.self_address()
                        && m.provider_id == self.provider_id
                });
            if owned {
                snapshot = Some(WireView::from_view(
                    view,
                    self.transport.protocol(),
                    self.credentials,
                ));
            }
        });

        if let Some(wire) = snapshot
            && let Err(e) = codec::write_group_file(path, &wire)
        {
            warn!("failed to rewrite group file {}: {e}", path.display());
        }
    }
}

struct ProviderRpcServer {
    inner: Arc<ProviderInner>,
}

#[async_trait]
impl RpcServer for ProviderRpcServer {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, FlockError> {
        match request {
            RpcRequest::Identity => Ok(RpcResponse::Identity {
                name: PROVIDER_IDENTITY.to_string(),
            }),
            RpcRequest::GetView { known_digest } => {
                let backend = self.inner.backend_ref()?;
                backend.refresh().await?;

                let mut no_change = false;
                let mut payload = None;
                backend.get_view(&mut |view| {
                    if view.digest() == known_digest {
                        no_change = true;
                    } else {
                        payload = Some(WireView::from_view(
                            view,
                            self.inner.transport.protocol(),
                            self.inner.credentials,
                        ));
                    }
                });
                Ok(RpcResponse::View { no_change, view: payload })
            }
            // anything else belongs to the backend's own protocol
            other => self.inner.backend_ref()?.handle_rpc(other).await,
        }
    }
}

/// Server-side endpoint for one group on one process.
#[derive(Clone)]
pub struct GroupProvider {
    inner: Arc<ProviderInner>,
}

impl GroupProvider {
    /// Create the backend named by `config`, register the RPC endpoint,
    /// and write the initial group file if owned.
    pub async fn register(
        transport: Arc<dyn Transport>,
        provider_id: u16,
        config: ProviderConfig,
        initial_view: GroupView,
        join: bool,
    ) -> Result<Self, FlockError> {
        let inner = Arc::new(ProviderInner {
            transport: Arc::clone(&transport),
            provider_id,
            backend: OnceLock::new(),
            file: config.file,
            credentials: config.credentials,
            callbacks: RwLock::new(Vec::new()),
        });

        // the backend reaches back only through weak references, so the
        // provider stays the single owner
        let member_target = Arc::downgrade(&inner);
        let metadata_target = Arc::downgrade(&inner);
        let callbacks = UpdateCallbacks {
            member: Arc::new(move |kind, address, pid| {
                if let Some(inner) = member_target.upgrade() {
                    inner.on_member_update(kind, address, pid);
                }
            }),
            metadata: Arc::new(move |key, value| {
                if let Some(inner) = metadata_target.upgrade() {
                    inner.on_metadata_update(key, value);
                }
            }),
        };

        let backend = create_backend(
            &config.group.backend,
            BackendInitArgs {
                transport: Arc::clone(&transport),
                provider_id,
                config: config.group.config,
                initial_view,
                callbacks,
                join,
            },
        )
        .await?;
        let name = backend.name();
        inner
            .backend
            .set(backend)
            .map_err(|_| FlockError::InvalidGroup)?;

        let server = Arc::new(ProviderRpcServer { inner: Arc::clone(&inner) });
        if let Err(e) = transport.register(provider_id, server) {
            // abort the whole registration: the backend must not outlive it
            if let Ok(backend) = inner.backend_ref() {
                let _ = backend.destroy().await;
            }
            return Err(e);
        }
        info!(
            "provider {provider_id} registered at {} with {name} backend",
            transport.self_address()
        );

        inner.sync_group_file();
        Ok(Self { inner })
    }

    /// Announce departure (backend-dependent), tear down the backend,
    /// and drop the RPC registration.
    pub async fn shutdown(&self) -> Result<(), FlockError> {
        if let Some(backend) = self.inner.backend.get() {
            backend.destroy().await?;
        }
        self.inner.transport.deregister(self.inner.provider_id);
        info!("provider {} deregistered", self.inner.provider_id);
        Ok(())
    }

    /// Register update callbacks under an opaque key. Re-registering an
    /// existing key replaces its callbacks in place.
    pub fn register_update_callbacks(&self, key: u64, callbacks: UpdateCallbacks) {
        let mut registrations = self.inner.callbacks.write().unwrap();
        match registrations.iter_mut().find(|r| r.key == key) {
            Some(registration) => registration.callbacks = callbacks,
            None => registrations.push(CallbackRegistration { key, callbacks }),
        }
    }

    /// Remove the registration under `key`. Returns whether it existed.
    pub fn deregister_update_callbacks(&self, key: u64) -> bool {
        let mut registrations = self.inner.callbacks.write().unwrap();
        let before = registrations.len();
        registrations.retain(|r| r.key != key);
        registrations.len() != before
    }

    pub fn provider_id(&self) -> u16 {
        self.inner.provider_id
    }

    pub fn self_address(&self) -> String {
        self.inner.transport.self_address().to_string()
    }

    /// Run `f` with the backend's current view under its lock.
    pub fn with_view<R>(&self, f: impl FnOnce(&GroupView) -> R) -> Result<R, FlockError> {
        let backend = self.inner.backend_ref()?;
        let mut out = None;
        let mut f = Some(f);
        backend.get_view(&mut |view| {
            if let Some(f) = f.take() {
                out = Some(f(view));
            }
        });
        out.ok_or(FlockError::InvalidGroup)
    }

    /// Run `f` with the backend's configuration under its lock.
    pub fn with_config<R>(&self, f: impl FnOnce(&serde_json::Value) -> R) -> Result<R, FlockError> {
        let backend = self.inner.backend_ref()?;
        let mut out = None;
        let mut f = Some(f);
        backend.get_config(&mut |config| {
            if let Some(f) = f.take() {
                out = Some(f(config));
            }
        });
        out.ok_or(FlockError::InvalidGroup)
    }

    pub async fn add_metadata(&self, key: &str, value: &str) -> Result<(), FlockError> {
        self.inner.backend_ref()?.add_metadata(key, value).await
    }

    pub async fn remove_metadata(&self, key: &str) -> Result<(), FlockError> {
        self.inner.backend_ref()?.remove_metadata(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalSwitch;
    use std::sync::Mutex;

    fn static_provider_config() -> ProviderConfig {
        ProviderConfig::from_str(r#"{ "group": { "type": "static" } }"#).unwrap()
    }

    #[tokio::test]
    async fn test_callback_registration_replaces_in_place() {
        let switch = LocalSwitch::new();
        let mut view = GroupView::new();
        view.add_member(0, 0, "mem://a").unwrap();

        let provider = GroupProvider::register(
            switch.endpoint("mem://a"),
            0,
            static_provider_config(),
            view,
            false,
        )
        .await
        .unwrap();

        let hits = Arc::new(Mutex::new(0u32));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            provider.register_update_callbacks(
                7,
                UpdateCallbacks {
                    member: Arc::new(move |_, _, _| *hits.lock().unwrap() += 1),
                    metadata: Arc::new(|_, _| {}),
                },
            );
        }
        // same key registered twice: one registration
        provider.inner.on_member_update(UpdateKind::Joined, "mem://x", 0);
        assert_eq!(*hits.lock().unwrap(), 1);

        assert!(provider.deregister_update_callbacks(7));
        assert!(!provider.deregister_update_callbacks(7));
    }

    #[tokio::test]
    async fn test_second_provider_id_coexists() {
        let switch = LocalSwitch::new();
        let endpoint = switch.endpoint("mem://a");

        let mut view = GroupView::new();
        view.add_member(0, 0, "mem://a").unwrap();
        let first =
            GroupProvider::register(Arc::clone(&endpoint) as Arc<dyn Transport>, 0, static_provider_config(), view, false)
                .await
                .unwrap();

        let mut view = GroupView::new();
        view.add_member(0, 1, "mem://a").unwrap();
        let second =
            GroupProvider::register(endpoint, 1, static_provider_config(), view, false)
                .await
                .unwrap();

        assert_eq!(first.provider_id(), 0);
        assert_eq!(second.provider_id(), 1);
        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }
}
