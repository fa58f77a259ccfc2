//! Client-side group handle: a refcounted cached view bound to one
//! contact member, refreshed on demand through the view-sync RPC.

use crate::codec::{self, WireView};
use crate::transport::{RpcRequest, RpcResponse, Transport};
use crate::types::{
    Credentials, FlockError, MemberId, GET_VIEW_TIMEOUT_MS, HANDSHAKE_TIMEOUT_MS,
    MODE_INIT_UPDATE, PROVIDER_IDENTITY,
};
use crate::view::{Member, MetadataEntry, GroupView};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

struct HandleInner {
    transport: Arc<dyn Transport>,
    contact: MemberId,
    credentials: Credentials,
    view: Mutex<GroupView>,
}

/// Handle onto a group hosted by some provider.
///
/// Cheap to clone; all clones share one cached view. Every accessor takes
/// the view lock for its duration, so readers observe either the previous
/// complete view or the refreshed one, never a mix.
#[derive(Clone)]
pub struct GroupHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for GroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHandle").finish_non_exhaustive()
    }
}

impl GroupHandle {
    /// Open a handle by handshaking with the provider at
    /// `(address, provider_id)`.
    ///
    /// The provider must answer the identity probe with `"flock"`; any
    /// other reply fails with `InvalidProvider`. With `MODE_INIT_UPDATE`
    /// the view is fetched immediately, otherwise the cache is seeded
    /// with the contact member alone.
    pub async fn from_endpoint(
        transport: Arc<dyn Transport>,
        address: impl Into<String>,
        provider_id: u16,
        mode: u32,
        credentials: Credentials,
    ) -> Result<Self, FlockError> {
        let contact = MemberId::new(address, provider_id);

        let response = transport
            .call(
                &contact.address,
                provider_id,
                RpcRequest::Identity,
                Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            )
            .await?;
        match response {
            RpcResponse::Identity { name } if name == PROVIDER_IDENTITY => {}
            RpcResponse::Identity { name } => return Err(FlockError::InvalidProvider(name)),
            _ => return Err(FlockError::InvalidProvider("malformed identity reply".into())),
        }

        let mut view = GroupView::new();
        view.add_member(0, provider_id, contact.address.clone())?;

        let handle = Self {
            inner: Arc::new(HandleInner {
                transport,
                contact,
                credentials,
                view: Mutex::new(view),
            }),
        };

        if mode & MODE_INIT_UPDATE != 0 {
            handle.update().await?;
        }
        Ok(handle)
    }

    /// Open a handle from a serialized view. The first member becomes the
    /// contact.
    pub fn from_serialized(transport: Arc<dyn Transport>, text: &str) -> Result<Self, FlockError> {
        let wire = codec::decode(text)?;
        Ok(Self::from_wire(transport, wire))
    }

    /// Open a handle from a group file.
    pub fn from_file(
        transport: Arc<dyn Transport>,
        path: impl AsRef<Path>,
    ) -> Result<Self, FlockError> {
        let wire = codec::read_group_file(path)?;
        Ok(Self::from_wire(transport, wire))
    }

    pub(crate) fn from_wire(transport: Arc<dyn Transport>, wire: WireView) -> Self {
        // decode() guarantees a non-empty member list
        let first = &wire.members[0];
        let contact = MemberId::new(first.address.clone(), first.provider_id);
        Self {
            inner: Arc::new(HandleInner {
                transport,
                contact,
                credentials: wire.credentials,
                view: Mutex::new(wire.to_view()),
            }),
        }
    }

    /// Refresh the cached view from the contact provider.
    ///
    /// Sends the cached digest; when it matches the provider's, the
    /// transfer is skipped and the cache is untouched. Returns whether the
    /// cache was replaced.
    pub async fn update(&self) -> Result<bool, FlockError> {
        let known_digest = self.inner.view.lock().unwrap().digest();

        let response = self
            .inner
            .transport
            .call(
                &self.inner.contact.address,
                self.inner.contact.provider_id,
                RpcRequest::GetView { known_digest },
                Duration::from_millis(GET_VIEW_TIMEOUT_MS),
            )
            .await?;

        match response {
            RpcResponse::View { no_change: true, .. } => {
                debug!("view unchanged at digest {known_digest:#x}");
                Ok(false)
            }
            RpcResponse::View { no_change: false, view: Some(wire) } => {
                let fresh = wire.to_view();
                *self.inner.view.lock().unwrap() = fresh;
                Ok(true)
            }
            _ => Err(FlockError::InvalidGroup),
        }
    }

    /// Group size: highest assigned rank plus one, not the live count.
    pub fn size(&self) -> u64 {
        self.inner.view.lock().unwrap().size()
    }

    /// Number of members currently in the cached view.
    pub fn live_count(&self) -> usize {
        self.inner.view.lock().unwrap().live_count()
    }

    pub fn member_at(&self, index: usize) -> Option<Member> {
        self.inner.view.lock().unwrap().member_at(index).cloned()
    }

    pub fn find_rank(&self, address: &str, provider_id: u16) -> Result<u64, FlockError> {
        self.inner.view.lock().unwrap().rank_of(address, provider_id)
    }

    /// Run `f` over every member under the view lock.
    pub fn iterate(&self, mut f: impl FnMut(&Member)) {
        let view = self.inner.view.lock().unwrap();
        for member in view.members() {
            f(member);
        }
    }

    pub fn metadata_iterate(&self, mut f: impl FnMut(&MetadataEntry)) {
        let view = self.inner.view.lock().unwrap();
        for entry in view.metadata() {
            f(entry);
        }
    }

    pub fn metadata_access(&self, key: &str) -> Result<String, FlockError> {
        self.inner
            .view
            .lock()
            .unwrap()
            .find_metadata(key)
            .map(str::to_string)
            .ok_or(FlockError::NoMetadata)
    }

    /// Declared but unimplemented: propagation semantics for handle-side
    /// metadata writes are unspecified.
    pub async fn metadata_set(&self, _key: &str, _value: &str) -> Result<(), FlockError> {
        Err(FlockError::Unsupported("metadata_set"))
    }

    /// Run `f` with the cached view under its lock.
    pub fn with_view<R>(&self, f: impl FnOnce(&GroupView) -> R) -> R {
        let view = self.inner.view.lock().unwrap();
        f(&view)
    }

    pub fn digest(&self) -> u64 {
        self.inner.view.lock().unwrap().digest()
    }

    pub fn contact(&self) -> &MemberId {
        &self.inner.contact
    }

    pub fn credentials(&self) -> Credentials {
        self.inner.credentials
    }

    /// Serialize the cached view.
    pub fn serialize(&self) -> String {
        let view = self.inner.view.lock().unwrap();
        let wire = WireView::from_view(
            &view,
            self.inner.transport.protocol(),
            self.inner.credentials,
        );
        codec::encode(&wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalSwitch;

    #[test]
    fn test_from_serialized_contact_is_first_member() {
        let switch = LocalSwitch::new();
        let handle = GroupHandle::from_serialized(
            switch.endpoint("mem://client"),
            r#"{ "transport": "mem",
                 "credentials": 5,
                 "members": [ { "address": "mem://a", "provider_id": 3 },
                              { "address": "mem://b", "provider_id": 0 } ],
                 "metadata": { "k": "v" } }"#,
        )
        .unwrap();

        assert_eq!(handle.contact(), &MemberId::new("mem://a", 3));
        assert_eq!(handle.credentials(), 5);
        assert_eq!(handle.live_count(), 2);
        assert_eq!(handle.find_rank("mem://b", 0).unwrap(), 1);
        assert_eq!(handle.metadata_access("k").unwrap(), "v");
        assert!(matches!(
            handle.metadata_access("missing"),
            Err(FlockError::NoMetadata)
        ));
    }

    #[tokio::test]
    async fn test_metadata_set_unsupported() {
        let switch = LocalSwitch::new();
        let handle = GroupHandle::from_serialized(
            switch.endpoint("mem://client"),
            r#"{ "transport": "mem",
                 "members": [ { "address": "mem://a", "provider_id": 0 } ] }"#,
        )
        .unwrap();
        assert!(handle.metadata_set("k", "v").await.unwrap_err().is_unsupported());
    }
}
