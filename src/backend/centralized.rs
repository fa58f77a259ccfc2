//! Centralized backend: member 0 of the initial view owns the
//! authoritative copy; everyone else pulls it from there.
//!
//! Trivially consistent and trivially a single point of failure. Useful
//! as a reference implementation and for small deployments where the
//! primary's availability is acceptable to depend on.

use super::{BackendInitArgs, GroupBackend, GroupFactoryFuture};
use crate::codec::WireView;
use crate::handle::GroupHandle;
use crate::types::{FlockError, MemberId};
use crate::view::GroupView;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

enum Role {
    /// This process is member 0: its view is the authoritative one.
    Primary { view: Mutex<GroupView> },
    /// Any other process: a handle to the primary plus the last view
    /// streamed from it.
    Secondary { primary: GroupHandle },
}

pub struct CentralizedBackend {
    role: Role,
    config: Mutex<serde_json::Value>,
}

impl CentralizedBackend {
    pub fn factory(args: BackendInitArgs) -> GroupFactoryFuture {
        Box::pin(async move { Self::init(args).await })
    }

    async fn init(args: BackendInitArgs) -> Result<Arc<dyn GroupBackend>, FlockError> {
        let primary = args
            .initial_view
            .member_at(0)
            .map(|m| m.id())
            .ok_or_else(|| {
                FlockError::InvalidConfig("centralized group requires a non-empty view".into())
            })?;

        if args.join {
            warn!("centralized backend does not support joining; flag ignored");
        }

        let self_id = MemberId::new(args.transport.self_address(), args.provider_id);
        let role = if self_id == primary {
            debug!("acting as centralized primary at {self_id}");
            Role::Primary { view: Mutex::new(args.initial_view) }
        } else {
            debug!("centralized secondary at {self_id}, primary {primary}");
            // Seed the handle from the initial view; member 0 becomes its
            // contact, so refreshes stream straight from the primary.
            let wire = WireView::from_view(&args.initial_view, args.transport.protocol(), 0);
            Role::Secondary { primary: GroupHandle::from_wire(args.transport, wire) }
        };

        Ok(Arc::new(CentralizedBackend {
            role,
            config: Mutex::new(args.config),
        }))
    }
}

#[async_trait]
impl GroupBackend for CentralizedBackend {
    fn name(&self) -> &'static str {
        "centralized"
    }

    fn get_config(&self, visitor: &mut dyn FnMut(&serde_json::Value)) {
        let config = self.config.lock().unwrap();
        visitor(&config);
    }

    fn get_view(&self, visitor: &mut dyn FnMut(&GroupView)) {
        match &self.role {
            Role::Primary { view } => {
                let view = view.lock().unwrap();
                visitor(&view);
            }
            Role::Secondary { primary } => primary.with_view(|view| visitor(view)),
        }
    }

    /// On a secondary, pull the primary's current view (digest-gated)
    /// before the next visitor runs. On the primary this is a no-op.
    async fn refresh(&self) -> Result<(), FlockError> {
        match &self.role {
            Role::Primary { .. } => Ok(()),
            Role::Secondary { primary } => primary.update().await.map(|_| ()),
        }
    }

    async fn destroy(&self) -> Result<(), FlockError> {
        if let Role::Primary { view } = &self.role {
            view.lock().unwrap().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UpdateCallbacks;
    use crate::transport::LocalSwitch;

    fn three_member_view() -> GroupView {
        let mut view = GroupView::new();
        view.add_member(0, 0, "mem://primary").unwrap();
        view.add_member(1, 0, "mem://b").unwrap();
        view.add_member(2, 0, "mem://c").unwrap();
        view
    }

    #[tokio::test]
    async fn test_primary_detection() {
        let switch = LocalSwitch::new();
        let backend = CentralizedBackend::factory(BackendInitArgs {
            transport: switch.endpoint("mem://primary"),
            provider_id: 0,
            config: serde_json::json!({}),
            initial_view: three_member_view(),
            callbacks: UpdateCallbacks::noop(),
            join: false,
        })
        .await
        .unwrap();

        let mut count = 0;
        backend.get_view(&mut |v| count = v.live_count());
        assert_eq!(count, 3);
        assert!(backend.refresh().await.is_ok());
    }

    #[tokio::test]
    async fn test_secondary_serves_cached_view() {
        let switch = LocalSwitch::new();
        let backend = CentralizedBackend::factory(BackendInitArgs {
            transport: switch.endpoint("mem://b"),
            provider_id: 0,
            config: serde_json::json!({}),
            initial_view: three_member_view(),
            callbacks: UpdateCallbacks::noop(),
            join: false,
        })
        .await
        .unwrap();

        let mut first = None;
        backend.get_view(&mut |v| first = v.member_at(0).cloned());
        assert_eq!(first.unwrap().address, "mem://primary");
    }

    #[tokio::test]
    async fn test_empty_view_rejected() {
        let switch = LocalSwitch::new();
        let err = CentralizedBackend::factory(BackendInitArgs {
            transport: switch.endpoint("mem://a"),
            provider_id: 0,
            config: serde_json::json!({}),
            initial_view: GroupView::new(),
            callbacks: UpdateCallbacks::noop(),
            join: false,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FlockError::InvalidConfig(_)));
    }
}
