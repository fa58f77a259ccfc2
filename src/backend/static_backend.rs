//! Static backend: the initial view, frozen for the group's lifetime.
//!
//! Baseline for single-shot jobs and externally managed groups. No
//! background activity, no mutators.

use super::{BackendInitArgs, GroupBackend, GroupFactoryFuture};
use crate::types::FlockError;
use crate::view::GroupView;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub struct StaticBackend {
    view: Mutex<GroupView>,
    config: Mutex<serde_json::Value>,
}

impl StaticBackend {
    pub fn factory(args: BackendInitArgs) -> GroupFactoryFuture {
        Box::pin(async move {
            Ok(Arc::new(StaticBackend {
                view: Mutex::new(args.initial_view),
                config: Mutex::new(args.config),
            }) as Arc<dyn GroupBackend>)
        })
    }
}

#[async_trait]
impl GroupBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn get_config(&self, visitor: &mut dyn FnMut(&serde_json::Value)) {
        let config = self.config.lock().unwrap();
        visitor(&config);
    }

    fn get_view(&self, visitor: &mut dyn FnMut(&GroupView)) {
        let view = self.view.lock().unwrap();
        visitor(&view);
    }

    async fn destroy(&self) -> Result<(), FlockError> {
        self.view.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UpdateCallbacks;
    use crate::transport::LocalSwitch;

    #[tokio::test]
    async fn test_serves_initial_view_verbatim() {
        let mut view = GroupView::new();
        view.add_member(0, 1, "mem://a").unwrap();
        view.add_metadata("k", "v");
        let digest = view.digest();

        let switch = LocalSwitch::new();
        let backend = StaticBackend::factory(BackendInitArgs {
            transport: switch.endpoint("mem://a"),
            provider_id: 1,
            config: serde_json::json!({}),
            initial_view: view,
            callbacks: UpdateCallbacks::noop(),
            join: false,
        })
        .await
        .unwrap();

        let mut seen = 0;
        backend.get_view(&mut |v| seen = v.digest());
        assert_eq!(seen, digest);
    }

    #[tokio::test]
    async fn test_mutators_refused() {
        let switch = LocalSwitch::new();
        let backend = StaticBackend::factory(BackendInitArgs {
            transport: switch.endpoint("mem://a"),
            provider_id: 0,
            config: serde_json::json!({}),
            initial_view: GroupView::new(),
            callbacks: UpdateCallbacks::noop(),
            join: false,
        })
        .await
        .unwrap();

        assert!(backend.add_metadata("k", "v").await.unwrap_err().is_unsupported());
        assert!(backend.remove_metadata("k").await.unwrap_err().is_unsupported());
    }
}
