//! Components registered with the daemon's instance registry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use relay_core::{
    Component, HookResult, InstanceRegistry, OnIpcDisconnect, OnIpcInit, PeerHandle,
    Registration, RegistryError, Scope, ServerChannel,
};

/// Announces the daemon on startup and counts departing peers
#[derive(Debug)]
pub struct Presence {
    id: String,
    departures: AtomicU64,
}

impl Presence {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            departures: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn departures(&self) -> u64 {
        self.departures.load(Ordering::Relaxed)
    }
}

impl Component for Presence {
    fn init_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcInit>> {
        Some(self)
    }

    fn disconnect_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcDisconnect>> {
        Some(self)
    }
}

#[async_trait]
impl OnIpcInit for Presence {
    async fn on_ipc_init(&self, channel: &dyn ServerChannel) -> HookResult {
        channel
            .broadcast("relay.online", json!({ "id": self.id }))
            .await?;
        info!(id = %self.id, "Presence announced");
        Ok(())
    }
}

#[async_trait]
impl OnIpcDisconnect for Presence {
    async fn on_ipc_disconnect(&self, peer: &PeerHandle) -> HookResult {
        let total = self.departures.fetch_add(1, Ordering::Relaxed) + 1;
        info!(peer = %peer, departures = total, "Peer left");
        Ok(())
    }
}

/// Per-request state; request scope keeps it out of lifecycle hooks
struct RequestContext;

impl Component for RequestContext {
    fn init_hook(self: Arc<Self>) -> Option<Arc<dyn OnIpcInit>> {
        Some(self)
    }
}

#[async_trait]
impl OnIpcInit for RequestContext {
    async fn on_ipc_init(&self, _channel: &dyn ServerChannel) -> HookResult {
        Err("request-scoped components never see on_ipc_init".into())
    }
}

/// Register the daemon's components and return the presence tracker
pub fn register(instances: &InstanceRegistry, id: &str) -> Result<Arc<Presence>, RegistryError> {
    let presence = Arc::new(Presence::new(id));
    instances.register(Registration::provider("Presence", Arc::clone(&presence)))?;
    instances.register(
        Registration::provider("RequestContext", Arc::new(RequestContext))
            .scope(Scope::Request)
            .depends_on("Presence"),
    )?;
    Ok(presence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{InProcessServer, InstanceSelector, LifecycleHookDispatcher};

    #[tokio::test]
    async fn test_only_presence_receives_hooks() {
        let instances = InstanceRegistry::new();
        let presence = register(&instances, "demo").unwrap();

        let selected = InstanceSelector::new(instances.clone()).select();
        assert_eq!(selected.names(), vec!["Presence"]);

        let channel = InProcessServer::new();
        let invoked = LifecycleHookDispatcher::default()
            .on_init(&selected, &channel)
            .await
            .unwrap();
        assert_eq!(invoked, 1);

        let peer = PeerHandle::new(None);
        LifecycleHookDispatcher::default()
            .on_disconnect(&selected, &peer)
            .await
            .unwrap();
        assert_eq!(presence.departures(), 1);
    }
}
