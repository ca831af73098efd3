use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::session::{ClientSession, WsSink};

/// Concurrent extension -> session map. The registry owns identity, not
/// liveness: whoever registered a session is responsible for
/// unregistering it on every exit path.
pub struct ClientRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Install a fresh Idle session for `ext`. Registration is
    /// exclusive; when the extension is already live the sink is handed
    /// back so the caller can decline the newcomer.
    pub async fn register(
        &self,
        ext: &str,
        sink: WsSink,
    ) -> Result<Arc<ClientSession>, WsSink> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(ext) {
            warn!(ext = %ext, "connection refused, extension already active");
            return Err(sink);
        }
        let session = ClientSession::new(ext, sink);
        sessions.insert(ext.to_string(), session.clone());
        info!(ext = %ext, total = sessions.len(), "extension registered");
        Ok(session)
    }

    pub async fn unregister(&self, ext: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(ext).is_some() {
            info!(ext = %ext, "extension unregistered");
        }
    }

    pub async fn lookup(&self, ext: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(ext).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::sink_pair;

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = ClientRegistry::new();
        let (sink, _client) = sink_pair().await;

        let session = registry.register("1001", sink).await.ok().unwrap();
        assert_eq!(session.extension, "1001");
        assert!(registry.lookup("1001").await.is_some());
        assert!(registry.lookup("1002").await.is_none());

        registry.unregister("1001").await;
        assert!(registry.lookup("1001").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let registry = ClientRegistry::new();
        let (sink, _c1) = sink_pair().await;
        let (second_sink, _c2) = sink_pair().await;

        let first = registry.register("1001", sink).await.ok().unwrap();
        assert!(registry.register("1001", second_sink).await.is_err());

        // the refused attempt must not disturb the live session
        let live = registry.lookup("1001").await.unwrap();
        assert!(Arc::ptr_eq(&first, &live));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ClientRegistry::new();
        let (sink, _client) = sink_pair().await;
        registry.register("1001", sink).await.ok().unwrap();

        registry.unregister("1001").await;
        registry.unregister("1001").await;
        assert!(registry.lookup("1001").await.is_none());
    }
}
