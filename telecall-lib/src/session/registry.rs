use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::info;

use super::{PeerSession, PeerSessionHandle, SessionConfig, SessionEvent};
use crate::{
    connection::{IceServer, SharedFactory},
    error::ResourceError,
    signaling::ConnectionLabel,
};

/// At most one live session per label.
pub struct SessionRegistry {
    sessions: HashMap<ConnectionLabel, PeerSessionHandle>,
    factory: SharedFactory,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(
        factory: SharedFactory,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            factory,
            config,
            events,
        }
    }

    pub async fn create(
        &mut self,
        label: ConnectionLabel,
        is_initiator: bool,
        ice_servers: Vec<IceServer>,
    ) -> Result<PeerSessionHandle, ResourceError> {
        if self.sessions.contains_key(&label) {
            return Err(ResourceError::DuplicateSession(label));
        }
        let session = PeerSession::spawn(
            label,
            is_initiator,
            ice_servers,
            self.config.clone(),
            self.factory.clone(),
            self.events.clone(),
        )
        .await?;
        self.sessions.insert(label, session.clone());
        Ok(session)
    }

    pub fn get(&self, label: ConnectionLabel) -> Option<&PeerSessionHandle> {
        self.sessions.get(&label)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn close(&mut self, label: ConnectionLabel) -> bool {
        let Some(session) = self.sessions.remove(&label) else {
            return false;
        };
        info!("close {} session", label);
        session.close().await;
        true
    }

    pub async fn close_all(&mut self) {
        for (label, session) in self.sessions.drain() {
            info!("close {} session", label);
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::Ordering, Arc};

    use super::*;
    use crate::connection::mock::MockFactory;

    fn registry(factory: Arc<MockFactory>) -> (SessionRegistry, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            SessionRegistry::new(SharedFactory::new(factory), SessionConfig::default(), events),
            rx,
        )
    }

    #[tokio::test]
    async fn one_session_per_label_and_factory_follows_sessions() {
        let factory = Arc::new(MockFactory::default());
        let (mut registry, _events) = registry(factory.clone());

        registry.create(ConnectionLabel::Media, true, vec![]).await.unwrap();
        registry.create(ConnectionLabel::Data, true, vec![]).await.unwrap();
        assert!(matches!(
            registry.create(ConnectionLabel::Media, false, vec![]).await,
            Err(ResourceError::DuplicateSession(ConnectionLabel::Media))
        ));
        assert_eq!(registry.len(), 2);
        assert_eq!(factory.created_count(), 2);
        assert_eq!(factory.initialized.load(Ordering::SeqCst), 1);

        assert!(registry.close(ConnectionLabel::Media).await);
        assert!(!registry.close(ConnectionLabel::Media).await);
        assert_eq!(registry.len(), 1);
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 0);
        assert!(registry.get(ConnectionLabel::Data).is_some());

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_factory_creates_nothing() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_initialize.store(true, Ordering::SeqCst);
        let (mut registry, _events) = registry(factory.clone());

        assert!(matches!(
            registry.create(ConnectionLabel::Media, true, vec![]).await,
            Err(ResourceError::FactoryUnavailable(_))
        ));
        assert!(registry.is_empty());
        assert_eq!(factory.created_count(), 0);
    }
}
