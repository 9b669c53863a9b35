use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::store::operations::papers::Paper;
use crate::store::operations::subscribers::{DeliveryPreferences, Platform};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport network error: {0}")]
    Network(String),
    #[error("transport api error: code={code}, description={description}")]
    Api { code: u16, description: String },
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("could not decode transport response: {0}")]
    Decode(String),
}

impl TransportError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Outbound side of a chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn platform(&self) -> Platform;

    async fn send_paper(
        &self,
        chat_id: &str,
        paper: &Paper,
        prefs: &DeliveryPreferences,
    ) -> Result<(), TransportError>;
}

/// Transports keyed by the platform they serve.
#[derive(Clone, Default)]
pub struct Transports {
    inner: HashMap<Platform, Arc<dyn ChatTransport>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, transport: Arc<dyn ChatTransport>) {
        self.inner.insert(transport.platform(), transport);
    }

    pub fn with(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn ChatTransport>> {
        self.inner.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.inner.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
