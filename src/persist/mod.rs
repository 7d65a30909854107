//! Storage for unacknowledged QoS 1/2 publishes
//!
//! Packets are saved before they are handed to the transport and removed once
//! the broker acknowledges them. On a persistent-session reconnect the client
//! resends whatever is still stored.

use crate::config::{PersistConfig, PersistStrategy};
use crate::error::{EngineError, EngineResult};
use crate::transport::{OutboundPacket, RequestToken};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub mod file;
pub mod memory;

pub use file::FilePersist;
pub use memory::MemPersist;

/// Message used when the strategy refuses a packet
pub const DROPPED_BY_STRATEGY: &str = "packet persist dropped by strategy";

/// Backing store for in-flight publishes
#[async_trait]
pub trait PersistStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether saved packets can be resent after a reconnect
    fn is_durable(&self) -> bool {
        true
    }

    /// Highest token currently stored, known without reading any packet
    fn last_token(&self) -> Option<RequestToken>;

    async fn save(&self, token: RequestToken, packet: &OutboundPacket) -> EngineResult<()>;

    /// Forget a packet; unknown tokens are ignored
    async fn ack(&self, token: RequestToken) -> EngineResult<()>;

    /// Every stored packet, oldest token first
    async fn load_pending(&self) -> EngineResult<Vec<(RequestToken, OutboundPacket)>>;

    /// Drop everything stored
    async fn destroy(&self) -> EngineResult<()>;
}

/// Store that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NonePersist;

#[async_trait]
impl PersistStore for NonePersist {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn last_token(&self) -> Option<RequestToken> {
        None
    }

    async fn save(&self, _token: RequestToken, _packet: &OutboundPacket) -> EngineResult<()> {
        Ok(())
    }

    async fn ack(&self, _token: RequestToken) -> EngineResult<()> {
        Ok(())
    }

    async fn load_pending(&self) -> EngineResult<Vec<(RequestToken, OutboundPacket)>> {
        Ok(Vec::new())
    }

    async fn destroy(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Open the store named by `config`
///
/// A file store whose directory cannot be used is replaced by an in-memory
/// store with the same strategy; the error is returned alongside so it can be
/// reported as a persistence error.
pub fn open_store(config: &PersistConfig) -> (Arc<dyn PersistStore>, Option<EngineError>) {
    match config {
        PersistConfig::None => (Arc::new(NonePersist), None),
        PersistConfig::Memory { strategy } => (Arc::new(MemPersist::new(strategy.clone())), None),
        PersistConfig::File { path, strategy } => match FilePersist::open(path, strategy.clone()) {
            Ok(store) => (Arc::new(store), None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file store unavailable, keeping packets in memory");
                let error = EngineError::persistence(format!("open {}: {e}", path.display()));
                (Arc::new(MemPersist::new(strategy.clone())), Some(error))
            }
        },
    }
}

/// Whether a packet may be stored given the current contents
///
/// `Ok(false)` means keep the existing entry untouched.
pub(crate) fn admit(strategy: &PersistStrategy, stored: usize, exists: bool) -> EngineResult<bool> {
    if exists {
        return Ok(strategy.duplicate_replace);
    }
    if strategy.max_count > 0 && stored >= strategy.max_count as usize && strategy.drop_on_exceed {
        return Err(EngineError::persistence(DROPPED_BY_STRATEGY));
    }
    Ok(true)
}
