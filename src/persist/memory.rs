use super::{admit, PersistStore};
use crate::config::PersistStrategy;
use crate::error::EngineResult;
use crate::transport::{OutboundPacket, RequestToken};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// In-process store; contents do not survive a restart
#[derive(Debug, Default)]
pub struct MemPersist {
    strategy: PersistStrategy,
    packets: Mutex<BTreeMap<RequestToken, OutboundPacket>>,
}

impl MemPersist {
    pub fn new(strategy: PersistStrategy) -> Self {
        Self {
            strategy,
            packets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistStore for MemPersist {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn last_token(&self) -> Option<RequestToken> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next_back()
            .copied()
    }

    async fn save(&self, token: RequestToken, packet: &OutboundPacket) -> EngineResult<()> {
        let mut packets = self.packets.lock().unwrap_or_else(PoisonError::into_inner);
        if admit(&self.strategy, packets.len(), packets.contains_key(&token))? {
            packets.insert(token, packet.clone());
        }
        Ok(())
    }

    async fn ack(&self, token: RequestToken) -> EngineResult<()> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token);
        Ok(())
    }

    async fn load_pending(&self) -> EngineResult<Vec<(RequestToken, OutboundPacket)>> {
        Ok(self
            .packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(token, packet)| (*token, packet.clone()))
            .collect())
    }

    async fn destroy(&self) -> EngineResult<()> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
