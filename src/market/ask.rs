// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;
use fvm_shared::address::Address;
use parking_lot::RwLock;

use super::types::StorageAsk;

/// Read access to the asks this daemon has posted for its miners. Posting
/// and signing asks is the RPC layer's concern; validation only reads.
pub trait AskStore: Send + Sync {
    fn ask(&self, miner: &Address) -> anyhow::Result<Option<StorageAsk>>;
    fn set_ask(&self, ask: StorageAsk) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryAskStore {
    asks: RwLock<HashMap<Address, StorageAsk>>,
}

impl MemoryAskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AskStore for MemoryAskStore {
    fn ask(&self, miner: &Address) -> anyhow::Result<Option<StorageAsk>> {
        Ok(self.asks.read().get(miner).cloned())
    }

    fn set_ask(&self, ask: StorageAsk) -> anyhow::Result<()> {
        self.asks.write().insert(ask.miner, ask);
        Ok(())
    }
}
