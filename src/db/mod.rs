// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Persistence for deal records.
//!
//! The store is the single source of truth for deal state. All state
//! transitions go through [`DealStore::update_deal`], a read-modify-write
//! executed under the store's lock, so two racing writers cannot interleave
//! a transition.

mod fs;
mod memory;

pub use fs::FsDealStore;
pub use memory::MemoryDealStore;

use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;

use crate::provider::deal::MinerDeal;
use crate::provider::fsm::DealState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("deal {0} not found")]
    NotFound(Cid),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub trait DealStore: Send + Sync {
    fn save_deal(&self, deal: &MinerDeal) -> Result<(), StoreError>;

    fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, StoreError>;

    fn has_deal(&self, proposal_cid: &Cid) -> Result<bool, StoreError>;

    /// Lookup by the on-chain deal ID, available once published.
    fn deal_by_deal_id(&self, deal_id: DealID) -> Result<Option<MinerDeal>, StoreError>;

    /// All deals, optionally narrowed to one provider address.
    fn list_deals(&self, miner: Option<&Address>) -> Result<Vec<MinerDeal>, StoreError>;

    /// Atomically mutate one deal record and return the updated copy.
    fn update_deal(
        &self,
        proposal_cid: &Cid,
        mutate: &mut dyn FnMut(&mut MinerDeal),
    ) -> Result<MinerDeal, StoreError>;

    fn list_deals_in_state(&self, state: DealState) -> Result<Vec<MinerDeal>, StoreError> {
        Ok(self
            .list_deals(None)?
            .into_iter()
            .filter(|d| d.state == state)
            .collect())
    }
}
