// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use itertools::Itertools;
use parking_lot::RwLock;

use super::{DealStore, StoreError};
use crate::provider::deal::MinerDeal;

/// In-memory deal store, used by tests and as the cache layer of
/// [`super::FsDealStore`].
#[derive(Debug, Default)]
pub struct MemoryDealStore {
    deals: RwLock<HashMap<Cid, MinerDeal>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DealStore for MemoryDealStore {
    fn save_deal(&self, deal: &MinerDeal) -> Result<(), StoreError> {
        self.deals
            .write()
            .insert(deal.proposal_cid, deal.clone());
        Ok(())
    }

    fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, StoreError> {
        self.deals
            .read()
            .get(proposal_cid)
            .cloned()
            .ok_or(StoreError::NotFound(*proposal_cid))
    }

    fn has_deal(&self, proposal_cid: &Cid) -> Result<bool, StoreError> {
        Ok(self.deals.read().contains_key(proposal_cid))
    }

    fn deal_by_deal_id(&self, deal_id: DealID) -> Result<Option<MinerDeal>, StoreError> {
        Ok(self
            .deals
            .read()
            .values()
            .find(|d| d.deal_id == Some(deal_id))
            .cloned())
    }

    fn list_deals(&self, miner: Option<&Address>) -> Result<Vec<MinerDeal>, StoreError> {
        Ok(self
            .deals
            .read()
            .values()
            .filter(|d| miner.is_none_or(|m| d.provider() == *m))
            .cloned()
            .collect_vec())
    }

    fn update_deal(
        &self,
        proposal_cid: &Cid,
        mutate: &mut dyn FnMut(&mut MinerDeal),
    ) -> Result<MinerDeal, StoreError> {
        let mut deals = self.deals.write();
        let deal = deals
            .get_mut(proposal_cid)
            .ok_or(StoreError::NotFound(*proposal_cid))?;
        mutate(deal);
        Ok(deal.clone())
    }
}
