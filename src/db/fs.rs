// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::{Path, PathBuf};

use ahash::HashMap;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use itertools::Itertools;
use parking_lot::RwLock;
use tracing::warn;

use super::{DealStore, StoreError};
use crate::provider::deal::MinerDeal;

/// Deal store persisting one JSON document per deal under a directory,
/// with a full in-memory copy for reads. Writes go to a temporary file in
/// the same directory and are renamed into place, so a crash mid-write
/// never leaves a truncated record.
#[derive(Debug)]
pub struct FsDealStore {
    dir: PathBuf,
    cache: RwLock<HashMap<Cid, MinerDeal>>,
}

impl FsDealStore {
    /// Opens (creating if needed) a store at `dir` and loads every record.
    /// Unparseable files are skipped with a warning rather than failing the
    /// whole store; they stay on disk for inspection.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut cache = HashMap::default();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match Self::load_record(&path) {
                Ok(deal) => {
                    cache.insert(deal.proposal_cid, deal);
                }
                Err(e) => warn!(path = %path.display(), "skipping unreadable deal record: {e}"),
            }
        }
        Ok(Self {
            dir,
            cache: RwLock::new(cache),
        })
    }

    fn load_record(path: &Path) -> Result<MinerDeal, StoreError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn record_path(&self, proposal_cid: &Cid) -> PathBuf {
        self.dir.join(format!("{proposal_cid}.json"))
    }

    fn persist(&self, deal: &MinerDeal) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(deal)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::fs::write(tmp.path(), &bytes)?;
        tmp.persist(self.record_path(&deal.proposal_cid))
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl DealStore for FsDealStore {
    fn save_deal(&self, deal: &MinerDeal) -> Result<(), StoreError> {
        let mut cache = self.cache.write();
        self.persist(deal)?;
        cache.insert(deal.proposal_cid, deal.clone());
        Ok(())
    }

    fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, StoreError> {
        self.cache
            .read()
            .get(proposal_cid)
            .cloned()
            .ok_or(StoreError::NotFound(*proposal_cid))
    }

    fn has_deal(&self, proposal_cid: &Cid) -> Result<bool, StoreError> {
        Ok(self.cache.read().contains_key(proposal_cid))
    }

    fn deal_by_deal_id(&self, deal_id: DealID) -> Result<Option<MinerDeal>, StoreError> {
        Ok(self
            .cache
            .read()
            .values()
            .find(|d| d.deal_id == Some(deal_id))
            .cloned())
    }

    fn list_deals(&self, miner: Option<&Address>) -> Result<Vec<MinerDeal>, StoreError> {
        Ok(self
            .cache
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
        let mut cache = self.cache.write();
        let deal = cache
            .get_mut(proposal_cid)
            .ok_or(StoreError::NotFound(*proposal_cid))?;
        let mut next = deal.clone();
        mutate(&mut next);
        self.persist(&next)?;
        *deal = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fsm::DealState;
    use crate::test_utils::test_deal;

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let deal = test_deal(|d| d.state = DealState::AwaitingPreCommit);

        {
            let store = FsDealStore::open(dir.path()).unwrap();
            store.save_deal(&deal).unwrap();
        }

        let reopened = FsDealStore::open(dir.path()).unwrap();
        let loaded = reopened.get_deal(&deal.proposal_cid).unwrap();
        assert_eq!(loaded.state, DealState::AwaitingPreCommit);
        assert_eq!(loaded.proposal(), deal.proposal());
    }

    #[test]
    fn update_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let deal = test_deal(|_| {});
        {
            let store = FsDealStore::open(dir.path()).unwrap();
            store.save_deal(&deal).unwrap();
            store
                .update_deal(&deal.proposal_cid, &mut |d| {
                    d.state = DealState::Publishing;
                    d.message = "publish pending".into();
                })
                .unwrap();
        }
        let reopened = FsDealStore::open(dir.path()).unwrap();
        let loaded = reopened.get_deal(&deal.proposal_cid).unwrap();
        assert_eq!(loaded.state, DealState::Publishing);
        assert_eq!(loaded.message, "publish pending");
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();
        let store = FsDealStore::open(dir.path()).unwrap();
        assert!(store.list_deals(None).unwrap().is_empty());
    }
}
