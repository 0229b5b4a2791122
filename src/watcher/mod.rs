// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain-event driven tracking of a deal's path into a sealed sector.
//!
//! After publication the engine no longer drives the deal itself: the
//! sealing pipeline pre-commits and prove-commits sectors on its own
//! schedule. The watcher observes those messages and reports back when the
//! deal's data is provably on chain.

pub mod events;
pub mod publish;

use std::sync::Arc;

use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use fvm_shared::message::Message;
use fvm_shared::sector::SectorNumber;
use tracing::debug;

use crate::chain::ChainApi;
use crate::market::miner::{
    PRE_COMMIT_SECTOR_BATCH_METHOD, PRE_COMMIT_SECTOR_METHOD, PROVE_COMMIT_AGGREGATE_METHOD,
    PROVE_COMMIT_SECTOR_METHOD, PreCommitSectorBatchParams, ProveCommitAggregateParams,
    ProveCommitSectorParams, SectorPreCommitInfo,
};
use crate::market::types::DealProposal;
pub use events::{MatchedMessage, wait_for_message_matching};
pub use publish::{CurrentDealInfo, DealInfoError, current_deal_info, deal_id_from_publish_msg};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("deal was not pre-committed before its start epoch")]
    PreCommitTimeout,
    #[error("sector {0} was not prove-committed before the deal start epoch")]
    CommitTimeout(SectorNumber),
    #[error("deal {0} not active after its sector was proven")]
    NotActiveAfterCommit(DealID),
    #[error(transparent)]
    DealInfo(#[from] DealInfoError),
    #[error(transparent)]
    Chain(#[from] anyhow::Error),
}

/// How a pre-commit was detected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreCommitOutcome {
    /// The deal is already proven into a sector; no pre-commit will come.
    AlreadyActive,
    Found {
        sector: SectorNumber,
        /// True when found by diffing state (the message landed while we
        /// were not watching), false for a live message.
        via_state: bool,
    },
}

pub struct CommitmentWatcher {
    chain: Arc<dyn ChainApi>,
    confidence: i64,
}

impl CommitmentWatcher {
    pub fn new(chain: Arc<dyn ChainApi>, confidence: i64) -> Self {
        Self { chain, confidence }
    }

    /// Resolves once the deal's data is pre-committed into a sector.
    ///
    /// Checks, in order: the deal is already active (nothing to wait for);
    /// a pre-commit landed between publication and now (state diff); then
    /// live pre-commit messages to the provider. Matches re-resolve the
    /// deal ID through the publish message each time, since a reorg can
    /// renumber the deal mid-watch. Resolves at most once; gives up past
    /// `start_epoch + 1`.
    pub async fn on_deal_sector_precommitted(
        &self,
        provider: Address,
        proposal: &DealProposal,
        publish_cid: Cid,
    ) -> Result<PreCommitOutcome, WatchError> {
        let info = current_deal_info(&self.chain, publish_cid, proposal).await?;
        if info
            .market_deal
            .as_ref()
            .is_some_and(|d| d.state.is_active())
        {
            return Ok(PreCommitOutcome::AlreadyActive);
        }

        let head = self.chain.chain_head().await?;
        let landed = self
            .chain
            .state_miner_precommits_diff(provider, &info.publish_tipset, head.key())
            .await?;
        if let Some(pc) = landed.iter().find(|pc| pc.deal_ids.contains(&info.deal_id)) {
            return Ok(PreCommitOutcome::Found {
                sector: pc.sector_number,
                via_state: true,
            });
        }

        let timeout_epoch = proposal.start_epoch + 1;
        loop {
            let matched = wait_for_message_matching(&self.chain, self.confidence, timeout_epoch, |msg| {
                msg.to == provider && !precommitted_sectors(msg).is_empty()
            })
            .await?
            .ok_or(WatchError::PreCommitTimeout)?;

            // The publish message may have been re-executed since we armed
            // the watch; resolve the ID the chain currently knows.
            let current = current_deal_info(&self.chain, publish_cid, proposal).await?;
            if let Some(info) = precommitted_sectors(&matched.message)
                .iter()
                .find(|pc| pc.deal_ids.contains(&current.deal_id))
            {
                return Ok(PreCommitOutcome::Found {
                    sector: info.sector_number,
                    via_state: false,
                });
            }
            debug!(cid = %matched.cid, "pre-commit message does not carry our deal, continuing watch");
        }
    }

    /// Resolves once `sector` is prove-committed and the deal shows as
    /// active in market state.
    pub async fn on_deal_sector_committed(
        &self,
        provider: Address,
        sector: SectorNumber,
        proposal: &DealProposal,
        publish_cid: Cid,
    ) -> Result<(), WatchError> {
        let info = current_deal_info(&self.chain, publish_cid, proposal).await?;
        if info
            .market_deal
            .as_ref()
            .is_some_and(|d| d.state.is_active())
        {
            return Ok(());
        }

        let timeout_epoch = proposal.start_epoch + 1;
        wait_for_message_matching(&self.chain, self.confidence, timeout_epoch, |msg| {
            msg.to == provider && proves_sector(msg, sector)
        })
        .await?
        .ok_or(WatchError::CommitTimeout(sector))?;

        // The prove-commit landed; confirm the market actor activated the
        // deal rather than trusting the message alone.
        let refreshed = current_deal_info(&self.chain, publish_cid, proposal).await?;
        match refreshed.market_deal {
            Some(deal) if deal.state.is_active() => Ok(()),
            _ => Err(WatchError::NotActiveAfterCommit(refreshed.deal_id)),
        }
    }
}

/// Sectors pre-committed by a message, empty for anything that is not a
/// pre-commit (or does not parse as one).
fn precommitted_sectors(msg: &Message) -> Vec<SectorPreCommitInfo> {
    match msg.method_num {
        PRE_COMMIT_SECTOR_METHOD => msg
            .params
            .deserialize::<SectorPreCommitInfo>()
            .map(|info| vec![info])
            .unwrap_or_default(),
        PRE_COMMIT_SECTOR_BATCH_METHOD => msg
            .params
            .deserialize::<PreCommitSectorBatchParams>()
            .map(|batch| batch.sectors)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Whether a message proves the given sector, alone or in an aggregate.
fn proves_sector(msg: &Message, sector: SectorNumber) -> bool {
    match msg.method_num {
        PROVE_COMMIT_SECTOR_METHOD => msg
            .params
            .deserialize::<ProveCommitSectorParams>()
            .map(|p| p.sector_number == sector)
            .unwrap_or(false),
        PROVE_COMMIT_AGGREGATE_METHOD => msg
            .params
            .deserialize::<ProveCommitAggregateParams>()
            .map(|p| p.sector_numbers.get(sector))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{ChainDealState, MarketDeal};
    use crate::test_utils::{
        TestChain, precommit_message, prove_commit_aggregate_message, prove_commit_message,
        register_publish_message, test_client_proposal,
    };
    use fvm_shared::error::ExitCode;
    use std::time::Duration;

    const PROVIDER: Address = Address::new_id(1000);
    const DEAL_ID: DealID = 55;

    struct Fixture {
        chain: Arc<TestChain>,
        watcher: Arc<CommitmentWatcher>,
        proposal: DealProposal,
        publish_cid: Cid,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(TestChain::new(100));
        let deal = test_client_proposal(|p| {
            p.provider = PROVIDER;
            p.start_epoch = 500;
        });
        let publish_cid =
            register_publish_message(&chain, &[deal.clone()], &[DEAL_ID], &[0], ExitCode::OK);
        chain.set_market_deal(
            DEAL_ID,
            MarketDeal {
                proposal: deal.proposal.clone(),
                state: ChainDealState::default(),
            },
        );
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        let watcher = Arc::new(CommitmentWatcher::new(dyn_chain, 0));
        Fixture {
            chain,
            watcher,
            proposal: deal.proposal,
            publish_cid,
        }
    }

    fn activate(chain: &TestChain, proposal: &DealProposal) {
        chain.set_market_deal(
            DEAL_ID,
            MarketDeal {
                proposal: proposal.clone(),
                state: ChainDealState {
                    sector_start_epoch: 120,
                    last_updated_epoch: -1,
                    slash_epoch: -1,
                },
            },
        );
    }

    #[tokio::test]
    async fn active_deal_short_circuits_precommit_watch() {
        let f = fixture();
        activate(&f.chain, &f.proposal);
        let outcome = f
            .watcher
            .on_deal_sector_precommitted(PROVIDER, &f.proposal, f.publish_cid)
            .await
            .unwrap();
        assert_eq!(outcome, PreCommitOutcome::AlreadyActive);
    }

    #[tokio::test]
    async fn precommit_found_in_state_diff() {
        let f = fixture();
        f.chain.add_precommit_diff(crate::chain::SectorPreCommitment {
            sector_number: 31,
            deal_ids: vec![DEAL_ID],
        });
        let outcome = f
            .watcher
            .on_deal_sector_precommitted(PROVIDER, &f.proposal, f.publish_cid)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PreCommitOutcome::Found {
                sector: 31,
                via_state: true
            }
        );
    }

    #[tokio::test]
    async fn precommit_found_in_live_message() {
        let f = fixture();
        let watcher = f.watcher.clone();
        let proposal = f.proposal.clone();
        let task = tokio::spawn(async move {
            watcher
                .on_deal_sector_precommitted(PROVIDER, &proposal, f.publish_cid)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A pre-commit for someone else's deal first; ours afterwards.
        f.chain
            .apply_tipset(101, vec![precommit_message(PROVIDER, 7, &[9999])]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.chain
            .apply_tipset(102, vec![precommit_message(PROVIDER, 8, &[DEAL_ID])]);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            PreCommitOutcome::Found {
                sector: 8,
                via_state: false
            }
        );
    }

    #[tokio::test]
    async fn precommit_watch_times_out_at_start_epoch() {
        let f = fixture();
        let watcher = f.watcher.clone();
        let proposal = f.proposal.clone();
        let task = tokio::spawn(async move {
            watcher
                .on_deal_sector_precommitted(PROVIDER, &proposal, f.publish_cid)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.chain.apply_tipset(502, vec![]);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, WatchError::PreCommitTimeout));
    }

    #[tokio::test]
    async fn commit_single_message_confirms_activation() {
        let f = fixture();
        let watcher = f.watcher.clone();
        let proposal = f.proposal.clone();
        let chain = f.chain.clone();
        let task = tokio::spawn(async move {
            watcher
                .on_deal_sector_committed(PROVIDER, 8, &proposal, f.publish_cid)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        activate(&chain, &f.proposal);
        chain.apply_tipset(101, vec![prove_commit_message(PROVIDER, 8)]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commit_aggregate_message_confirms_activation() {
        let f = fixture();
        let watcher = f.watcher.clone();
        let proposal = f.proposal.clone();
        let chain = f.chain.clone();
        let task = tokio::spawn(async move {
            watcher
                .on_deal_sector_committed(PROVIDER, 8, &proposal, f.publish_cid)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        activate(&chain, &f.proposal);
        chain.apply_tipset(
            101,
            vec![prove_commit_aggregate_message(PROVIDER, &[3, 8, 21])],
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commit_without_activation_is_an_error() {
        let f = fixture();
        let watcher = f.watcher.clone();
        let proposal = f.proposal.clone();
        let chain = f.chain.clone();
        let task = tokio::spawn(async move {
            watcher
                .on_deal_sector_committed(PROVIDER, 8, &proposal, f.publish_cid)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The prove-commit lands but market state never flips to active.
        chain.apply_tipset(101, vec![prove_commit_message(PROVIDER, 8)]);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, WatchError::NotActiveAfterCommit(DEAL_ID)));
    }
}
