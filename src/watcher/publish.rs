// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Resolution of a deal's on-chain identity from its publish message.
//!
//! Deal IDs are not stable identifiers: a reorg can re-execute the publish
//! message and hand out different numbers. Everything that needs "the deal
//! ID" therefore re-derives it from the publish message's current return
//! value instead of caching it.

use std::sync::Arc;

use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;

use crate::chain::{ChainApi, TipsetKey};
use crate::market::types::{
    DealProposal, MarketDeal, PublishStorageDealsParams, PublishStorageDealsReturn,
};

#[derive(Debug, thiserror::Error)]
pub enum DealInfoError {
    #[error("publish message {0} not found on chain")]
    PublishNotFound(Cid),
    #[error("publish message failed with exit code {0}")]
    PublishFailed(u32),
    #[error("target proposal not present in publish message {0}")]
    DealNotInMessage(Cid),
    #[error("proposal at index {0} was rejected by the market actor")]
    DealInvalid(usize),
    #[error("publish return value malformed: {0}")]
    MalformedReturn(String),
    #[error(transparent)]
    Chain(#[from] anyhow::Error),
}

/// A deal's current on-chain identity, derived from its publish message.
#[derive(Clone, Debug)]
pub struct CurrentDealInfo {
    pub deal_id: DealID,
    pub market_deal: Option<MarketDeal>,
    /// Tipset the publish message landed in; the lower bound for
    /// pre-commit diffing.
    pub publish_tipset: TipsetKey,
}

/// Finds the deal ID assigned to `target` by the publish message.
///
/// Validates that the message succeeded, that the target proposal is among
/// the message's parameters (with client addresses compared in canonical
/// key form) and that the market actor marked that slot valid, then maps
/// the parameter index through the validity bitfield into the returned ID
/// vector.
pub async fn deal_id_from_publish_msg(
    chain: &Arc<dyn ChainApi>,
    publish_cid: Cid,
    target: &DealProposal,
) -> Result<(DealID, TipsetKey), DealInfoError> {
    let lookup = chain
        .search_for_message(publish_cid)
        .await?
        .ok_or(DealInfoError::PublishNotFound(publish_cid))?;
    if !lookup.receipt.exit_code.is_success() {
        return Err(DealInfoError::PublishFailed(lookup.receipt.exit_code.value()));
    }

    let ret: PublishStorageDealsReturn = lookup
        .receipt
        .return_data
        .deserialize()
        .map_err(|e| DealInfoError::MalformedReturn(e.to_string()))?;

    let message = chain.chain_get_message(publish_cid).await?;
    let params: PublishStorageDealsParams = message
        .params
        .deserialize()
        .map_err(|e| DealInfoError::MalformedReturn(e.to_string()))?;

    let mut index = None;
    for (i, deal) in params.deals.iter().enumerate() {
        if proposals_equal(chain, &deal.proposal, target).await? {
            index = Some(i);
            break;
        }
    }
    let index = index.ok_or(DealInfoError::DealNotInMessage(publish_cid))?;

    if !ret.valid_deals.get(index as u64) {
        return Err(DealInfoError::DealInvalid(index));
    }
    // IDs are returned for valid deals only; our slot in the ID vector is
    // the number of valid slots before ours.
    let out_index = (0..index as u64).filter(|i| ret.valid_deals.get(*i)).count();
    let deal_id = *ret.ids.get(out_index).ok_or_else(|| {
        DealInfoError::MalformedReturn(format!(
            "return value has {} ids, valid slot {out_index} missing",
            ret.ids.len()
        ))
    })?;
    Ok((deal_id, lookup.tipset))
}

/// Deal ID plus current market state, re-derived from chain.
pub async fn current_deal_info(
    chain: &Arc<dyn ChainApi>,
    publish_cid: Cid,
    proposal: &DealProposal,
) -> Result<CurrentDealInfo, DealInfoError> {
    let (deal_id, publish_tipset) = deal_id_from_publish_msg(chain, publish_cid, proposal).await?;
    let market_deal = chain.state_market_storage_deal(deal_id).await?;
    Ok(CurrentDealInfo {
        deal_id,
        market_deal,
        publish_tipset,
    })
}

/// Canonical equality: clients may be referenced by key address or account
/// actor ID, so both sides resolve to key form before comparing.
async fn proposals_equal(
    chain: &Arc<dyn ChainApi>,
    a: &DealProposal,
    b: &DealProposal,
) -> Result<bool, DealInfoError> {
    if a.piece_cid != b.piece_cid
        || a.piece_size != b.piece_size
        || a.verified_deal != b.verified_deal
        || a.provider != b.provider
        || a.start_epoch != b.start_epoch
        || a.end_epoch != b.end_epoch
        || a.storage_price_per_epoch != b.storage_price_per_epoch
        || a.provider_collateral != b.provider_collateral
        || a.client_collateral != b.client_collateral
        || a.label != b.label
    {
        return Ok(false);
    }
    let client_a = resolve_client(chain, a.client).await?;
    let client_b = resolve_client(chain, b.client).await?;
    Ok(client_a == client_b)
}

async fn resolve_client(
    chain: &Arc<dyn ChainApi>,
    client: Address,
) -> Result<Address, DealInfoError> {
    Ok(chain.state_account_key(client).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestChain, register_publish_message, test_client_proposal};
    use fvm_shared::error::ExitCode;

    #[tokio::test]
    async fn resolves_deal_id_through_validity_bitfield() {
        let chain = Arc::new(TestChain::new(100));
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        let rejected = test_client_proposal(|p| p.start_epoch = 500);
        let target = test_client_proposal(|p| p.start_epoch = 600);

        // Slot 0 was rejected by the actor; target sits at slot 1 but is
        // the first (only) valid deal, so it takes ids[0].
        let publish_cid = register_publish_message(
            &chain,
            &[rejected.clone(), target.clone()],
            &[77],
            &[1],
            ExitCode::OK,
        );

        let (deal_id, _) = deal_id_from_publish_msg(&dyn_chain, publish_cid, &target.proposal)
            .await
            .unwrap();
        assert_eq!(deal_id, 77);

        let err = deal_id_from_publish_msg(&dyn_chain, publish_cid, &rejected.proposal)
            .await
            .unwrap_err();
        assert!(matches!(err, DealInfoError::DealInvalid(0)));
    }

    #[tokio::test]
    async fn client_addresses_compare_in_key_form() {
        let chain = Arc::new(TestChain::new(100));
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        let key_address = Address::new_bls(&[0x17; 48]).unwrap();
        let id_address = Address::new_id(4242);
        chain.set_account_key(id_address, key_address);
        chain.set_account_key(key_address, key_address);

        // Published with the ID form, queried with the key form.
        let published = test_client_proposal(|p| p.client = id_address);
        let queried = {
            let mut q = published.clone();
            q.proposal.client = key_address;
            q
        };
        let publish_cid =
            register_publish_message(&chain, &[published], &[9], &[0], ExitCode::OK);

        let (deal_id, _) = deal_id_from_publish_msg(&dyn_chain, publish_cid, &queried.proposal)
            .await
            .unwrap();
        assert_eq!(deal_id, 9);
    }

    #[tokio::test]
    async fn unrelated_proposal_is_not_found() {
        let chain = Arc::new(TestChain::new(100));
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        let published = test_client_proposal(|p| p.start_epoch = 500);
        let other = test_client_proposal(|p| p.start_epoch = 777);
        let publish_cid =
            register_publish_message(&chain, &[published], &[9], &[0], ExitCode::OK);

        let err = deal_id_from_publish_msg(&dyn_chain, publish_cid, &other.proposal)
            .await
            .unwrap_err();
        assert!(matches!(err, DealInfoError::DealNotInMessage(_)));
    }

    #[tokio::test]
    async fn failed_publish_message_is_terminal() {
        let chain = Arc::new(TestChain::new(100));
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        let deal = test_client_proposal(|_| {});
        let publish_cid = register_publish_message(
            &chain,
            &[deal.clone()],
            &[],
            &[],
            ExitCode::new(16), // USR_ILLEGAL_ARGUMENT
        );

        let err = deal_id_from_publish_msg(&dyn_chain, publish_cid, &deal.proposal)
            .await
            .unwrap_err();
        assert!(matches!(err, DealInfoError::PublishFailed(16)));
    }

    #[tokio::test]
    async fn reorged_return_value_yields_the_current_id() {
        let chain = Arc::new(TestChain::new(100));
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        let deal = test_client_proposal(|_| {});

        let publish_cid =
            register_publish_message(&chain, &[deal.clone()], &[10], &[0], ExitCode::OK);
        let (before, _) = deal_id_from_publish_msg(&dyn_chain, publish_cid, &deal.proposal)
            .await
            .unwrap();
        assert_eq!(before, 10);

        // Reorg: the same message re-executes and assigns a different ID.
        register_publish_message(&chain, &[deal.clone()], &[44], &[0], ExitCode::OK);
        let (after, _) = deal_id_from_publish_msg(&dyn_chain, publish_cid, &deal.proposal)
            .await
            .unwrap();
        assert_eq!(after, 44);
    }
}
