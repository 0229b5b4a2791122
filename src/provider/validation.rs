// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Proposal acceptance checks.
//!
//! Every check mirrors what the market actor will enforce at publish time
//! (plus this provider's own ask); rejecting here saves the client a failed
//! on-chain publish. Checks run in a fixed order and the first failure is
//! the one reported back.

use std::sync::Arc;

use ahash::HashSet;
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;

use crate::chain::ChainApi;
use crate::market::ask::AskStore;
use crate::market::policy::{DEAL_MAX_LABEL_SIZE, deal_duration_bounds, deal_end_epoch_bound};
use crate::market::types::ClientDealProposal;
use crate::piece::validate_piece_cid;

/// Why a proposal was turned down. Always terminal and always reported to
/// the counterparty; distinct from infrastructure failures, which abort
/// validation without rejecting.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("client signature does not verify against {0}")]
    WrongSignature(Address),
    #[error("provider {0} is not managed by this daemon")]
    UnknownProvider(Address),
    #[error("label is {0} bytes, above the {DEAL_MAX_LABEL_SIZE} byte limit")]
    LabelTooLong(usize),
    #[error("piece size {0} invalid: {1}")]
    InvalidPieceSize(u64, &'static str),
    #[error("piece commitment rejected: {0}")]
    InvalidPieceCid(String),
    #[error("end epoch {end} does not follow start epoch {start}")]
    EpochsInverted { start: ChainEpoch, end: ChainEpoch },
    #[error("start epoch {start} already elapsed, head is at {head}")]
    StartElapsed { start: ChainEpoch, head: ChainEpoch },
    #[error("duration {duration} outside protocol bounds [{min}, {max}]")]
    DurationOutOfBounds {
        duration: ChainEpoch,
        min: ChainEpoch,
        max: ChainEpoch,
    },
    #[error("end epoch {end} further out than the protocol allows ({bound})")]
    EndTooFar { end: ChainEpoch, bound: ChainEpoch },
    #[error("provider collateral {collateral} outside bounds [{min}, {max}]")]
    CollateralOutOfBounds {
        collateral: TokenAmount,
        min: TokenAmount,
        max: TokenAmount,
    },
    #[error("no ask posted for provider {0}")]
    NoAsk(Address),
    #[error("price {price} per epoch below the posted ask {ask}")]
    PriceBelowAsk { price: TokenAmount, ask: TokenAmount },
    #[error("piece size {size} outside the ask's bounds [{min}, {max}]")]
    SizeOutsideAsk { size: u64, min: u64, max: u64 },
    #[error("client market balance {available} below required {required}")]
    InsufficientMarketBalance {
        available: TokenAmount,
        required: TokenAmount,
    },
    #[error("verified client {0} holds no datacap")]
    NoDatacap(Address),
    #[error("verified client datacap {datacap} below piece size {size}")]
    InsufficientDatacap { datacap: BigInt, size: u64 },
}

/// Runs the full acceptance check list.
///
/// `Ok(Err(_))` is a policy rejection to report to the client; `Err(_)` is
/// an infrastructure failure (chain unreachable) that must not reject the
/// deal.
pub async fn validate_proposal(
    chain: &Arc<dyn ChainApi>,
    asks: &Arc<dyn AskStore>,
    managed: &HashSet<Address>,
    deal: &ClientDealProposal,
) -> anyhow::Result<Result<(), ValidationError>> {
    let proposal = &deal.proposal;

    let signed_bytes = to_vec(proposal)?;
    if !chain
        .verify_signature(&deal.client_signature, proposal.client, &signed_bytes)
        .await?
    {
        return Ok(Err(ValidationError::WrongSignature(proposal.client)));
    }

    if !managed.contains(&proposal.provider) {
        return Ok(Err(ValidationError::UnknownProvider(proposal.provider)));
    }

    if proposal.label.len() > DEAL_MAX_LABEL_SIZE {
        return Ok(Err(ValidationError::LabelTooLong(proposal.label.len())));
    }

    if let Err(reason) = proposal.piece_size.validate() {
        return Ok(Err(ValidationError::InvalidPieceSize(
            proposal.piece_size.0,
            reason,
        )));
    }
    if let Err(e) = validate_piece_cid(&proposal.piece_cid) {
        return Ok(Err(ValidationError::InvalidPieceCid(e.to_string())));
    }

    if proposal.end_epoch <= proposal.start_epoch {
        return Ok(Err(ValidationError::EpochsInverted {
            start: proposal.start_epoch,
            end: proposal.end_epoch,
        }));
    }

    let head = chain.chain_head().await?;
    if head.epoch() > proposal.start_epoch {
        return Ok(Err(ValidationError::StartElapsed {
            start: proposal.start_epoch,
            head: head.epoch(),
        }));
    }

    let (min_duration, max_duration) = deal_duration_bounds(proposal.piece_size);
    let duration = proposal.duration();
    if duration < min_duration || duration > max_duration {
        return Ok(Err(ValidationError::DurationOutOfBounds {
            duration,
            min: min_duration,
            max: max_duration,
        }));
    }

    let end_bound = deal_end_epoch_bound(head.epoch());
    if proposal.end_epoch > end_bound {
        return Ok(Err(ValidationError::EndTooFar {
            end: proposal.end_epoch,
            bound: end_bound,
        }));
    }

    let (min_collateral, max_collateral) = chain
        .state_deal_provider_collateral_bounds(proposal.piece_size, proposal.verified_deal)
        .await?;
    if proposal.provider_collateral < min_collateral
        || proposal.provider_collateral > max_collateral
    {
        return Ok(Err(ValidationError::CollateralOutOfBounds {
            collateral: proposal.provider_collateral.clone(),
            min: min_collateral,
            max: max_collateral,
        }));
    }

    let ask = asks
        .ask(&proposal.provider)?
        .ok_or(ValidationError::NoAsk(proposal.provider));
    let ask = match ask {
        Ok(ask) => ask,
        Err(e) => return Ok(Err(e)),
    };
    let floor = ask.price_for(proposal.verified_deal);
    if proposal.storage_price_per_epoch < *floor {
        return Ok(Err(ValidationError::PriceBelowAsk {
            price: proposal.storage_price_per_epoch.clone(),
            ask: floor.clone(),
        }));
    }
    if proposal.piece_size.0 < ask.min_piece_size.0 || proposal.piece_size.0 > ask.max_piece_size.0
    {
        return Ok(Err(ValidationError::SizeOutsideAsk {
            size: proposal.piece_size.0,
            min: ask.min_piece_size.0,
            max: ask.max_piece_size.0,
        }));
    }

    let balance = chain.state_market_balance(proposal.client).await?;
    let available = balance.available();
    let required = proposal.client_balance_requirement();
    if available < required {
        return Ok(Err(ValidationError::InsufficientMarketBalance {
            available,
            required,
        }));
    }

    if proposal.verified_deal {
        let datacap = match chain.state_verified_client_datacap(proposal.client).await? {
            Some(datacap) => datacap,
            None => return Ok(Err(ValidationError::NoDatacap(proposal.client))),
        };
        if datacap < BigInt::from(proposal.piece_size.0) {
            return Ok(Err(ValidationError::InsufficientDatacap {
                datacap,
                size: proposal.piece_size.0,
            }));
        }
    }

    Ok(Ok(()))
}
