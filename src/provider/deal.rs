// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use super::fsm::DealState;
use crate::market::types::{ClientDealProposal, DealProposal};
use crate::transfer::TransferParams;

/// Packing progress of a deal's piece, independent of the deal lifecycle
/// state: a deal can be `Active` on chain while its piece is still
/// `Assigned` to a sector that has not sealed.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum PieceStatus {
    #[default]
    Undefined,
    Assigned,
    Packing,
    Proving,
}

/// The persisted record of one storage deal handled by this provider.
///
/// Created on proposal acceptance, mutated only by the deal state machine
/// (packing fields under its transaction), never physically deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinerDeal {
    pub client_proposal: ClientDealProposal,
    /// CID of the signed proposal; the primary key.
    pub proposal_cid: Cid,
    pub state: DealState,
    pub piece_status: PieceStatus,
    /// Human-readable last error, empty while healthy.
    pub message: String,
    /// Verified piece data staged for sealing.
    pub piece_path: Option<PathBuf>,
    /// In-flight transfer destination, before verification.
    pub inbound_path: Option<PathBuf>,
    /// Running total of locally reserved collateral. Never negative;
    /// `handle_error` releases exactly this amount, once.
    pub funds_reserved: TokenAmount,
    /// `AddBalance` message of an in-flight collateral reservation.
    pub funding_message: Option<Cid>,
    pub publish_message: Option<Cid>,
    /// Assigned by the chain on publication; may change across a reorg.
    pub deal_id: Option<DealID>,
    /// Only meaningful once `piece_status` reaches `Assigned`.
    pub sector_number: Option<SectorNumber>,
    pub offset: Option<u64>,
    pub available_for_retrieval: bool,
    /// Present for online deals; the handle used to resume after a crash.
    pub transfer: Option<TransferParams>,
    pub created_at_epoch: ChainEpoch,
}

impl MinerDeal {
    pub fn new(
        client_proposal: ClientDealProposal,
        proposal_cid: Cid,
        transfer: Option<TransferParams>,
        created_at_epoch: ChainEpoch,
    ) -> Self {
        Self {
            client_proposal,
            proposal_cid,
            state: DealState::Unknown,
            piece_status: PieceStatus::default(),
            message: String::new(),
            piece_path: None,
            inbound_path: None,
            funds_reserved: TokenAmount::zero(),
            funding_message: None,
            publish_message: None,
            deal_id: None,
            sector_number: None,
            offset: None,
            available_for_retrieval: false,
            transfer,
            created_at_epoch,
        }
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_proposal.proposal
    }

    pub fn provider(&self) -> fvm_shared::address::Address {
        self.client_proposal.proposal.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_deal;

    #[test]
    fn new_deal_starts_clean() {
        let deal = test_deal(|_| {});
        assert_eq!(deal.state, DealState::Unknown);
        assert_eq!(deal.piece_status, PieceStatus::Undefined);
        assert!(deal.funds_reserved.is_zero());
        assert!(deal.deal_id.is_none() && deal.publish_message.is_none());
        assert!(!deal.available_for_retrieval);
    }

    #[test]
    fn deal_record_roundtrips_through_json() {
        let deal = test_deal(|d| {
            d.state = DealState::Publishing;
            d.message = "awaiting publish".into();
        });
        let bytes = serde_json::to_vec(&deal).unwrap();
        let back: MinerDeal = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.state, DealState::Publishing);
        assert_eq!(back.proposal_cid, deal.proposal_cid);
        assert_eq!(back.proposal(), deal.proposal());
    }
}
