// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::to_vec;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::MethodNum;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use multihash_codetable::{Code, MultihashDigest};
use serde::{Deserialize, Serialize};

/// Storage market actor address.
pub const STORAGE_MARKET_ACTOR_ADDR: Address = Address::new_id(5);

/// `PublishStorageDeals` method number on the market actor.
pub const PUBLISH_STORAGE_DEALS_METHOD: MethodNum = 4;

/// Arbitrary client-supplied label carried in a proposal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Terms of one storage deal, as published on chain.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: Label,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> TokenAmount {
        self.storage_price_per_epoch.clone() * self.duration()
    }

    /// Escrow the client must hold in the market actor for this deal.
    pub fn client_balance_requirement(&self) -> TokenAmount {
        self.client_collateral.clone() + self.total_storage_fee()
    }
}

/// A proposal together with the client's signature over it.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl ClientDealProposal {
    /// Canonical CID of the signed proposal; the deal's primary key.
    pub fn cid(&self) -> anyhow::Result<Cid> {
        let bytes = to_vec(self)?;
        Ok(Cid::new_v1(
            fvm_ipld_encoding::DAG_CBOR,
            Code::Blake2b256.digest(&bytes),
        ))
    }
}

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsParams {
    pub deals: Vec<ClientDealProposal>,
}

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsReturn {
    pub ids: Vec<DealID>,
    pub valid_deals: BitField,
}

/// Mutable on-chain state of a published deal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ChainDealState {
    pub sector_start_epoch: ChainEpoch,
    pub last_updated_epoch: ChainEpoch,
    pub slash_epoch: ChainEpoch,
}

impl ChainDealState {
    /// A deal is active once its data is proven into a sector.
    pub fn is_active(&self) -> bool {
        self.sector_start_epoch > 0
    }
}

/// A published deal as reported by `StateMarketStorageDeal`.
#[derive(Clone, Debug)]
pub struct MarketDeal {
    pub proposal: DealProposal,
    pub state: ChainDealState,
}

/// The provider's posted terms for incoming proposals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageAsk {
    pub price: TokenAmount,
    pub verified_price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

impl StorageAsk {
    /// The floor price for a proposal under this ask.
    pub fn price_for(&self, verified: bool) -> &TokenAmount {
        if verified {
            &self.verified_price
        } else {
            &self.price
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_client_proposal;

    #[test]
    fn client_balance_requirement_covers_fee_and_collateral() {
        let deal = test_client_proposal(|p| {
            p.start_epoch = 100;
            p.end_epoch = 110;
            p.storage_price_per_epoch = TokenAmount::from_atto(7);
            p.client_collateral = TokenAmount::from_atto(50);
        });
        assert_eq!(
            deal.proposal.client_balance_requirement(),
            TokenAmount::from_atto(7 * 10 + 50)
        );
    }

    #[test]
    fn proposal_cid_distinguishes_proposals() {
        let a = test_client_proposal(|p| p.start_epoch = 100);
        let b = test_client_proposal(|p| p.start_epoch = 101);
        assert_ne!(a.cid().unwrap(), b.cid().unwrap());
        assert_eq!(a.cid().unwrap(), a.clone().cid().unwrap());
    }
}
