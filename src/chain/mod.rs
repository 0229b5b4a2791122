// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Capability boundary towards the full node, wallet and funds manager.
//!
//! The deal engine never talks to a blockchain implementation directly; every
//! component receives an [`ChainApi`] handle and calls the small surface it
//! needs. Production wiring implements these traits over the node's RPC
//! client; tests implement them in-memory.

pub mod message;
pub mod tipset;

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::message::Message;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::receipt::Receipt;
use fvm_shared::sector::{SectorNumber, SectorSize};
use tokio::sync::broadcast;

use crate::market::types::MarketDeal;
pub use message::{SignedMessage, message_cid};
pub use tipset::{Tipset, TipsetKey};

/// Default number of epochs a message must stay on chain before the engine
/// treats it as final.
pub const DEFAULT_MESSAGE_CONFIDENCE: i64 = 5;

/// Change notification delivered by the head subscription.
#[derive(Clone, Debug)]
pub enum HeadChange {
    Apply(Arc<Tipset>),
    Revert(Arc<Tipset>),
}

/// Receipt and location of a message found on chain.
#[derive(Clone, Debug)]
pub struct MsgLookup {
    pub message: Cid,
    pub receipt: Receipt,
    pub tipset: TipsetKey,
    pub height: ChainEpoch,
}

/// Escrow state of an address in the storage market actor.
#[derive(Clone, Debug, Default)]
pub struct MarketBalance {
    pub escrow: TokenAmount,
    pub locked: TokenAmount,
}

impl MarketBalance {
    /// Escrow not currently locked for deals.
    pub fn available(&self) -> TokenAmount {
        self.escrow.clone() - self.locked.clone()
    }
}

/// The subset of on-chain miner info the engine consumes.
#[derive(Clone, Debug)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub control_addresses: Vec<Address>,
    pub sector_size: SectorSize,
}

/// A sector pre-commitment observed in state, with the deals it carries.
#[derive(Clone, Debug)]
pub struct SectorPreCommitment {
    pub sector_number: SectorNumber,
    pub deal_ids: Vec<DealID>,
}

/// Chain, state and wallet operations the engine depends on. Mirrors the
/// node's `Chain*`/`State*`/`Mpool*`/`Wallet*` RPC groups, narrowed to what
/// the deal lifecycle actually calls.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_head(&self) -> anyhow::Result<Arc<Tipset>>;

    /// Subscription to head changes. Lagging receivers may observe
    /// [`broadcast::error::RecvError::Lagged`] and should resynchronize from
    /// [`ChainApi::chain_head`].
    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange>;

    async fn messages_for_tipset(&self, key: &TipsetKey) -> anyhow::Result<Vec<Message>>;

    async fn chain_get_message(&self, cid: Cid) -> anyhow::Result<Message>;

    /// Assigns a sequence, signs and submits a message, respecting `max_fee`
    /// as the fee cap. Returns the signed message; its CID is the handle the
    /// caller waits on.
    async fn mpool_push_message(
        &self,
        msg: Message,
        max_fee: TokenAmount,
    ) -> anyhow::Result<SignedMessage>;

    /// Blocks until the message lands and has stayed on chain for
    /// `confidence` epochs without being reverted.
    async fn wait_for_message(
        &self,
        cid: Cid,
        confidence: i64,
        lookback: Option<ChainEpoch>,
    ) -> anyhow::Result<MsgLookup>;

    /// Non-blocking variant: looks for an already-landed message.
    async fn search_for_message(&self, cid: Cid) -> anyhow::Result<Option<MsgLookup>>;

    /// Resolves an account-actor address to its key address.
    async fn state_account_key(&self, addr: Address) -> anyhow::Result<Address>;

    async fn state_miner_info(&self, miner: Address) -> anyhow::Result<MinerInfo>;

    async fn state_market_balance(&self, addr: Address) -> anyhow::Result<MarketBalance>;

    /// Remaining datacap of a verified client, `None` when the client holds
    /// no allocation at all.
    async fn state_verified_client_datacap(
        &self,
        addr: Address,
    ) -> anyhow::Result<Option<BigInt>>;

    async fn state_market_storage_deal(
        &self,
        deal_id: DealID,
    ) -> anyhow::Result<Option<MarketDeal>>;

    /// Protocol min/max bounds for provider collateral on a deal of the
    /// given size, derived from current network power and supply.
    async fn state_deal_provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> anyhow::Result<(TokenAmount, TokenAmount)>;

    /// Pre-commitments for `miner` that landed between two tipsets.
    async fn state_miner_precommits_diff(
        &self,
        miner: Address,
        from: &TipsetKey,
        to: &TipsetKey,
    ) -> anyhow::Result<Vec<SectorPreCommitment>>;

    async fn wallet_balance(&self, addr: Address) -> anyhow::Result<TokenAmount>;

    async fn wallet_sign(&self, addr: Address, data: &[u8]) -> anyhow::Result<Signature>;

    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: Address,
        data: &[u8],
    ) -> anyhow::Result<bool>;
}

/// Reservation interface of the funds manager. Reserving may require an
/// on-chain `AddBalance` message; when it does, the returned CID must be
/// waited on before the reservation counts as confirmed.
#[async_trait]
pub trait FundsApi: Send + Sync {
    async fn reserve_funds(
        &self,
        wallet: Address,
        amount: TokenAmount,
    ) -> anyhow::Result<Option<Cid>>;

    async fn release_funds(&self, wallet: Address, amount: TokenAmount) -> anyhow::Result<()>;
}
