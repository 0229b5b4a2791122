// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared fixtures: an in-memory chain implementing the capability traits
//! plus builders for proposals, deals and miner-actor messages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ahash::HashMap;
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::message::Message;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::receipt::Receipt;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber};
use multihash_codetable::{Code, MultihashDigest};
use num_traits::Zero;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::chain::{
    ChainApi, FundsApi, HeadChange, MarketBalance, MinerInfo, MsgLookup, SectorPreCommitment,
    SignedMessage, Tipset, TipsetKey, message_cid,
};
use crate::market::miner::{
    PRE_COMMIT_SECTOR_METHOD, PROVE_COMMIT_AGGREGATE_METHOD, PROVE_COMMIT_SECTOR_METHOD,
    ProveCommitAggregateParams, ProveCommitSectorParams, SectorPreCommitInfo,
};
use crate::market::policy::MIN_DEAL_DURATION;
use crate::market::types::{
    ClientDealProposal, DealProposal, Label, MarketDeal, PUBLISH_STORAGE_DEALS_METHOD,
    PublishStorageDealsParams, PublishStorageDealsReturn, STORAGE_MARKET_ACTOR_ADDR, StorageAsk,
};
use crate::piece::zero_piece_commitment;
use crate::provider::deal::MinerDeal;

/// Installs a subscriber printing `RUST_LOG`-filtered events for the test
/// run; repeated calls are no-ops.
pub fn init_test_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn dummy_cid(data: &[u8]) -> Cid {
    Cid::new_v1(fvm_ipld_encoding::DAG_CBOR, Code::Blake2b256.digest(data))
}

pub fn test_message(from_id: u64, to_id: u64, sequence: u64) -> Message {
    Message {
        version: 0,
        from: Address::new_id(from_id),
        to: Address::new_id(to_id),
        sequence,
        value: TokenAmount::zero(),
        method_num: 0,
        params: RawBytes::default(),
        gas_limit: 0,
        gas_fee_cap: TokenAmount::zero(),
        gas_premium: TokenAmount::zero(),
    }
}

/// A proposal that passes validation against [`test_ask`] and a default
/// [`TestChain`]; tweak fields through the mutator.
pub fn test_client_proposal(mutate: impl FnOnce(&mut DealProposal)) -> ClientDealProposal {
    let piece_size = PaddedPieceSize(1024);
    let mut proposal = DealProposal {
        piece_cid: zero_piece_commitment(piece_size).unwrap(),
        piece_size,
        verified_deal: false,
        client: Address::new_id(101),
        provider: Address::new_id(1000),
        label: Label::new("deal-label"),
        start_epoch: 10_000,
        end_epoch: 10_000 + MIN_DEAL_DURATION,
        storage_price_per_epoch: TokenAmount::from_atto(100),
        provider_collateral: TokenAmount::from_atto(1_000),
        client_collateral: TokenAmount::zero(),
    };
    mutate(&mut proposal);
    ClientDealProposal {
        proposal,
        client_signature: Signature::new_secp256k1(vec![7u8; 65]),
    }
}

/// A fresh deal record; the proposal CID reflects any mutation applied.
pub fn test_deal(mutate: impl FnOnce(&mut MinerDeal)) -> MinerDeal {
    let client_proposal = test_client_proposal(|_| {});
    let proposal_cid = client_proposal.cid().unwrap();
    let mut deal = MinerDeal::new(client_proposal, proposal_cid, None, 100);
    mutate(&mut deal);
    deal.proposal_cid = deal.client_proposal.cid().unwrap();
    deal
}

pub fn test_ask(miner: Address) -> StorageAsk {
    StorageAsk {
        price: TokenAmount::from_atto(10),
        verified_price: TokenAmount::from_atto(5),
        min_piece_size: PaddedPieceSize(128),
        max_piece_size: PaddedPieceSize(1 << 30),
        miner,
        timestamp: 0,
        expiry: 1_000_000,
        seq_no: 0,
    }
}

/// In-memory chain/wallet capability with scriptable state.
pub struct TestChain {
    head: RwLock<Arc<Tipset>>,
    head_tx: broadcast::Sender<HeadChange>,
    tipset_counter: AtomicU64,
    pushed: Mutex<Vec<SignedMessage>>,
    push_failure: Mutex<Option<String>>,
    auto_publish_result: Mutex<Option<(Vec<DealID>, Vec<u64>)>>,
    messages: RwLock<HashMap<Cid, Message>>,
    tipset_messages: RwLock<HashMap<TipsetKey, Vec<Message>>>,
    lookups: RwLock<HashMap<Cid, MsgLookup>>,
    balances: RwLock<HashMap<Address, TokenAmount>>,
    miner_infos: RwLock<HashMap<Address, MinerInfo>>,
    account_keys: RwLock<HashMap<Address, Address>>,
    market_balances: RwLock<HashMap<Address, MarketBalance>>,
    market_deals: RwLock<HashMap<DealID, MarketDeal>>,
    datacaps: RwLock<HashMap<Address, BigInt>>,
    collateral_bounds: RwLock<(TokenAmount, TokenAmount)>,
    precommit_diffs: RwLock<Vec<SectorPreCommitment>>,
    signatures_valid: AtomicBool,
    verify_calls: AtomicU64,
}

impl TestChain {
    pub fn new(epoch: ChainEpoch) -> Self {
        let (head_tx, _) = broadcast::channel(256);
        let genesis = Arc::new(Tipset::new(
            TipsetKey::new(vec![dummy_cid(b"genesis")]),
            epoch,
        ));
        Self {
            head: RwLock::new(genesis),
            head_tx,
            tipset_counter: AtomicU64::new(0),
            pushed: Mutex::new(Vec::new()),
            push_failure: Mutex::new(None),
            auto_publish_result: Mutex::new(None),
            messages: RwLock::new(HashMap::default()),
            tipset_messages: RwLock::new(HashMap::default()),
            lookups: RwLock::new(HashMap::default()),
            balances: RwLock::new(HashMap::default()),
            miner_infos: RwLock::new(HashMap::default()),
            account_keys: RwLock::new(HashMap::default()),
            market_balances: RwLock::new(HashMap::default()),
            market_deals: RwLock::new(HashMap::default()),
            datacaps: RwLock::new(HashMap::default()),
            collateral_bounds: RwLock::new((
                TokenAmount::zero(),
                TokenAmount::from_whole(1_000_000_000),
            )),
            precommit_diffs: RwLock::new(Vec::new()),
            signatures_valid: AtomicBool::new(true),
            verify_calls: AtomicU64::new(0),
        }
    }

    pub fn set_head(&self, epoch: ChainEpoch) {
        self.apply_tipset(epoch, Vec::new());
    }

    pub fn head_sync(&self) -> Arc<Tipset> {
        self.head.read().clone()
    }

    /// Builds a tipset at `epoch` carrying `messages`, makes it the head
    /// and notifies subscribers.
    pub fn apply_tipset(&self, epoch: ChainEpoch, messages: Vec<Message>) -> Arc<Tipset> {
        let n = self.tipset_counter.fetch_add(1, Ordering::SeqCst);
        let key = TipsetKey::new(vec![dummy_cid(format!("tipset-{epoch}-{n}").as_bytes())]);
        let tipset = Arc::new(Tipset::new(key.clone(), epoch));
        for message in &messages {
            if let Ok(cid) = message_cid(message) {
                self.messages.write().insert(cid, message.clone());
            }
        }
        self.tipset_messages.write().insert(key, messages);
        *self.head.write() = tipset.clone();
        let _ = self.head_tx.send(HeadChange::Apply(tipset.clone()));
        tipset
    }

    pub fn revert_tipset(&self, tipset: Arc<Tipset>) {
        let _ = self.head_tx.send(HeadChange::Revert(tipset));
    }

    pub fn pushed_messages(&self) -> Vec<SignedMessage> {
        self.pushed.lock().clone()
    }

    pub fn fail_next_push(&self, reason: &str) {
        *self.push_failure.lock() = Some(reason.to_owned());
    }

    /// Makes every pushed publish message immediately succeed on chain with
    /// the given IDs and valid slots.
    pub fn auto_publish_result(&self, ids: Vec<DealID>, valid_indices: Vec<u64>) {
        *self.auto_publish_result.lock() = Some((ids, valid_indices));
    }

    pub fn register_message(&self, cid: Cid, message: Message) {
        self.messages.write().insert(cid, message);
    }

    pub fn register_lookup(&self, cid: Cid, lookup: MsgLookup) {
        self.lookups.write().insert(cid, lookup);
    }

    pub fn set_wallet_balance(&self, addr: Address, balance: TokenAmount) {
        self.balances.write().insert(addr, balance);
    }

    pub fn set_miner_info(&self, miner: Address, info: MinerInfo) {
        self.miner_infos.write().insert(miner, info);
    }

    pub fn set_account_key(&self, addr: Address, key: Address) {
        self.account_keys.write().insert(addr, key);
    }

    pub fn set_market_balance(&self, addr: Address, balance: MarketBalance) {
        self.market_balances.write().insert(addr, balance);
    }

    pub fn set_market_deal(&self, deal_id: DealID, deal: MarketDeal) {
        self.market_deals.write().insert(deal_id, deal);
    }

    pub fn set_datacap(&self, addr: Address, datacap: BigInt) {
        self.datacaps.write().insert(addr, datacap);
    }

    pub fn set_collateral_bounds(&self, min: TokenAmount, max: TokenAmount) {
        *self.collateral_bounds.write() = (min, max);
    }

    pub fn add_precommit_diff(&self, precommit: SectorPreCommitment) {
        self.precommit_diffs.write().push(precommit);
    }

    pub fn reject_signatures(&self) {
        self.signatures_valid.store(false, Ordering::SeqCst);
    }

    /// How many signature verifications ran; duplicate proposals must not
    /// add to this.
    pub fn signature_checks(&self) -> u64 {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainApi for TestChain {
    async fn chain_head(&self) -> anyhow::Result<Arc<Tipset>> {
        Ok(self.head.read().clone())
    }

    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange> {
        self.head_tx.subscribe()
    }

    async fn messages_for_tipset(&self, key: &TipsetKey) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .tipset_messages
            .read()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn chain_get_message(&self, cid: Cid) -> anyhow::Result<Message> {
        self.messages
            .read()
            .get(&cid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("message {cid} not known"))
    }

    async fn mpool_push_message(
        &self,
        msg: Message,
        _max_fee: TokenAmount,
    ) -> anyhow::Result<SignedMessage> {
        if let Some(reason) = self.push_failure.lock().take() {
            anyhow::bail!("{reason}");
        }
        let signed = SignedMessage::new(msg, Signature::new_secp256k1(vec![1u8; 65]));
        let cid = signed.cid()?;
        self.messages.write().insert(cid, signed.message.clone());
        if let Some((ids, valid_indices)) = self.auto_publish_result.lock().clone() {
            let mut valid_deals = BitField::new();
            for i in valid_indices {
                valid_deals.set(i);
            }
            let ret = PublishStorageDealsReturn {
                ids,
                valid_deals,
            };
            let head = self.head.read().clone();
            self.lookups.write().insert(
                cid,
                MsgLookup {
                    message: cid,
                    receipt: Receipt {
                        exit_code: ExitCode::OK,
                        return_data: RawBytes::serialize(&ret)?,
                        gas_used: 0,
                        events_root: None,
                    },
                    tipset: head.key().clone(),
                    height: head.epoch(),
                },
            );
        }
        self.pushed.lock().push(signed.clone());
        Ok(signed)
    }

    async fn wait_for_message(
        &self,
        cid: Cid,
        _confidence: i64,
        _lookback: Option<ChainEpoch>,
    ) -> anyhow::Result<MsgLookup> {
        for _ in 0..500 {
            if let Some(lookup) = self.lookups.read().get(&cid).cloned() {
                return Ok(lookup);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("timed out waiting for message {cid}")
    }

    async fn search_for_message(&self, cid: Cid) -> anyhow::Result<Option<MsgLookup>> {
        Ok(self.lookups.read().get(&cid).cloned())
    }

    async fn state_account_key(&self, addr: Address) -> anyhow::Result<Address> {
        Ok(self.account_keys.read().get(&addr).copied().unwrap_or(addr))
    }

    async fn state_miner_info(&self, miner: Address) -> anyhow::Result<MinerInfo> {
        self.miner_infos
            .read()
            .get(&miner)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no miner info for {miner}"))
    }

    async fn state_market_balance(&self, addr: Address) -> anyhow::Result<MarketBalance> {
        Ok(self
            .market_balances
            .read()
            .get(&addr)
            .cloned()
            .unwrap_or_default())
    }

    async fn state_verified_client_datacap(
        &self,
        addr: Address,
    ) -> anyhow::Result<Option<BigInt>> {
        Ok(self.datacaps.read().get(&addr).cloned())
    }

    async fn state_market_storage_deal(
        &self,
        deal_id: DealID,
    ) -> anyhow::Result<Option<MarketDeal>> {
        Ok(self.market_deals.read().get(&deal_id).cloned())
    }

    async fn state_deal_provider_collateral_bounds(
        &self,
        _size: PaddedPieceSize,
        _verified: bool,
    ) -> anyhow::Result<(TokenAmount, TokenAmount)> {
        Ok(self.collateral_bounds.read().clone())
    }

    async fn state_miner_precommits_diff(
        &self,
        _miner: Address,
        _from: &TipsetKey,
        _to: &TipsetKey,
    ) -> anyhow::Result<Vec<SectorPreCommitment>> {
        Ok(self.precommit_diffs.read().clone())
    }

    async fn wallet_balance(&self, addr: Address) -> anyhow::Result<TokenAmount> {
        Ok(self
            .balances
            .read()
            .get(&addr)
            .cloned()
            .unwrap_or_else(TokenAmount::zero))
    }

    async fn wallet_sign(&self, _addr: Address, _data: &[u8]) -> anyhow::Result<Signature> {
        Ok(Signature::new_secp256k1(vec![42u8; 65]))
    }

    async fn verify_signature(
        &self,
        _signature: &Signature,
        _signer: Address,
        _data: &[u8],
    ) -> anyhow::Result<bool> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.signatures_valid.load(Ordering::SeqCst))
    }
}

/// Registers a publish message plus its on-chain result and returns its
/// CID. Registering again with the same proposals overwrites the previous
/// result, which is how tests simulate a reorged return value.
pub fn register_publish_message(
    chain: &TestChain,
    deals: &[ClientDealProposal],
    ids: &[DealID],
    valid_indices: &[u64],
    exit_code: ExitCode,
) -> Cid {
    let params = PublishStorageDealsParams {
        deals: deals.to_vec(),
    };
    let mut message = test_message(999, 5, 0);
    message.to = STORAGE_MARKET_ACTOR_ADDR;
    message.method_num = PUBLISH_STORAGE_DEALS_METHOD;
    message.params = RawBytes::serialize(&params).unwrap();
    let cid = message_cid(&message).unwrap();
    chain.register_message(cid, message);

    let mut valid_deals = BitField::new();
    for &i in valid_indices {
        valid_deals.set(i);
    }
    let ret = PublishStorageDealsReturn {
        ids: ids.to_vec(),
        valid_deals,
    };
    let head = chain.head_sync();
    chain.register_lookup(
        cid,
        MsgLookup {
            message: cid,
            receipt: Receipt {
                exit_code,
                return_data: RawBytes::serialize(&ret).unwrap(),
                gas_used: 0,
                events_root: None,
            },
            tipset: head.key().clone(),
            height: head.epoch(),
        },
    );
    cid
}

pub fn precommit_message(
    provider: Address,
    sector: SectorNumber,
    deal_ids: &[DealID],
) -> Message {
    let params = SectorPreCommitInfo {
        seal_proof: RegisteredSealProof::StackedDRG32GiBV1P1,
        sector_number: sector,
        sealed_cid: dummy_cid(b"sealed"),
        seal_rand_epoch: 0,
        deal_ids: deal_ids.to_vec(),
        expiration: 10_000_000,
    };
    let mut message = test_message(888, 0, 0);
    message.to = provider;
    message.method_num = PRE_COMMIT_SECTOR_METHOD;
    message.params = RawBytes::serialize(&params).unwrap();
    message
}

pub fn prove_commit_message(provider: Address, sector: SectorNumber) -> Message {
    let params = ProveCommitSectorParams {
        sector_number: sector,
        proof: RawBytes::new(vec![0u8; 16]),
    };
    let mut message = test_message(888, 0, 1);
    message.to = provider;
    message.method_num = PROVE_COMMIT_SECTOR_METHOD;
    message.params = RawBytes::serialize(&params).unwrap();
    message
}

pub fn prove_commit_aggregate_message(provider: Address, sectors: &[SectorNumber]) -> Message {
    let mut sector_numbers = BitField::new();
    for &sector in sectors {
        sector_numbers.set(sector);
    }
    let params = ProveCommitAggregateParams {
        sector_numbers,
        aggregate_proof: RawBytes::new(vec![0u8; 16]),
    };
    let mut message = test_message(888, 0, 2);
    message.to = provider;
    message.method_num = PROVE_COMMIT_AGGREGATE_METHOD;
    message.params = RawBytes::serialize(&params).unwrap();
    message
}

/// Funds manager double recording reservations and releases.
#[derive(Default)]
pub struct TestFunds {
    pub reserved: Mutex<Vec<(Address, TokenAmount)>>,
    pub released: Mutex<Vec<(Address, TokenAmount)>>,
    /// Returned (once) from the next reservation, simulating an on-chain
    /// top-up being required.
    pub next_message: Mutex<Option<Cid>>,
}

impl TestFunds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_released(&self) -> TokenAmount {
        self.released
            .lock()
            .iter()
            .fold(TokenAmount::zero(), |acc, (_, amt)| acc + amt.clone())
    }
}

#[async_trait]
impl FundsApi for TestFunds {
    async fn reserve_funds(
        &self,
        wallet: Address,
        amount: TokenAmount,
    ) -> anyhow::Result<Option<Cid>> {
        self.reserved.lock().push((wallet, amount));
        Ok(self.next_message.lock().take())
    }

    async fn release_funds(&self, wallet: Address, amount: TokenAmount) -> anyhow::Result<()> {
        self.released.lock().push((wallet, amount));
        Ok(())
    }
}

/// Records the responses the provider sends back on a deal stream.
#[derive(Default)]
pub struct TestStream {
    pub responses: Mutex<Vec<crate::provider::network::SignedResponse>>,
    pub closed: AtomicBool,
}

impl TestStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::provider::network::DealStream for TestStream {
    async fn send_response(
        &self,
        response: crate::provider::network::SignedResponse,
    ) -> anyhow::Result<()> {
        self.responses.lock().push(response);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct TestTagger {
    pub tagged: Mutex<Vec<Cid>>,
    pub untagged: Mutex<Vec<Cid>>,
}

impl crate::provider::network::PeerTagger for TestTagger {
    fn tag_peer(&self, proposal: &Cid) {
        self.tagged.lock().push(*proposal);
    }

    fn untag_peer(&self, proposal: &Cid) {
        self.untagged.lock().push(*proposal);
    }
}

#[derive(Default)]
pub struct TestRegistry {
    pub registered: Mutex<Vec<Cid>>,
    pub announced: Mutex<Vec<Cid>>,
}

#[async_trait]
impl crate::provider::network::PieceRegistry for TestRegistry {
    async fn register_piece(&self, deal: &MinerDeal) -> anyhow::Result<()> {
        self.registered.lock().push(deal.proposal_cid);
        Ok(())
    }

    async fn announce_deal(&self, deal: &MinerDeal) -> anyhow::Result<()> {
        self.announced.lock().push(deal.proposal_cid);
        Ok(())
    }
}
