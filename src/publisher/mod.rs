// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Batched submission of `PublishStorageDeals` messages.
//!
//! Each provider address owns one accumulator. A caller's `publish` enqueues
//! the proposal and resolves once the accumulator flushes: when the batch
//! reaches its configured size, when the quiescence period after the first
//! queued deal elapses, or when a flush is forced. Everything flushed
//! together lands in a single on-chain message, so the whole batch shares
//! one message CID or one error.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use cid::Cid;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::message::Message;
use num_traits::Zero;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::ChainApi;
use crate::config::PublishConfig;
use crate::market::types::{
    ClientDealProposal, PUBLISH_STORAGE_DEALS_METHOD, PublishStorageDealsParams,
    STORAGE_MARKET_ACTOR_ADDR,
};

#[derive(Clone, Debug, thiserror::Error)]
pub enum PublishError {
    #[error("proposal start epoch {start} has passed, head is at {head}")]
    StartEpochPassed { start: i64, head: i64 },
    #[error("publish batch mixes providers {expected} and {got}")]
    MixedProviders { expected: Address, got: Address },
    #[error("chain query failed: {0}")]
    Chain(String),
    #[error("message push failed: {0}")]
    Push(String),
}

/// One queued proposal and the single-use channel its caller waits on.
struct PendingDeal {
    deal: ClientDealProposal,
    result: oneshot::Sender<Result<Cid, PublishError>>,
    cancel: CancellationToken,
}

struct QueueInner {
    pending: Vec<PendingDeal>,
    /// Cancels the quiescence timer armed by the first queued deal.
    timer: Option<CancellationToken>,
}

/// Accumulator for a single provider address.
struct ProviderQueue {
    provider: Address,
    chain: Arc<dyn ChainApi>,
    config: PublishConfig,
    inner: Mutex<QueueInner>,
}

impl ProviderQueue {
    fn new(provider: Address, chain: Arc<dyn ChainApi>, config: PublishConfig) -> Self {
        Self {
            provider,
            chain,
            config,
            inner: Mutex::new(QueueInner {
                pending: Vec::new(),
                timer: None,
            }),
        }
    }

    fn enqueue(self: &Arc<Self>, pending: PendingDeal) {
        let batch = {
            let mut inner = self.inner.lock();
            inner.pending.push(pending);
            if inner.pending.len() >= self.config.max_deals_per_msg {
                Self::drain(&mut inner)
            } else {
                if inner.timer.is_none() {
                    let timer = CancellationToken::new();
                    inner.timer = Some(timer.clone());
                    let queue = Arc::clone(self);
                    let period = self.config.period;
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = timer.cancelled() => {}
                            _ = tokio::time::sleep(period) => {
                                debug!(provider = %queue.provider, "publish period elapsed");
                                queue.flush_pending().await;
                            }
                        }
                    });
                }
                Vec::new()
            }
        };
        if !batch.is_empty() {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.flush(batch).await });
        }
    }

    /// Takes everything queued, disarming the timer.
    fn drain(inner: &mut QueueInner) -> Vec<PendingDeal> {
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
        std::mem::take(&mut inner.pending)
    }

    async fn flush_pending(self: &Arc<Self>) {
        let batch = Self::drain(&mut self.inner.lock());
        self.flush(batch).await;
    }

    async fn flush(&self, mut batch: Vec<PendingDeal>) {
        // Callers gone before the flush leave the batch silently; their
        // result channel is already dead.
        batch.retain(|p| !p.cancel.is_cancelled() && !p.result.is_closed());
        if batch.is_empty() {
            return;
        }

        let head = match self.chain.chain_head().await {
            Ok(head) => head,
            Err(e) => {
                let err = PublishError::Chain(e.to_string());
                for p in batch {
                    let _ = p.result.send(Err(err.clone()));
                }
                return;
            }
        };

        // Proposals whose start epoch already passed can never publish;
        // resolve them individually and keep the rest of the batch alive.
        let mut valid = Vec::with_capacity(batch.len());
        for p in batch {
            let start = p.deal.proposal.start_epoch;
            if start <= head.epoch() {
                warn!(
                    provider = %self.provider,
                    start, head = head.epoch(),
                    "dropping expired proposal from publish batch"
                );
                let _ = p.result.send(Err(PublishError::StartEpochPassed {
                    start,
                    head: head.epoch(),
                }));
            } else {
                valid.push(p);
            }
        }
        if valid.is_empty() {
            return;
        }

        // Accumulators are per provider by construction; anything else in
        // the batch is a caller bug.
        if let Some(stray) = valid
            .iter()
            .find(|p| p.deal.proposal.provider != self.provider)
        {
            let err = PublishError::MixedProviders {
                expected: self.provider,
                got: stray.deal.proposal.provider,
            };
            error!("{err}");
            for p in valid {
                let _ = p.result.send(Err(err.clone()));
            }
            return;
        }

        let result = self.submit(&valid).await;
        match result {
            Ok(cid) => {
                info!(provider = %self.provider, deals = valid.len(), message = %cid, "published deals");
                for p in valid {
                    let _ = p.result.send(Ok(cid));
                }
            }
            Err(err) => {
                warn!(provider = %self.provider, "publish failed: {err}");
                for p in valid {
                    let _ = p.result.send(Err(err.clone()));
                }
            }
        }
    }

    async fn submit(&self, batch: &[PendingDeal]) -> Result<Cid, PublishError> {
        let from = self
            .select_publish_address()
            .await
            .map_err(|e| PublishError::Chain(e.to_string()))?;
        let params = PublishStorageDealsParams {
            deals: batch.iter().map(|p| p.deal.clone()).collect(),
        };
        let msg = Message {
            version: 0,
            to: STORAGE_MARKET_ACTOR_ADDR,
            from,
            sequence: 0,
            value: TokenAmount::zero(),
            method_num: PUBLISH_STORAGE_DEALS_METHOD,
            params: RawBytes::serialize(&params).map_err(|e| PublishError::Push(e.to_string()))?,
            gas_limit: 0,
            gas_fee_cap: TokenAmount::zero(),
            gas_premium: TokenAmount::zero(),
        };
        let signed = self
            .chain
            .mpool_push_message(msg, self.config.max_fee.clone())
            .await
            .map_err(|e| PublishError::Push(e.to_string()))?;
        signed.cid().map_err(|e| PublishError::Push(e.to_string()))
    }

    /// Picks the sending address from the provider's control set: any
    /// address already holding the fee budget wins, otherwise the one with
    /// the highest balance.
    async fn select_publish_address(&self) -> anyhow::Result<Address> {
        let info = self.chain.state_miner_info(self.provider).await?;
        let mut candidates = info.control_addresses;
        if !candidates.contains(&info.worker) {
            candidates.push(info.worker);
        }

        let mut richest: Option<(Address, TokenAmount)> = None;
        for addr in candidates {
            let balance = self.chain.wallet_balance(addr).await?;
            if balance >= self.config.max_fee {
                return Ok(addr);
            }
            match &richest {
                Some((_, best)) if *best >= balance => {}
                _ => richest = Some((addr, balance)),
            }
        }
        Ok(richest
            .map(|(addr, _)| addr)
            .unwrap_or(info.worker))
    }
}

/// Front of the publish queues, one accumulator per provider address.
pub struct DealPublisher {
    chain: Arc<dyn ChainApi>,
    config: PublishConfig,
    queues: Mutex<HashMap<Address, Arc<ProviderQueue>>>,
}

impl DealPublisher {
    pub fn new(chain: Arc<dyn ChainApi>, config: PublishConfig) -> Self {
        Self {
            chain,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queue(&self, provider: Address) -> Arc<ProviderQueue> {
        self.queues
            .lock()
            .entry(provider)
            .or_insert_with(|| {
                Arc::new(ProviderQueue::new(
                    provider,
                    Arc::clone(&self.chain),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Enqueues a proposal for its provider's next publish message. The
    /// returned channel resolves with the publish message CID shared by the
    /// whole batch, or the batch's error. Cancelling `cancel` removes the
    /// entry at the next flush without touching the rest of the batch.
    pub fn publish(
        &self,
        deal: ClientDealProposal,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<Result<Cid, PublishError>> {
        let (tx, rx) = oneshot::channel();
        let provider = deal.proposal.provider;
        self.queue(provider).enqueue(PendingDeal {
            deal,
            result: tx,
            cancel,
        });
        rx
    }

    /// Flushes a provider's accumulator immediately.
    pub async fn force_publish_pending(&self, provider: Address) {
        self.queue(provider).flush_pending().await;
    }

    /// Queued-but-unflushed deal count for a provider.
    pub fn pending_count(&self, provider: Address) -> usize {
        self.queue(provider).inner.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MinerInfo;
    use crate::test_utils::{TestChain, test_client_proposal};
    use fvm_ipld_encoding::from_slice;
    use fvm_shared::sector::SectorSize;
    use std::time::Duration;

    const MINER: Address = Address::new_id(1000);

    fn publisher_with(
        chain: &Arc<TestChain>,
        config: PublishConfig,
    ) -> DealPublisher {
        chain.set_miner_info(
            MINER,
            MinerInfo {
                owner: Address::new_id(1001),
                worker: Address::new_id(1002),
                control_addresses: vec![Address::new_id(1003), Address::new_id(1004)],
                sector_size: SectorSize::_2KiB,
            },
        );
        chain.set_wallet_balance(Address::new_id(1002), TokenAmount::from_whole(1));
        let dyn_chain: Arc<dyn ChainApi> = chain.clone();
        DealPublisher::new(dyn_chain, config)
    }

    fn proposal_at(start_epoch: i64) -> ClientDealProposal {
        test_client_proposal(|p| {
            p.provider = MINER;
            p.start_epoch = start_epoch;
            p.end_epoch = start_epoch + crate::market::policy::MIN_DEAL_DURATION;
        })
    }

    fn slow_config() -> PublishConfig {
        PublishConfig {
            max_deals_per_msg: 8,
            period: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn batch_resolves_with_one_message_cid() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(&chain, slow_config());

        let waiters: Vec<_> = (0..3)
            .map(|i| publisher.publish(proposal_at(5000 + i), CancellationToken::new()))
            .collect();
        assert_eq!(publisher.pending_count(MINER), 3);

        publisher.force_publish_pending(MINER).await;
        let mut cids = Vec::new();
        for rx in waiters {
            cids.push(rx.await.unwrap().unwrap());
        }
        assert!(cids.windows(2).all(|w| w[0] == w[1]));

        // One message carrying all three proposals.
        let pushed = chain.pushed_messages();
        assert_eq!(pushed.len(), 1);
        let msg = &pushed[0].message;
        assert_eq!(msg.to, STORAGE_MARKET_ACTOR_ADDR);
        assert_eq!(msg.method_num, PUBLISH_STORAGE_DEALS_METHOD);
        let params: PublishStorageDealsParams = from_slice(&msg.params).unwrap();
        assert_eq!(params.deals.len(), 3);
    }

    #[tokio::test]
    async fn full_queue_flushes_without_force() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(
            &chain,
            PublishConfig {
                max_deals_per_msg: 2,
                period: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        let a = publisher.publish(proposal_at(5000), CancellationToken::new());
        let b = publisher.publish(proposal_at(5001), CancellationToken::new());
        assert_eq!(a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(chain.pushed_messages().len(), 1);
    }

    #[tokio::test]
    async fn quiescence_period_flushes_a_partial_batch() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(
            &chain,
            PublishConfig {
                max_deals_per_msg: 8,
                period: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let rx = publisher.publish(proposal_at(5000), CancellationToken::new());
        let cid = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(chain.pushed_messages()[0].cid().unwrap(), cid);
    }

    #[tokio::test]
    async fn cancelled_caller_leaves_the_batch_intact() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(&chain, slow_config());

        let cancel = CancellationToken::new();
        let cancelled = publisher.publish(proposal_at(5000), cancel.clone());
        let kept = publisher.publish(proposal_at(5001), CancellationToken::new());

        cancel.cancel();
        publisher.force_publish_pending(MINER).await;

        // The cancelled caller's channel dies unresolved.
        assert!(cancelled.await.is_err());
        kept.await.unwrap().unwrap();

        let pushed = chain.pushed_messages();
        assert_eq!(pushed.len(), 1);
        let params: PublishStorageDealsParams = from_slice(&pushed[0].message.params).unwrap();
        assert_eq!(params.deals.len(), 1);
        assert_eq!(params.deals[0].proposal.start_epoch, 5001);
    }

    #[tokio::test]
    async fn expired_start_epochs_resolve_individually() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(&chain, slow_config());

        let expired = publisher.publish(proposal_at(50), CancellationToken::new());
        let alive = publisher.publish(proposal_at(5000), CancellationToken::new());
        publisher.force_publish_pending(MINER).await;

        assert!(matches!(
            expired.await.unwrap(),
            Err(PublishError::StartEpochPassed { start: 50, head: 100 })
        ));
        alive.await.unwrap().unwrap();
        let params: PublishStorageDealsParams =
            from_slice(&chain.pushed_messages()[0].message.params).unwrap();
        assert_eq!(params.deals.len(), 1);
    }

    #[tokio::test]
    async fn push_failure_fails_the_whole_batch_alike() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(&chain, slow_config());
        chain.fail_next_push("mpool rejected");

        let a = publisher.publish(proposal_at(5000), CancellationToken::new());
        let b = publisher.publish(proposal_at(5001), CancellationToken::new());
        publisher.force_publish_pending(MINER).await;

        let ea = a.await.unwrap().unwrap_err();
        let eb = b.await.unwrap().unwrap_err();
        assert_eq!(ea.to_string(), eb.to_string());
        assert!(matches!(ea, PublishError::Push(_)));
    }

    #[tokio::test]
    async fn publish_address_prefers_funded_control_address() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(&chain, slow_config());
        // First control address is broke, the second covers the fee budget.
        chain.set_wallet_balance(Address::new_id(1003), TokenAmount::from_atto(1));
        chain.set_wallet_balance(
            Address::new_id(1004),
            PublishConfig::default().max_fee + TokenAmount::from_atto(1),
        );

        let rx = publisher.publish(proposal_at(5000), CancellationToken::new());
        publisher.force_publish_pending(MINER).await;
        rx.await.unwrap().unwrap();

        assert_eq!(chain.pushed_messages()[0].message.from, Address::new_id(1004));
    }

    #[tokio::test]
    async fn publish_address_falls_back_to_richest() {
        let chain = Arc::new(TestChain::new(100));
        let publisher = publisher_with(&chain, slow_config());
        // Nobody covers the budget; 1003 holds the most.
        chain.set_wallet_balance(Address::new_id(1002), TokenAmount::from_atto(5));
        chain.set_wallet_balance(Address::new_id(1003), TokenAmount::from_atto(50));
        chain.set_wallet_balance(Address::new_id(1004), TokenAmount::from_atto(10));

        let rx = publisher.publish(proposal_at(5000), CancellationToken::new());
        publisher.force_publish_pending(MINER).await;
        rx.await.unwrap().unwrap();

        assert_eq!(chain.pushed_messages()[0].message.from, Address::new_id(1003));
    }
}
