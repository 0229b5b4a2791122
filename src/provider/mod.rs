// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The deal state machine orchestrator.
//!
//! [`StorageProvider`] owns every deal's lifecycle: it validates inbound
//! proposals, persists each transition through the deal store, and runs the
//! effects the transition table (`fsm`) demands (fund reservation, batched
//! publication, staging, commitment watches). Failures funnel through
//! [`StorageProvider::handle_error`], which is safe to call from any path,
//! any number of times.

pub mod deal;
pub mod fsm;
pub mod network;
pub mod validation;

use std::path::PathBuf;
use std::sync::Arc;

use ahash::HashSet;
use anyhow::{Context as _, anyhow};
use cid::Cid;
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainApi, FundsApi};
use crate::config::MarketConfig;
use crate::db::{DealStore, StoreError};
use crate::market::ask::AskStore;
use crate::market::types::ClientDealProposal;
use crate::packing::DealAssigner;
use crate::piece::{self, PieceError};
use crate::publisher::DealPublisher;
use crate::supervisor::Supervisor;
use crate::transfer::{TransferError, TransferEvent, TransferManager, TransferParams};
use crate::watcher::{CommitmentWatcher, PreCommitOutcome, deal_id_from_publish_msg};
use deal::MinerDeal;
use fsm::{DealEvent, DealState, Effect, FsmError};
use network::{DealResponse, DealStream, PeerTagger, PieceRegistry, SignedResponse};
use validation::validate_proposal;

/// Emitted on every persisted state change, in commit order.
#[derive(Clone, Debug)]
pub struct DealNotification {
    pub proposal_cid: Cid,
    pub state: DealState,
    pub message: String,
}

pub struct StorageProvider {
    chain: Arc<dyn ChainApi>,
    funds: Arc<dyn FundsApi>,
    store: Arc<dyn DealStore>,
    asks: Arc<dyn AskStore>,
    registry: Arc<dyn PieceRegistry>,
    tagger: Arc<dyn PeerTagger>,
    publisher: DealPublisher,
    transfers: Arc<TransferManager>,
    watcher: CommitmentWatcher,
    supervisor: Supervisor,
    config: MarketConfig,
    managed: HashSet<Address>,
    notifications_tx: flume::Sender<DealNotification>,
    notifications_rx: flume::Receiver<DealNotification>,
}

impl StorageProvider {
    /// Wires the engine together. The capability handles come from the host
    /// daemon; the publish queue, transport and watcher are built here.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainApi>,
        funds: Arc<dyn FundsApi>,
        store: Arc<dyn DealStore>,
        asks: Arc<dyn AskStore>,
        registry: Arc<dyn PieceRegistry>,
        tagger: Arc<dyn PeerTagger>,
        config: MarketConfig,
        miners: impl IntoIterator<Item = Address>,
    ) -> Arc<Self> {
        let publisher = DealPublisher::new(Arc::clone(&chain), config.publish.clone());
        let transfers = Arc::new(TransferManager::new(config.transfer.clone()));
        let watcher = CommitmentWatcher::new(Arc::clone(&chain), config.message_confidence);
        let (notifications_tx, notifications_rx) = flume::unbounded();
        Arc::new(Self {
            chain,
            funds,
            store,
            asks,
            registry,
            tagger,
            publisher,
            transfers,
            watcher,
            supervisor: Supervisor::new(),
            config,
            managed: miners.into_iter().collect(),
            notifications_tx,
            notifications_rx,
        })
    }

    pub fn subscribe(&self) -> flume::Receiver<DealNotification> {
        self.notifications_rx.clone()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Assignment surface for the sealing subsystem, sharing this
    /// provider's deal store.
    pub fn assigner(&self) -> DealAssigner {
        DealAssigner::new(Arc::clone(&self.store))
    }

    pub fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, StoreError> {
        self.store.get_deal(proposal_cid)
    }

    pub fn list_deals(&self, miner: Option<&Address>) -> Result<Vec<MinerDeal>, StoreError> {
        self.store.list_deals(miner)
    }

    /// Entry point for an inbound proposal.
    ///
    /// The record persists before any response goes out, so a retried
    /// proposal (say, after the client's connection dropped) is answered
    /// from stored state instead of being validated twice.
    pub async fn accept_proposal(
        self: &Arc<Self>,
        proposal: ClientDealProposal,
        transfer: Option<TransferParams>,
        stream: Arc<dyn DealStream>,
    ) -> anyhow::Result<Cid> {
        let proposal_cid = proposal.cid()?;
        self.tagger.tag_peer(&proposal_cid);

        if self.store.has_deal(&proposal_cid)? {
            let existing = self.store.get_deal(&proposal_cid)?;
            debug!(%proposal_cid, state = %existing.state, "re-proposal answered from stored state");
            self.send_response(&existing, stream.as_ref()).await?;
            return Ok(proposal_cid);
        }

        let head = self.chain.chain_head().await?;
        let record = MinerDeal::new(proposal.clone(), proposal_cid, transfer, head.epoch());
        self.store.save_deal(&record)?;
        self.dispatch(proposal_cid, DealEvent::Validate, Some(&stream))
            .await?;

        match validate_proposal(&self.chain, &self.asks, &self.managed, &proposal).await {
            Ok(Ok(())) => {
                info!(%proposal_cid, provider = %proposal.proposal.provider, "deal accepted");
                self.dispatch(proposal_cid, DealEvent::Accepted, Some(&stream))
                    .await?;
            }
            Ok(Err(rejection)) => {
                self.dispatch(
                    proposal_cid,
                    DealEvent::Rejected {
                        reason: rejection.to_string(),
                    },
                    Some(&stream),
                )
                .await?;
            }
            Err(infra) => {
                self.handle_error(&proposal_cid, format!("validation aborted: {infra:#}"))
                    .await;
                return Err(infra);
            }
        }
        Ok(proposal_cid)
    }

    /// Offline-deal path: the operator supplies the piece file directly and
    /// verification picks up from there.
    pub async fn import_data(
        self: &Arc<Self>,
        proposal_cid: &Cid,
        path: PathBuf,
    ) -> anyhow::Result<()> {
        let deal = self.store.get_deal(proposal_cid)?;
        anyhow::ensure!(
            deal.state == DealState::WaitingForData,
            "deal {proposal_cid} is not awaiting data (state {})",
            deal.state
        );
        self.dispatch(*proposal_cid, DealEvent::DataReceived { path }, None)
            .await
    }

    /// Re-entrant driver: re-executes the pending work of the deal's
    /// current state. Calling it on a deal whose state has no pending work
    /// is a no-op, which is what makes restarts safe.
    pub async fn advance(self: &Arc<Self>, proposal_cid: Cid) -> anyhow::Result<()> {
        let deal = self.store.get_deal(&proposal_cid)?;
        let effect = match deal.state {
            DealState::WaitingForData => Some(Effect::BeginTransfer),
            DealState::VerifyData => Some(Effect::VerifyPieceData),
            DealState::ReserveProviderFunds => Some(Effect::ReserveFunds),
            DealState::ProviderFunding => deal
                .funding_message
                .map(|message| Effect::WaitForFunding { message }),
            DealState::Publish => Some(Effect::QueuePublish),
            DealState::Publishing => deal
                .publish_message
                .map(|message| Effect::WaitForPublish { message }),
            DealState::Staged => Some(Effect::StagePiece),
            DealState::AwaitingPreCommit => Some(Effect::WatchPreCommit),
            DealState::Sealing => deal.sector_number.map(|sector| Effect::WatchCommit { sector }),
            _ => None,
        };
        let Some(effect) = effect else {
            return Ok(());
        };
        match self.run_effect(&deal, effect, None).await {
            Ok(Some(event)) => self.dispatch(proposal_cid, event, None).await,
            Ok(None) => Ok(()),
            Err(e) => {
                self.handle_error(&proposal_cid, format!("{e:#}")).await;
                Err(e)
            }
        }
    }

    /// Crash recovery: re-arms transfers, waits and watches for every
    /// non-terminal deal. Deals already mid-transfer are left alone.
    pub fn restart_deals(self: &Arc<Self>) -> anyhow::Result<()> {
        for deal in self.store.list_deals(None)? {
            if deal.state.is_terminal() {
                continue;
            }
            if deal.state == DealState::WaitingForData
                && self.transfers.is_executing(&deal.proposal_cid)
            {
                continue;
            }
            debug!(proposal_cid = %deal.proposal_cid, state = %deal.state, "resuming deal");
            let provider = Arc::clone(self);
            let proposal_cid = deal.proposal_cid;
            self.supervisor.spawn(format!("resume:{proposal_cid}"), async move {
                provider.advance(proposal_cid).await
            });
        }
        Ok(())
    }

    /// Unconditional failure path: releases reserved funds (at most once),
    /// deletes staged files, persists `Failing` with the reason. Never
    /// fails; double invocation is harmless.
    pub async fn handle_error(&self, proposal_cid: &Cid, reason: impl AsRef<str>) {
        let reason = reason.as_ref();
        error!(%proposal_cid, "deal failed: {reason}");
        let deal = match self.store.get_deal(proposal_cid) {
            Ok(deal) => deal,
            Err(e) => {
                warn!(%proposal_cid, "cannot load failing deal: {e}");
                return;
            }
        };

        if !deal.funds_reserved.is_zero() {
            match self.chain.state_miner_info(deal.provider()).await {
                Ok(info) => {
                    if let Err(e) = self
                        .funds
                        .release_funds(info.worker, deal.funds_reserved.clone())
                        .await
                    {
                        warn!(%proposal_cid, "failed to release reserved funds: {e:#}");
                    }
                }
                Err(e) => warn!(%proposal_cid, "cannot resolve worker to release funds: {e:#}"),
            }
        }

        self.remove_staged_files(&deal);

        match self.store.update_deal(proposal_cid, &mut |d| {
            d.state = DealState::Failing;
            d.message = reason.to_string();
            d.funds_reserved = TokenAmount::zero();
        }) {
            Ok(updated) => self.notify(&updated),
            Err(e) => warn!(%proposal_cid, "failed to persist deal failure: {e}"),
        }
    }

    /// Boxed re-entry into `dispatch` for the tasks spawned by effects.
    /// Without the box the spawned futures' types would contain the
    /// dispatch future and vice versa.
    fn dispatch_boxed(
        self: &Arc<Self>,
        proposal_cid: Cid,
        event: DealEvent,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<()>> {
        let provider = Arc::clone(self);
        Box::pin(async move { provider.dispatch(proposal_cid, event, None).await })
    }

    /// Applies one event through the transition table, persists, runs the
    /// resulting effects, and follows any event an effect produces.
    async fn dispatch(
        self: &Arc<Self>,
        proposal_cid: Cid,
        mut event: DealEvent,
        stream: Option<&Arc<dyn DealStream>>,
    ) -> anyhow::Result<()> {
        loop {
            let current = self.store.get_deal(&proposal_cid)?;
            let transition = match fsm::transition(current.state, &event) {
                Ok(t) => t,
                Err(FsmError::Invalid { state, event }) => {
                    // Advance is idempotent per state: a precondition
                    // reported twice finds the deal already past the state
                    // it unlocks.
                    debug!(%proposal_cid, %state, event, "ignoring stale deal event");
                    return Ok(());
                }
            };

            let updated = self.store.update_deal(&proposal_cid, &mut |deal| {
                apply_event(deal, &event);
                deal.state = transition.next;
            })?;
            debug!(%proposal_cid, state = %updated.state, event = event.label(), "deal advanced");
            self.notify(&updated);

            let mut next = None;
            for effect in transition.effects {
                match self.run_effect(&updated, effect, stream).await {
                    Ok(Some(produced)) => next = Some(produced),
                    Ok(None) => {}
                    Err(e) => {
                        self.handle_error(&proposal_cid, format!("{e:#}")).await;
                        return Err(e);
                    }
                }
            }
            match next {
                Some(produced) => event = produced,
                None => return Ok(()),
            }
        }
    }

    async fn run_effect(
        self: &Arc<Self>,
        deal: &MinerDeal,
        effect: Effect,
        stream: Option<&Arc<dyn DealStream>>,
    ) -> anyhow::Result<Option<DealEvent>> {
        match effect {
            Effect::SendAcceptResponse => {
                let stream = stream.context("no open stream to deliver the acceptance on")?;
                self.send_response(deal, stream.as_ref()).await?;
                Ok(Some(DealEvent::ResponseSent))
            }

            Effect::SendRejectResponse { reason } => {
                warn!(proposal_cid = %deal.proposal_cid, "rejecting deal: {reason}");
                if let Some(stream) = stream {
                    if let Err(e) = self.send_response(deal, stream.as_ref()).await {
                        warn!("failed to deliver rejection: {e:#}");
                    }
                    if let Err(e) = stream.close().await {
                        debug!("failed to close deal stream: {e:#}");
                    }
                }
                self.tagger.untag_peer(&deal.proposal_cid);
                Ok(Some(DealEvent::RejectionSent))
            }

            Effect::BeginTransfer => {
                let Some(params) = deal.transfer.clone() else {
                    debug!(proposal_cid = %deal.proposal_cid, "offline deal, waiting for import");
                    return Ok(None);
                };
                std::fs::create_dir_all(&self.config.staging_dir)
                    .context("creating staging directory")?;
                let dest = self
                    .config
                    .staging_dir
                    .join(format!("{}.piece", deal.proposal_cid));
                let events = match self.transfers.execute(
                    deal.proposal_cid,
                    params,
                    dest.clone(),
                    self.supervisor.shutdown_token(),
                ) {
                    Ok(events) => events,
                    Err(TransferError::AlreadyExecuting(_)) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };

                let provider = Arc::clone(self);
                let proposal_cid = deal.proposal_cid;
                self.supervisor
                    .spawn(format!("transfer:{proposal_cid}"), async move {
                        loop {
                            match events.recv_async().await {
                                Ok(TransferEvent::Progress { received }) => {
                                    debug!(%proposal_cid, received, "transfer progress");
                                }
                                Ok(TransferEvent::Completed { .. }) => {
                                    return provider
                                        .dispatch_boxed(
                                            proposal_cid,
                                            DealEvent::DataReceived { path: dest },
                                        )
                                        .await;
                                }
                                Ok(TransferEvent::Failed { error }) => {
                                    provider
                                        .handle_error(
                                            &proposal_cid,
                                            format!("transfer failed: {error}"),
                                        )
                                        .await;
                                    return Ok(());
                                }
                                Err(_) => return Ok(()),
                            }
                        }
                    });
                Ok(None)
            }

            Effect::VerifyPieceData => {
                let path = deal
                    .inbound_path
                    .clone()
                    .context("no staged data to verify")?;
                let declared = deal.proposal().piece_cid;
                match piece::commitment_from_file(&path, deal.proposal().piece_size).await {
                    Ok(computed) if computed == declared => {
                        self.store.update_deal(&deal.proposal_cid, &mut |d| {
                            d.piece_path = Some(path.clone());
                        })?;
                        Ok(Some(DealEvent::DataVerified))
                    }
                    Ok(computed) => Ok(Some(DealEvent::VerificationFailed {
                        reason: format!(
                            "piece commitment mismatch: computed {computed}, proposal declares {declared}"
                        ),
                    })),
                    Err(e @ PieceError::Oversized { .. }) => {
                        Ok(Some(DealEvent::VerificationFailed {
                            reason: e.to_string(),
                        }))
                    }
                    // IO trouble proves nothing about the data.
                    Err(e) => Err(e.into()),
                }
            }

            Effect::ReserveFunds => {
                let info = self.chain.state_miner_info(deal.provider()).await?;
                let amount = deal.proposal().provider_collateral.clone();
                let message = self.funds.reserve_funds(info.worker, amount.clone()).await?;
                Ok(Some(DealEvent::FundsReserved { amount, message }))
            }

            Effect::WaitForFunding { message } => {
                let lookup = self
                    .chain
                    .wait_for_message(message, self.config.message_confidence, None)
                    .await?;
                anyhow::ensure!(
                    lookup.receipt.exit_code.is_success(),
                    "funding message {message} failed with exit code {}",
                    lookup.receipt.exit_code.value()
                );
                Ok(Some(DealEvent::FundingConfirmed))
            }

            Effect::QueuePublish => {
                let result = self
                    .publisher
                    .publish(deal.client_proposal.clone(), self.supervisor.shutdown_token())
                    .await
                    .context("publisher dropped the deal")?;
                let message = result.map_err(|e| anyhow!("publish failed: {e}"))?;
                Ok(Some(DealEvent::PublishSubmitted { message }))
            }

            Effect::WaitForPublish { message } => {
                let lookup = self
                    .chain
                    .wait_for_message(message, self.config.message_confidence, None)
                    .await?;
                anyhow::ensure!(
                    lookup.receipt.exit_code.is_success(),
                    "publish message {message} failed with exit code {}",
                    lookup.receipt.exit_code.value()
                );
                let (deal_id, _) =
                    deal_id_from_publish_msg(&self.chain, message, deal.proposal()).await?;

                // The collateral is locked on chain from here on; the local
                // reservation has done its job.
                if !deal.funds_reserved.is_zero() {
                    let info = self.chain.state_miner_info(deal.provider()).await?;
                    self.funds
                        .release_funds(info.worker, deal.funds_reserved.clone())
                        .await?;
                }
                Ok(Some(DealEvent::PublishConfirmed { deal_id }))
            }

            Effect::StagePiece => {
                self.registry.register_piece(deal).await?;
                self.registry.announce_deal(deal).await?;
                Ok(Some(DealEvent::PieceStaged))
            }

            Effect::WatchPreCommit => {
                let provider = Arc::clone(self);
                let snapshot = deal.clone();
                let proposal_cid = deal.proposal_cid;
                self.supervisor
                    .spawn(format!("watch-precommit:{proposal_cid}"), async move {
                        let publish = snapshot
                            .publish_message
                            .context("watching pre-commit without a publish message")?;
                        match provider
                            .watcher
                            .on_deal_sector_precommitted(
                                snapshot.provider(),
                                snapshot.proposal(),
                                publish,
                            )
                            .await
                        {
                            Ok(PreCommitOutcome::AlreadyActive) => {
                                provider
                                    .dispatch_boxed(
                                        proposal_cid,
                                        DealEvent::SectorPreCommitted {
                                            sector: snapshot.sector_number.unwrap_or(0),
                                            active: true,
                                        },
                                    )
                                    .await
                            }
                            Ok(PreCommitOutcome::Found { sector, via_state }) => {
                                info!(%proposal_cid, sector, via_state, "deal pre-committed");
                                provider
                                    .dispatch_boxed(
                                        proposal_cid,
                                        DealEvent::SectorPreCommitted {
                                            sector,
                                            active: false,
                                        },
                                    )
                                    .await
                            }
                            Err(e) => {
                                provider
                                    .handle_error(
                                        &proposal_cid,
                                        format!("pre-commit watch failed: {e}"),
                                    )
                                    .await;
                                Ok(())
                            }
                        }
                    });
                Ok(None)
            }

            Effect::WatchCommit { sector } => {
                let provider = Arc::clone(self);
                let snapshot = deal.clone();
                let proposal_cid = deal.proposal_cid;
                self.supervisor
                    .spawn(format!("watch-commit:{proposal_cid}"), async move {
                        let publish = snapshot
                            .publish_message
                            .context("watching commit without a publish message")?;
                        match provider
                            .watcher
                            .on_deal_sector_committed(
                                snapshot.provider(),
                                sector,
                                snapshot.proposal(),
                                publish,
                            )
                            .await
                        {
                            Ok(()) => {
                                info!(%proposal_cid, sector, "deal sector proven, deal active");
                                provider
                                    .dispatch_boxed(proposal_cid, DealEvent::SectorCommitted)
                                    .await
                            }
                            Err(e) => {
                                provider
                                    .handle_error(&proposal_cid, format!("commit watch failed: {e}"))
                                    .await;
                                Ok(())
                            }
                        }
                    });
                Ok(None)
            }

            Effect::Cleanup => {
                self.remove_staged_files(deal);
                Ok(None)
            }
        }
    }

    async fn send_response(&self, deal: &MinerDeal, stream: &dyn DealStream) -> anyhow::Result<()> {
        let response = DealResponse {
            state: deal.state,
            message: deal.message.clone(),
            proposal: deal.proposal_cid,
        };
        let info = self.chain.state_miner_info(deal.provider()).await?;
        let signature = self
            .chain
            .wallet_sign(info.worker, &to_vec(&response)?)
            .await?;
        stream
            .send_response(SignedResponse {
                response,
                signature,
            })
            .await
    }

    fn remove_staged_files(&self, deal: &MinerDeal) {
        for path in [&deal.inbound_path, &deal.piece_path].into_iter().flatten() {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed staged file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to remove staged file: {e}"),
            }
        }
    }

    fn notify(&self, deal: &MinerDeal) {
        let _ = self.notifications_tx.send(DealNotification {
            proposal_cid: deal.proposal_cid,
            state: deal.state,
            message: deal.message.clone(),
        });
    }
}

/// Field updates tied to an event, applied in the same store transaction as
/// the state change.
fn apply_event(deal: &mut MinerDeal, event: &DealEvent) {
    match event {
        DealEvent::Rejected { reason } => deal.message = reason.clone(),
        DealEvent::VerificationFailed { reason } => deal.message = reason.clone(),
        DealEvent::DataReceived { path } => deal.inbound_path = Some(path.clone()),
        DealEvent::FundsReserved { amount, message } => {
            deal.funds_reserved = deal.funds_reserved.clone() + amount.clone();
            deal.funding_message = *message;
        }
        DealEvent::PublishSubmitted { message } => deal.publish_message = Some(*message),
        DealEvent::PublishConfirmed { deal_id } => {
            deal.deal_id = Some(*deal_id);
            deal.funds_reserved = TokenAmount::zero();
        }
        DealEvent::PieceStaged => deal.available_for_retrieval = true,
        DealEvent::SectorPreCommitted { sector, active } => {
            if !active {
                deal.sector_number = Some(*sector);
            }
        }
        _ => {}
    }
}
