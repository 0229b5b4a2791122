// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Outward-facing surfaces of the deal handshake: the response stream back
//! to the counterparty and the downstream piece registry. Wire encodings
//! and the actual index/storage backends live outside this crate.

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::crypto::signature::Signature;
use serde::{Deserialize, Serialize};

use super::deal::MinerDeal;
use super::fsm::DealState;

/// Provider's answer to a proposal, signed with the miner's worker key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DealResponse {
    pub state: DealState,
    pub message: String,
    pub proposal: Cid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedResponse {
    pub response: DealResponse,
    pub signature: Signature,
}

/// The open stream a proposal arrived on.
#[async_trait]
pub trait DealStream: Send + Sync {
    async fn send_response(&self, response: SignedResponse) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Connection-manager tagging, keeping peers with in-flight deals from
/// being garbage-collected by the transport.
pub trait PeerTagger: Send + Sync {
    fn tag_peer(&self, proposal: &Cid);
    fn untag_peer(&self, proposal: &Cid);
}

/// Hand-off to the piece/index subsystem once a deal's data is on chain.
#[async_trait]
pub trait PieceRegistry: Send + Sync {
    /// Register the staged piece with piece storage and the DAG index.
    async fn register_piece(&self, deal: &MinerDeal) -> anyhow::Result<()>;
    /// Announce the deal to the index-provider network.
    async fn announce_deal(&self, deal: &MinerDeal) -> anyhow::Result<()>;
}
