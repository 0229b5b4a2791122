// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage market actor surface: proposal and publish-message types, policy
//! bounds and the provider's posted ask.

pub mod ask;
pub mod miner;
pub mod policy;
pub mod types;

pub use ask::{AskStore, MemoryAskStore};
pub use types::{
    ClientDealProposal, DealProposal, Label, MarketDeal, PublishStorageDealsParams,
    PublishStorageDealsReturn, StorageAsk,
};
