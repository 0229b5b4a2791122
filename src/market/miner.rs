// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The slice of the miner actor's method surface the commitment watcher
//! inspects: sector pre-commit and prove-commit messages.

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::RawBytes;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::MethodNum;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber};

pub const PRE_COMMIT_SECTOR_METHOD: MethodNum = 6;
pub const PROVE_COMMIT_SECTOR_METHOD: MethodNum = 7;
pub const PRE_COMMIT_SECTOR_BATCH_METHOD: MethodNum = 25;
pub const PROVE_COMMIT_AGGREGATE_METHOD: MethodNum = 26;

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct SectorPreCommitInfo {
    pub seal_proof: RegisteredSealProof,
    pub sector_number: SectorNumber,
    pub sealed_cid: Cid,
    pub seal_rand_epoch: ChainEpoch,
    pub deal_ids: Vec<DealID>,
    pub expiration: ChainEpoch,
}

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct PreCommitSectorBatchParams {
    pub sectors: Vec<SectorPreCommitInfo>,
}

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct ProveCommitSectorParams {
    pub sector_number: SectorNumber,
    pub proof: RawBytes,
}

#[derive(Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct ProveCommitAggregateParams {
    pub sector_numbers: BitField,
    pub aggregate_proof: RawBytes,
}
