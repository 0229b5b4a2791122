// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

/// Ordered set of block CIDs identifying one tipset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipsetKey(Vec<Cid>);

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self(cids)
    }

    pub fn cids(&self) -> &[Cid] {
        &self.0
    }
}

impl From<Vec<Cid>> for TipsetKey {
    fn from(cids: Vec<Cid>) -> Self {
        Self(cids)
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cids: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{{{}}}", cids.join(", "))
    }
}

/// The view of a tipset the deal engine needs: its key and its height.
/// Full header data stays with the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tipset {
    key: TipsetKey,
    epoch: ChainEpoch,
}

impl Tipset {
    pub fn new(key: TipsetKey, epoch: ChainEpoch) -> Self {
        Self { key, epoch }
    }

    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::dummy_cid;

    #[test]
    fn tipset_key_display_lists_cids() {
        let key = TipsetKey::new(vec![dummy_cid(b"a"), dummy_cid(b"b")]);
        let shown = key.to_string();
        assert!(shown.starts_with('{') && shown.ends_with('}'));
        assert!(shown.contains(", "));
    }

    #[test]
    fn tipset_accessors() {
        let ts = Tipset::new(TipsetKey::new(vec![dummy_cid(b"head")]), 42);
        assert_eq!(ts.epoch(), 42);
        assert_eq!(ts.key().cids().len(), 1);
    }
}
