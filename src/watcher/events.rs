// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The generic chain-event wait the commitment watches are built on: block
//! until a message matching a predicate lands and survives a confidence
//! window, give up past a height deadline, and re-arm when a reorg reverts
//! the match.

use std::sync::Arc;

use anyhow::bail;
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::message::Message;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::chain::{ChainApi, HeadChange, TipsetKey, message_cid};

/// A message that matched the predicate and held for the confidence window.
#[derive(Clone, Debug)]
pub struct MatchedMessage {
    pub cid: Cid,
    pub message: Message,
    pub found_at: ChainEpoch,
}

/// Watches incoming tipsets for a message accepted by `matcher`.
///
/// Returns `Ok(None)` when the head passes `timeout_epoch` with no match. A
/// match reverted before it gathers `confidence` epochs is logged and
/// forgotten; the watch keeps running against the new chain.
pub async fn wait_for_message_matching<F>(
    chain: &Arc<dyn ChainApi>,
    confidence: i64,
    timeout_epoch: ChainEpoch,
    mut matcher: F,
) -> anyhow::Result<Option<MatchedMessage>>
where
    F: FnMut(&Message) -> bool + Send,
{
    let mut subscriber = chain.subscribe_head_changes();
    let mut candidate: Option<(MatchedMessage, TipsetKey)> = None;

    loop {
        match subscriber.recv().await {
            Ok(HeadChange::Apply(tipset)) => {
                if let Some((matched, _)) = &candidate {
                    if tipset.epoch() >= matched.found_at + confidence {
                        return Ok(candidate.map(|(matched, _)| matched));
                    }
                    continue;
                }

                for message in chain.messages_for_tipset(tipset.key()).await? {
                    if matcher(&message) {
                        let matched = MatchedMessage {
                            cid: message_cid(&message)?,
                            message,
                            found_at: tipset.epoch(),
                        };
                        debug!(cid = %matched.cid, epoch = matched.found_at, "matched chain message");
                        if confidence <= 0 {
                            return Ok(Some(matched));
                        }
                        candidate = Some((matched, tipset.key().clone()));
                        break;
                    }
                }

                if candidate.is_none() && tipset.epoch() > timeout_epoch {
                    return Ok(None);
                }
            }
            Ok(HeadChange::Revert(tipset)) => {
                if let Some((matched, key)) = &candidate {
                    if key == tipset.key() {
                        // Deliberately no corrective action beyond re-arming:
                        // the same message usually re-lands within a few
                        // epochs.
                        warn!(cid = %matched.cid, "matched message reverted by reorg, continuing watch");
                        candidate = None;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "chain event subscriber lagged");
            }
            Err(RecvError::Closed) => bail!("head change subscription closed"),
        }
    }
}
