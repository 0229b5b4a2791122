// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::to_vec;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::crypto::signature::{Signature, SignatureType};
use fvm_shared::message::Message;
use multihash_codetable::{Code, MultihashDigest};

/// Returns the canonical CID of an unsigned message (DAG-CBOR, Blake2b-256).
pub fn message_cid(msg: &Message) -> anyhow::Result<Cid> {
    let bytes = to_vec(msg)?;
    Ok(Cid::new_v1(
        fvm_ipld_encoding::DAG_CBOR,
        Code::Blake2b256.digest(&bytes),
    ))
}

/// A message with its sender's signature, as returned by the node once a
/// message has been signed and accepted into the local pool.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Signature,
}

impl SignedMessage {
    pub fn new(message: Message, signature: Signature) -> Self {
        Self { message, signature }
    }

    /// BLS-signed messages are referenced on chain by the CID of the bare
    /// message; secp messages by the CID of the signed envelope.
    pub fn cid(&self) -> anyhow::Result<Cid> {
        match self.signature.signature_type() {
            SignatureType::BLS => message_cid(&self.message),
            _ => {
                let bytes = to_vec(self)?;
                Ok(Cid::new_v1(
                    fvm_ipld_encoding::DAG_CBOR,
                    Code::Blake2b256.digest(&bytes),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_message;

    #[test]
    fn message_cid_is_stable() {
        let msg = test_message(1, 2, 0);
        assert_eq!(message_cid(&msg).unwrap(), message_cid(&msg).unwrap());
        let other = test_message(1, 2, 1);
        assert_ne!(message_cid(&msg).unwrap(), message_cid(&other).unwrap());
    }

    #[test]
    fn bls_signed_cid_matches_unsigned_cid() {
        let msg = test_message(1, 2, 0);
        let signed = SignedMessage::new(msg.clone(), Signature::new_bls(vec![0xfe; 96]));
        assert_eq!(signed.cid().unwrap(), message_cid(&msg).unwrap());

        let secp = SignedMessage::new(msg.clone(), Signature::new_secp256k1(vec![0xfe; 65]));
        assert_ne!(secp.cid().unwrap(), message_cid(&msg).unwrap());
    }
}
