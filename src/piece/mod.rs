// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content commitments over padded piece data.
//!
//! A piece commitment is the root of a binary SHA2-256 merkle tree whose
//! leaves are the 32-byte nodes of the padded piece, wrapped in a CID with
//! the unsealed-commitment codec. Filler pieces reuse the precomputable
//! commitment of all-zero data.

use cid::Cid;
use cid::multihash::Multihash;
use fvm_shared::piece::PaddedPieceSize;
use multihash_codetable::{Code, MultihashDigest};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Multicodec for unsealed piece commitments.
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;

/// Multihash code of the digest carried by piece commitments.
pub const SHA2_256_CODE: u64 = 0x12;

const NODE_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PieceError {
    #[error("invalid padded piece size {0}: {1}")]
    InvalidSize(u64, &'static str),
    #[error("invalid piece commitment: {0}")]
    InvalidCommitment(String),
    #[error("piece larger than declared size: {actual} > {declared}")]
    Oversized { actual: u64, declared: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn sha256(data: &[u8]) -> [u8; NODE_SIZE] {
    let mh = Code::Sha2_256.digest(data);
    let mut out = [0u8; NODE_SIZE];
    out.copy_from_slice(mh.digest());
    out
}

fn combine(left: &[u8; NODE_SIZE], right: &[u8; NODE_SIZE]) -> [u8; NODE_SIZE] {
    let mut buf = [0u8; NODE_SIZE * 2];
    buf[..NODE_SIZE].copy_from_slice(left);
    buf[NODE_SIZE..].copy_from_slice(right);
    sha256(&buf)
}

/// Incremental merkle accumulator. Nodes of equal height collapse as leaves
/// arrive, so memory stays logarithmic in the piece size.
struct MerkleStack {
    nodes: Vec<(u32, [u8; NODE_SIZE])>,
}

impl MerkleStack {
    fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    fn push_leaf(&mut self, leaf: [u8; NODE_SIZE]) {
        self.nodes.push((0, leaf));
        while self.nodes.len() >= 2 {
            let (hr, right) = self.nodes[self.nodes.len() - 1];
            let (hl, left) = self.nodes[self.nodes.len() - 2];
            if hl != hr {
                break;
            }
            self.nodes.truncate(self.nodes.len() - 2);
            self.nodes.push((hl + 1, combine(&left, &right)));
        }
    }

    fn root(mut self) -> Option<[u8; NODE_SIZE]> {
        match (self.nodes.pop(), self.nodes.pop()) {
            (Some((_, root)), None) => Some(root),
            _ => None,
        }
    }
}

fn commitment_cid(root: [u8; NODE_SIZE]) -> Result<Cid, PieceError> {
    let mh = Multihash::wrap(SHA2_256_CODE, &root)
        .map_err(|e| PieceError::InvalidCommitment(e.to_string()))?;
    Ok(Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh))
}

/// Computes the commitment of `data` as a piece of `size` padded bytes.
/// `data` shorter than `size` is zero-extended; longer is an error.
pub fn commitment_from_bytes(data: &[u8], size: PaddedPieceSize) -> Result<Cid, PieceError> {
    size.validate().map_err(|e| PieceError::InvalidSize(size.0, e))?;
    if data.len() as u64 > size.0 {
        return Err(PieceError::Oversized {
            actual: data.len() as u64,
            declared: size.0,
        });
    }

    let mut stack = MerkleStack::new();
    let mut chunk = [0u8; NODE_SIZE];
    for offset in (0..size.0).step_by(NODE_SIZE) {
        chunk.fill(0);
        let end = data.len().min((offset as usize) + NODE_SIZE);
        if (offset as usize) < data.len() {
            let src = &data[offset as usize..end];
            chunk[..src.len()].copy_from_slice(src);
        }
        stack.push_leaf(sha256(&chunk));
    }
    let root = stack
        .root()
        .ok_or_else(|| PieceError::InvalidCommitment("empty merkle tree".into()))?;
    commitment_cid(root)
}

/// Streaming variant of [`commitment_from_bytes`] for staged piece files.
pub async fn commitment_from_reader(
    mut reader: impl AsyncRead + Unpin,
    size: PaddedPieceSize,
) -> Result<Cid, PieceError> {
    size.validate().map_err(|e| PieceError::InvalidSize(size.0, e))?;

    let mut stack = MerkleStack::new();
    let mut remaining = size.0;
    let mut seen: u64 = 0;
    let mut chunk = [0u8; NODE_SIZE];
    while remaining > 0 {
        chunk.fill(0);
        let mut filled = 0usize;
        while filled < NODE_SIZE {
            let n = reader.read(&mut chunk[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        seen += filled as u64;
        stack.push_leaf(sha256(&chunk));
        remaining -= NODE_SIZE as u64;
        if filled < NODE_SIZE {
            break;
        }
    }
    // Anything still on the wire past the declared size is a protocol
    // violation, not padding.
    if reader.read(&mut chunk).await? != 0 || seen > size.0 {
        return Err(PieceError::Oversized {
            actual: seen + 1,
            declared: size.0,
        });
    }
    // Remaining leaves are all-zero padding.
    while remaining > 0 {
        stack.push_leaf(sha256(&[0u8; NODE_SIZE]));
        remaining -= NODE_SIZE as u64;
    }
    let root = stack
        .root()
        .ok_or_else(|| PieceError::InvalidCommitment("empty merkle tree".into()))?;
    commitment_cid(root)
}

/// Commitment of a staged piece file, zero-padded to `size`.
pub async fn commitment_from_file(
    path: &std::path::Path,
    size: PaddedPieceSize,
) -> Result<Cid, PieceError> {
    let file = File::open(path).await?;
    commitment_from_reader(BufReader::new(file), size).await
}

/// Commitment of `size` bytes of zeros; the filler-piece commitment.
pub fn zero_piece_commitment(size: PaddedPieceSize) -> Result<Cid, PieceError> {
    size.validate().map_err(|e| PieceError::InvalidSize(size.0, e))?;
    let mut node = sha256(&[0u8; NODE_SIZE]);
    let mut width = size.0 / NODE_SIZE as u64;
    while width > 1 {
        node = combine(&node, &node);
        width /= 2;
    }
    commitment_cid(node)
}

/// Checks that a proposal's piece CID carries the commitment scheme this
/// engine produces.
pub fn validate_piece_cid(cid: &Cid) -> Result<(), PieceError> {
    if cid.version() != cid::Version::V1 {
        return Err(PieceError::InvalidCommitment("expected CIDv1".into()));
    }
    if cid.codec() != FIL_COMMITMENT_UNSEALED {
        return Err(PieceError::InvalidCommitment(format!(
            "unexpected codec {:#x}",
            cid.codec()
        )));
    }
    let hash = cid.hash();
    if hash.code() != SHA2_256_CODE || usize::from(hash.size()) != NODE_SIZE {
        return Err(PieceError::InvalidCommitment(
            "unexpected multihash in piece commitment".into(),
        ));
    }
    Ok(())
}
