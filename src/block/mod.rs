//! Block creator (C2): pure stateful next-block production.

use sha2::{Digest, Sha256};

use crate::types::{Block, BlockHeader, Envelope};

/// Keeps `{previous_hash, previous_number}` and produces the next block in
/// the chain.
#[derive(Debug, Clone)]
pub struct BlockCreator {
    previous_hash: Vec<u8>,
    previous_number: u64,
}

impl BlockCreator {
    /// Initialize from the last block written to the ledger (or genesis
    /// defaults if there is none yet).
    pub fn from_previous(previous_header: Option<&BlockHeader>) -> Self {
        match previous_header {
            Some(h) => BlockCreator {
                previous_hash: hash_header(h),
                previous_number: h.number,
            },
            None => BlockCreator {
                previous_hash: Vec::new(),
                previous_number: 0,
            },
        }
    }

    /// Produce the next block from a batch of envelopes, advancing
    /// `previous_hash`/`previous_number` for the following call.
    pub fn create_next(&mut self, batch: Vec<Envelope>) -> Block {
        let header = BlockHeader {
            number: self.previous_number + 1,
            previous_hash: self.previous_hash.clone(),
            data_hash: hash_envelopes(&batch),
        };

        self.previous_hash = hash_header(&header);
        self.previous_number = header.number;

        Block {
            header,
            data: batch,
            metadata: Vec::new(),
        }
    }

    pub fn previous_number(&self) -> u64 {
        self.previous_number
    }
}

fn hash_header(header: &BlockHeader) -> Vec<u8> {
    let encoded = bincode::serialize(header).expect("BlockHeader encoding cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hasher.finalize().to_vec()
}

fn hash_envelopes(envelopes: &[Envelope]) -> Vec<u8> {
    let encoded = bincode::serialize(envelopes).expect("envelope encoding cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hasher.finalize().to_vec()
}
