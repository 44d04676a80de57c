use crate::*;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// An ordered, hash-linked sequence of blocks starting at the genesis block.
///
/// Keeps an index of the key images published per election so double votes can be found without
/// walking the chain.
#[derive(Clone, Debug)]
pub struct Chain {
    blocks: Vec<Block>,
    key_images: HashMap<Uuid, HashSet<KeyImage>>,
}

impl Default for Chain {
    fn default() -> Self {
        Chain {
            blocks: vec![Block::genesis()],
            key_images: HashMap::new(),
        }
    }
}

impl Chain {
    /// A fresh chain holding only the genesis block
    pub fn new() -> Self {
        Chain::default()
    }

    /// Build a chain from stored blocks, validating all of them
    pub fn from_blocks(
        blocks: Vec<Block>,
        authorities: &AuthoritySet,
        difficulty: usize,
    ) -> Result<Self, ChainIntegrityError> {
        Self::validate_blocks(&blocks, authorities, difficulty)?;
        let mut chain = Chain {
            blocks,
            key_images: HashMap::new(),
        };
        chain.rebuild_index();
        Ok(chain)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn head(&self) -> &Block {
        // never empty: every constructor starts at genesis
        &self.blocks[self.blocks.len() - 1]
    }

    /// Blocks from `start` onward
    pub fn blocks_from(&self, start: usize) -> Vec<Block> {
        self.blocks.iter().skip(start).cloned().collect()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blocks.iter().any(|block| block.hash == hash)
    }

    /// Whether the key image already has a ballot on chain for the election
    pub fn is_key_image_used(&self, election_id: Uuid, key_image: &KeyImage) -> bool {
        self.key_images
            .get(&election_id)
            .map(|images| images.contains(key_image))
            .unwrap_or(false)
    }

    /// Every ballot published for the election, in chain order
    pub fn election_ballots(&self, election_id: Uuid) -> Vec<Ballot> {
        self.blocks
            .iter()
            .skip(1)
            .filter_map(|block| block.payload().ok())
            .flat_map(|data| match data {
                BlockData::Ballots { ballots } => ballots,
                BlockData::Genesis { .. } => vec![],
            })
            .filter(|ballot| ballot.election_id == election_id)
            .collect()
    }

    /// Check that `block` may be appended to this chain
    pub fn validate_next(
        &self,
        block: &Block,
        authorities: &AuthoritySet,
        difficulty: usize,
    ) -> Result<BlockData, ChainIntegrityError> {
        let index = self.blocks.len();
        if block.previous_hash != self.head().hash {
            return Err(ChainIntegrityError::LinkMismatch(index));
        }
        block.verify(index, authorities, difficulty)?;

        let data = block
            .payload()
            .map_err(|_| ChainIntegrityError::BadPayload(index))?;
        Chain::check_key_images(index, &data, &self.key_images)?;
        Ok(data)
    }

    /// Append a block after validating it against the head
    pub fn append(
        &mut self,
        block: Block,
        authorities: &AuthoritySet,
        difficulty: usize,
    ) -> Result<(), ChainIntegrityError> {
        let data = self.validate_next(&block, authorities, difficulty)?;
        self.commit(block, &data);
        Ok(())
    }

    /// Push a block that `validate_next` has already accepted
    pub(crate) fn commit(&mut self, block: Block, data: &BlockData) {
        self.index_ballots(data);
        self.blocks.push(block);
    }

    /// Ballots in our blocks that `other` lacks and whose key images it has not published.
    ///
    /// Used to recover ballots from blocks that lose a fork.
    pub(crate) fn orphaned_ballots(&self, other: &Chain) -> Vec<Ballot> {
        self.blocks
            .iter()
            .skip(1)
            .filter(|block| !other.contains(&block.hash))
            .filter_map(|block| block.payload().ok())
            .flat_map(|data| match data {
                BlockData::Ballots { ballots } => ballots,
                BlockData::Genesis { .. } => vec![],
            })
            .filter(|ballot| !other.is_key_image_used(ballot.election_id, &ballot.key_image()))
            .collect()
    }

    /// O(n) walk checking hash, linkage, signatures and key-image uniqueness
    pub fn is_chain_valid(&self, authorities: &AuthoritySet, difficulty: usize) -> bool {
        Self::validate_blocks(&self.blocks, authorities, difficulty).is_ok()
    }

    /// Validate a candidate chain from genesis
    pub fn validate_blocks(
        blocks: &[Block],
        authorities: &AuthoritySet,
        difficulty: usize,
    ) -> Result<(), ChainIntegrityError> {
        match blocks.first() {
            Some(genesis) if *genesis == Block::genesis() => {}
            _ => return Err(ChainIntegrityError::InvalidGenesis),
        }

        let mut seen: HashMap<Uuid, HashSet<KeyImage>> = HashMap::new();
        for (index, pair) in blocks.windows(2).enumerate() {
            let index = index + 1;
            let (previous, block) = (&pair[0], &pair[1]);

            if block.previous_hash != previous.hash {
                return Err(ChainIntegrityError::LinkMismatch(index));
            }
            block.verify(index, authorities, difficulty)?;

            let data = block
                .payload()
                .map_err(|_| ChainIntegrityError::BadPayload(index))?;
            Chain::check_key_images(index, &data, &seen)?;
            for ballot in data.ballots() {
                seen.entry(ballot.election_id)
                    .or_default()
                    .insert(ballot.key_image());
            }
        }

        Ok(())
    }

    // A key image may appear once per election across `existing` and the block itself
    fn check_key_images(
        index: usize,
        data: &BlockData,
        existing: &HashMap<Uuid, HashSet<KeyImage>>,
    ) -> Result<(), ChainIntegrityError> {
        let mut in_block: HashSet<(Uuid, KeyImage)> = HashSet::new();
        for ballot in data.ballots() {
            let key_image = ballot.key_image();
            let used = existing
                .get(&ballot.election_id)
                .map(|images| images.contains(&key_image))
                .unwrap_or(false);
            if used || !in_block.insert((ballot.election_id, key_image)) {
                return Err(ChainIntegrityError::DuplicateKeyImage(index));
            }
        }
        Ok(())
    }

    fn index_ballots(&mut self, data: &BlockData) {
        for ballot in data.ballots() {
            self.key_images
                .entry(ballot.election_id)
                .or_default()
                .insert(ballot.key_image());
        }
    }

    fn rebuild_index(&mut self) {
        self.key_images.clear();
        let payloads: Vec<BlockData> = self
            .blocks
            .iter()
            .skip(1)
            .filter_map(|block| block.payload().ok())
            .collect();
        for data in &payloads {
            self.index_ballots(data);
        }
    }
}
