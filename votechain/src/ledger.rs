use crate::*;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// A node's copy of the chain, kept in step with its block store.
///
/// Every mutation goes through the write lock, so appends and chain replacement are serialized.
/// Mining happens outside the lock.
pub struct Ledger {
    chain: RwLock<Chain>,
    store: Arc<dyn BlockStore>,
    authorities: AuthoritySet,
    authority: Option<AuthorityKeyPair>,
    difficulty: usize,
}

impl Ledger {
    /// Load the chain from `store`, seeding it with the genesis block if it is empty
    pub fn new(
        store: Arc<dyn BlockStore>,
        authorities: AuthoritySet,
        authority: Option<AuthorityKeyPair>,
        difficulty: usize,
    ) -> Result<Self, Error> {
        if difficulty > MAX_DIFFICULTY {
            return Err(Error::CryptoParameter("difficulty exceeds the block hash length"));
        }

        let mut blocks = store.get_all()?;
        if blocks.is_empty() {
            let genesis = Block::genesis();
            store.insert(&genesis)?;
            blocks.push(genesis);
        }

        let chain = Chain::from_blocks(blocks, &authorities, difficulty)?;
        log::info!("loaded chain of {} blocks, head {}", chain.len(), chain.head().hash);

        Ok(Ledger {
            chain: RwLock::new(chain),
            store,
            authorities,
            authority,
            difficulty,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<Chain>, Error> {
        self.chain
            .read()
            .map_err(|_| Error::Store("ledger lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<Chain>, Error> {
        self.chain
            .write()
            .map_err(|_| Error::Store("ledger lock poisoned".to_string()))
    }

    pub fn authorities(&self) -> &AuthoritySet {
        &self.authorities
    }

    pub fn authority(&self) -> Option<&AuthorityKeyPair> {
        self.authority.as_ref()
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Build, mine and sign a block on top of the current head
    pub fn propose_block(&self, data: &BlockData) -> Result<Block, Error> {
        let mut block = self.prepare_block(data)?;
        block.mine_block(self.difficulty)?;
        self.sign_block(&mut block)?;
        Ok(block)
    }

    /// An unmined, unsigned block on top of the current head
    pub fn prepare_block(&self, data: &BlockData) -> Result<Block, Error> {
        if self.authority.is_none() {
            return Err(Error::NotAnAuthority);
        }
        let head = self.latest_block()?;
        Block::new(&head.hash, data)
    }

    /// Sign a mined block with our authority key
    pub fn sign_block(&self, block: &mut Block) -> Result<(), Error> {
        let authority = self.authority.as_ref().ok_or(Error::NotAnAuthority)?;
        block.sign(authority);
        Ok(())
    }

    /// Validate `block` against the head, persist it and append it
    pub fn append(&self, block: Block) -> Result<(), Error> {
        let mut chain = self.write()?;
        let data = chain.validate_next(&block, &self.authorities, self.difficulty)?;
        self.store.insert(&block)?;
        log::info!("appended block {} at height {}", block.hash, chain.len());
        chain.commit(block, &data);
        Ok(())
    }

    /// Append a block received from a peer. Returns false if we already have it.
    pub fn receive(&self, block: Block) -> Result<bool, Error> {
        let hash = block.hash.clone();
        if self.contains(&hash) {
            return Ok(false);
        }
        match self.append(block) {
            Ok(()) => Ok(true),
            // raced with another delivery of the same block
            Err(Error::ChainIntegrity(ChainIntegrityError::LinkMismatch(_)))
                if self.contains(&hash) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.read().map(|chain| chain.contains(hash)).unwrap_or(false)
    }

    /// Sign `block` if it carries no signature and we are an authority
    pub fn countersign(&self, block: &mut Block) -> bool {
        match &self.authority {
            Some(authority) if !block.is_signed() => {
                block.sign(authority);
                true
            }
            _ => false,
        }
    }

    /// Our endorsement of a block, if we are an authority
    pub fn endorse(&self, block_hash: &str) -> Option<Endorsement> {
        self.authority
            .as_ref()
            .map(|authority| Endorsement::new(authority, block_hash))
    }

    pub fn latest_block(&self) -> Result<Block, Error> {
        Ok(self.read()?.head().clone())
    }

    /// Blocks from height `start` onward
    pub fn chain_from(&self, start: usize) -> Result<Vec<Block>, Error> {
        Ok(self.read()?.blocks_from(start))
    }

    pub fn len(&self) -> usize {
        self.read().map(|chain| chain.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_chain_valid(&self) -> bool {
        self.read()
            .map(|chain| chain.is_chain_valid(&self.authorities, self.difficulty))
            .unwrap_or(false)
    }

    /// Longest-chain rule: adopt `blocks` only if the chain is strictly longer than ours and valid
    /// on its own.
    ///
    /// Returns `None` if we kept our chain, otherwise the ballots from our abandoned blocks that
    /// the adopted chain does not contain.
    pub fn replace_chain(&self, blocks: Vec<Block>) -> Result<Option<Vec<Ballot>>, Error> {
        if blocks.len() <= self.len() {
            return Ok(None);
        }
        let candidate = Chain::from_blocks(blocks, &self.authorities, self.difficulty)?;

        let mut chain = self.write()?;
        if candidate.len() <= chain.len() {
            return Ok(None);
        }

        self.store.replace_all(candidate.blocks())?;
        let orphaned = chain.orphaned_ballots(&candidate);
        log::info!(
            "adopted chain of {} blocks (was {}), head {}",
            candidate.len(),
            chain.len(),
            candidate.head().hash
        );
        *chain = candidate;
        Ok(Some(orphaned))
    }

    pub fn is_key_image_used(&self, election_id: Uuid, key_image: &KeyImage) -> Result<bool, Error> {
        Ok(self.read()?.is_key_image_used(election_id, key_image))
    }

    pub fn election_ballots(&self, election_id: Uuid) -> Result<Vec<Ballot>, Error> {
        Ok(self.read()?.election_ballots(election_id))
    }
}
