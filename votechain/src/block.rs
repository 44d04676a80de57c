use crate::*;

/// Sentinel previous hash of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

const GENESIS_MESSAGE: &str = "votechain genesis";

/// A block hash has 64 hex digits, so no nonce can produce more leading zeros
pub const MAX_DIFFICULTY: usize = 64;

/// A sealed block.
///
/// `hash` covers timestamp, data, previous hash and nonce. The authority signature is made over
/// the hash and is therefore not part of it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub previous_hash: String,

    /// Milliseconds since the unix epoch
    pub timestamp: u64,

    /// JSON-encoded `BlockData`
    pub data: String,

    pub nonce: u64,

    pub hash: String,

    /// Hex ed25519 signature over `hash` by `validator_id`
    #[serde(default)]
    pub signature: Option<String>,

    #[serde(default)]
    pub validator_id: Option<String>,
}

impl Block {
    /// The canonical genesis block. Every node computes the same one.
    pub fn genesis() -> Self {
        // Serializing a fixed enum value cannot fail
        let data = BlockData::Genesis {
            message: GENESIS_MESSAGE.to_string(),
        }
        .to_json()
        .unwrap_or_default();

        let mut block = Block {
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            timestamp: 0,
            data,
            nonce: 0,
            hash: String::new(),
            signature: None,
            validator_id: None,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// An unsealed block on top of `previous_hash`
    pub fn new(previous_hash: &str, data: &BlockData) -> Result<Self, Error> {
        let mut block = Block {
            previous_hash: previous_hash.to_string(),
            timestamp: now_millis(),
            data: data.to_json()?,
            nonce: 0,
            hash: String::new(),
            signature: None,
            validator_id: None,
        };
        block.hash = block.calculate_hash();
        Ok(block)
    }

    /// H(timestamp ‖ data ‖ previous_hash ‖ nonce)
    pub fn calculate_hash(&self) -> String {
        let preimage = format!(
            "{}{}{}{}",
            self.timestamp, self.data, self.previous_hash, self.nonce
        );
        sha256_hex(preimage.as_bytes())
    }

    /// Whether the hash starts with `difficulty` hex zeros
    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        self.hash.len() >= difficulty && self.hash.bytes().take(difficulty).all(|b| b == b'0')
    }

    /// Search for a nonce that gives the hash `difficulty` leading hex zeros.
    ///
    /// This is spam resistance only, the authority signature is what makes a block valid.
    pub fn mine_block(&mut self, difficulty: usize) -> Result<(), Error> {
        if difficulty > MAX_DIFFICULTY {
            return Err(Error::CryptoParameter("difficulty exceeds the block hash length"));
        }
        self.hash = self.calculate_hash();
        while !self.meets_difficulty(difficulty) {
            self.nonce = self.nonce.wrapping_add(1);
            self.hash = self.calculate_hash();
        }
        log::debug!("mined block {} with nonce {}", self.hash, self.nonce);
        Ok(())
    }

    /// Sign the block hash. Mining afterwards would invalidate the signature.
    pub fn sign(&mut self, authority: &AuthorityKeyPair) {
        let signature = authority.sign(self.hash.as_bytes());
        self.signature = Some(hex::encode(signature.to_bytes()));
        self.validator_id = Some(authority.id.clone());
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some() && self.validator_id.is_some()
    }

    /// Check the block's own integrity: hash, authority signature and work.
    ///
    /// `index` only labels errors.
    pub fn verify(
        &self,
        index: usize,
        authorities: &AuthoritySet,
        difficulty: usize,
    ) -> Result<(), ChainIntegrityError> {
        if self.hash != self.calculate_hash() {
            return Err(ChainIntegrityError::HashMismatch(index));
        }

        let (signature, validator) = match (&self.signature, &self.validator_id) {
            (Some(signature), Some(validator)) => (signature, validator),
            _ => return Err(ChainIntegrityError::MissingSignature(index)),
        };
        if !authorities.contains(validator) {
            return Err(ChainIntegrityError::UnknownValidator(index));
        }
        if !authorities.verify(validator, self.hash.as_bytes(), signature) {
            return Err(ChainIntegrityError::BadSignature(index));
        }

        if !self.meets_difficulty(difficulty) {
            return Err(ChainIntegrityError::InsufficientWork(index));
        }

        Ok(())
    }

    pub fn payload(&self) -> Result<BlockData, Error> {
        BlockData::from_json(&self.data)
    }
}
