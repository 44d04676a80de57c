use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("votechain: key generation failed after {0} attempts")]
    KeyGeneration(usize),

    #[error("votechain: invalid cryptographic parameter: {0}")]
    CryptoParameter(&'static str),

    #[error("votechain: could not find a usable blinding factor after {0} attempts")]
    BlindingFactor(usize),

    #[error("votechain: blinding failed: {0}")]
    Blinding(&'static str),

    #[error("votechain: tally does not fit the vote encoding (digit overflow)")]
    DecodeOverflow,

    #[error("votechain: quorum of {required} signatures not reached (got {collected})")]
    ConsensusTimeout { required: usize, collected: usize },

    #[error("votechain: peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("votechain: peer {peer} rejected the request with status {status}")]
    PeerRejected { peer: String, status: u16 },

    #[error("votechain: HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("votechain: chain integrity error: {0}")]
    ChainIntegrity(#[from] ChainIntegrityError),

    #[error("votechain: ballot rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("votechain: unknown election {0}")]
    UnknownElection(uuid::Uuid),

    #[error("votechain: no tally key installed for election {0}")]
    NoTallyKey(uuid::Uuid),

    #[error("votechain: election {0} has already been tallied")]
    TallyFinalized(uuid::Uuid),

    #[error("votechain: not enough key shares: need {0}, found {1}")]
    NotEnoughShares(usize, usize),

    #[error("votechain: no other registered voter to hide among; only a degraded signature is possible")]
    RingTooSmall,

    #[error("votechain: voter {0} is not registered")]
    UnknownVoter(String),

    #[error("votechain: voter {0} has already been authorized for this election")]
    AlreadyAuthorized(String),

    #[error("votechain: block store error: {0}")]
    Store(String),

    #[error("votechain: this node holds no authority key")]
    NotAnAuthority,

    #[error("votechain: no reachable authority peer to forward to")]
    NoAuthorityPeer,

    #[error("votechain: mining task failed: {0}")]
    Mining(#[from] tokio::task::JoinError),

    #[error("votechain: CBOR error: {0}")]
    CBOR(#[from] serde_cbor::Error),

    #[error("votechain: JSON error: {0}")]
    JSON(#[from] serde_json::Error),

    #[error("votechain: error deserializing transaction: unknown format")]
    DeserializationUnknownFormat,

    #[error("votechain: RSA error: {0}")]
    RSAError(#[from] rsa::errors::Error),

    #[error("votechain: full-domain hash error: {0}")]
    FDH(#[from] rsa_fdh::Error),

    #[error("votechain: signature error: {0}")]
    SignatureError(#[from] ed25519_dalek::SignatureError),
}

/// Ballot admission errors
///
/// These are terminal for the ballot. `public_reason` is what a voter gets to see.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("ring signature invalid")]
    SignatureInvalid,

    #[error("double vote detected: key image already used in this election")]
    DoubleVoteDetected,

    #[error("blind authorization invalid")]
    AuthorizationInvalid,

    #[error("ballot election mismatch")]
    ElectionMismatch,

    #[error("ring contains a key that is neither a registered voter nor an election decoy")]
    RingMemberUnknown,

    #[error("degraded (non-anonymous) signature not accepted for this election")]
    DegradedSignatureNotAllowed,

    #[error("ciphertext outside of Z*_n^2")]
    CiphertextOutOfRange,
}

impl ValidationError {
    /// Coarse reason that is safe to show to the submitter.
    pub fn public_reason(&self) -> &'static str {
        match self {
            ValidationError::DoubleVoteDetected => "ballot already cast",
            ValidationError::ElectionMismatch | ValidationError::CiphertextOutOfRange => {
                "malformed ballot"
            }
            _ => "ballot credentials rejected",
        }
    }

    /// Reverse of `public_reason`, for rejections relayed from another node
    pub fn from_public_reason(reason: &str) -> Option<Self> {
        match reason {
            "ballot already cast" => Some(ValidationError::DoubleVoteDetected),
            "malformed ballot" => Some(ValidationError::CiphertextOutOfRange),
            "ballot credentials rejected" => Some(ValidationError::SignatureInvalid),
            _ => None,
        }
    }
}

/// Reasons a block or chain fails validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainIntegrityError {
    #[error("block {0}: stored hash does not match its contents")]
    HashMismatch(usize),

    #[error("block {0}: previous hash does not link to the chain head")]
    LinkMismatch(usize),

    #[error("genesis block is not the canonical genesis")]
    InvalidGenesis,

    #[error("block {0}: missing authority signature")]
    MissingSignature(usize),

    #[error("block {0}: validator is not a known authority")]
    UnknownValidator(usize),

    #[error("block {0}: authority signature does not verify")]
    BadSignature(usize),

    #[error("block {0}: hash does not meet the required difficulty")]
    InsufficientWork(usize),

    #[error("block {0}: payload is not a valid block payload")]
    BadPayload(usize),

    #[error("block {0}: key image already used in this election")]
    DuplicateKeyImage(usize),
}

impl Error {
    /// Message for the submitter of a ballot.
    ///
    /// Validation failures are collapsed to a coarse reason, anything else is reported as an
    /// internal error.
    pub fn public_reason(&self) -> &'static str {
        match self {
            Error::Validation(e) => e.public_reason(),
            Error::UnknownElection(_) => "unknown election",
            Error::CryptoParameter(_) => "malformed ballot",
            Error::CBOR(_) | Error::JSON(_) | Error::DeserializationUnknownFormat => {
                "malformed request"
            }
            Error::NoAuthorityPeer | Error::PeerUnreachable(_) => "no authority reachable",
            Error::PeerRejected { status, .. } if (400..500).contains(status) => {
                "request rejected by authority"
            }
            _ => "internal error",
        }
    }
}
