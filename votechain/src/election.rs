use crate::*;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Ring size used when an election does not specify one
pub const DEFAULT_RING_SIZE: usize = 5;

/// Everything a node needs to know to accept and count ballots for an election
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ElectionParams {
    pub id: Uuid,

    pub name: String,

    /// Candidates in ballot order. A vote for position p is encoded as B^p.
    pub candidates: Vec<String>,

    /// Upper bound on the number of ballots; sizes the vote encoding
    pub max_voters: u64,

    /// Paillier key ballots are encrypted under
    pub encryption_key: PaillierPublicKey,

    /// Key of the authenticator that blind-signs ballot authorizations
    pub authorization_key: BlindPublicKey,

    /// Number of keys in each ballot's ring, signer included
    pub ring_size: usize,

    /// Accept audited, non-anonymous signatures
    #[serde(default)]
    pub allow_degraded_signatures: bool,
}

impl ElectionParams {
    /// Create election parameters, checking that the encoding fits the encryption key
    pub fn new(
        name: &str,
        candidates: Vec<String>,
        max_voters: u64,
        encryption_key: PaillierPublicKey,
        authorization_key: BlindPublicKey,
    ) -> Result<Self, Error> {
        let params = ElectionParams {
            id: Uuid::new_v4(),
            name: name.to_string(),
            candidates,
            max_voters,
            encryption_key,
            authorization_key,
            ring_size: DEFAULT_RING_SIZE,
            allow_degraded_signatures: false,
        };

        params.encoding()?;
        Ok(params)
    }

    pub fn encoding(&self) -> Result<VoteEncoding, Error> {
        VoteEncoding::new(self.max_voters, self.candidates.len(), &self.encryption_key)
    }

    /// Position of a candidate on the ballot
    pub fn candidate_position(&self, candidate: &str) -> Option<usize> {
        self.candidates.iter().position(|c| c == candidate)
    }
}

/// Registered voters: identity -> ring-signing public key
#[derive(Default)]
pub struct VoterRegistry {
    voters: RwLock<IndexMap<String, VoterPublicKey>>,
}

impl VoterRegistry {
    /// Register (or re-key) a voter
    pub fn register(&self, identity: &str, public_key: VoterPublicKey) -> Result<(), Error> {
        self.voters
            .write()
            .map_err(|_| Error::Store("voter registry lock poisoned".to_string()))?
            .insert(identity.to_string(), public_key);
        Ok(())
    }

    pub fn public_key(&self, identity: &str) -> Option<VoterPublicKey> {
        self.voters
            .read()
            .ok()
            .and_then(|voters| voters.get(identity).copied())
    }

    pub fn contains_identity(&self, identity: &str) -> bool {
        self.public_key(identity).is_some()
    }

    pub fn contains_key(&self, public_key: &VoterPublicKey) -> bool {
        self.voters
            .read()
            .map(|voters| voters.values().any(|key| key == public_key))
            .unwrap_or(false)
    }

    /// All registered keys, in registration order
    pub fn public_keys(&self) -> Vec<VoterPublicKey> {
        self.voters
            .read()
            .map(|voters| voters.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.voters.read().map(|voters| voters.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Election lookup by id, each election with its own voter roll
#[derive(Default)]
pub struct ElectionDirectory {
    elections: RwLock<HashMap<Uuid, (ElectionParams, Arc<VoterRegistry>)>>,
}

impl ElectionDirectory {
    /// Add an election with an empty voter roll. Re-adding an election keeps its voters.
    pub fn insert(&self, election: ElectionParams) -> Result<(), Error> {
        let mut elections = self
            .elections
            .write()
            .map_err(|_| Error::Store("election directory lock poisoned".to_string()))?;
        let voters = elections
            .get(&election.id)
            .map(|(_, voters)| voters.clone())
            .unwrap_or_default();
        elections.insert(election.id, (election, voters));
        Ok(())
    }

    pub fn get(&self, election_id: Uuid) -> Result<ElectionParams, Error> {
        self.elections
            .read()
            .ok()
            .and_then(|elections| elections.get(&election_id).map(|(params, _)| params.clone()))
            .ok_or(Error::UnknownElection(election_id))
    }

    /// The voters registered for an election
    pub fn voters(&self, election_id: Uuid) -> Result<Arc<VoterRegistry>, Error> {
        self.elections
            .read()
            .ok()
            .and_then(|elections| elections.get(&election_id).map(|(_, voters)| voters.clone()))
            .ok_or(Error::UnknownElection(election_id))
    }

    pub fn register_voter(
        &self,
        election_id: Uuid,
        identity: &str,
        public_key: VoterPublicKey,
    ) -> Result<(), Error> {
        self.voters(election_id)?.register(identity, public_key)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.elections
            .read()
            .map(|elections| elections.keys().copied().collect())
            .unwrap_or_default()
    }
}
