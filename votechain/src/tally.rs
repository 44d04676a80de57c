use crate::*;
use indexmap::IndexMap;
use num_bigint_dig::BigUint;
use uuid::Uuid;

/// Running homomorphic sum of an election's ballots
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EncryptedTally {
    pub election_id: Uuid,

    /// Product of every added ciphertext mod n²
    pub sum: Ciphertext,

    /// Number of ballots in `sum`
    pub ballots: u64,
}

/// Decrypted per-candidate counts
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TallyResult {
    pub election_id: Uuid,

    pub ballots: u64,

    /// Candidate -> count, in ballot order
    pub counts: IndexMap<String, u64>,
}

impl TallyResult {
    /// Counts in ballot order
    pub fn counts(&self) -> Vec<u64> {
        self.counts.values().copied().collect()
    }
}

impl EncryptedTally {
    /// An empty tally, E(0)
    pub fn new(election: &ElectionParams) -> Self {
        EncryptedTally {
            election_id: election.id,
            sum: election.encryption_key.encrypted_zero(),
            ballots: 0,
        }
    }

    /// Sum the ciphertexts of every ballot for the election
    pub fn from_ballots(election: &ElectionParams, ballots: &[Ballot]) -> Result<Self, Error> {
        let mut tally = EncryptedTally::new(election);
        for ballot in ballots {
            tally.add(election, ballot)?;
        }
        Ok(tally)
    }

    pub fn add(&mut self, election: &ElectionParams, ballot: &Ballot) -> Result<(), Error> {
        if ballot.election_id != self.election_id || election.id != self.election_id {
            return Err(ValidationError::ElectionMismatch.into());
        }
        self.sum = election
            .encryption_key
            .add_encrypted(&self.sum, &ballot.encrypted_choice);
        self.ballots += 1;
        Ok(())
    }

    /// Decrypt with the whole private key. A tally is finalized once.
    pub fn finalize(
        self,
        election: &ElectionParams,
        private_key: &PaillierPrivateKey,
    ) -> Result<TallyResult, Error> {
        let sum = private_key.decrypt(&self.sum)?;
        self.decode(election, &sum)
    }

    /// Combine partial decryptions of `sum` from at least `threshold` share holders
    pub fn finalize_threshold(
        self,
        election: &ElectionParams,
        key: &ThresholdKey,
        partials: &[PartialDecryption],
    ) -> Result<TallyResult, Error> {
        if key.public_key != election.encryption_key {
            return Err(Error::CryptoParameter(
                "threshold key does not match the election key",
            ));
        }
        let sum = key.combine_partial_decryptions(partials)?;
        self.decode(election, &sum)
    }

    fn decode(&self, election: &ElectionParams, sum: &BigUint) -> Result<TallyResult, Error> {
        let counts = match election.encoding()?.decode_checked(sum, self.ballots) {
            Ok(counts) => counts,
            Err(e) => {
                log::error!(
                    "tally of election {} failed to decode {} ballots: {}",
                    self.election_id,
                    self.ballots,
                    e
                );
                return Err(e);
            }
        };

        Ok(TallyResult {
            election_id: self.election_id,
            ballots: self.ballots,
            counts: election
                .candidates
                .iter()
                .cloned()
                .zip(counts.into_iter())
                .collect(),
        })
    }
}
