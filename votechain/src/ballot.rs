use crate::*;
use uuid::Uuid;

/// An encrypted, ring-signed, authorized ballot.
///
/// The choice only ever exists as a Paillier ciphertext.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Ballot {
    pub id: Uuid,

    pub election_id: Uuid,

    /// E(B^position)
    pub encrypted_choice: Ciphertext,

    /// Blind-signed authorization over (election, key image)
    pub authorization: BlindSignature,

    /// Milliseconds since the unix epoch, as claimed by the voter
    pub timestamp: u64,

    /// Signature over everything above
    pub signature: BallotSignature,
}

// The part of a ballot covered by its signature
#[derive(Serialize)]
struct BallotContent<'a> {
    id: Uuid,
    election_id: Uuid,
    encrypted_choice: &'a Ciphertext,
    authorization: &'a BlindSignature,
    timestamp: u64,
}

impl Ballot {
    /// Encrypt a vote for the candidate at `position` and ring-sign it.
    pub fn new(
        election: &ElectionParams,
        voter: &VoterKeyPair,
        position: usize,
        ring: &[VoterPublicKey],
        authorization: BlindSignature,
    ) -> Result<Self, Error> {
        let (id, timestamp, encrypted_choice) = Self::encrypt_choice(election, position)?;
        let message = signing_message(
            id,
            election.id,
            &encrypted_choice,
            &authorization,
            timestamp,
        )?;
        let signature = voter.sign_ring(election.id, &message, ring)?;

        Ok(Ballot {
            id,
            election_id: election.id,
            encrypted_choice,
            authorization,
            timestamp,
            signature: BallotSignature::Ring(signature),
        })
    }

    /// Like `new`, but signed without anonymity. `audit_reason` is published with the ballot.
    pub fn new_degraded(
        election: &ElectionParams,
        voter: &VoterKeyPair,
        position: usize,
        authorization: BlindSignature,
        audit_reason: &str,
    ) -> Result<Self, Error> {
        let (id, timestamp, encrypted_choice) = Self::encrypt_choice(election, position)?;
        let message = signing_message(
            id,
            election.id,
            &encrypted_choice,
            &authorization,
            timestamp,
        )?;
        let signature = voter.sign_degraded(election.id, &message, audit_reason)?;

        Ok(Ballot {
            id,
            election_id: election.id,
            encrypted_choice,
            authorization,
            timestamp,
            signature: BallotSignature::Degraded(signature),
        })
    }

    fn encrypt_choice(
        election: &ElectionParams,
        position: usize,
    ) -> Result<(Uuid, u64, Ciphertext), Error> {
        let plaintext = election.encoding()?.encode_vote(position)?;
        let encrypted_choice = election.encryption_key.encrypt(&plaintext)?;
        Ok((Uuid::new_v4(), now_millis(), encrypted_choice))
    }

    pub fn key_image(&self) -> KeyImage {
        self.signature.key_image()
    }

    /// Hex SHA-256 of the ballot's canonical (CBOR) form
    pub fn hash(&self) -> Result<String, Error> {
        Ok(sha256_hex(&serde_cbor::to_vec(self)?))
    }

    /// The bytes the ballot signature covers
    pub fn signing_message(&self) -> Result<Vec<u8>, Error> {
        signing_message(
            self.id,
            self.election_id,
            &self.encrypted_choice,
            &self.authorization,
            self.timestamp,
        )
    }

    /// Check everything about a ballot that does not depend on the ledger.
    ///
    /// Whether the key image has been used before is up to the caller.
    pub fn validate(
        &self,
        election: &ElectionParams,
        voters: &VoterRegistry,
    ) -> Result<(), ValidationError> {
        if self.election_id != election.id {
            return Err(ValidationError::ElectionMismatch);
        }

        if !election
            .encryption_key
            .is_valid_ciphertext(&self.encrypted_choice)
        {
            return Err(ValidationError::CiphertextOutOfRange);
        }

        let message = self
            .signing_message()
            .map_err(|_| ValidationError::SignatureInvalid)?;

        match &self.signature {
            BallotSignature::Ring(sig) => {
                let mut registered = 0;
                for member in &sig.ring {
                    if voters.contains_key(member) {
                        registered += 1;
                    } else if !is_synthetic_decoy(election.id, member, sig.ring.len()) {
                        return Err(ValidationError::RingMemberUnknown);
                    }
                }
                // a ring that hides nobody must come in as an audited degraded signature
                if registered < MIN_ANONYMOUS_RING {
                    return Err(ValidationError::DegradedSignatureNotAllowed);
                }
                sig.verify(election.id, &message)?;
            }
            BallotSignature::Degraded(degraded) => {
                if !election.allow_degraded_signatures {
                    return Err(ValidationError::DegradedSignatureNotAllowed);
                }
                match degraded.signer() {
                    Some(signer) if voters.contains_key(signer) => {}
                    _ => return Err(ValidationError::RingMemberUnknown),
                }
                degraded.verify(election.id, &message)?;
                log::warn!(
                    "accepting degraded (non-anonymous) ballot {} in election {}: {}",
                    self.id,
                    election.id,
                    degraded.audit_reason
                );
            }
        }

        election.authorization_key.verify_authorization(
            election.id,
            &self.key_image(),
            &self.authorization,
        )
    }
}

fn signing_message(
    id: Uuid,
    election_id: Uuid,
    encrypted_choice: &Ciphertext,
    authorization: &BlindSignature,
    timestamp: u64,
) -> Result<Vec<u8>, Error> {
    let content = BallotContent {
        id,
        election_id,
        encrypted_choice,
        authorization,
        timestamp,
    };
    Ok(serde_cbor::to_vec(&content)?)
}
