use crate::*;
use num_bigint_dig::BigUint;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

/// Issues blind authorizations to eligible voters.
///
/// Each registered voter identity gets at most one authorization per election.
pub struct Authenticator {
    pub id: Uuid,
    key: BlindSigningKey,
    issued: Mutex<HashSet<(String, Uuid)>>,
}

impl Authenticator {
    /// Create an authenticator with a fresh RSA key of `bits` bits
    pub fn new(bits: usize) -> Result<Self, Error> {
        Ok(Self::from_key(BlindSigningKey::generate(bits)?))
    }

    pub fn from_key(key: BlindSigningKey) -> Self {
        Authenticator {
            id: Uuid::new_v4(),
            key,
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn public_key(&self) -> BlindPublicKey {
        self.key.public_key()
    }

    /// Blind-sign `blinded` on behalf of `voter_identity`.
    ///
    /// The voter's out-of-band authentication is assumed to have happened already.
    pub fn authorize(
        &self,
        voters: &VoterRegistry,
        voter_identity: &str,
        election_id: Uuid,
        blinded: &BigUint,
    ) -> Result<BlindSignature, Error> {
        if !voters.contains_identity(voter_identity) {
            return Err(Error::UnknownVoter(voter_identity.to_string()));
        }

        let mut issued = self
            .issued
            .lock()
            .map_err(|_| Error::Blinding("authorization registry poisoned"))?;

        let entry = (voter_identity.to_string(), election_id);
        if issued.contains(&entry) {
            return Err(Error::AlreadyAuthorized(voter_identity.to_string()));
        }

        let signature = self.key.sign_blinded(blinded)?;
        issued.insert(entry);

        log::info!("issued blind authorization for election {}", election_id);
        Ok(signature)
    }
}

// What an authorization certifies: the right to cast one ballot with this key image
#[derive(Serialize)]
struct AuthorizationToken<'a> {
    election_id: Uuid,
    key_image: &'a KeyImage,
}

/// Voter-side state for obtaining an authorization
pub struct AuthorizationRequest {
    pub election_id: Uuid,
    pub key_image: KeyImage,

    /// The value to hand to the authenticator
    pub blinded: BigUint,

    factor: BlindingFactor,
}

impl AuthorizationRequest {
    pub fn new(
        public_key: &BlindPublicKey,
        election_id: Uuid,
        key_image: KeyImage,
    ) -> Result<Self, Error> {
        let factor = public_key.generate_blinding_factor()?;
        let message = authorization_message(election_id, &key_image)?;
        let blinded = public_key.blind(&message, &factor)?;

        Ok(AuthorizationRequest {
            election_id,
            key_image,
            blinded,
            factor,
        })
    }

    /// Unblind the authenticator's response and check it before it goes into a ballot
    pub fn finalize(
        self,
        public_key: &BlindPublicKey,
        blind_signature: &BlindSignature,
    ) -> Result<BlindSignature, Error> {
        let signature = public_key.unblind(blind_signature, &self.factor);
        public_key.verify_authorization(self.election_id, &self.key_image, &signature)?;
        Ok(signature)
    }
}

impl BlindPublicKey {
    /// Check that `signature` authorizes a ballot with `key_image` in the election
    pub fn verify_authorization(
        &self,
        election_id: Uuid,
        key_image: &KeyImage,
        signature: &BlindSignature,
    ) -> Result<(), ValidationError> {
        let message = authorization_message(election_id, key_image)
            .map_err(|_| ValidationError::AuthorizationInvalid)?;
        self.verify(&message, signature)
    }
}

fn authorization_message(election_id: Uuid, key_image: &KeyImage) -> Result<Vec<u8>, Error> {
    let token = AuthorizationToken {
        election_id,
        key_image,
    };
    Ok(serde_cbor::to_vec(&token)?)
}
