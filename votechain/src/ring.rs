//! Linkable ring signatures (LSAG) over Ristretto.
//!
//! A signature proves that its author holds the secret key of one of the ring members without
//! saying which. Each signature also carries a key image I = x·H_e, where H_e is a generator
//! derived from the election id. The same key always yields the same image within an election,
//! so a second ballot from the same voter is detectable while the voter stays anonymous.

use crate::*;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha512};
use std::collections::HashSet;
use uuid::Uuid;

const KEY_IMAGE_DOMAIN: &[u8] = b"votechain-key-image";
const DECOY_DOMAIN: &[u8] = b"votechain-decoy";
const CHALLENGE_DOMAIN: &[u8] = b"votechain-lsag";

/// Registered voters a ring needs before it hides anyone, the signer included
pub const MIN_ANONYMOUS_RING: usize = 2;

/// A voter's ring-signing public key
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoterPublicKey(#[serde(with = "RistrettoHex")] pub CompressedRistretto);

/// Linking tag of a ring signature, unique per (voter key, election)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KeyImage(#[serde(with = "RistrettoHex")] pub CompressedRistretto);

impl std::fmt::Display for KeyImage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0.as_bytes()))
    }
}

/// A voter's ring-signing keypair
#[derive(Clone)]
pub struct VoterKeyPair {
    secret: Scalar,
    pub public: VoterPublicKey,
}

impl std::fmt::Debug for VoterKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VoterKeyPair")
            .field("public", &self.public)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RingSignature {
    /// Challenge entering member 0
    #[serde(with = "ScalarHex")]
    pub c0: Scalar,

    /// One response per ring member
    #[serde(
        serialize_with = "ScalarHex::serialize_vec",
        deserialize_with = "ScalarHex::deserialize_vec"
    )]
    pub responses: Vec<Scalar>,

    pub key_image: KeyImage,

    /// The exact ring the signature verifies against
    pub ring: Vec<VoterPublicKey>,
}

/// A non-anonymous signature: a ring of one, plus the reason it was used.
///
/// Elections must opt in to accepting these, and every acceptance is logged.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DegradedSignature {
    pub signature: RingSignature,
    pub audit_reason: String,
}

/// How a ballot is signed
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BallotSignature {
    Ring(RingSignature),
    Degraded(DegradedSignature),
}

impl BallotSignature {
    pub fn key_image(&self) -> KeyImage {
        match self {
            BallotSignature::Ring(sig) => sig.key_image,
            BallotSignature::Degraded(degraded) => degraded.signature.key_image,
        }
    }

    pub fn ring(&self) -> &[VoterPublicKey] {
        match self {
            BallotSignature::Ring(sig) => &sig.ring,
            BallotSignature::Degraded(degraded) => &degraded.signature.ring,
        }
    }
}

impl VoterPublicKey {
    fn decompress(&self) -> Option<RistrettoPoint> {
        self.0.decompress()
    }
}

impl VoterKeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng {};
        Self::generate_with_rng(&mut rng)
    }

    pub fn generate_with_rng<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let secret = Scalar::random(rng);
        let public = VoterPublicKey((secret * RISTRETTO_BASEPOINT_POINT).compress());
        VoterKeyPair { secret, public }
    }

    /// Restore a keypair from its 32-byte secret scalar
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Result<Self, Error> {
        let secret = Scalar::from_canonical_bytes(bytes)
            .ok_or(Error::CryptoParameter("non-canonical voter secret key"))?;
        let public = VoterPublicKey((secret * RISTRETTO_BASEPOINT_POINT).compress());
        Ok(VoterKeyPair { secret, public })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// I = x·H_e
    pub fn key_image(&self, election_id: Uuid) -> KeyImage {
        KeyImage((self.secret * election_generator(election_id)).compress())
    }

    /// Build a ring of `size` keys around our own public key.
    ///
    /// Decoys are drawn at random from `voter_pool`; if it is too small the ring is padded with
    /// synthetic decoys for the election. Our key lands at a random position.
    ///
    /// Synthetic decoys hide nobody, so at least one other registered voter is required. Without
    /// one the only option left is an explicit `sign_degraded`.
    pub fn select_ring(
        &self,
        election_id: Uuid,
        voter_pool: &[VoterPublicKey],
        size: usize,
    ) -> Result<Vec<VoterPublicKey>, Error> {
        let mut rng = rand::rngs::OsRng {};

        let others: Vec<&VoterPublicKey> = voter_pool
            .iter()
            .filter(|key| **key != self.public)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if size < MIN_ANONYMOUS_RING || others.len() + 1 < MIN_ANONYMOUS_RING {
            return Err(Error::RingTooSmall);
        }

        let mut ring: Vec<VoterPublicKey> = others
            .choose_multiple(&mut rng, size - 1)
            .map(|key| **key)
            .collect();

        let mut index = 0;
        while ring.len() < size - 1 {
            ring.push(synthetic_decoy(election_id, index));
            index += 1;
        }

        let position = rng.gen_range(0, ring.len() + 1);
        ring.insert(position, self.public);
        Ok(ring)
    }

    /// Sign `message` as an anonymous member of `ring`, which must contain our public key.
    pub fn sign_ring(
        &self,
        election_id: Uuid,
        message: &[u8],
        ring: &[VoterPublicKey],
    ) -> Result<RingSignature, Error> {
        let mut rng = rand::rngs::OsRng {};
        self.sign_ring_with_rng(&mut rng, election_id, message, ring)
    }

    pub fn sign_ring_with_rng<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        election_id: Uuid,
        message: &[u8],
        ring: &[VoterPublicKey],
    ) -> Result<RingSignature, Error> {
        let position = ring
            .iter()
            .position(|key| *key == self.public)
            .ok_or(Error::CryptoParameter("signer is not a member of the ring"))?;

        let points = decompress_ring(ring)
            .ok_or(Error::CryptoParameter("ring contains an invalid point"))?;

        let size = ring.len();
        let h = election_generator(election_id);
        let image_point = self.secret * h;
        let key_image = KeyImage(image_point.compress());
        let transcript = Transcript::new(election_id, message, ring, &key_image);

        let mut challenges = vec![Scalar::zero(); size];
        let mut responses: Vec<Scalar> = (0..size).map(|_| Scalar::random(&mut *rng)).collect();

        let alpha = Scalar::random(&mut *rng);
        challenges[(position + 1) % size] =
            transcript.challenge(&(alpha * RISTRETTO_BASEPOINT_POINT), &(alpha * h));

        let mut i = (position + 1) % size;
        while i != position {
            let (l, r) = commitments(&points[i], &image_point, &h, &challenges[i], &responses[i]);
            challenges[(i + 1) % size] = transcript.challenge(&l, &r);
            i = (i + 1) % size;
        }

        responses[position] = alpha - challenges[position] * self.secret;

        Ok(RingSignature {
            c0: challenges[0],
            responses,
            key_image,
            ring: ring.to_vec(),
        })
    }

    /// Sign without anonymity.
    ///
    /// Only for elections that explicitly accept it, for example when the voter pool is a single
    /// person. The reason is recorded on chain.
    pub fn sign_degraded(
        &self,
        election_id: Uuid,
        message: &[u8],
        audit_reason: &str,
    ) -> Result<DegradedSignature, Error> {
        let signature = self.sign_ring(election_id, message, &[self.public])?;
        Ok(DegradedSignature {
            signature,
            audit_reason: audit_reason.to_string(),
        })
    }
}

impl RingSignature {
    /// Check the signature against its ring. Reveals nothing about which member signed.
    pub fn verify(&self, election_id: Uuid, message: &[u8]) -> Result<(), ValidationError> {
        let size = self.ring.len();
        if size == 0 || self.responses.len() != size {
            return Err(ValidationError::SignatureInvalid);
        }

        let distinct: HashSet<&VoterPublicKey> = self.ring.iter().collect();
        if distinct.len() != size {
            return Err(ValidationError::SignatureInvalid);
        }

        let points = decompress_ring(&self.ring).ok_or(ValidationError::SignatureInvalid)?;
        let image_point = self
            .key_image
            .0
            .decompress()
            .ok_or(ValidationError::SignatureInvalid)?;
        if image_point == RistrettoPoint::identity() {
            return Err(ValidationError::SignatureInvalid);
        }

        let h = election_generator(election_id);
        let transcript = Transcript::new(election_id, message, &self.ring, &self.key_image);

        let mut c = self.c0;
        for (point, response) in points.iter().zip(self.responses.iter()) {
            let (l, r) = commitments(point, &image_point, &h, &c, response);
            c = transcript.challenge(&l, &r);
        }

        if c == self.c0 {
            Ok(())
        } else {
            Err(ValidationError::SignatureInvalid)
        }
    }
}

impl DegradedSignature {
    pub fn verify(&self, election_id: Uuid, message: &[u8]) -> Result<(), ValidationError> {
        if self.signature.ring.len() != 1 {
            return Err(ValidationError::SignatureInvalid);
        }
        self.signature.verify(election_id, message)
    }

    /// The voter that produced this signature
    pub fn signer(&self) -> Option<&VoterPublicKey> {
        self.signature.ring.first()
    }
}

/// Deterministic padding key `index` for an election. Nobody knows its discrete log.
pub fn synthetic_decoy(election_id: Uuid, index: usize) -> VoterPublicKey {
    let mut bytes = Vec::with_capacity(DECOY_DOMAIN.len() + 16 + 8);
    bytes.extend_from_slice(DECOY_DOMAIN);
    bytes.extend_from_slice(election_id.as_bytes());
    bytes.extend_from_slice(&(index as u64).to_be_bytes());
    VoterPublicKey(RistrettoPoint::hash_from_bytes::<Sha512>(&bytes).compress())
}

/// Whether `key` is one of the first `ring_size` synthetic decoys of the election
pub fn is_synthetic_decoy(election_id: Uuid, key: &VoterPublicKey, ring_size: usize) -> bool {
    (0..ring_size).any(|index| synthetic_decoy(election_id, index) == *key)
}

/// H_e, the key-image base for an election
fn election_generator(election_id: Uuid) -> RistrettoPoint {
    let mut bytes = Vec::with_capacity(KEY_IMAGE_DOMAIN.len() + 16);
    bytes.extend_from_slice(KEY_IMAGE_DOMAIN);
    bytes.extend_from_slice(election_id.as_bytes());
    RistrettoPoint::hash_from_bytes::<Sha512>(&bytes)
}

fn decompress_ring(ring: &[VoterPublicKey]) -> Option<Vec<RistrettoPoint>> {
    ring.iter().map(|key| key.decompress()).collect()
}

/// L = sG + cP, R = sH + cI
fn commitments(
    public: &RistrettoPoint,
    image: &RistrettoPoint,
    h: &RistrettoPoint,
    c: &Scalar,
    s: &Scalar,
) -> (RistrettoPoint, RistrettoPoint) {
    let l = s * RISTRETTO_BASEPOINT_POINT + c * public;
    let r = s * h + c * image;
    (l, r)
}

// Hash state shared by every challenge of one signature
struct Transcript {
    prefix: Sha512,
}

impl Transcript {
    fn new(
        election_id: Uuid,
        message: &[u8],
        ring: &[VoterPublicKey],
        key_image: &KeyImage,
    ) -> Self {
        let mut prefix = Sha512::new();
        prefix.update(CHALLENGE_DOMAIN);
        prefix.update(election_id.as_bytes());
        prefix.update(&(message.len() as u64).to_be_bytes());
        prefix.update(message);
        prefix.update(&(ring.len() as u64).to_be_bytes());
        for key in ring {
            prefix.update(key.0.as_bytes());
        }
        prefix.update(key_image.0.as_bytes());
        Transcript { prefix }
    }

    fn challenge(&self, l: &RistrettoPoint, r: &RistrettoPoint) -> Scalar {
        let mut hasher = self.prefix.clone();
        hasher.update(l.compress().as_bytes());
        hasher.update(r.compress().as_bytes());
        Scalar::from_hash(hasher)
    }
}
