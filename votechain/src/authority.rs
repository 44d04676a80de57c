use crate::*;
use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use indexmap::IndexMap;
use std::convert::TryFrom;

/// A validator's signing identity
pub struct AuthorityKeyPair {
    pub id: String,
    keypair: Keypair,
}

impl std::fmt::Debug for AuthorityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "AuthorityKeyPair {{ id: {}, public: {} }}",
            self.id,
            hex::encode(self.keypair.public.as_bytes())
        )
    }
}

impl AuthorityKeyPair {
    pub fn generate(id: &str) -> Self {
        let (secret, public) = generate_keypair();
        AuthorityKeyPair {
            id: id.to_string(),
            keypair: Keypair { secret, public },
        }
    }

    pub fn from_secret(id: &str, secret: SecretKey) -> Self {
        let public: PublicKey = (&secret).into();
        AuthorityKeyPair {
            id: id.to_string(),
            keypair: Keypair { secret, public },
        }
    }

    /// Load from a hex-encoded ed25519 secret key
    pub fn from_secret_hex(id: &str, secret_hex: &str) -> Result<Self, Error> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|_| Error::CryptoParameter("authority secret key is not valid hex"))?;
        let secret = SecretKey::from_bytes(&bytes)?;
        Ok(Self::from_secret(id, secret))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public
    }

    pub fn info(&self) -> AuthorityInfo {
        AuthorityInfo {
            id: self.id.clone(),
            public_key: self.keypair.public,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

/// A known validator
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuthorityInfo {
    pub id: String,

    #[serde(with = "EdPublicKeyHex")]
    pub public_key: PublicKey,
}

impl AuthorityInfo {
    /// Parse `id:hexpubkey`
    pub fn parse(entry: &str) -> Result<Self, Error> {
        let mut parts = entry.trim().splitn(2, ':');
        let id = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .ok_or(Error::CryptoParameter("authority entry must be id:public_key"))?;
        if id.is_empty() {
            return Err(Error::CryptoParameter("authority entry has an empty id"));
        }

        let bytes = hex::decode(key)
            .map_err(|_| Error::CryptoParameter("authority public key is not valid hex"))?;
        Ok(AuthorityInfo {
            id: id.to_string(),
            public_key: PublicKey::from_bytes(&bytes)?,
        })
    }
}

/// The validator keys whose signatures make a block valid
#[derive(Clone, Debug, Default)]
pub struct AuthoritySet {
    members: IndexMap<String, PublicKey>,
}

impl AuthoritySet {
    pub fn new(members: Vec<AuthorityInfo>) -> Self {
        let mut set = AuthoritySet::default();
        for member in members {
            set.insert(member);
        }
        set
    }

    pub fn insert(&mut self, member: AuthorityInfo) {
        self.members.insert(member.id, member.public_key);
    }

    pub fn get(&self, id: &str) -> Option<&PublicKey> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Verify a hex-encoded signature by authority `id`
    pub fn verify(&self, id: &str, message: &[u8], signature_hex: &str) -> bool {
        let public_key = match self.members.get(id) {
            Some(key) => key,
            None => return false,
        };
        let signature = match hex::decode(signature_hex)
            .ok()
            .and_then(|bytes| Signature::try_from(bytes.as_slice()).ok())
        {
            Some(signature) => signature,
            None => return false,
        };
        public_key.verify_strict(message, &signature).is_ok()
    }
}

/// An authority's statement that it validated and appended a block
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Endorsement {
    pub block_hash: String,

    pub authority_id: String,

    #[serde(with = "EdSignatureHex")]
    pub signature: Signature,
}

impl Endorsement {
    pub fn new(authority: &AuthorityKeyPair, block_hash: &str) -> Self {
        Endorsement {
            block_hash: block_hash.to_string(),
            authority_id: authority.id.clone(),
            signature: authority.sign(&endorsement_message(block_hash)),
        }
    }

    /// Check the endorsement is for `block_hash` and signed by a known authority
    pub fn verify(&self, authorities: &AuthoritySet, block_hash: &str) -> bool {
        if self.block_hash != block_hash {
            return false;
        }
        match authorities.get(&self.authority_id) {
            Some(key) => key
                .verify_strict(&endorsement_message(block_hash), &self.signature)
                .is_ok(),
            None => false,
        }
    }
}

fn endorsement_message(block_hash: &str) -> Vec<u8> {
    let mut message = b"votechain-endorse:".to_vec();
    message.extend_from_slice(block_hash.as_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_set_verifies_members_only() {
        let alpha = AuthorityKeyPair::generate("alpha");
        let beta = AuthorityKeyPair::generate("beta");
        let set = AuthoritySet::new(vec![alpha.info()]);

        let sig = hex::encode(alpha.sign(b"block").to_bytes());
        assert!(set.verify("alpha", b"block", &sig));
        assert!(!set.verify("alpha", b"other", &sig));
        assert!(!set.verify("alpha", b"block", "zz"));

        let beta_sig = hex::encode(beta.sign(b"block").to_bytes());
        assert!(!set.verify("beta", b"block", &beta_sig));
        assert!(!set.verify("alpha", b"block", &beta_sig));
    }

    #[test]
    fn endorsements() {
        let alpha = AuthorityKeyPair::generate("alpha");
        let set = AuthoritySet::new(vec![alpha.info()]);

        let endorsement = Endorsement::new(&alpha, "abcd");
        assert!(endorsement.verify(&set, "abcd"));
        assert!(!endorsement.verify(&set, "abce"));

        let mut forged = endorsement;
        forged.authority_id = "gamma".to_string();
        assert!(!forged.verify(&set, "abcd"));
    }

    #[test]
    fn parse_authority_entries() {
        let alpha = AuthorityKeyPair::generate("alpha");
        let entry = format!("alpha:{}", hex::encode(alpha.public_key().as_bytes()));
        assert_eq!(AuthorityInfo::parse(&entry).unwrap(), alpha.info());

        assert!(AuthorityInfo::parse("alpha").is_err());
        assert!(AuthorityInfo::parse(":00").is_err());
        assert!(AuthorityInfo::parse("alpha:nothex").is_err());
    }

    #[test]
    fn secret_hex_roundtrip() {
        let (secret, public) = generate_keypair();
        let authority =
            AuthorityKeyPair::from_secret_hex("alpha", &hex::encode(secret.as_bytes())).unwrap();
        assert_eq!(authority.public_key(), public);
    }
}
