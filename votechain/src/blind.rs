//! RSA blind signatures.
//!
//! The voter takes the RSA-FDH digest of a message, multiplies in rᵉ, and sends the blinded value to the
//! authority. The authority raises it to d without learning the message; the voter multiplies by
//! r⁻¹ to recover an ordinary RSA signature on the hash.

use crate::*;
use num_bigint_dig::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};
use rsa::{PublicKeyParts, RSAPrivateKey, RSAPublicKey};
use sha2::Sha256;

/// How many candidate r values we draw before reporting a degenerate key
pub const MAX_BLINDING_ATTEMPTS: usize = 16;

/// The authority side of the blind signature scheme
#[derive(Clone)]
pub struct BlindSigningKey {
    key: RSAPrivateKey,
}

impl std::fmt::Debug for BlindSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BlindSigningKey {{ n: {}, .. }}", self.key.n())
    }
}

/// Public verification key (n, e)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlindPublicKey {
    #[serde(with = "BigUintHex")]
    pub n: BigUint,

    #[serde(with = "BigUintHex")]
    pub e: BigUint,
}

/// A blinding factor r together with r⁻¹ mod n
///
/// Only the voter holds this. Reusing it across messages links them.
#[derive(Clone)]
pub struct BlindingFactor {
    r: BigUint,
    r_inv: BigUint,
}

/// An RSA signature over the full-domain hash of a message
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlindSignature(#[serde(with = "BigUintHex")] pub BigUint);

impl BlindSigningKey {
    pub fn generate(bits: usize) -> Result<Self, Error> {
        let mut rng = rand::rngs::OsRng {};
        let key = RSAPrivateKey::new(&mut rng, bits)?;
        Ok(BlindSigningKey { key })
    }

    pub fn from_rsa(key: RSAPrivateKey) -> Result<Self, Error> {
        key.validate()?;
        Ok(BlindSigningKey { key })
    }

    pub fn public_key(&self) -> BlindPublicKey {
        BlindPublicKey {
            n: self.key.n().clone(),
            e: self.key.e().clone(),
        }
    }

    /// s' = m'^d mod n
    ///
    /// The authority cannot tell what it is signing, so callers must gate this on eligibility.
    pub fn sign_blinded(&self, blinded: &BigUint) -> Result<BlindSignature, Error> {
        let n = self.key.n();
        if blinded.is_zero() || blinded >= n {
            return Err(Error::Blinding("blinded message outside of Z_n"));
        }
        Ok(BlindSignature(blinded.modpow(self.key.d(), n)))
    }
}

impl BlindPublicKey {
    /// Draw r with gcd(r, n) = 1 and compute r⁻¹ mod n
    pub fn generate_blinding_factor(&self) -> Result<BlindingFactor, Error> {
        let mut rng = rand::rngs::OsRng {};
        self.generate_blinding_factor_with_rng(&mut rng)
    }

    pub fn generate_blinding_factor_with_rng<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<BlindingFactor, Error> {
        let two = BigUint::from(2u32);
        if self.n <= two {
            return Err(Error::CryptoParameter("RSA modulus too small"));
        }

        for _ in 0..MAX_BLINDING_ATTEMPTS {
            let r = rng.gen_biguint_range(&two, &self.n);
            if !r.gcd(&self.n).is_one() {
                continue;
            }
            if let Some(r_inv) = mod_inverse(&r, &self.n) {
                return Ok(BlindingFactor { r, r_inv });
            }
        }

        Err(Error::BlindingFactor(MAX_BLINDING_ATTEMPTS))
    }

    /// Full-domain SHA-256 hash of `message`, sized to the modulus and below n
    pub fn hash_message(&self, message: &[u8]) -> Result<BigUint, Error> {
        let key = RSAPublicKey::new(self.n.clone(), self.e.clone())?;
        let digest = rsa_fdh::blind::hash_message::<Sha256, _>(&key, message)?;
        Ok(BigUint::from_bytes_be(&digest))
    }

    /// m' = H(m) · rᵉ mod n
    pub fn blind(&self, message: &[u8], factor: &BlindingFactor) -> Result<BigUint, Error> {
        let hashed = self.hash_message(message)?;
        Ok((hashed * factor.r.modpow(&self.e, &self.n)) % &self.n)
    }

    /// s = s' · r⁻¹ mod n
    pub fn unblind(&self, signature: &BlindSignature, factor: &BlindingFactor) -> BlindSignature {
        BlindSignature((&signature.0 * &factor.r_inv) % &self.n)
    }

    /// sᵉ mod n == H(m)
    pub fn verify(&self, message: &[u8], signature: &BlindSignature) -> Result<(), ValidationError> {
        if signature.0.is_zero() || signature.0 >= self.n {
            return Err(ValidationError::AuthorizationInvalid);
        }
        let hashed = self
            .hash_message(message)
            .map_err(|_| ValidationError::AuthorizationInvalid)?;
        if signature.0.modpow(&self.e, &self.n) == hashed {
            Ok(())
        } else {
            Err(ValidationError::AuthorizationInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::FixedRng;

    fn signing_key() -> BlindSigningKey {
        BlindSigningKey::generate(512).unwrap()
    }

    #[test]
    fn blind_sign_unblind_verify() {
        let key = signing_key();
        let public_key = key.public_key();
        let message = b"authorize this ballot";

        for _ in 0..5 {
            let factor = public_key.generate_blinding_factor().unwrap();
            let blinded = public_key.blind(message, &factor).unwrap();

            // the signer never sees the hash itself
            assert_ne!(blinded, public_key.hash_message(message).unwrap());

            let blind_sig = key.sign_blinded(&blinded).unwrap();
            let sig = public_key.unblind(&blind_sig, &factor);
            assert!(public_key.verify(message, &sig).is_ok());
        }
    }

    #[test]
    fn signature_does_not_transfer() {
        let key = signing_key();
        let public_key = key.public_key();

        let factor = public_key.generate_blinding_factor().unwrap();
        let blinded = public_key.blind(b"message one", &factor).unwrap();
        let sig = public_key.unblind(&key.sign_blinded(&blinded).unwrap(), &factor);

        assert_eq!(
            public_key.verify(b"message two", &sig),
            Err(ValidationError::AuthorizationInvalid)
        );

        // a key from another authority does not accept it either
        let other = signing_key().public_key();
        assert!(other.verify(b"message one", &sig).is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let key = signing_key();
        let public_key = key.public_key();
        assert!(key.sign_blinded(&BigUint::zero()).is_err());
        assert!(key.sign_blinded(&public_key.n).is_err());
        assert!(public_key
            .verify(b"m", &BlindSignature(public_key.n.clone()))
            .is_err());
    }

    #[test]
    fn degenerate_modulus() {
        let public_key = BlindPublicKey {
            n: BigUint::from(2u32),
            e: BigUint::from(3u32),
        };
        assert!(public_key.generate_blinding_factor().is_err());

        // every r drawn from [2, 6) by an all-zero stream is 2, never coprime to 6
        let public_key = BlindPublicKey {
            n: BigUint::from(6u32),
            e: BigUint::from(5u32),
        };
        let mut rng = FixedRng(vec![0]);
        assert!(matches!(
            public_key.generate_blinding_factor_with_rng(&mut rng),
            Err(Error::BlindingFactor(MAX_BLINDING_ATTEMPTS))
        ));
    }

    #[test]
    fn hash_covers_modulus() {
        let public_key = signing_key().public_key();
        let h1 = public_key.hash_message(b"a").unwrap();
        let h2 = public_key.hash_message(b"b").unwrap();
        assert!(h1 < public_key.n);
        assert_ne!(h1, h2);
        assert_eq!(h1, public_key.hash_message(b"a").unwrap());

        // the digest is bound to the modulus, not just the message
        let other = signing_key().public_key();
        assert_ne!(h1, other.hash_message(b"a").unwrap());
    }
}
