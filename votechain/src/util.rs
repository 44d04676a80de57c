use ed25519_dalek::Keypair;
use ed25519_dalek::PublicKey;
use ed25519_dalek::SecretKey;
use num_bigint_dig::{BigInt, BigUint, ModInverse, Sign};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate an ed25519 keypair, used for authority identities
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let mut csprng = rand::rngs::OsRng {};
    let Keypair { public, secret } = Keypair::generate(&mut csprng);
    (secret, public)
}

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hex-encoded SHA-256
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Modular inverse of `a` mod `m`, normalized into `[0, m)`
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let inverse: BigInt = a.clone().mod_inverse(m)?;
    let m = BigInt::from_biguint(Sign::Plus, m.clone());
    let normalized = ((inverse % &m) + &m) % &m;
    normalized.to_biguint()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_is_normalized() {
        let m = BigUint::from(97u32);
        for a in 1u32..97 {
            let a = BigUint::from(a);
            let inv = mod_inverse(&a, &m).unwrap();
            assert!(inv < m);
            assert_eq!((a * inv) % &m, BigUint::from(1u32));
        }
        assert!(mod_inverse(&BigUint::from(6u32), &BigUint::from(9u32)).is_none());
    }
}
