//! Paillier cryptosystem.
//!
//! Multiplying two ciphertexts modulo n² adds their plaintexts modulo n, which lets a tally be
//! computed over encrypted ballots and decrypted exactly once.

use crate::*;
use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};

/// How many prime pairs key generation draws before giving up
pub const MAX_KEYGEN_ATTEMPTS: usize = 32;

/// Smallest modulus we are willing to generate
pub const MIN_KEY_BITS: usize = 64;

/// Paillier public key (n, g)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PaillierPublicKey {
    #[serde(with = "BigUintHex")]
    pub n: BigUint,

    #[serde(with = "BigUintHex")]
    pub g: BigUint,
}

/// Paillier private key (λ, μ)
///
/// Deliberately not serializable: it only ever lives inside the tallying side of a node.
#[derive(Clone)]
pub struct PaillierPrivateKey {
    pub(crate) n: BigUint,
    pub(crate) lambda: BigUint,
    pub(crate) mu: BigUint,
}

impl std::fmt::Debug for PaillierPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "PaillierPrivateKey {{ n: {}, .. }}", self.n)
    }
}

/// A freshly generated election key
#[derive(Clone, Debug)]
pub struct PaillierKeyPair {
    pub public_key: PaillierPublicKey,
    pub private_key: PaillierPrivateKey,
}

/// A Paillier ciphertext, an element of Z*_{n²}
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ciphertext(#[serde(with = "BigUintHex")] pub BigUint);

impl PaillierKeyPair {
    /// Generate a keypair with an n of `bits` bits using the OS random number generator
    pub fn generate(bits: usize) -> Result<Self, Error> {
        let mut rng = rand::rngs::OsRng {};
        Self::generate_with_rng(&mut rng, bits)
    }

    /// Generate a keypair: p, q of ~bits/2 each, n = pq, λ = lcm(p-1, q-1), g = n+1, μ = λ⁻¹ mod n
    pub fn generate_with_rng<R: Rng + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self, Error> {
        if bits < MIN_KEY_BITS {
            return Err(Error::CryptoParameter("paillier key size too small"));
        }

        let one = BigUint::one();
        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            let p = rng.gen_prime(bits / 2);
            let q = rng.gen_prime(bits - bits / 2);
            if p == q {
                continue;
            }

            let n = &p * &q;
            let p_1 = &p - &one;
            let q_1 = &q - &one;

            // gcd(n, φ(n)) = 1 guarantees λ is invertible mod n
            if !n.gcd(&(&p_1 * &q_1)).is_one() {
                continue;
            }

            let lambda = p_1.lcm(&q_1);
            let public_key = PaillierPublicKey::new(n.clone());
            let nn = public_key.n_squared();
            let l = l_function(&public_key.g.modpow(&lambda, &nn), &n);
            let mu = match mod_inverse(&l, &n) {
                Some(mu) => mu,
                None => continue,
            };

            return Ok(PaillierKeyPair {
                public_key,
                private_key: PaillierPrivateKey { n, lambda, mu },
            });
        }

        Err(Error::KeyGeneration(MAX_KEYGEN_ATTEMPTS))
    }
}

impl PaillierPublicKey {
    /// Public key with the standard generator g = n + 1
    pub fn new(n: BigUint) -> Self {
        let g = &n + BigUint::one();
        PaillierPublicKey { n, g }
    }

    pub fn n_squared(&self) -> BigUint {
        &self.n * &self.n
    }

    /// Size of the modulus in bits
    pub fn bits(&self) -> usize {
        self.n.bits()
    }

    /// Encrypt `m` (which must be < n) under a fresh random nonce
    pub fn encrypt(&self, m: &BigUint) -> Result<Ciphertext, Error> {
        let mut rng = rand::rngs::OsRng {};
        self.encrypt_with_rng(&mut rng, m)
    }

    pub fn encrypt_with_rng<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        m: &BigUint,
    ) -> Result<Ciphertext, Error> {
        if m >= &self.n {
            return Err(Error::CryptoParameter("plaintext must be smaller than n"));
        }

        let r = loop {
            let r = rng.gen_biguint_below(&self.n);
            if !r.is_zero() && r.gcd(&self.n).is_one() {
                break r;
            }
        };

        let nn = self.n_squared();
        let gm = self.g.modpow(m, &nn);
        let rn = r.modpow(&self.n, &nn);
        Ok(Ciphertext((gm * rn) % nn))
    }

    /// Homomorphic addition: E(m1) · E(m2) mod n² = E(m1 + m2 mod n)
    pub fn add_encrypted(&self, c1: &Ciphertext, c2: &Ciphertext) -> Ciphertext {
        Ciphertext((&c1.0 * &c2.0) % self.n_squared())
    }

    /// The neutral element of `add_encrypted`, a (trivial) encryption of zero
    pub fn encrypted_zero(&self) -> Ciphertext {
        Ciphertext(BigUint::one())
    }

    /// A ciphertext is well-formed when it lies in Z*_{n²}
    pub fn is_valid_ciphertext(&self, c: &Ciphertext) -> bool {
        !c.0.is_zero() && c.0 < self.n_squared() && c.0.gcd(&self.n).is_one()
    }
}

impl PaillierPrivateKey {
    /// The public half of this key
    pub fn public_key(&self) -> PaillierPublicKey {
        PaillierPublicKey::new(self.n.clone())
    }

    /// m = L(c^λ mod n²) · μ mod n
    pub fn decrypt(&self, c: &Ciphertext) -> Result<BigUint, Error> {
        let nn = &self.n * &self.n;
        if c.0.is_zero() || c.0 >= nn {
            return Err(Error::CryptoParameter("ciphertext outside of Z*_n^2"));
        }

        let u = c.0.modpow(&self.lambda, &nn);
        Ok((l_function(&u, &self.n) * &self.mu) % &self.n)
    }
}

/// L(u) = (u - 1) / n
pub(crate) fn l_function(u: &BigUint, n: &BigUint) -> BigUint {
    (u - BigUint::one()) / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::FixedRng;

    fn keypair() -> PaillierKeyPair {
        PaillierKeyPair::generate(256).unwrap()
    }

    #[test]
    fn encrypt_decrypt() {
        let keys = keypair();
        for m in &[0u32, 1, 42, 65535] {
            let m = BigUint::from(*m);
            let c = keys.public_key.encrypt(&m).unwrap();
            assert!(keys.public_key.is_valid_ciphertext(&c));
            assert_eq!(keys.private_key.decrypt(&c).unwrap(), m);
        }
    }

    #[test]
    fn encryption_is_randomized() {
        let keys = keypair();
        let m = BigUint::from(7u32);
        let c1 = keys.public_key.encrypt(&m).unwrap();
        let c2 = keys.public_key.encrypt(&m).unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn homomorphic_addition() {
        let keys = keypair();
        let pk = &keys.public_key;

        let c1 = pk.encrypt(&BigUint::from(1234u32)).unwrap();
        let c2 = pk.encrypt(&BigUint::from(4321u32)).unwrap();

        let sum = pk.add_encrypted(&c1, &c2);
        assert_eq!(keys.private_key.decrypt(&sum).unwrap(), BigUint::from(5555u32));

        // commutative, and the trivial zero is neutral
        assert_eq!(sum, pk.add_encrypted(&c2, &c1));
        let same = pk.add_encrypted(&sum, &pk.encrypted_zero());
        assert_eq!(same, sum);
    }

    #[test]
    fn addition_wraps_mod_n() {
        let keys = keypair();
        let pk = &keys.public_key;
        let n_minus_one = &pk.n - BigUint::one();

        let c1 = pk.encrypt(&n_minus_one).unwrap();
        let c2 = pk.encrypt(&BigUint::from(2u32)).unwrap();
        let sum = pk.add_encrypted(&c1, &c2);
        assert_eq!(keys.private_key.decrypt(&sum).unwrap(), BigUint::one());
    }

    #[test]
    fn rejects_bad_inputs() {
        let keys = keypair();
        let pk = &keys.public_key;
        assert!(pk.encrypt(&pk.n).is_err());
        assert!(keys.private_key.decrypt(&Ciphertext(BigUint::zero())).is_err());
        assert!(!pk.is_valid_ciphertext(&Ciphertext(pk.n_squared())));
        assert!(!pk.is_valid_ciphertext(&Ciphertext(pk.n.clone())));
        assert!(PaillierKeyPair::generate(32).is_err());
    }

    #[test]
    fn keygen_gives_up_when_primes_repeat() {
        // 0xc0000001 is prime, so p and q always come out equal
        let mut rng = FixedRng(vec![0xc0, 0x00, 0x00, 0x01]);
        assert!(matches!(
            PaillierKeyPair::generate_with_rng(&mut rng, MIN_KEY_BITS),
            Err(Error::KeyGeneration(MAX_KEYGEN_ATTEMPTS))
        ));
    }

    #[test]
    fn private_key_debug_is_redacted() {
        let keys = keypair();
        let debug = format!("{:?}", keys.private_key);
        assert!(!debug.contains(&keys.private_key.lambda.to_string()));
    }
}
