//! Threshold Paillier decryption with a trusted dealer.
//!
//! The dealer picks d with d ≡ 0 mod λ and d ≡ 1 mod n and Shamir-shares it modulo nλ. Holder
//! `i` publishes c^(2Δs_i) mod n², where Δ = l! for `l` holders. Any `t` partial decryptions are
//! combined in the exponent with integer Lagrange coefficients Δ·∏ j/(j-i), which yields
//! c^(4Δ²d) = 1 + 4Δ²m·n mod n², so nobody ever holds λ after dealing.

use crate::*;
use num_bigint_dig::{BigInt, BigUint, RandBigInt, Sign};
use num_traits::{One, Signed, Zero};
use rand::{CryptoRng, Rng};

/// Public description of a threshold-shared election key
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ThresholdKey {
    pub public_key: PaillierPublicKey,

    /// Minimum number of partial decryptions needed
    pub threshold: usize,

    /// Number of shares dealt
    pub total: usize,
}

/// One holder's share of the decryption exponent
#[derive(Clone)]
pub struct KeyShare {
    /// 1-based share index
    pub index: u64,
    pub total: usize,
    n: BigUint,
    share: BigUint,
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "KeyShare {{ index: {}, total: {}, .. }}", self.index, self.total)
    }
}

/// A holder's contribution to decrypting one ciphertext
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartialDecryption {
    pub index: u64,

    #[serde(with = "BigUintHex")]
    pub value: BigUint,
}

impl PaillierPrivateKey {
    /// Split this key into `total` shares, any `threshold` of which can decrypt.
    ///
    /// The private key should be dropped once the shares are handed out.
    pub fn generate_key_shares(
        &self,
        total: usize,
        threshold: usize,
    ) -> Result<(ThresholdKey, Vec<KeyShare>), Error> {
        let mut rng = rand::rngs::OsRng {};
        self.generate_key_shares_with_rng(&mut rng, total, threshold)
    }

    pub fn generate_key_shares_with_rng<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        total: usize,
        threshold: usize,
    ) -> Result<(ThresholdKey, Vec<KeyShare>), Error> {
        if threshold == 0 || threshold > total {
            return Err(Error::CryptoParameter(
                "threshold must be between 1 and the number of shares",
            ));
        }

        // 4Δ² must be invertible mod n
        let delta = factorial(total);
        if mod_inverse(&(&delta * &delta * BigUint::from(4u32)), &self.n).is_none() {
            return Err(Error::CryptoParameter("too many shares for this key"));
        }

        let lambda_inv = mod_inverse(&self.lambda, &self.n)
            .ok_or(Error::CryptoParameter("λ is not invertible mod n"))?;
        let d = &self.lambda * lambda_inv;
        let modulus = &self.n * &self.lambda;

        // f(x) = d + a_1 x + ... + a_{t-1} x^{t-1} mod nλ
        let mut coefficients = vec![d];
        for _ in 1..threshold {
            coefficients.push(rng.gen_biguint_below(&modulus));
        }

        let shares = (1..=total as u64)
            .map(|index| {
                let x = BigUint::from(index);
                let share = coefficients
                    .iter()
                    .rev()
                    .fold(BigUint::zero(), |acc, a| (acc * &x + a) % &modulus);
                KeyShare {
                    index,
                    total,
                    n: self.n.clone(),
                    share,
                }
            })
            .collect();

        let key = ThresholdKey {
            public_key: self.public_key(),
            threshold,
            total,
        };

        Ok((key, shares))
    }
}

impl KeyShare {
    /// c_i = c^(2Δs_i) mod n²
    pub fn partial_decrypt(&self, c: &Ciphertext) -> Result<PartialDecryption, Error> {
        let nn = &self.n * &self.n;
        if c.0.is_zero() || c.0 >= nn {
            return Err(Error::CryptoParameter("ciphertext outside of Z*_n^2"));
        }

        let exponent = factorial(self.total) * &self.share * BigUint::from(2u32);
        Ok(PartialDecryption {
            index: self.index,
            value: c.0.modpow(&exponent, &nn),
        })
    }
}

impl ThresholdKey {
    /// Combine at least `threshold` partial decryptions of the same ciphertext.
    ///
    /// Duplicate indices count once.
    pub fn combine_partial_decryptions(
        &self,
        partials: &[PartialDecryption],
    ) -> Result<BigUint, Error> {
        let mut selected: Vec<&PartialDecryption> = Vec::with_capacity(self.threshold);
        for partial in partials {
            if partial.index == 0 || partial.index > self.total as u64 {
                return Err(Error::CryptoParameter("partial decryption index out of range"));
            }
            if selected.iter().any(|p| p.index == partial.index) {
                continue;
            }
            selected.push(partial);
            if selected.len() == self.threshold {
                break;
            }
        }

        if selected.len() < self.threshold {
            return Err(Error::NotEnoughShares(self.threshold, selected.len()));
        }

        let n = &self.public_key.n;
        let nn = self.public_key.n_squared();
        let delta = factorial(self.total);
        let delta_int = BigInt::from_biguint(Sign::Plus, delta.clone());
        let indices: Vec<u64> = selected.iter().map(|p| p.index).collect();

        let mut combined = BigUint::one();
        for partial in &selected {
            let coefficient =
                lagrange_coefficient(&delta_int, partial.index, &indices) * BigInt::from(2u32);
            let magnitude = coefficient
                .abs()
                .to_biguint()
                .ok_or(Error::CryptoParameter("lagrange coefficient"))?;

            let base = if coefficient.is_negative() {
                mod_inverse(&partial.value, &nn)
                    .ok_or(Error::CryptoParameter("partial decryption is not invertible"))?
            } else {
                partial.value.clone()
            };

            combined = (combined * base.modpow(&magnitude, &nn)) % &nn;
        }

        let four_delta_sq = &delta * &delta * BigUint::from(4u32);
        let inverse = mod_inverse(&four_delta_sq, n)
            .ok_or(Error::CryptoParameter("4Δ² is not invertible mod n"))?;

        Ok((crate::paillier::l_function(&combined, n) * inverse) % n)
    }
}

/// Δ·∏_{j≠i} j/(j-i), always an integer
fn lagrange_coefficient(delta: &BigInt, i: u64, indices: &[u64]) -> BigInt {
    let mut numerator = delta.clone();
    let mut denominator = BigInt::one();
    for &j in indices.iter().filter(|&&j| j != i) {
        numerator = numerator * BigInt::from(j);
        denominator = denominator * (BigInt::from(j) - BigInt::from(i));
    }
    numerator / denominator
}

fn factorial(n: usize) -> BigUint {
    (1..=n as u64).fold(BigUint::one(), |acc, k| acc * BigUint::from(k))
}
