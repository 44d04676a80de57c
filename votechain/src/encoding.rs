//! Digit-packed vote encoding.
//!
//! A vote for candidate `p` out of `K` is the plaintext `B^p`, so summing ballots adds one to
//! the base-`B` digit of each chosen candidate. `B` is the smallest power of two strictly larger
//! than the maximum number of voters, which makes `N_max = B - 1` the largest number of ballots
//! that can be summed before a digit carries into its neighbour. `B^K` must stay below the
//! Paillier modulus `n`, otherwise the sum wraps modulo `n`.

use crate::*;
use num_bigint_dig::BigUint;
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VoteEncoding {
    /// Number of candidates (digits)
    pub candidates: usize,

    /// log2 of the digit base B
    pub digit_bits: usize,
}

impl VoteEncoding {
    /// Choose a base for `max_voters` ballots over `candidates` candidates, checking that the
    /// packed tally fits below the modulus of `public_key`.
    pub fn new(
        max_voters: u64,
        candidates: usize,
        public_key: &PaillierPublicKey,
    ) -> Result<Self, Error> {
        if candidates == 0 {
            return Err(Error::CryptoParameter("an election needs at least one candidate"));
        }
        if max_voters == 0 {
            return Err(Error::CryptoParameter("an election needs at least one voter"));
        }

        // smallest power of two > max_voters
        let digit_bits = 64 - max_voters.leading_zeros() as usize;
        let encoding = VoteEncoding {
            candidates,
            digit_bits,
        };

        // B^K - 1 is the largest packed value; it has exactly K * digit_bits bits
        if candidates * digit_bits >= public_key.bits() {
            return Err(Error::CryptoParameter(
                "too many candidates or voters for the election key size",
            ));
        }

        Ok(encoding)
    }

    /// The digit base B
    pub fn base(&self) -> BigUint {
        BigUint::one() << self.digit_bits
    }

    /// Largest number of ballots that can be summed without a digit carrying
    pub fn max_ballots(&self) -> u64 {
        if self.digit_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.digit_bits) - 1
        }
    }

    /// Plaintext of a vote for the candidate at `position`
    pub fn encode_vote(&self, position: usize) -> Result<BigUint, Error> {
        if position >= self.candidates {
            return Err(Error::CryptoParameter("candidate position out of range"));
        }
        Ok(BigUint::one() << (position * self.digit_bits))
    }

    /// Unpack per-candidate counts from a decrypted sum.
    ///
    /// Any bits left above the last digit mean the sum overflowed the encoding.
    pub fn decode_vote_tally(&self, sum: &BigUint) -> Result<Vec<u64>, Error> {
        let base = self.base();
        let mut remaining = sum.clone();
        let mut counts = Vec::with_capacity(self.candidates);

        for _ in 0..self.candidates {
            let (quotient, digit) = remaining.div_rem(&base);
            counts.push(digit.to_u64().ok_or(Error::DecodeOverflow)?);
            remaining = quotient;
        }

        if !remaining.is_zero() {
            return Err(Error::DecodeOverflow);
        }

        Ok(counts)
    }

    /// Decode, additionally requiring that the counts add up to the number of ballots summed.
    ///
    /// Each well-formed ballot contributes exactly one vote, so a mismatch means either a carry
    /// between digits or a malformed ballot in the sum. Both make the tally untrustworthy.
    pub fn decode_checked(&self, sum: &BigUint, num_ballots: u64) -> Result<Vec<u64>, Error> {
        if num_ballots > self.max_ballots() {
            return Err(Error::DecodeOverflow);
        }

        let counts = self.decode_vote_tally(sum)?;
        let total: u64 = counts.iter().sum();
        if total != num_ballots {
            return Err(Error::DecodeOverflow);
        }

        Ok(counts)
    }
}
