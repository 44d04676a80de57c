// Hex adapters for `#[serde(with)]`
//
// Human-readable formats get hex strings, CBOR gets raw bytes.
use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::PublicKey;
use ed25519_dalek::Signature;
use num_bigint_dig::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::convert::TryFrom;

pub use hex_buffer_serde::Hex;

// a single-purpose type for use in `#[serde(with)]`
pub enum EdPublicKeyHex {}

impl Hex<PublicKey> for EdPublicKeyHex {
    type Error = String;

    fn create_bytes(public_key: &PublicKey) -> Cow<[u8]> {
        public_key.as_ref().into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<PublicKey, String> {
        PublicKey::from_bytes(bytes).map_err(|e| format!("{}", e))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum EdSignatureHex {}

impl Hex<Signature> for EdSignatureHex {
    type Error = String;

    fn create_bytes(sig: &Signature) -> Cow<[u8]> {
        let bytes = sig.to_bytes().to_vec();
        Cow::from(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Signature, String> {
        Signature::try_from(bytes).map_err(|e| format!("{}", e))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum BigUintHex {}

impl Hex<BigUint> for BigUintHex {
    type Error = String;

    fn create_bytes(value: &BigUint) -> Cow<[u8]> {
        Cow::from(value.to_bytes_be())
    }

    fn from_bytes(bytes: &[u8]) -> Result<BigUint, String> {
        if bytes.is_empty() {
            return Err("empty big integer".to_string());
        }
        Ok(BigUint::from_bytes_be(bytes))
    }
}

fn to_array32(bytes: &[u8]) -> Result<[u8; 32], String> {
    <[u8; 32]>::try_from(bytes).map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
}

// a single-purpose type for use in `#[serde(with)]`
pub enum RistrettoHex {}

impl Hex<CompressedRistretto> for RistrettoHex {
    type Error = String;

    fn create_bytes(point: &CompressedRistretto) -> Cow<[u8]> {
        point.as_bytes()[..].into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<CompressedRistretto, String> {
        Ok(CompressedRistretto(to_array32(bytes)?))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum ScalarHex {}

impl Hex<Scalar> for ScalarHex {
    type Error = String;

    fn create_bytes(scalar: &Scalar) -> Cow<[u8]> {
        scalar.as_bytes()[..].into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Scalar, String> {
        Scalar::from_canonical_bytes(to_array32(bytes)?)
            .ok_or_else(|| "non-canonical scalar".to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct HexScalar(#[serde(with = "ScalarHex")] Scalar);

impl ScalarHex {
    pub fn serialize_vec<S: Serializer>(
        scalars: &[Scalar],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(scalars.iter().map(|scalar| HexScalar(*scalar)))
    }

    pub fn deserialize_vec<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Scalar>, D::Error> {
        let scalars = Vec::<HexScalar>::deserialize(deserializer)?;
        Ok(scalars.into_iter().map(|scalar| scalar.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper(#[serde(with = "BigUintHex")] BigUint);

    #[test]
    fn biguint_is_hex_encoded() {
        let json = serde_json::to_string(&Wrapper(BigUint::from(0xbeefu32))).unwrap();
        assert_eq!(json, "\"beef\"");
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0, BigUint::from(0xbeefu32));
        assert!(serde_json::from_str::<Wrapper>("\"\"").is_err());
        assert!(serde_json::from_str::<Wrapper>("\"xyz\"").is_err());
    }

    #[test]
    fn cbor_carries_raw_bytes() {
        let value = Wrapper(BigUint::from(0xbeefu32));
        let cbor = serde_cbor::to_vec(&value).unwrap();
        // a two-byte CBOR byte string
        assert_eq!(cbor, vec![0x42, 0xbe, 0xef]);
        assert_eq!(serde_cbor::from_slice::<Wrapper>(&cbor).unwrap(), value);
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Scalars(
        #[serde(
            serialize_with = "ScalarHex::serialize_vec",
            deserialize_with = "ScalarHex::deserialize_vec"
        )]
        Vec<Scalar>,
    );

    #[test]
    fn scalars_must_be_canonical() {
        let scalars = Scalars(vec![Scalar::one(), Scalar::zero()]);
        let json = serde_json::to_string(&scalars).unwrap();
        let back: Scalars = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scalars);

        let cbor = serde_cbor::to_vec(&scalars).unwrap();
        assert_eq!(serde_cbor::from_slice::<Scalars>(&cbor).unwrap(), scalars);

        let too_big = format!("[\"{}\"]", "ff".repeat(32));
        assert!(serde_json::from_str::<Scalars>(&too_big).is_err());
        assert!(serde_json::from_str::<Scalars>("[\"0102\"]").is_err());
    }
}
