mod basic;

pub use basic::*;
use crate::{
    merkle::{self, MerkleHash},
    pcn::ParseError,
};
use openssl::{
    pkey::{HasPublic, Id, PKeyRef},
    x509::{X509Ref, X509ReqRef},
};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Stable identifier of a certificate or certificate request, derived from
/// the subject public key only. A request and the certificate issued for it
/// therefore share a fingerprint.
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn bytes(&self) -> &[u8; 32] { &self.0 }

    /// Fingerprint of the public key carried by the certificate.
    pub fn of_certificate(cert: &X509Ref) -> Result<Self, ParseError> {
        let key = cert.public_key()?;
        Ok(PublicKeyMaterial::from_pkey(&key)?.fingerprint())
    }

    /// Fingerprint of the public key carried by the certification request.
    pub fn of_request(req: &X509ReqRef) -> Result<Self, ParseError> {
        let key = req.public_key()?;
        Ok(PublicKeyMaterial::from_pkey(&key)?.fingerprint())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] { &self.0 }
}

impl From<[u8; 32]> for Fingerprint {
    fn from(bytes: [u8; 32]) -> Self { Self(bytes) }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&hex::encode(self.0)) }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Fingerprint({})", self) }
}

impl FromStr for Fingerprint {
    type Err = merkle::HashFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash: MerkleHash = s.parse()?;
        Ok(Self(*hash.bytes()))
    }
}

impl SerdeSerialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> SerdeDeserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(des: D) -> Result<Self, D::Error> {
        let s = String::deserialize(des)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The public key components a fingerprint is computed over.
pub enum PublicKeyMaterial {
    /// Modulus and public exponent, both as decimal strings.
    Rsa { modulus: String, exponent: String },
    /// Raw 32 byte public key.
    Ed25519([u8; 32]),
}

impl PublicKeyMaterial {
    pub fn from_pkey<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self, ParseError> {
        match key.id() {
            Id::RSA => {
                let rsa = key.rsa()?;
                Ok(Self::Rsa {
                    modulus:  rsa.n().to_dec_str()?.to_string(),
                    exponent: rsa.e().to_dec_str()?.to_string(),
                })
            }
            Id::ED25519 => {
                let raw = key.raw_public_key()?;
                let bytes = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| ParseError::UnsupportedKey("ED25519 key of wrong length".into()))?;
                Ok(Self::Ed25519(bytes))
            }
            other => Err(ParseError::UnsupportedKey(format!("{:?}", other))),
        }
    }

    /// SHA-256 over the decimal modulus followed by the decimal exponent for
    /// RSA keys, and over the raw key bytes for Ed25519 keys.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = match self {
            PublicKeyMaterial::Rsa { modulus, exponent } => {
                Sha256::digest(format!("{}{}", modulus, exponent).as_bytes())
            }
            PublicKeyMaterial::Ed25519(raw) => Sha256::digest(raw),
        };
        Fingerprint(digest.into())
    }
}

#[derive(SerdeSerialize, SerdeDeserialize, Debug, Clone, PartialEq, Eq)]
/// Inclusion proof of a leaf in a published Merkle tree, together with the
/// ledger block it was committed in.
pub struct ValidationInfo {
    /// Index of the leaf in the tree.
    #[serde(rename = "index")]
    pub leaf_index:  u64,
    /// Ledger block number, [`ValidationInfo::UNCONFIRMED`] until the
    /// containing block is observed.
    pub height:      i64,
    #[serde(rename = "numLeaves")]
    pub leaf_count:  u64,
    #[serde(rename = "merkleRoot", default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<MerkleHash>,
    /// Sibling hashes from the leaf upwards.
    #[serde(rename = "hashes")]
    pub path:        Vec<MerkleHash>,
}

impl ValidationInfo {
    pub const UNCONFIRMED: i64 = -1;

    pub fn is_confirmed(&self) -> bool { self.height >= 0 }

    /// Verify that `leaf` is included under the recorded root. A proof
    /// without a root never verifies.
    pub fn verify(&self, leaf: &[u8]) -> bool {
        match &self.merkle_root {
            Some(root) => merkle::verify(self.leaf_index, self.leaf_count, root, leaf, &self.path),
            None => false,
        }
    }

    /// Ledger block the proof was confirmed in, if any.
    pub fn block_number(&self) -> Option<u64> { u64::try_from(self.height).ok() }
}

impl merkle::MerkleTree {
    /// Proof for the leaf at `index` against the current root, not yet tied
    /// to a ledger block.
    pub fn validation_info(&self, index: u64) -> Option<ValidationInfo> {
        Some(ValidationInfo {
            leaf_index:  index,
            height:      ValidationInfo::UNCONFIRMED,
            leaf_count:  self.leaf_count(),
            merkle_root: Some(self.root()),
            path:        self.prove(index)?,
        })
    }
}
