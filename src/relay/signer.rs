//! Relay block signatures.
//!
//! RSA keys sign the block bytes with PKCS#1 v1.5 over SHA-256, which amounts
//! to a signature over the block hash. Ed25519 keys sign the block hash
//! directly.
use super::block::RelayBlock;
use ed25519_dalek::{Signer as _, Verifier as _};
use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{Id, PKey, Private, Public},
    sign::{Signer, Verifier},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] ErrorStack),
    #[error("Unsupported key type: {0}")]
    UnsupportedKey(String),
    #[error("Invalid Ed25519 key or signature: {0}")]
    Ed25519(#[from] ed25519_dalek::SignatureError),
}

/// Private key of a relay.
pub enum RelaySigner {
    Rsa(PKey<Private>),
    Ed25519(ed25519_dalek::SigningKey),
}

impl RelaySigner {
    /// Load a PKCS#8 or traditional PEM private key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, SignatureError> { Self::from_pkey(PKey::private_key_from_pem(pem)?) }

    pub fn from_pkey(key: PKey<Private>) -> Result<Self, SignatureError> {
        match key.id() {
            Id::RSA => Ok(Self::Rsa(key)),
            Id::ED25519 => {
                let raw = key.raw_private_key()?;
                let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    SignatureError::UnsupportedKey("Ed25519 key of wrong length".into())
                })?;
                Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&bytes)))
            }
            other => Err(SignatureError::UnsupportedKey(format!("{:?}", other))),
        }
    }

    pub fn sign(&self, block: &RelayBlock) -> Result<Vec<u8>, SignatureError> {
        match self {
            RelaySigner::Rsa(key) => {
                let mut signer = Signer::new(MessageDigest::sha256(), key)?;
                Ok(signer.sign_oneshot_to_vec(&block.to_bytes())?)
            }
            RelaySigner::Ed25519(key) => Ok(key.sign(block.hash().as_ref()).to_bytes().to_vec()),
        }
    }

    /// The matching public key.
    pub fn verifier(&self) -> Result<RelayVerifier, SignatureError> {
        match self {
            RelaySigner::Rsa(key) => Ok(RelayVerifier::Rsa(PKey::public_key_from_der(
                &key.public_key_to_der()?,
            )?)),
            RelaySigner::Ed25519(key) => Ok(RelayVerifier::Ed25519(key.verifying_key())),
        }
    }
}

/// Public key of a relay, as held by light clients.
pub enum RelayVerifier {
    Rsa(PKey<Public>),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl RelayVerifier {
    pub fn from_pem(pem: &[u8]) -> Result<Self, SignatureError> {
        let key = PKey::public_key_from_pem(pem)?;
        match key.id() {
            Id::RSA => Ok(Self::Rsa(key)),
            Id::ED25519 => {
                let raw = key.raw_public_key()?;
                let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    SignatureError::UnsupportedKey("Ed25519 key of wrong length".into())
                })?;
                Ok(Self::Ed25519(ed25519_dalek::VerifyingKey::from_bytes(&bytes)?))
            }
            other => Err(SignatureError::UnsupportedKey(format!("{:?}", other))),
        }
    }

    /// Whether `signature` is a valid signature on `block`. Malformed
    /// signatures are reported as invalid.
    pub fn verify(&self, block: &RelayBlock, signature: &[u8]) -> bool {
        match self {
            RelayVerifier::Rsa(key) => Verifier::new(MessageDigest::sha256(), key)
                .and_then(|mut v| v.verify_oneshot(signature, &block.to_bytes()))
                .unwrap_or(false),
            RelayVerifier::Ed25519(key) => match ed25519_dalek::Signature::from_slice(signature) {
                Ok(sig) => key.verify(block.hash().as_ref(), &sig).is_ok(),
                Err(_) => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{merkle::MerkleTree, test_util};

    fn block() -> RelayBlock {
        RelayBlock {
            index:    3,
            root:     MerkleTree::build([b"a", b"b"]).root(),
            bloom:    vec![7; 32],
            previous: vec![9; 32],
        }
    }

    #[test]
    fn rsa_signatures() {
        let signer = RelaySigner::from_pkey(test_util::rsa_key()).expect("RSA is supported.");
        let block = block();
        let signature = signer.sign(&block).expect("Signed.");
        let verifier = signer.verifier().expect("Public key.");
        assert!(verifier.verify(&block, &signature));

        let mut other = block.clone();
        other.index = 4;
        assert!(!verifier.verify(&other, &signature));
        assert!(!verifier.verify(&block, &signature[1..]));
    }

    #[test]
    fn ed25519_signatures() {
        let key = PKey::generate_ed25519().expect("Key generation.");
        let pem = key.private_key_to_pem_pkcs8().expect("PEM");
        let public_pem = key.public_key_to_pem().expect("PEM");
        let signer = RelaySigner::from_pem(&pem).expect("Ed25519 is supported.");
        let block = block();
        let signature = signer.sign(&block).expect("Signed.");
        assert_eq!(signature.len(), 64);

        let verifier = RelayVerifier::from_pem(&public_pem).expect("Public key.");
        assert!(verifier.verify(&block, &signature));
        // openssl agrees on the signed message.
        let mut check = Verifier::new_without_digest(&key).expect("Verifier.");
        assert!(check
            .verify_oneshot(&signature, block.hash().as_ref())
            .expect("Well formed."));
        assert!(!verifier.verify(&block, &[0u8; 64]));
    }
}
