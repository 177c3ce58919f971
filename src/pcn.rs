//! Proof Chain Notarization (PCN) codec.
//!
//! A PCN is a certificate delegation chain, leaf first and trust anchor last,
//! in PEM form, immediately followed by a JSON document
//!
//! ```json
//! {"proofList": [ValidationInfo, ...], "revoke": {"signature": "..", "message": ".."}}
//! ```
//!
//! The proof list holds one proof per certificate above the leaf, in the same
//! order as the certificates. Confirming a newly published certificate
//! prepends its own proof, after which the list covers the whole chain.
use crate::{constants::REVOKE_PREFIX, types::*};
use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{HasPublic, PKeyRef, Private},
    sign::{Signer, Verifier},
    x509::{X509NameRef, X509Ref, X509},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PEM_END: &[u8] = b"-----END CERTIFICATE-----";

#[derive(Error, Debug)]
/// Malformed PEM, X.509, JSON or key material.
pub enum ParseError {
    #[error("Malformed PEM data: {0}")]
    Pem(String),
    #[error("Cryptographic decoding failed: {0}")]
    Crypto(#[from] ErrorStack),
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported public key algorithm: {0}")]
    UnsupportedKey(String),
    #[error("The certificate chain is empty.")]
    EmptyChain,
    #[error("Chain of {certificates} certificates cannot carry {proofs} proofs.")]
    ProofCount { certificates: usize, proofs: usize },
    #[error("The chain needs at least {0} certificates.")]
    ShortChain(usize),
    #[error("The name has no common name entry.")]
    MissingCommonName,
    #[error("Malformed revocation instruction: {0}")]
    Revocation(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
/// A revoker's signature over `REVOKE\n` followed by the PEM of the revoked
/// certificate.
pub struct RevocationInstruction {
    #[serde(with = "crate::internal::byte_array_hex")]
    pub signature: Vec<u8>,
    pub message:   String,
}

impl RevocationInstruction {
    /// Sign the revocation of `revoked` with the revoker's private key.
    pub fn sign(revoked: &X509Ref, key: &PKeyRef<Private>) -> Result<Self, ParseError> {
        let pem = String::from_utf8(revoked.to_pem()?)
            .map_err(|e| ParseError::Pem(e.to_string()))?;
        let message = format!("{}{}", REVOKE_PREFIX, pem);
        let signature = sign_message(key, message.as_bytes())?;
        Ok(Self { signature, message })
    }

    /// The certificate named by the message.
    pub fn revoked_certificate(&self) -> Result<X509, ParseError> {
        let pem = self.message.strip_prefix(REVOKE_PREFIX).ok_or_else(|| {
            ParseError::Revocation("message does not start with REVOKE".into())
        })?;
        certificate_from_pem(pem.as_bytes())
    }

    /// Whether the signature was made by the key of `revoker`.
    pub fn verify(&self, revoker: &X509Ref) -> Result<bool, ParseError> {
        let key = revoker.public_key()?;
        verify_message(&key, self.message.as_bytes(), &self.signature)
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ProofDocument {
    #[serde(rename = "proofList", default)]
    proof_list: Vec<ValidationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revoke:     Option<RevocationInstruction>,
}

#[derive(Debug, Clone)]
/// A parsed Proof Chain Notarization.
pub struct ProofChainNotarization {
    certificates: Vec<X509>,
    proofs:       Vec<ValidationInfo>,
    revocation:   Option<RevocationInstruction>,
}

impl ProofChainNotarization {
    /// A chain of certificates with the proofs of every certificate above the
    /// leaf.
    pub fn new(certificates: Vec<X509>, proofs: Vec<ValidationInfo>) -> Result<Self, ParseError> {
        if certificates.is_empty() {
            return Err(ParseError::EmptyChain);
        }
        if proofs.len() > certificates.len() {
            return Err(ParseError::ProofCount {
                certificates: certificates.len(),
                proofs:       proofs.len(),
            });
        }
        Ok(Self {
            certificates,
            proofs,
            revocation: None,
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (certificates, rest) = split_pem_chain(data)?;
        let rest = trim_ascii(rest);
        let document = if rest.is_empty() {
            ProofDocument::default()
        } else {
            serde_json::from_slice::<ProofDocument>(rest)?
        };
        let mut pcn = Self::new(certificates, document.proof_list)?;
        pcn.revocation = document.revoke;
        Ok(pcn)
    }

    /// Certificates in PEM form followed by the JSON proof document.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::new();
        for cert in &self.certificates {
            out.extend_from_slice(&cert.to_pem()?);
        }
        let document = ProofDocument {
            proof_list: self.proofs.clone(),
            revoke:     self.revocation.clone(),
        };
        serde_json::to_writer(&mut out, &document)?;
        Ok(out)
    }

    pub fn to_text(&self) -> Result<String, ParseError> {
        String::from_utf8(self.to_bytes()?).map_err(|e| ParseError::Pem(e.to_string()))
    }

    pub fn certificates(&self) -> &[X509] { &self.certificates }

    pub fn proofs(&self) -> &[ValidationInfo] { &self.proofs }

    /// The certificate the notarization is about.
    pub fn leaf(&self) -> &X509 { &self.certificates[0] }

    /// The certificate that issued the leaf, if present.
    pub fn issuer(&self) -> Option<&X509> { self.certificates.get(1) }

    pub fn revocation(&self) -> Option<&RevocationInstruction> { self.revocation.as_ref() }

    pub fn set_revocation(&mut self, revocation: RevocationInstruction) {
        self.revocation = Some(revocation);
    }

    /// Whether every certificate except the leaf carries a proof.
    pub fn awaits_leaf_proof(&self) -> bool { self.certificates.len() == self.proofs.len() + 1 }

    /// Whether every certificate carries a proof.
    pub fn is_complete(&self) -> bool { self.certificates.len() == self.proofs.len() }

    /// Prepend the leaf's proof. The chain must be missing exactly that proof.
    pub fn add_leaf_proof(&mut self, proof: ValidationInfo) -> Result<(), ParseError> {
        if !self.awaits_leaf_proof() {
            return Err(ParseError::ProofCount {
                certificates: self.certificates.len(),
                proofs:       self.proofs.len() + 1,
            });
        }
        self.proofs.insert(0, proof);
        Ok(())
    }
}

/// Parse all PEM certificates at the start of `data`, returning them and the
/// remaining bytes.
pub fn split_pem_chain(data: &[u8]) -> Result<(Vec<X509>, &[u8]), ParseError> {
    let mut certificates = Vec::new();
    let mut rest = data;
    loop {
        let trimmed = trim_ascii(rest);
        if !trimmed.starts_with(b"-----BEGIN CERTIFICATE-----") {
            break;
        }
        let end = find(trimmed, PEM_END)
            .ok_or_else(|| ParseError::Pem("unterminated certificate block".into()))?
            + PEM_END.len();
        certificates.push(X509::from_pem(&trimmed[..end])?);
        rest = &trimmed[end..];
    }
    if certificates.is_empty() {
        return Err(ParseError::EmptyChain);
    }
    Ok((certificates, rest))
}

/// Parse PEM data that must contain exactly one certificate.
pub fn certificate_from_pem(data: &[u8]) -> Result<X509, ParseError> {
    let (mut certificates, rest) = split_pem_chain(data)?;
    if certificates.len() != 1 || !trim_ascii(rest).is_empty() {
        return Err(ParseError::Pem(format!(
            "expected a single certificate, found {} and {} trailing bytes",
            certificates.len(),
            rest.len()
        )));
    }
    Ok(certificates.remove(0))
}

/// The first common name of an X.509 name, lowercased. Identities and
/// storage buckets are keyed by this value.
pub fn common_name(name: &X509NameRef) -> Result<String, ParseError> {
    let entry = name
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .ok_or(ParseError::MissingCommonName)?;
    Ok(entry.data().as_utf8()?.to_string().to_lowercase())
}

/// Sign a message with SHA-256 for RSA keys, or natively for Ed25519 keys.
pub fn sign_message(key: &PKeyRef<Private>, message: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut signer = match PublicKeyMaterial::from_pkey(key)? {
        PublicKeyMaterial::Rsa { .. } => Signer::new(MessageDigest::sha256(), key)?,
        PublicKeyMaterial::Ed25519(_) => Signer::new_without_digest(key)?,
    };
    Ok(signer.sign_oneshot_to_vec(message)?)
}

/// Counterpart of [`sign_message`]. An invalid signature yields `Ok(false)`.
pub fn verify_message<T: HasPublic>(
    key: &PKeyRef<T>,
    message: &[u8],
    signature: &[u8],
) -> Result<bool, ParseError> {
    let mut verifier = match PublicKeyMaterial::from_pkey(key)? {
        PublicKeyMaterial::Rsa { .. } => Verifier::new(MessageDigest::sha256(), key)?,
        PublicKeyMaterial::Ed25519(_) => Verifier::new_without_digest(key)?,
    };
    // openssl reports some malformed signatures as errors rather than a
    // mismatch.
    Ok(verifier.verify_oneshot(signature, message).unwrap_or(false))
}

fn trim_ascii(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(data.len());
    let end = data.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &data[start..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{merkle::MerkleTree, test_util};

    fn anchor_proof() -> ValidationInfo {
        let tree = MerkleTree::build([b"anchor"]);
        let mut proof = tree.validation_info(0).expect("Index in range.");
        proof.height = 1;
        proof
    }

    #[test]
    fn parse_and_serialize() {
        let root = test_util::self_signed("Root");
        let key = test_util::rsa_key();
        let leaf = test_util::issue("Alice", &key, &root);
        let pcn = ProofChainNotarization::new(vec![leaf.clone(), root.cert.clone()], vec![
            anchor_proof(),
        ])
        .expect("Valid chain.");
        let bytes = pcn.to_bytes().expect("Serializable.");
        let text = String::from_utf8(bytes.clone()).expect("Text.");
        assert!(text.contains("\"proofList\""));
        assert!(!text.contains("\"revoke\""));

        let parsed = ProofChainNotarization::parse(&bytes).expect("Parsable.");
        assert_eq!(parsed.certificates().len(), 2);
        assert_eq!(parsed.proofs(), pcn.proofs());
        assert_eq!(
            parsed.leaf().to_der().expect("DER"),
            leaf.to_der().expect("DER")
        );
        assert!(parsed.awaits_leaf_proof());
        assert!(parsed.revocation().is_none());
    }

    #[test]
    fn chain_without_document() {
        let root = test_util::self_signed("Root");
        let pem = root.cert.to_pem().expect("PEM");
        let pcn = ProofChainNotarization::parse(&pem).expect("Parsable.");
        assert_eq!(pcn.certificates().len(), 1);
        assert!(pcn.proofs().is_empty());
    }

    #[test]
    fn leaf_proof_is_prepended_once() {
        let root = test_util::self_signed("Root");
        let key = test_util::rsa_key();
        let leaf = test_util::issue("Alice", &key, &root);
        let mut pcn =
            ProofChainNotarization::new(vec![leaf, root.cert.clone()], vec![anchor_proof()])
                .expect("Valid chain.");
        let mut own = anchor_proof();
        own.height = 7;
        pcn.add_leaf_proof(own.clone()).expect("Missing exactly one proof.");
        assert!(pcn.is_complete());
        assert_eq!(pcn.proofs()[0], own);
        assert!(matches!(
            pcn.add_leaf_proof(own),
            Err(ParseError::ProofCount { .. })
        ));
    }

    #[test]
    fn malformed_inputs() {
        assert!(matches!(
            ProofChainNotarization::parse(b"{\"proofList\": []}"),
            Err(ParseError::EmptyChain)
        ));
        let root = test_util::self_signed("Root");
        let mut pem = root.cert.to_pem().expect("PEM");
        pem.extend_from_slice(b"{not json");
        assert!(matches!(
            ProofChainNotarization::parse(&pem),
            Err(ParseError::Json(_))
        ));
        let truncated = &root.cert.to_pem().expect("PEM")[..40];
        assert!(ProofChainNotarization::parse(truncated).is_err());
    }

    #[test]
    fn revocation_instruction() {
        let root = test_util::self_signed("Root");
        let alice_key = test_util::rsa_key();
        let alice = test_util::issue("Alice", &alice_key, &root);
        let bob_key = test_util::rsa_key();
        let bob = test_util::issue("Bob", &bob_key, &root);

        let instruction = RevocationInstruction::sign(&alice, &bob_key).expect("Signable.");
        assert!(instruction.message.starts_with(REVOKE_PREFIX));
        assert!(instruction.verify(&bob).expect("Supported key."));
        assert!(!instruction.verify(&alice).expect("Supported key."));
        assert_eq!(
            instruction.revoked_certificate().expect("Parsable.").to_der().expect("DER"),
            alice.to_der().expect("DER")
        );

        let mut tampered = instruction.clone();
        tampered.message.push(' ');
        assert!(!tampered.verify(&bob).expect("Supported key."));

        let mut pcn =
            ProofChainNotarization::new(vec![bob, root.cert.clone()], vec![anchor_proof()])
                .expect("Valid chain.");
        pcn.set_revocation(instruction.clone());
        let parsed = ProofChainNotarization::parse(&pcn.to_bytes().expect("Serializable."))
            .expect("Parsable.");
        assert_eq!(parsed.revocation(), Some(&instruction));
    }

    #[test]
    fn ed25519_signatures() {
        let key = openssl::pkey::PKey::generate_ed25519().expect("Key generation.");
        let signature = sign_message(&key, b"message").expect("Signable.");
        assert!(verify_message(&key, b"message", &signature).expect("Supported key."));
        assert!(!verify_message(&key, b"other", &signature).expect("Supported key."));
    }

    #[test]
    fn common_names_are_lowercased() {
        let root = test_util::self_signed("Root CA");
        assert_eq!(
            common_name(root.cert.subject_name()).expect("Has a CN."),
            "root ca"
        );
    }
}
