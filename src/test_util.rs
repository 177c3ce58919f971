//! Certificate fixtures and collaborator stubs shared by the unit tests.
use crate::{
    async_trait,
    policy::{PolicyDecision, PolicyError, PolicyEvaluator},
};
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Private},
    rsa::Rsa,
    x509::{X509Name, X509Req, X509},
};
use std::sync::Mutex;

pub(crate) struct TestIdentity {
    pub key:  PKey<Private>,
    pub cert: X509,
}

pub(crate) fn rsa_key() -> PKey<Private> {
    let rsa = Rsa::generate(2048).expect("RSA key generation.");
    PKey::from_rsa(rsa).expect("Valid RSA key.")
}

fn name(cn: &str) -> X509Name {
    let mut builder = X509Name::builder().expect("Name builder.");
    builder.append_entry_by_nid(Nid::COMMONNAME, cn).expect("Valid CN.");
    builder.build()
}

fn certificate(
    cn: &str,
    subject_key: &PKeyRef<Private>,
    issuer_name: &X509Name,
    issuer_key: &PKeyRef<Private>,
) -> X509 {
    let mut builder = X509::builder().expect("Certificate builder.");
    builder.set_version(2).expect("Version.");
    let mut serial = BigNum::new().expect("BigNum.");
    serial.rand(128, MsbOption::MAYBE_ZERO, false).expect("Random serial.");
    builder
        .set_serial_number(&serial.to_asn1_integer().expect("Serial."))
        .expect("Serial.");
    builder.set_subject_name(&name(cn)).expect("Subject.");
    builder.set_issuer_name(issuer_name).expect("Issuer.");
    builder.set_not_before(&Asn1Time::days_from_now(0).expect("Time.")).expect("Validity.");
    builder.set_not_after(&Asn1Time::days_from_now(365).expect("Time.")).expect("Validity.");
    builder.set_pubkey(subject_key).expect("Public key.");
    builder.sign(issuer_key, MessageDigest::sha256()).expect("Signature.");
    builder.build()
}

/// A self-signed trust anchor.
pub(crate) fn self_signed(cn: &str) -> TestIdentity {
    let key = rsa_key();
    let cert = certificate(cn, &key, &name(cn), &key);
    TestIdentity { key, cert }
}

/// A certificate for `subject_key` issued by `issuer`.
pub(crate) fn issue(cn: &str, subject_key: &PKeyRef<Private>, issuer: &TestIdentity) -> X509 {
    let issuer_name = issuer.cert.subject_name().to_owned().expect("Issuer name.");
    certificate(cn, subject_key, &issuer_name, &issuer.key)
}

/// A fresh key with a certificate issued by `issuer`.
pub(crate) fn identity(cn: &str, issuer: &TestIdentity) -> TestIdentity {
    let key = rsa_key();
    let cert = issue(cn, &key, issuer);
    TestIdentity { key, cert }
}

pub(crate) fn request(cn: &str, key: &PKeyRef<Private>) -> X509Req {
    let mut builder = X509Req::builder().expect("Request builder.");
    builder.set_subject_name(&name(cn)).expect("Subject.");
    builder.set_pubkey(key).expect("Public key.");
    builder.sign(key, MessageDigest::sha256()).expect("Signature.");
    builder.build()
}

/// Policy stub returning a fixed decision and recording chain lengths.
pub(crate) struct StaticPolicy {
    decision:  PolicyDecision,
    pub calls: Mutex<Vec<usize>>,
}

impl StaticPolicy {
    pub fn allow() -> Self {
        Self {
            decision: PolicyDecision::Allow,
            calls:    Mutex::new(Vec::new()),
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            decision: PolicyDecision::Deny {
                reason: reason.into(),
            },
            calls:    Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticPolicy {
    async fn evaluate(&self, chain: &[X509]) -> Result<PolicyDecision, PolicyError> {
        self.calls.lock().expect("Not poisoned.").push(chain.len());
        Ok(self.decision.clone())
    }

    async fn list_attributes(&self) -> Result<Vec<String>, PolicyError> {
        Ok(vec!["role".into(), "department".into()])
    }
}
