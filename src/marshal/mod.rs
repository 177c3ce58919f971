//! The Permission Marshal: certificate requests, issuance and revocation
//! recorded locally and anchored in the ledger.
//!
//! Requests are handled by [`PermissionMarshal`]. The periodic batcher and
//! the block confirmation handler live in [`publication`].
//!
//! Policy and ledger calls are made before the store transaction that applies
//! their outcome, so that no store lock is held while waiting on either.
use crate::{
    ledger::{LedgerError, LedgerSession},
    pcn::{self, ParseError, ProofChainNotarization},
    policy::{PolicyDecision, PolicyError, PolicyEvaluator},
    store::StoreError,
    types::*,
    workflow::{
        revoked_in, CertificateRecord, StateTransitionViolation, WorkflowError, WorkflowStore,
    },
};
use openssl::x509::{X509Req, X509};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

pub mod publication;

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Denied by policy: {reason}")]
    PolicyDenied { reason: String },
    #[error(transparent)]
    StateTransition(#[from] StateTransitionViolation),
    #[error("No record {fingerprint} for identity {identity}.")]
    UnknownRecord {
        identity:    String,
        fingerprint: Fingerprint,
    },
    #[error("Merkle verification failed: {0}")]
    MerkleVerification(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Certificate {0} is revoked.")]
    Revoked(Fingerprint),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Policy evaluator error: {0}")]
    Policy(#[from] PolicyError),
}

impl From<WorkflowError> for MarshalError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::Storage(e) => Self::Storage(e),
            WorkflowError::StateTransition(e) => Self::StateTransition(e),
            WorkflowError::UnknownRecord {
                identity,
                fingerprint,
            } => Self::UnknownRecord {
                identity,
                fingerprint,
            },
            WorkflowError::Revoked(key) => Self::Revoked(key),
            WorkflowError::Parse(e) => Self::Parse(e),
        }
    }
}

impl From<openssl::error::ErrorStack> for MarshalError {
    fn from(e: openssl::error::ErrorStack) -> Self { Self::Parse(e.into()) }
}

impl MarshalError {
    /// Whether the error points at forged or corrupted proof material rather
    /// than an ordinary failure.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            MarshalError::MerkleVerification(_) | MarshalError::InvalidSignature(_)
        )
    }
}

/// Configuration of a [`PermissionMarshal`].
#[derive(Debug, Clone)]
pub struct MarshalConfig {
    batch_interval: Duration,
    resubmit_after: Duration,
    block_offset:   u64,
}

impl Default for MarshalConfig {
    fn default() -> Self { Self::new() }
}

impl MarshalConfig {
    /// Batches every 5 seconds, resubmission after 60 seconds without
    /// confirmation, and the default block offset.
    pub fn new() -> Self {
        Self {
            batch_interval: crate::constants::DEFAULT_BATCH_INTERVAL,
            resubmit_after: Duration::from_secs(60),
            block_offset:   crate::constants::BLOCK_OFFSET,
        }
    }

    pub fn set_batch_interval(self, batch_interval: Duration) -> Self {
        Self {
            batch_interval,
            ..self
        }
    }

    /// A submitted record that has not been confirmed after this long is
    /// included in the next batch again.
    pub fn set_resubmit_after(self, resubmit_after: Duration) -> Self {
        Self {
            resubmit_after,
            ..self
        }
    }

    /// Difference between a ledger block number and the index of the relay
    /// block derived from it.
    pub fn set_block_offset(self, block_offset: u64) -> Self {
        Self {
            block_offset,
            ..self
        }
    }

    pub fn batch_interval(&self) -> Duration { self.batch_interval }

    pub fn resubmit_after(&self) -> Duration { self.resubmit_after }

    pub fn block_offset(&self) -> u64 { self.block_offset }
}

/// A record together with its key.
pub type RecordEntry = (Fingerprint, CertificateRecord);

pub struct PermissionMarshal {
    ledger: Arc<LedgerSession>,
    store:  WorkflowStore,
    policy: Arc<dyn PolicyEvaluator>,
    config: MarshalConfig,
}

impl PermissionMarshal {
    pub fn new(
        ledger: Arc<LedgerSession>,
        store: WorkflowStore,
        policy: Arc<dyn PolicyEvaluator>,
        config: MarshalConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            policy,
            config,
        }
    }

    pub fn store(&self) -> &WorkflowStore { &self.store }

    pub fn config(&self) -> &MarshalConfig { &self.config }

    /// Record a certification request from `from` addressed to the signer
    /// `to`. Returns the request's fingerprint.
    pub fn new_request(&self, csr_pem: &[u8], to: &str, from: &str) -> Result<Fingerprint, MarshalError> {
        let request = X509Req::from_pem(csr_pem)?;
        if !request.verify(&*request.public_key()?)? {
            return Err(MarshalError::InvalidSignature(
                "the request is not signed by its own key".into(),
            ));
        }
        let key = Fingerprint::of_request(&request)?;
        let record = CertificateRecord::new(request.to_der()?, to, from);
        self.store.create(key, &record)?;
        tracing::info!(
            target: "gpchain_marshal",
            "New request {key} from {} to {}.",
            record.from,
            record.to
        );
        Ok(key)
    }

    /// Accept a certificate issued for a pending request. The PCN's leaf is
    /// the new certificate and the next certificate its signer, which must be
    /// allowed by policy and not revoked.
    pub async fn accept_sign(&self, pcn_bytes: &[u8]) -> Result<Fingerprint, MarshalError> {
        let pcn = ProofChainNotarization::parse(pcn_bytes)?;
        if pcn.certificates().len() < 2 {
            return Err(ParseError::ShortChain(2).into());
        }
        if !pcn.awaits_leaf_proof() {
            return Err(ParseError::ProofCount {
                certificates: pcn.certificates().len(),
                proofs:       pcn.proofs().len(),
            }
            .into());
        }
        let leaf = pcn.leaf();
        let signer = &pcn.certificates()[1];
        if !leaf.verify(&*signer.public_key()?)? {
            return Err(MarshalError::InvalidSignature(
                "the certificate was not issued by the next certificate in the chain".into(),
            ));
        }
        self.require_allowed(&pcn.certificates()[1..]).await?;

        let key = Fingerprint::of_certificate(leaf)?;
        let signer_key = Fingerprint::of_certificate(signer)?;
        let signer_id = pcn::common_name(signer.subject_name())?;
        let subject_id = pcn::common_name(leaf.subject_name())?;
        let data = leaf.to_der()?;
        let text = pcn.to_text()?;
        let record = self.store.advance(&signer_id, &key, Status::Signed, |tx, record| {
            check_parties(record, &key, &signer_id, &subject_id)?;
            if revoked_in(tx, &signer_key)? {
                return Err(WorkflowError::Revoked(signer_key));
            }
            record.data = data;
            record.pcn = text;
            Ok(())
        })?;
        tracing::info!(target: "gpchain_marshal", "Signed {key} for {}.", record.from);
        Ok(key)
    }

    /// The subject asks for its published certificate to be revoked.
    pub fn mark_for_revocation(&self, cert_pem: &[u8]) -> Result<Fingerprint, MarshalError> {
        let cert = pcn::certificate_from_pem(cert_pem)?;
        let key = Fingerprint::of_certificate(&cert)?;
        let subject_id = pcn::common_name(cert.subject_name())?;
        let data = cert.to_der()?;
        self.store
            .advance(&subject_id, &key, Status::RevokedPending, |_, record| {
                if record.data != data {
                    return Err(ParseError::Revocation(
                        "the certificate differs from the stored one".into(),
                    )
                    .into());
                }
                Ok(())
            })?;
        tracing::info!(target: "gpchain_marshal", "Revocation of {key} requested by {subject_id}.");
        Ok(key)
    }

    /// Accept a revocation signed by the leaf of `pcn_bytes`. The PCN must
    /// carry a revocation instruction naming `revoked_pem`.
    pub async fn accept_revocation(
        &self,
        pcn_bytes: &[u8],
        revoked_pem: &[u8],
    ) -> Result<Fingerprint, MarshalError> {
        let revoked = pcn::certificate_from_pem(revoked_pem)?;
        let pcn = ProofChainNotarization::parse(pcn_bytes)?;
        let instruction = pcn
            .revocation()
            .ok_or_else(|| ParseError::Revocation("no revocation instruction".into()))?;
        if instruction.revoked_certificate()?.to_der()? != revoked.to_der()? {
            return Err(ParseError::Revocation(
                "the instruction names a different certificate".into(),
            )
            .into());
        }
        let revoker = pcn.leaf();
        let mut chain: Vec<X509> = vec![revoked.clone()];
        chain.extend(pcn.certificates().iter().cloned());
        self.require_allowed(&chain).await?;
        if !instruction.verify(revoker)? {
            tracing::warn!(
                target: "gpchain_security",
                "Revocation instruction with an invalid signature from {}.",
                pcn::common_name(revoker.subject_name()).unwrap_or_default()
            );
            return Err(MarshalError::InvalidSignature(
                "the revocation instruction is not signed by the revoker".into(),
            ));
        }
        let revoker_key = Fingerprint::of_certificate(revoker)?;
        if self.store.is_revoked(&revoker_key)? {
            return Err(MarshalError::Revoked(revoker_key));
        }

        let key = Fingerprint::of_certificate(&revoked)?;
        let subject_id = pcn::common_name(revoked.subject_name())?;
        let record = self.store.get(&subject_id, &key)?.ok_or_else(|| MarshalError::UnknownRecord {
            identity:    subject_id.clone(),
            fingerprint: key,
        })?;
        if record.status != Status::RevokedPending {
            return Err(StateTransitionViolation {
                current:   Some(record.status),
                requested: Status::Revoked,
            }
            .into());
        }
        self.verify_published(&key, &record).await?;

        let text = pcn.to_text()?;
        let data = revoked.to_der()?;
        self.store.advance(&subject_id, &key, Status::Revoked, |tx, record| {
            if record.data != data {
                return Err(ParseError::Revocation(
                    "the certificate differs from the stored one".into(),
                )
                .into());
            }
            if revoked_in(tx, &revoker_key)? {
                return Err(WorkflowError::Revoked(revoker_key));
            }
            record.revocation_pcn = text;
            record.submitted_at = None;
            Ok(())
        })?;
        tracing::info!(
            target: "gpchain_marshal",
            "Revocation of {key} accepted from {}.",
            pcn::common_name(revoker.subject_name())?
        );
        Ok(key)
    }

    /// Check, against the block it claims to be in, that the record's
    /// certificate was published.
    async fn verify_published(&self, key: &Fingerprint, record: &CertificateRecord) -> Result<(), MarshalError> {
        let fail = |reason: String| {
            tracing::error!(target: "gpchain_security", "Publication proof of {key} rejected: {reason}");
            MarshalError::MerkleVerification(reason)
        };
        let proof = record
            .publication_proof
            .as_ref()
            .ok_or_else(|| fail("no publication proof".into()))?;
        let number = proof
            .block_number()
            .ok_or_else(|| fail("publication is not confirmed".into()))?;
        let root = proof.merkle_root.ok_or_else(|| fail("proof has no root".into()))?;
        let height = self.ledger.chain_height().await?;
        if number >= height {
            return Err(fail(format!("block {number} is beyond the chain height {height}")));
        }
        let block = self.ledger.query_block(number).await?;
        if !block.published_roots().iter().any(|p| p.root == root) {
            return Err(fail(format!("block {number} does not commit root {root}")));
        }
        if !proof.verify(&record.data) {
            return Err(fail(format!("certificate is not a leaf of {root}")));
        }
        Ok(())
    }

    async fn require_allowed(&self, chain: &[X509]) -> Result<(), MarshalError> {
        match self.policy.evaluate(chain).await? {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny { reason } => {
                tracing::info!(target: "gpchain_marshal", "Policy denied: {reason}");
                Err(MarshalError::PolicyDenied { reason })
            }
        }
    }

    /// Records where `identity` plays `role`, restricted to `statuses`.
    pub fn query(&self, identity: &str, role: Role, statuses: &[Status]) -> Result<Vec<RecordEntry>, MarshalError> {
        Ok(self.store.query(identity, role, statuses)?)
    }

    /// Requests waiting for `identity` to sign them.
    pub fn to_sign(&self, identity: &str) -> Result<Vec<RecordEntry>, MarshalError> {
        self.query(identity, Role::Signer, &[Status::Created])
    }

    /// Certificates `identity` has issued that are not revoked.
    pub fn signed(&self, identity: &str) -> Result<Vec<RecordEntry>, MarshalError> {
        self.query(identity, Role::Signer, &[Status::Signed, Status::Published])
    }

    /// Requests made by `identity`, leaving out revocations still in progress.
    pub fn my_requests(&self, identity: &str) -> Result<Vec<RecordEntry>, MarshalError> {
        self.query(identity, Role::Requester, &[
            Status::Created,
            Status::Signed,
            Status::Published,
            Status::RevokedPublished,
        ])
    }

    /// Revocation requests against certificates `identity` has issued.
    pub fn pending_revocations(&self, identity: &str) -> Result<Vec<RecordEntry>, MarshalError> {
        self.query(identity, Role::Signer, &[Status::RevokedPending])
    }

    /// Attribute names the policy book can refer to.
    pub async fn attributes(&self) -> Result<Vec<String>, MarshalError> {
        Ok(self.policy.list_attributes().await?)
    }
}

fn check_parties(
    record: &CertificateRecord,
    key: &Fingerprint,
    signer_id: &str,
    subject_id: &str,
) -> Result<(), WorkflowError> {
    if record.to != signer_id || record.from != subject_id {
        return Err(WorkflowError::UnknownRecord {
            identity:    signer_id.to_owned(),
            fingerprint: *key,
        });
    }
    Ok(())
}
