//! Publication of signed certificates and accepted revocations to the ledger.
//!
//! The batcher periodically commits one Merkle root over all signed
//! certificates awaiting publication, together with the accepted revocations.
//! The confirmation handler reacts to block events: certificates whose batch
//! root appears in the block become published and revocations found in the
//! block become final.
use super::{MarshalError, PermissionMarshal};
use crate::{
    async_trait,
    internal::unix_now,
    ledger::{timestamp_leaf, RevocationEntry},
    listener::BlockEventHandler,
    merkle::{MerkleHash, MerkleTree},
    pcn::{self, ProofChainNotarization},
    store::StoreError,
    types::*,
    workflow::{all_records, read_record, transition, write_record, CertificateRecord, WorkflowError},
};
use std::{collections::HashMap, future::Future};

#[derive(Debug, Clone)]
/// Outcome of a successful batch submission.
pub struct BatchReceipt {
    pub root:         MerkleHash,
    /// Leaves in the batch tree, including the timestamp leaf.
    pub leaf_count:   u64,
    pub certificates: Vec<Fingerprint>,
    pub revocations:  Vec<Fingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Records changed by a block.
pub struct ConfirmationSummary {
    /// Signed certificates that are now published.
    pub published:    Vec<Fingerprint>,
    /// Local revocations that are now final.
    pub revoked:      Vec<Fingerprint>,
    /// Revocations of certificates this marshal had never seen.
    pub materialized: Vec<Fingerprint>,
}

/// A certificate revoked by a block.
struct BlockRevocation {
    key:     Fingerprint,
    subject: String,
    issuer:  String,
    data:    Vec<u8>,
    pcn:     String,
}

impl BlockRevocation {
    fn from_pcn(pcn: &ProofChainNotarization) -> Result<Self, MarshalError> {
        let instruction = pcn
            .revocation()
            .ok_or_else(|| pcn::ParseError::Revocation("no revocation instruction".into()))?;
        let cert = instruction.revoked_certificate()?;
        Ok(Self {
            key:     Fingerprint::of_certificate(&cert)?,
            subject: pcn::common_name(cert.subject_name())?,
            issuer:  pcn::common_name(cert.issuer_name())?,
            data:    cert.to_der()?,
            pcn:     pcn.to_text()?,
        })
    }
}

impl PermissionMarshal {
    /// Run one batching cycle. Returns [`None`] if nothing was waiting.
    ///
    /// Nothing is written locally unless the ledger accepted the submission.
    pub async fn publish_batch(&self) -> Result<Option<BatchReceipt>, MarshalError> {
        let now = unix_now();
        let timeout = self.config.resubmit_after.as_secs() as i64;
        let (certificates, revocations) = self.store.database().view(|tx| {
            let mut certificates = Vec::new();
            let mut revocations = Vec::new();
            for (key, record) in all_records(tx)? {
                if record.has_pending_submission(now, timeout) {
                    continue;
                }
                match record.status {
                    Status::Signed => certificates.push((key, record)),
                    Status::Revoked => revocations.push((key, record)),
                    _ => {}
                }
            }
            Ok::<_, StoreError>((certificates, revocations))
        })?;
        if certificates.is_empty() && revocations.is_empty() {
            return Ok(None);
        }

        let mut tree = MerkleTree::build(certificates.iter().map(|(_, r)| &r.data));
        tree.push(&timestamp_leaf(now));
        let mut entries = Vec::with_capacity(revocations.len());
        let mut revoked_keys = Vec::with_capacity(revocations.len());
        for (key, record) in &revocations {
            match &record.publication_proof {
                Some(proof) => {
                    entries.push(RevocationEntry {
                        cert_data:         record.data.clone(),
                        publication_proof: proof.clone(),
                        pcn:               record.revocation_pcn.clone(),
                    });
                    revoked_keys.push(*key);
                }
                None => tracing::warn!(
                    target: "gpchain_batcher",
                    "Revoked record {key} has no publication proof, leaving it out."
                ),
            }
        }
        let root = tree.root();
        if let Err(e) = self.ledger.publish(&root, &entries, now).await {
            tracing::warn!(
                target: "gpchain_batcher",
                "Submission of batch {root} with {} certificates and {} revocations failed: {e}",
                certificates.len(),
                entries.len()
            );
            return Err(e.into());
        }

        let certificate_keys = self.store.database().update(|tx| {
            let mut written = Vec::with_capacity(certificates.len());
            for (i, (key, snapshot)) in certificates.iter().enumerate() {
                let Some(mut record) = read_record(&*tx, &snapshot.from, key)? else {
                    continue;
                };
                if record.status != Status::Signed {
                    tracing::debug!(
                        target: "gpchain_batcher",
                        "Record {key} moved to {} during submission.",
                        record.status
                    );
                    continue;
                }
                record.publication_proof = tree.validation_info(i as u64);
                record.submitted_at = Some(now);
                write_record(tx, key, &record)?;
                written.push(*key);
            }
            for key in &revoked_keys {
                if let Some((_, snapshot)) = revocations.iter().find(|(k, _)| k == key) {
                    if let Some(mut record) = read_record(&*tx, &snapshot.from, key)? {
                        if record.status == Status::Revoked {
                            record.submitted_at = Some(now);
                            write_record(tx, key, &record)?;
                        }
                    }
                }
            }
            Ok::<_, StoreError>(written)
        })?;
        tracing::info!(
            target: "gpchain_batcher",
            "Submitted batch {root} with {} certificates and {} revocations.",
            certificate_keys.len(),
            revoked_keys.len()
        );
        Ok(Some(BatchReceipt {
            root,
            leaf_count: tree.leaf_count(),
            certificates: certificate_keys,
            revocations: revoked_keys,
        }))
    }

    /// Run the batcher every configured interval until `stop` resolves. A
    /// cycle in progress when `stop` resolves is completed first.
    pub async fn run_batcher(&self, stop: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.config.batch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = interval.tick() => {}
            }
            match self.publish_batch().await {
                Ok(Some(_)) => {}
                Ok(None) => tracing::trace!(target: "gpchain_batcher", "Nothing to publish."),
                Err(e) => tracing::error!(target: "gpchain_batcher", "Batching cycle failed: {e}"),
            }
        }
        tracing::info!(target: "gpchain_batcher", "Terminating the batcher.");
    }

    /// Reconcile the local records with ledger block `block_number`.
    pub async fn confirm_block(&self, block_number: u64) -> Result<ConfirmationSummary, MarshalError> {
        let Some(relay_index) = block_number.checked_sub(self.config.block_offset) else {
            return Ok(ConfirmationSummary::default());
        };
        let block = self.ledger.query_block(block_number).await?;
        let published = block.published_roots();
        if published.is_empty() {
            return Ok(ConfirmationSummary::default());
        }
        let tree = MerkleTree::build(published.iter().map(|p| p.root));
        let mut positions = HashMap::new();
        for (i, p) in published.iter().enumerate() {
            positions.entry(p.root).or_insert(i as u64);
        }
        let mut revocations = Vec::new();
        for pcn in published.iter().flat_map(|p| p.revocations.iter()) {
            match BlockRevocation::from_pcn(pcn) {
                Ok(r) => revocations.push(r),
                Err(e) => tracing::warn!(
                    target: "gpchain_confirm",
                    "Skipping malformed revocation in block {block_number}: {e}"
                ),
            }
        }

        let summary = self.store.database().update(|tx| {
            let mut summary = ConfirmationSummary::default();
            let records = all_records(&*tx)?;
            for (key, mut record) in records.clone() {
                if record.status != Status::Signed {
                    continue;
                }
                let Some(root) = record.publication_proof.as_ref().and_then(|p| p.merkle_root) else {
                    continue;
                };
                let Some(&index) = positions.get(&root) else {
                    continue;
                };
                let Some(mut confirmation) = tree.validation_info(index) else {
                    continue;
                };
                confirmation.height = relay_index as i64;
                let extended = ProofChainNotarization::parse(record.pcn.as_bytes()).and_then(|mut pcn| {
                    pcn.add_leaf_proof(confirmation.clone())?;
                    pcn.to_text()
                });
                let text = match extended {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(target: "gpchain_confirm", "Cannot extend the PCN of {key}: {e}");
                        continue;
                    }
                };
                transition(&mut record, Status::Published)?;
                record.pcn = text;
                if let Some(proof) = record.publication_proof.as_mut() {
                    proof.height = block_number as i64;
                }
                record.confirmation_proof = Some(confirmation);
                record.submitted_at = None;
                write_record(tx, &key, &record)?;
                summary.published.push(key);
            }
            for revocation in &revocations {
                match records.get(&revocation.key) {
                    Some(record) if record.status == Status::Revoked => {
                        let mut record = record.clone();
                        transition(&mut record, Status::RevokedPublished)?;
                        record.submitted_at = None;
                        write_record(tx, &revocation.key, &record)?;
                        summary.revoked.push(revocation.key);
                    }
                    Some(record) if record.status == Status::RevokedPublished => {}
                    Some(record) => tracing::warn!(
                        target: "gpchain_confirm",
                        "Block {block_number} revokes {} which is {} locally.",
                        revocation.key,
                        record.status
                    ),
                    None => {
                        let mut record = CertificateRecord::new(
                            revocation.data.clone(),
                            &revocation.issuer,
                            &revocation.subject,
                        );
                        record.status = Status::RevokedPublished;
                        record.revocation_pcn = revocation.pcn.clone();
                        write_record(tx, &revocation.key, &record)?;
                        summary.materialized.push(revocation.key);
                    }
                }
            }
            Ok::<_, WorkflowError>(summary)
        })?;
        if summary != ConfirmationSummary::default() {
            tracing::info!(
                target: "gpchain_confirm",
                "Block {block_number}: {} published, {} revoked, {} learned revocations.",
                summary.published.len(),
                summary.revoked.len(),
                summary.materialized.len()
            );
        }
        Ok(summary)
    }
}

#[async_trait]
impl BlockEventHandler for PermissionMarshal {
    type Error = MarshalError;

    async fn on_block(&self, block_number: u64) -> Result<(), MarshalError> {
        self.confirm_block(block_number).await.map(|_| ())
    }
}
