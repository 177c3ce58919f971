//! Certificate records and their lifecycle, persisted per identity.
//!
//! Every record is stored under its [`Fingerprint`] in two buckets, one named
//! after the requester (`from`) and one after the signer (`to`), and both
//! copies are always written in the same transaction.
use crate::{
    pcn::ParseError,
    store::{BucketRead, Database, StoreError, Transaction},
    types::*,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// DER encoding of the request while [`Status::Created`], of the
    /// certificate afterwards.
    #[serde(with = "crate::internal::byte_array_hex")]
    pub data:               Vec<u8>,
    /// Lowercased common name of the signer.
    pub to:                 String,
    /// Lowercased common name of the requester.
    pub from:               String,
    pub status:             Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_proof:  Option<ValidationInfo>,
    /// Proof of the batch root inside the block that confirmed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_proof: Option<ValidationInfo>,
    /// Serialized Proof Chain Notarization, empty until signed.
    #[serde(default)]
    pub pcn:                String,
    /// PCN of the revoker, carrying the signed revocation instruction.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revocation_pcn:     String,
    /// Unix time of the last submission to the ledger that has not been
    /// confirmed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at:       Option<i64>,
}

impl CertificateRecord {
    pub fn new(data: Vec<u8>, to: &str, from: &str) -> Self {
        Self {
            data,
            to: to.to_lowercase(),
            from: from.to_lowercase(),
            status: Status::Created,
            publication_proof: None,
            confirmation_proof: None,
            pcn: String::new(),
            revocation_pcn: String::new(),
            submitted_at: None,
        }
    }

    /// Whether a ledger submission is in flight and younger than `timeout`
    /// seconds at time `now`.
    pub fn has_pending_submission(&self, now: i64, timeout: i64) -> bool {
        matches!(self.submitted_at, Some(t) if now - t < timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An operation required a state the record is not in.
pub struct StateTransitionViolation {
    /// Current state, [`None`] if the record does not exist.
    pub current:   Option<Status>,
    pub requested: Status,
}

impl std::fmt::Display for StateTransitionViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.current {
            Some(current) => write!(f, "Cannot move a record from {} to {}.", current, self.requested),
            None => write!(f, "Cannot move a missing record to {}.", self.requested),
        }
    }
}

impl std::error::Error for StateTransitionViolation {}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    StateTransition(#[from] StateTransitionViolation),
    #[error("No record {fingerprint} for identity {identity}.")]
    UnknownRecord {
        identity:    String,
        fingerprint: Fingerprint,
    },
    #[error("Certificate {0} is revoked.")]
    Revoked(Fingerprint),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Decode the record stored under `key` in `bucket`.
pub fn read_record(
    tx: &impl BucketRead,
    bucket: &str,
    key: &Fingerprint,
) -> Result<Option<CertificateRecord>, StoreError> {
    match tx.get(bucket, key.as_ref())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Write the record into the buckets of both parties.
pub fn write_record(
    tx: &mut Transaction<'_>,
    key: &Fingerprint,
    record: &CertificateRecord,
) -> Result<(), StoreError> {
    let value = serde_json::to_vec(record)?;
    tx.put(&record.from, key.as_ref(), value.clone())?;
    if record.to != record.from {
        tx.put(&record.to, key.as_ref(), value)?;
    }
    Ok(())
}

/// Move the record one step forward, rejecting anything else.
pub fn transition(record: &mut CertificateRecord, next: Status) -> Result<(), StateTransitionViolation> {
    if !record.status.can_transition_to(next) {
        return Err(StateTransitionViolation {
            current:   Some(record.status),
            requested: next,
        });
    }
    record.status = next;
    Ok(())
}

/// Whether any bucket holds the fingerprint as revoked or about to be.
pub fn revoked_in(tx: &impl BucketRead, key: &Fingerprint) -> Result<bool, StoreError> {
    for (_, value) in tx.find(key.as_ref())? {
        let record: CertificateRecord = serde_json::from_slice(&value)?;
        if record.status.is_revocation() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every distinct record in the store, keyed by fingerprint.
pub fn all_records(tx: &impl BucketRead) -> Result<BTreeMap<Fingerprint, CertificateRecord>, StoreError> {
    let mut records = BTreeMap::new();
    for bucket in tx.bucket_names()? {
        for (key, value) in tx.entries(&bucket)? {
            let bytes: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Codec(format!("malformed key in bucket {}", bucket)))?;
            let fingerprint = Fingerprint::from(bytes);
            if !records.contains_key(&fingerprint) {
                records.insert(fingerprint, serde_json::from_slice(&value)?);
            }
        }
    }
    Ok(records)
}

/// The workflow state of a Permission Marshal.
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self { Self { db } }

    pub fn database(&self) -> &Database { &self.db }

    /// Store a new record in [`Status::Created`]. Fails if a record with the
    /// same fingerprint already exists in either party's bucket.
    pub fn create(&self, key: Fingerprint, record: &CertificateRecord) -> Result<(), WorkflowError> {
        self.db.update(|tx| {
            for bucket in [&record.from, &record.to] {
                if let Some(existing) = read_record(&*tx, bucket, &key)? {
                    return Err(StateTransitionViolation {
                        current:   Some(existing.status),
                        requested: Status::Created,
                    }
                    .into());
                }
            }
            write_record(tx, &key, record)?;
            Ok(())
        })
    }

    pub fn get(&self, identity: &str, key: &Fingerprint) -> Result<Option<CertificateRecord>, WorkflowError> {
        Ok(self.db.view(|tx| read_record(tx, &identity.to_lowercase(), key))?)
    }

    /// Advance the record found in `identity`'s bucket to `next`, apply
    /// `modify` and write both copies, all in one transaction. `modify` can
    /// read the rest of the store as of the same transaction.
    pub fn advance(
        &self,
        identity: &str,
        key: &Fingerprint,
        next: Status,
        modify: impl FnOnce(&Transaction<'_>, &mut CertificateRecord) -> Result<(), WorkflowError>,
    ) -> Result<CertificateRecord, WorkflowError> {
        let bucket = identity.to_lowercase();
        self.db.update(|tx| {
            let mut record = read_record(&*tx, &bucket, key)?.ok_or_else(|| {
                WorkflowError::UnknownRecord {
                    identity:    bucket.clone(),
                    fingerprint: *key,
                }
            })?;
            transition(&mut record, next)?;
            modify(&*tx, &mut record)?;
            write_record(tx, key, &record)?;
            Ok(record)
        })
    }

    /// Records where `identity` plays `role`, restricted to `statuses`.
    pub fn query(
        &self,
        identity: &str,
        role: Role,
        statuses: &[Status],
    ) -> Result<Vec<(Fingerprint, CertificateRecord)>, WorkflowError> {
        let identity = identity.to_lowercase();
        let matches = self.db.view(|tx| {
            let mut out = Vec::new();
            for (key, value) in tx.entries(&identity)? {
                let record: CertificateRecord = serde_json::from_slice(&value).map_err(StoreError::from)?;
                let party = match role {
                    Role::Signer => &record.to,
                    Role::Requester => &record.from,
                };
                if *party != identity || !statuses.contains(&record.status) {
                    continue;
                }
                let bytes: [u8; 32] = key
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Codec(format!("malformed key in bucket {}", identity)))?;
                out.push((Fingerprint::from(bytes), record));
            }
            Ok::<_, StoreError>(out)
        })?;
        Ok(matches)
    }

    /// Whether the store knows the fingerprint as revoked or about to be.
    pub fn is_revoked(&self, key: &Fingerprint) -> Result<bool, WorkflowError> {
        Ok(self.db.view(|tx| revoked_in(tx, key))?)
    }
}
