use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Lifecycle state of a certificate record. States only move forward, one
/// step at a time, in declaration order.
pub enum Status {
    /// A certification request was submitted to the signer.
    Created,
    /// The signer issued the certificate.
    Signed,
    /// The certificate was confirmed in a ledger block.
    Published,
    /// The subject asked for revocation.
    RevokedPending,
    /// A revoker authorized the revocation.
    Revoked,
    /// The revocation was confirmed in a ledger block.
    RevokedPublished,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Created,
        Status::Signed,
        Status::Published,
        Status::RevokedPending,
        Status::Revoked,
        Status::RevokedPublished,
    ];

    /// The only state this one may move to, if any.
    pub fn successor(self) -> Option<Status> {
        match self {
            Status::Created => Some(Status::Signed),
            Status::Signed => Some(Status::Published),
            Status::Published => Some(Status::RevokedPending),
            Status::RevokedPending => Some(Status::Revoked),
            Status::Revoked => Some(Status::RevokedPublished),
            Status::RevokedPublished => None,
        }
    }

    pub fn can_transition_to(self, next: Status) -> bool { self.successor() == Some(next) }

    /// Whether the certificate is, or is about to be, revoked.
    pub fn is_revocation(self) -> bool {
        matches!(self, Status::Revoked | Status::RevokedPublished)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Created => "CREATED",
            Status::Signed => "SIGNED",
            Status::Published => "PUBLISHED",
            Status::RevokedPending => "REVOKED_PENDING",
            Status::Revoked => "REVOKED",
            Status::RevokedPublished => "REVOKED_PUBLISHED",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
/// Side of a record an identity is querying from.
pub enum Role {
    /// The identity is the record's signer (`to`).
    Signer,
    /// The identity is the record's requester (`from`).
    Requester,
}
