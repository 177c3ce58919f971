//! A library anchoring a certificate issuance and revocation workflow to an
//! append-only ledger, and deriving from that ledger a compact revocation feed
//! for light clients. The library is structured around multiple modules.
//!
//! - [`merkle`] is the append-only Merkle tree shared by every other module:
//!   batch trees, block-level trees and inclusion proofs.
//! - [`pcn`] parses and serializes Proof Chain Notarizations, a certificate
//!   delegation chain bundled with its accumulated Merkle proofs.
//! - [`store`] and [`workflow`] hold the Permission Marshal's local state, one
//!   bucket per identity, and the certificate lifecycle state machine.
//! - [`marshal`] contains the [`PermissionMarshal`](marshal::PermissionMarshal)
//!   request path, the periodic batcher that publishes to the ledger and the
//!   block confirmation handler.
//! - [`relay`] derives the hash-chained relay blocks and bloom filters
//!   consumed by light clients, including safe catch-up after missed events.
//!
//! The ledger, the policy evaluator and the message bus are external
//! collaborators modelled by the traits in [`ledger`], [`policy`] and
//! [`relay::publisher`].

/// Various constants that apply to the ledger contract and the relay.
pub mod constants;
mod internal;
/// Block event listener with bounded registration retry.
pub mod listener;
pub mod ledger;
pub mod marshal;
pub mod merkle;
pub mod pcn;
pub mod policy;
pub mod relay;
pub mod store;
/// Type definitions used throughout the rest of the library.
pub mod types;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_util;

pub use tonic::async_trait;
