//! Snapshot replication engine: GitHub-backed durability for the local store.
//!
//! Flow: mutation -> local write (under the backup lock) -> trigger policy ->
//! snapshot encode -> remote put (CAS) -> pointer update. Startup runs the
//! recovery protocol once before any write traffic.

pub mod coordinator;
pub mod pointer;
pub mod policy;
pub mod recovery;
pub mod remote;
pub mod snapshot;

pub use coordinator::{BackupCoordinator, BackupStats, PushOutcome};
pub use policy::WriteKind;
pub use recovery::{RecoveryOutcome, SnapshotKind};
pub use remote::{RemoteBlobRef, RemoteError, RemoteRepo};
