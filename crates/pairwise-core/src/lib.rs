//! Pairwise session subsystem.
//!
//! Key management and session lifecycle for end-to-end encrypted messaging
//! between two devices that are never required to be online at the same time.
//! Cryptographic primitives live in [`pairwise_crypto`]; this crate owns
//! everything stateful around them.
//!
//! # Architecture
//!
//! ```text
//!                ┌───────────────┐
//!                │ MessageCipher │ ◄── Inbox (transport records)
//!                └──────┬────────┘
//!                       │ per-peer lock
//!                ┌──────▼──────────┐
//!                │ SessionProtocol │ ──► KeyDirectory (publish / fetch / claim)
//!                └──┬───────────┬──┘
//!                   │           │
//!            ┌──────▼───┐  ┌────▼─────────┐
//!            │ KeyStore │  │ SessionStore │
//!            └──────┬───┘  └────┬─────────┘
//!                   └─────┬─────┘
//!                    ┌────▼────┐
//!                    │ Storage │  memory / redb / chaotic
//!                    └─────────┘
//! ```
//!
//! # Components
//!
//! - [`KeyStore`]: identity, signed prekey and one-time prekey pool
//! - [`KeyDirectory`]: shared directory of public bundles
//! - [`SessionStore`]: sessions and trust entries per [`PeerAddress`]
//! - [`SessionProtocol`]: initiator and responder handshakes
//! - [`MessageCipher`]: encrypt/decrypt, one ratchet step per call
//! - [`Inbox`]: transport record dispatch
//!
//! Time and randomness come from an [`Environment`], so a seeded
//! [`env::test_utils::MockEnv`] replays a run exactly.

pub mod address;
pub mod bundle;
pub mod cipher;
pub mod config;
pub mod directory;
pub mod env;
pub mod envelope;
pub mod error;
pub mod key_store;
pub mod locks;
pub mod protocol;
pub mod records;
pub mod retry;
pub mod session_store;
pub mod storage;
mod system_env;
pub mod transport;

pub use address::PeerAddress;
pub use bundle::{KeyBundle, OneTimePreKeyPublic, PublishedBundle, SignedPreKeyPublic};
pub use cipher::MessageCipher;
pub use config::{OneTimePreKeyPolicy, RetryPolicy, SessionConfig};
pub use directory::{KeyDirectory, MemoryDirectory, publish_bundle};
pub use env::Environment;
pub use envelope::{EncryptedEnvelope, HandshakeMessage, MessageType};
pub use error::{DirectoryError, EnvelopeError, SessionError, StorageError};
pub use key_store::KeyStore;
pub use locks::{PeerGuard, PeerLocks};
pub use protocol::{Establishment, SessionProtocol};
pub use records::{SessionRecord, SessionRole, TrustDecision, TrustEntry};
pub use session_store::SessionStore;
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, Table, WriteBatch};
pub use system_env::SystemEnv;
pub use transport::{Inbox, ReceivedMessage, TransportRecord};
