//! Persistence for rsync: credentials, sessions, and observed status
//!
//! The credential and session stores sit on top of a [`KvStore`], so a
//! persistent database plugs in by implementing that one trait. The daemon
//! ships an in-memory and a JSON-file store. Observed status is process local.

#![warn(missing_docs)]

pub mod cloudconfig;
pub mod context;
pub mod file;
pub mod kv;
pub mod seed;
pub mod status;

pub use cloudconfig::{CloudConfig, CredentialStore, GitOpsDescriptor};
pub use context::{AppContextStore, KvContextStore, SessionRecord};
pub use file::FileStore;
pub use kv::{InsertMode, KvStore, MemoryStore, StoreKey};
pub use seed::{GitOpsSeed, Seed, SeedReport};
pub use status::{ResourceOutcome, StatusStore};
