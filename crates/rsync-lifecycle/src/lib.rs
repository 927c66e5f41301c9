//! Session lifecycle for rsync
//!
//! The [`state`] table decides which events a session accepts; the
//! [`Engine`] runs them: instantiate, terminate, update, rollback and read.

#![warn(missing_docs)]

pub mod engine;
pub mod observe;
pub mod plan;
pub mod state;

pub use engine::{AppStatus, ClusterStatus, Engine, EngineSettings, SessionStatus};
pub use observe::{EngineSink, SessionProbe};
pub use state::{Event, StateMachine, Transition};
pub use rsync_common::{Error, Result};
