//! Session lifecycle transitions
//!
//! Every event has a fixed set of source states, an in-progress state
//! entered as soon as the event starts, and the success and failure states
//! it ends in. `Read` is legal everywhere and changes nothing.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use rsync_common::{DeploymentState, Error, Result};
use rsync_store::{AppContextStore, SessionRecord};

use DeploymentState::*;

/// Events a session can go through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Deploy every app of the session
    Instantiate,
    /// Remove everything the session deployed
    Terminate,
    /// Deploy the session as the replacement of an older one
    Update,
    /// Remove what a superseded session deployed
    UpdateDelete,
    /// Report status
    Read,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Source states and outcome states of one event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// States the event may start from
    pub from: &'static [DeploymentState],
    /// Entered when the event starts
    pub in_progress: Option<DeploymentState>,
    /// Entered when the event succeeds
    pub success: Option<DeploymentState>,
    /// Entered when the event fails
    pub failure: Option<DeploymentState>,
}

const ALL_STATES: &[DeploymentState] = &[
    Created,
    Instantiating,
    Instantiated,
    InstantiateFailed,
    Updating,
    Updated,
    UpdateFailed,
    Terminating,
    Terminated,
    TerminateFailed,
];

impl Event {
    /// Transition table entry
    pub fn transition(self) -> Transition {
        match self {
            Event::Instantiate => Transition {
                from: &[Created, Instantiating, Instantiated, InstantiateFailed],
                in_progress: Some(Instantiating),
                success: Some(Instantiated),
                failure: Some(InstantiateFailed),
            },
            Event::Terminate => Transition {
                from: &[
                    Created,
                    Instantiating,
                    Instantiated,
                    InstantiateFailed,
                    Updating,
                    Updated,
                    UpdateFailed,
                    Terminating,
                    TerminateFailed,
                ],
                in_progress: Some(Terminating),
                success: Some(Terminated),
                failure: Some(TerminateFailed),
            },
            // Terminated: a rollback redeploys the session an update replaced
            Event::Update => Transition {
                from: &[Created, Updating, Updated, UpdateFailed, Terminated],
                in_progress: Some(Updating),
                success: Some(Updated),
                failure: Some(UpdateFailed),
            },
            Event::UpdateDelete => Transition {
                from: &[Instantiated, InstantiateFailed, Updating, Updated, UpdateFailed],
                in_progress: Some(Terminating),
                success: Some(Terminated),
                failure: Some(TerminateFailed),
            },
            Event::Read => Transition {
                from: ALL_STATES,
                in_progress: None,
                success: None,
                failure: None,
            },
        }
    }

    /// Whether the event may start from `state`
    pub fn is_legal_from(self, state: DeploymentState) -> bool {
        self.transition().from.contains(&state)
    }

    /// `IllegalTransition` unless the event may start from `state`
    pub fn check(self, state: DeploymentState) -> Result<()> {
        if self.is_legal_from(state) {
            Ok(())
        } else {
            Err(Error::illegal_transition(self, state))
        }
    }
}

/// Applies the transition table to persisted sessions
#[derive(Clone)]
pub struct StateMachine {
    sessions: Arc<dyn AppContextStore>,
}

impl StateMachine {
    /// State machine over `sessions`
    pub fn new(sessions: Arc<dyn AppContextStore>) -> Self {
        Self { sessions }
    }

    /// Validate `event` against the session's state and enter its in-progress state.
    ///
    /// Returns the record as it was before the event started.
    pub async fn begin(&self, id: &str, event: Event) -> Result<SessionRecord> {
        let record = self.sessions.get(id).await?;
        event.check(record.state)?;
        if let Some(next) = event.transition().in_progress {
            self.sessions.set_state(id, next).await?;
            info!(session = %id, event = %event, from = %record.state, to = %next, "session transition");
        }
        Ok(record)
    }

    /// Enter the success or failure state of `event`
    pub async fn finish(&self, id: &str, event: Event, succeeded: bool) -> Result<()> {
        let transition = event.transition();
        let next = if succeeded {
            transition.success
        } else {
            transition.failure
        };
        if let Some(next) = next {
            self.sessions.set_state(id, next).await?;
            info!(session = %id, event = %event, to = %next, "session transition");
        }
        Ok(())
    }
}
