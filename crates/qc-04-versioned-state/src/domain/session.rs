//! # Undo Sessions
//!
//! A [`Session`] owns one undo state on the database stack. Unless it is
//! pushed, squashed or undone explicitly, dropping it rolls its changes
//! back, so every early return and `?` leaves the store unchanged.

use super::database::Database;
use super::errors::StateError;
use tracing::warn;

/// Scoped undo session.
#[must_use = "dropping a session rolls back its changes"]
pub struct Session {
    db: Database,
    apply: bool,
    revision: i64,
}

impl Session {
    pub(crate) fn tracked(db: Database, revision: i64) -> Self {
        Self {
            db,
            apply: true,
            revision,
        }
    }

    pub(crate) fn inert(db: Database) -> Self {
        let revision = db.revision();
        Self {
            db,
            apply: false,
            revision,
        }
    }

    /// Revision this session was opened at.
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Leave the undo state on the stack for a later undo or commit.
    pub fn push(mut self) {
        self.apply = false;
    }

    /// Fold the changes into the enclosing session.
    pub fn squash(mut self) -> Result<(), StateError> {
        if !self.apply {
            return Ok(());
        }
        self.apply = false;
        self.db.squash()
    }

    /// Roll back now.
    pub fn undo(mut self) -> Result<(), StateError> {
        if !self.apply {
            return Ok(());
        }
        self.apply = false;
        self.db.undo()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.apply {
            if let Err(e) = self.db.undo() {
                warn!(revision = self.revision, error = %e, "[qc-04] rollback on drop failed");
            }
        }
    }
}

/// A session that may be absent, e.g. when replaying irreversible blocks
/// with sessions disabled. Every operation is a no-op when absent.
#[derive(Default)]
pub struct MaybeSession(Option<Session>);

impl MaybeSession {
    /// Open a session on `db`.
    pub fn new(db: &Database) -> Self {
        Self(Some(db.start_undo_session(true)))
    }

    /// No session.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_active(&self) -> bool {
        self.0.is_some()
    }

    pub fn push(&mut self) {
        if let Some(session) = self.0.take() {
            session.push();
        }
    }

    pub fn squash(&mut self) -> Result<(), StateError> {
        match self.0.take() {
            Some(session) => session.squash(),
            None => Ok(()),
        }
    }

    pub fn undo(&mut self) -> Result<(), StateError> {
        match self.0.take() {
            Some(session) => session.undo(),
            None => Ok(()),
        }
    }
}
