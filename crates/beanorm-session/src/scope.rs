//! Transaction scopes with propagation rules.
//!
//! A [`ScopeManager`] belongs to one logical flow and carries that flow's
//! current transaction. Entering a scope decides, from the propagation
//! policy and whether a transaction is active, to start one, reuse the
//! current one, suspend it, or fail:
//!
//! | policy          | no transaction | active transaction      |
//! |-----------------|----------------|-------------------------|
//! | `Required`      | start new      | reuse                   |
//! | `RequiresNew`   | start new      | suspend, start new      |
//! | `Mandatory`     | error          | reuse                   |
//! | `Never`         | none           | error                   |
//! | `Supports`      | none           | reuse                   |
//! | `NotSupported`  | none           | suspend, none           |

use crate::engine::Engine;
use crate::transaction::Transaction;
use beanorm_core::{Cx, Error, Outcome, PropagationError, PropagationErrorKind, try_outcome};
use std::sync::Arc;

/// Transaction propagation policy of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Required,
    RequiresNew,
    Mandatory,
    Never,
    Supports,
    NotSupported,
}

/// How a scope wants to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxScope {
    pub propagation: Propagation,
    /// Applies to a transaction the scope starts.
    pub read_only: bool,
}

impl TxScope {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            read_only: false,
        }
    }

    pub fn required() -> Self {
        Self::new(Propagation::Required)
    }

    pub fn requires_new() -> Self {
        Self::new(Propagation::RequiresNew)
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// What [`ScopeManager::enter`] did; hand it back to [`ScopeManager::exit`].
#[derive(Debug)]
#[must_use = "a scope must be exited"]
pub struct ScopeHandle {
    propagation: Propagation,
    /// A transaction was started by this scope.
    created: bool,
    /// The current transaction was reused.
    joined: bool,
    /// The outer transaction (or its absence) was pushed aside.
    suspended: bool,
    depth: usize,
}

impl ScopeHandle {
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn suspended(&self) -> bool {
        self.suspended
    }
}

/// The current transaction of one flow plus its stack of suspended ones.
pub struct ScopeManager {
    engine: Arc<Engine>,
    current: Option<Transaction>,
    suspended: Vec<Option<Transaction>>,
}

impl std::fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeManager")
            .field("current", &self.current.as_ref().map(Transaction::id))
            .field("suspended", &self.suspended.len())
            .finish()
    }
}

fn propagation_error(kind: PropagationErrorKind, message: &str) -> Error {
    Error::Propagation(PropagationError {
        kind,
        message: message.to_string(),
    })
}

impl ScopeManager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            current: None,
            suspended: Vec::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The active transaction of the innermost scope, if any.
    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref().filter(|tx| tx.is_active())
    }

    pub fn current_mut(&mut self) -> Option<&mut Transaction> {
        self.current.as_mut().filter(|tx| tx.is_active())
    }

    /// Number of suspended scopes.
    pub fn depth(&self) -> usize {
        self.suspended.len()
    }

    fn suspend(&mut self) {
        let outer = self.current.take();
        tracing::debug!(tx = ?outer.as_ref().map(Transaction::id), "Scope suspended");
        self.suspended.push(outer);
    }

    fn resume(&mut self) {
        if let Some(outer) = self.suspended.pop() {
            tracing::debug!(tx = ?outer.as_ref().map(Transaction::id), "Scope resumed");
            self.current = outer;
        }
    }

    /// Enter a scope. Propagation errors are raised before the store is touched.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn enter(&mut self, cx: &Cx, scope: &TxScope) -> Outcome<ScopeHandle, Error> {
        let active = self.current().is_some();
        let (create, joined, suspend) = match (scope.propagation, active) {
            (Propagation::Required | Propagation::RequiresNew, false) => (true, false, false),
            (Propagation::Required | Propagation::Mandatory | Propagation::Supports, true) => {
                (false, true, false)
            }
            (Propagation::RequiresNew, true) => (true, false, true),
            (Propagation::NotSupported, true) => (false, false, true),
            (Propagation::Never | Propagation::Supports | Propagation::NotSupported, false) => {
                (false, false, false)
            }
            (Propagation::Mandatory, false) => {
                return Outcome::Err(propagation_error(
                    PropagationErrorKind::MandatoryWithoutTransaction,
                    "MANDATORY scope entered without an active transaction",
                ));
            }
            (Propagation::Never, true) => {
                return Outcome::Err(propagation_error(
                    PropagationErrorKind::NeverWithTransaction,
                    "NEVER scope entered with an active transaction",
                ));
            }
        };

        if suspend {
            self.suspend();
        }
        if create {
            let begun = self.engine.begin(cx, scope.read_only).await;
            if suspend && !matches!(begun, Outcome::Ok(_)) {
                self.resume();
            }
            self.current = Some(try_outcome!(begun));
        }
        Outcome::Ok(ScopeHandle {
            propagation: scope.propagation,
            created: create,
            joined,
            suspended: suspend,
            depth: self.suspended.len(),
        })
    }

    /// Roll back and resume every scope nested deeper than `depth`.
    async fn unwind_to(&mut self, cx: &Cx, depth: usize) {
        while self.suspended.len() > depth {
            if let Some(mut tx) = self.current.take() {
                if tx.is_active() {
                    if let Outcome::Err(e) = tx.rollback(cx).await {
                        tracing::warn!(tx = tx.id(), error = %e, "Rollback of abandoned scope failed");
                    }
                }
            }
            self.resume();
        }
    }

    /// Leave a scope.
    ///
    /// A transaction the scope started is committed on success and rolled
    /// back otherwise; a reused one is marked rollback-only on failure. A
    /// suspended outer scope is restored in every case.
    ///
    /// Exiting while nested scopes are still open rolls those back first,
    /// then exits this scope as failed and reports the misuse.
    #[tracing::instrument(level = "debug", skip(self, cx, handle), fields(propagation = ?handle.propagation))]
    pub async fn exit(&mut self, cx: &Cx, handle: ScopeHandle, success: bool) -> Outcome<(), Error> {
        let found = self.suspended.len();
        if handle.depth > found {
            return Outcome::Err(Error::Custom(format!(
                "scope exited out of order: expected depth {}, found {found}",
                handle.depth
            )));
        }
        let misordered = handle.depth < found;
        if misordered {
            tracing::warn!(expected = handle.depth, found, "Scope exited before its nested scopes");
            self.unwind_to(cx, handle.depth).await;
        }
        let success = success && !misordered;

        let mut outcome = Outcome::Ok(());
        if handle.created {
            if let Some(mut tx) = self.current.take() {
                if tx.is_active() {
                    outcome = if success {
                        tx.commit(cx).await
                    } else {
                        tx.rollback(cx).await
                    };
                }
            }
        } else if handle.joined && !success {
            if let Some(tx) = self.current_mut() {
                tx.set_rollback_only();
            }
        }

        if handle.suspended {
            self.resume();
        }
        if misordered {
            if let Outcome::Err(e) = &outcome {
                tracing::warn!(error = %e, "Rollback of misordered scope failed");
            }
            return Outcome::Err(Error::Custom(format!(
                "scope exited out of order: expected depth {}, found {found}",
                handle.depth
            )));
        }
        outcome
    }

    /// Run `f` inside a scope, exiting it with the outcome of `f`.
    pub async fn run<T, F>(&mut self, cx: &Cx, scope: &TxScope, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut ScopeManager) -> Outcome<T, Error>,
    {
        let handle = try_outcome!(self.enter(cx, scope).await);
        let outcome = f(self).await;
        let success = matches!(outcome, Outcome::Ok(_));
        let exited = self.exit(cx, handle, success).await;
        match outcome {
            Outcome::Ok(value) => {
                try_outcome!(exited);
                Outcome::Ok(value)
            }
            failed => {
                if let Outcome::Err(e) = &exited {
                    tracing::warn!(error = %e, "Scope exit failed after an error");
                }
                failed
            }
        }
    }
}
