//! Atomic multi-entity updates.
//!
//! A [`UnitOfWork`] is an ordered list of steps, each pairing a side effect
//! with a compensating undo captured at apply time. The unit first attempts a
//! native SQLite transaction; when transaction initiation fails, or a step
//! reports [`WorkflowError::TransactionUnsupported`] mid-flight, it retries
//! exactly once on the fallback path: sequential writes, and on failure the
//! already-captured undos run in reverse order. Undo failures are logged and
//! never mask the original error.

use rusqlite::Connection;
use tracing::warn;

use crate::error::WorkflowError;

pub type Undo = Box<dyn FnOnce(&Connection) -> Result<(), WorkflowError>>;

/// An apply closure that performs no compensatable side effect.
pub fn no_undo() -> Undo {
    Box::new(|_| Ok(()))
}

type Apply = Box<dyn FnMut(&Connection) -> Result<Undo, WorkflowError>>;

pub struct Step {
    label: &'static str,
    apply: Apply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Try the native transaction path, falling back once if unavailable.
    Auto,
    /// Sequential writes with compensating undo only. For backends (or
    /// deployments) where multi-record transactions are not trustworthy.
    Sequential,
}

impl TxMode {
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(TxMode::Auto),
            "sequential" => Some(TxMode::Sequential),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct UnitOfWork {
    steps: Vec<Step>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        UnitOfWork { steps: Vec::new() }
    }

    pub fn step<F>(mut self, label: &'static str, apply: F) -> Self
    where
        F: FnMut(&Connection) -> Result<Undo, WorkflowError> + 'static,
    {
        self.steps.push(Step {
            label,
            apply: Box::new(apply),
        });
        self
    }

    pub fn run(mut self, conn: &Connection, mode: TxMode) -> Result<(), WorkflowError> {
        if mode == TxMode::Sequential {
            return self.run_sequential(conn);
        }
        match self.run_native(conn) {
            Err(WorkflowError::TransactionUnsupported) => {
                warn!("native transaction path unavailable, retrying with compensating writes");
                self.run_sequential(conn)
            }
            other => other,
        }
    }

    fn run_native(&mut self, conn: &Connection) -> Result<(), WorkflowError> {
        let tx = match conn.unchecked_transaction() {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "could not start transaction");
                return Err(WorkflowError::TransactionUnsupported);
            }
        };
        for step in &mut self.steps {
            // Undo closures are discarded: the transaction rollback is the undo.
            if let Err(e) = (step.apply)(&tx) {
                let _ = tx.rollback();
                return Err(e);
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn run_sequential(&mut self, conn: &Connection) -> Result<(), WorkflowError> {
        let mut undos: Vec<(&'static str, Undo)> = Vec::new();
        for step in &mut self.steps {
            match (step.apply)(conn) {
                Ok(undo) => undos.push((step.label, undo)),
                Err(err) => {
                    for (label, undo) in undos.into_iter().rev() {
                        if let Err(ue) = undo(conn) {
                            warn!(step = label, error = %ue, "compensating undo failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}
