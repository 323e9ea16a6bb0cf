//! Finite-state machine primitives.
//!
//! A [`Machine`] holds a current [`State`], the set of states it may ever be
//! in, and a table of [`Rule`]s describing which edges are allowed.
//!
//! # Invariants
//!
//! - The current state is always a declared legal state
//! - A transition succeeds only if some rule matches `current -> next`
//! - A rejected transition never mutates the machine
//!
//! Rejections are reported as [`FsmError`]. They indicate a defect in the
//! rule table or in the caller, never an operational failure, so callers are
//! expected to propagate them to the process entry point and stop.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

/// Error value stored alongside a state.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Bounds required of a state name.
pub trait StateName: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> StateName for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

/// State machine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    /// Target state was never declared legal.
    #[error("illegal_state: cannot transition to undeclared state {state}")]
    IllegalState { state: String },

    /// No rule allows this edge.
    #[error("illegal_transition: cannot transition from {from} to {to}, not allowed")]
    IllegalTransition { from: String, to: String },
}

impl FsmError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            FsmError::IllegalState { .. } => "illegal_state",
            FsmError::IllegalTransition { .. } => "illegal_transition",
        }
    }
}

/// A named state with the error (if any) that caused it.
///
/// Equality compares names only.
#[derive(Clone)]
pub struct State<S> {
    name: S,
    error: Option<SharedError>,
}

impl<S: StateName> State<S> {
    pub fn new(name: S) -> Self {
        Self { name, error: None }
    }

    pub fn with_error(name: S, error: Option<SharedError>) -> Self {
        Self { name, error }
    }

    pub fn name(&self) -> S {
        self.name
    }

    /// The error recorded when this state was entered.
    pub fn error(&self) -> Option<&SharedError> {
        self.error.as_ref()
    }
}

impl<S: StateName> PartialEq for State<S> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<S: StateName> Eq for State<S> {}

impl<S: fmt::Debug> fmt::Debug for State<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

impl<S: StateName> fmt::Display for State<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Some(error) => write!(f, "{}: {}", self.name, error),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One allowed `from -> {to...}` edge set.
#[derive(Debug, Clone)]
pub struct Rule<S> {
    from: S,
    to: Vec<S>,
}

impl<S: StateName> Rule<S> {
    /// Returns true if this rule allows `current -> next`.
    pub fn test(&self, current: S, next: S) -> bool {
        self.from == current && self.to.contains(&next)
    }
}

/// Half-built rule returned by [`from`].
#[derive(Debug, Clone, Copy)]
pub struct PartialRule<S> {
    from: S,
}

impl<S: StateName> PartialRule<S> {
    pub fn to(self, to: impl IntoIterator<Item = S>) -> Rule<S> {
        Rule {
            from: self.from,
            to: to.into_iter().collect(),
        }
    }
}

/// Start a rule: `from(A).to([B, C])`.
pub fn from<S: StateName>(state: S) -> PartialRule<S> {
    PartialRule { from: state }
}

/// Transition table.
#[derive(Debug, Clone)]
pub struct Rules<S>(Vec<Rule<S>>);

impl<S: StateName> Rules<S> {
    pub fn new(rules: Vec<Rule<S>>) -> Self {
        Self(rules)
    }

    /// Returns true if any rule allows `current -> next`.
    pub fn test(&self, current: S, next: S) -> bool {
        self.0.iter().any(|rule| rule.test(current, next))
    }
}

/// A rule-validated state machine.
#[derive(Debug, Clone)]
pub struct Machine<S> {
    current: State<S>,
    legal: HashSet<S>,
    rules: Rules<S>,
}

impl<S: StateName> Machine<S> {
    /// Create a machine starting in `initial`.
    ///
    /// Fails if `initial` is not among `legal`.
    pub fn new(
        initial: S,
        legal: impl IntoIterator<Item = S>,
        rules: Rules<S>,
    ) -> Result<Self, FsmError> {
        let legal: HashSet<S> = legal.into_iter().collect();
        if !legal.contains(&initial) {
            return Err(FsmError::IllegalState {
                state: initial.to_string(),
            });
        }

        Ok(Self {
            current: State::new(initial),
            legal,
            rules,
        })
    }

    pub fn current(&self) -> &State<S> {
        &self.current
    }

    pub fn is_currently(&self, state: S) -> bool {
        self.current.name == state
    }

    pub fn is_legal(&self, state: S) -> bool {
        self.legal.contains(&state)
    }

    /// Returns true if `transition(to, ..)` would succeed right now.
    pub fn can_transition(&self, to: S) -> bool {
        self.is_legal(to) && self.rules.test(self.current.name, to)
    }

    /// Move to `to`, recording `error`.
    pub fn transition(&mut self, to: S, error: Option<SharedError>) -> Result<(), FsmError> {
        if !self.is_legal(to) {
            return Err(FsmError::IllegalState {
                state: to.to_string(),
            });
        }

        if !self.rules.test(self.current.name, to) {
            return Err(FsmError::IllegalTransition {
                from: self.current.name.to_string(),
                to: to.to_string(),
            });
        }

        let next = State::with_error(to, error);
        info!(from = %self.current.name, to = %next, "FSM transitioned");
        self.current = next;
        Ok(())
    }

    /// Move to `to` without consulting the rule table.
    pub fn force_transition(&mut self, to: S, error: Option<SharedError>) {
        let next = State::with_error(to, error);
        info!(from = %self.current.name, to = %next, "FSM force transitioned");
        self.current = next;
    }
}
