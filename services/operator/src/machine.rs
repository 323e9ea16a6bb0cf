//! Agent lifecycle state machine.
//!
//! The rule table lives here; the [`Machine`] itself is owned by a single
//! actor task and reached through a cloneable [`MachineHandle`]. The control
//! loop drives transitions and the status server reads the current state.

use std::fmt;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use wake_fsm::{from, FsmError, Machine, Rules, SharedError, State};

/// Mailbox size for the machine actor.
const MAILBOX_SIZE: usize = 32;

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Initial,
    Booting,
    Booted,
    DetectionFailed,
    PostingMetadataFailed,
    FetchingNodeStateFailed,
    MergingStateFailed,
    NormalizingFailed,
    FetchingDirectoryStateFailed,
    AttemptingToRecover,
    Running,
    ConfigFailed,
}

impl AgentState {
    pub const ALL: [AgentState; 12] = [
        AgentState::Initial,
        AgentState::Booting,
        AgentState::Booted,
        AgentState::DetectionFailed,
        AgentState::PostingMetadataFailed,
        AgentState::FetchingNodeStateFailed,
        AgentState::MergingStateFailed,
        AgentState::NormalizingFailed,
        AgentState::FetchingDirectoryStateFailed,
        AgentState::AttemptingToRecover,
        AgentState::Running,
        AgentState::ConfigFailed,
    ];

    /// Failure states the agent can recover from.
    pub const RUNTIME_FAILURES: [AgentState; 6] = [
        AgentState::DetectionFailed,
        AgentState::PostingMetadataFailed,
        AgentState::FetchingNodeStateFailed,
        AgentState::MergingStateFailed,
        AgentState::NormalizingFailed,
        AgentState::FetchingDirectoryStateFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Initial => "Initial",
            AgentState::Booting => "Booting",
            AgentState::Booted => "Booted",
            AgentState::DetectionFailed => "DetectionFailed",
            AgentState::PostingMetadataFailed => "PostingMetadataFailed",
            AgentState::FetchingNodeStateFailed => "FetchingNodeStateFailed",
            AgentState::MergingStateFailed => "MergingStateFailed",
            AgentState::NormalizingFailed => "NormalizingFailed",
            AgentState::FetchingDirectoryStateFailed => "FetchingDirectoryStateFailed",
            AgentState::AttemptingToRecover => "AttemptingToRecover",
            AgentState::Running => "Running",
            AgentState::ConfigFailed => "ConfigFailed",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The agent's transition table.
pub fn rules() -> Rules<AgentState> {
    use AgentState::*;

    let active = || {
        let mut to = vec![Running];
        to.extend(AgentState::RUNTIME_FAILURES);
        to
    };

    let mut rules = vec![
        from(Initial).to([Booting, ConfigFailed]),
        from(Booting).to([
            DetectionFailed,
            PostingMetadataFailed,
            FetchingNodeStateFailed,
            NormalizingFailed,
            Booted,
        ]),
        from(Booted).to(active()),
        from(Running).to(active()),
        from(AttemptingToRecover).to(active()),
    ];
    rules.extend(
        AgentState::RUNTIME_FAILURES
            .into_iter()
            .map(|failed| from(failed).to([AttemptingToRecover, Booting])),
    );

    Rules::new(rules)
}

/// A fresh machine in `Initial`.
pub fn new_machine() -> Result<Machine<AgentState>, FsmError> {
    Machine::new(AgentState::Initial, AgentState::ALL, rules())
}

/// Errors from the machine handle.
#[derive(Debug, Clone, Error)]
pub enum MachineError {
    #[error(transparent)]
    Fsm(#[from] FsmError),

    /// The actor task is gone.
    #[error("state machine actor stopped")]
    Stopped,
}

impl MachineError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            MachineError::Fsm(e) => e.reason_code(),
            MachineError::Stopped => "actor_stopped",
        }
    }
}

#[derive(Debug)]
enum Command {
    Transition {
        to: AgentState,
        error: Option<SharedError>,
        reply: oneshot::Sender<Result<(), FsmError>>,
    },
    Force {
        to: AgentState,
        error: Option<SharedError>,
        reply: oneshot::Sender<()>,
    },
    Current {
        reply: oneshot::Sender<State<AgentState>>,
    },
}

/// Sole owner of the agent's [`Machine`].
pub struct MachineActor {
    machine: Machine<AgentState>,
    rx: mpsc::Receiver<Command>,
}

impl MachineActor {
    /// Spawn the actor on the current runtime.
    ///
    /// The task ends once every handle is dropped.
    pub fn spawn(machine: Machine<AgentState>) -> MachineHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let actor = MachineActor { machine, rx };
        tokio::spawn(actor.run());
        MachineHandle { tx }
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Transition { to, error, reply } => {
                    let _ = reply.send(self.machine.transition(to, error));
                }
                Command::Force { to, error, reply } => {
                    self.machine.force_transition(to, error);
                    let _ = reply.send(());
                }
                Command::Current { reply } => {
                    let _ = reply.send(self.machine.current().clone());
                }
            }
        }
        debug!("State machine actor stopped");
    }
}

/// Cloneable handle to the machine actor.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    tx: mpsc::Sender<Command>,
}

impl MachineHandle {
    /// Rule-checked transition.
    pub async fn transition(
        &self,
        to: AgentState,
        error: Option<SharedError>,
    ) -> Result<(), MachineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Transition { to, error, reply }).await?;
        rx.await.map_err(|_| MachineError::Stopped)?.map_err(MachineError::from)
    }

    /// Transition ignoring the rule table.
    pub async fn force_transition(
        &self,
        to: AgentState,
        error: Option<SharedError>,
    ) -> Result<(), MachineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Force { to, error, reply }).await?;
        rx.await.map_err(|_| MachineError::Stopped)
    }

    pub async fn current(&self) -> Result<State<AgentState>, MachineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Current { reply }).await?;
        rx.await.map_err(|_| MachineError::Stopped)
    }

    pub async fn is_currently(&self, state: AgentState) -> Result<bool, MachineError> {
        Ok(self.current().await?.name() == state)
    }

    async fn send(&self, command: Command) -> Result<(), MachineError> {
        self.tx.send(command).await.map_err(|_| MachineError::Stopped)
    }
}
