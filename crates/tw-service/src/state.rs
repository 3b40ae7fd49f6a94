//! Tunnel State Machine
//!
//! ```text
//!  Unknown ─┐
//!           ├─ start ─▶ Starting ─▶ Started ─ stop ─▶ Stopping ─▶ Stopped
//!  Stopped ─┘              │                                        │
//!                          └─────────── (failure) ─────────────────▶┘
//!
//!  any non-transitional ─ delete ─▶ Deleting ─▶ (removed)
//! ```
//!
//! A request that conflicts with a transition already in progress for the
//! same tunnel is rejected, never queued.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tw_ipc::TunnelState;
use tw_net::{TunnelConfig, TunnelName};

/// Operations that move a tunnel between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Start => write!(f, "start"),
            Operation::Stop => write!(f, "stop"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Outcome of checking an operation against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Enter this transitional state and do the work
    Begin(TunnelState),
    /// Nothing to do, the tunnel is already there
    Already(TunnelState),
}

/// Rejected transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Cannot {op} {name} while it is {state}")]
    Busy {
        name: String,
        op: Operation,
        state: TunnelState,
    },

    #[error("State of {0} is still settling")]
    Unresolved(String),
}

/// Decide what an operation does from a given state
///
/// `Unknown` must be resolved against the service manager before stopping
/// or deleting; starting from `Unknown` is allowed.
pub fn transition(current: TunnelState, op: Operation) -> Result<Step, Option<TunnelState>> {
    use TunnelState::*;
    match (op, current) {
        (_, Starting | Stopping | Deleting) => Err(Some(current)),
        (Operation::Start, Stopped | Unknown) => Ok(Step::Begin(Starting)),
        (Operation::Start, Started) => Ok(Step::Already(Started)),
        (Operation::Stop, Started) => Ok(Step::Begin(Stopping)),
        (Operation::Stop, Stopped) => Ok(Step::Already(Stopped)),
        (Operation::Delete, Started | Stopped) => Ok(Step::Begin(Deleting)),
        (Operation::Stop | Operation::Delete, Unknown) => Err(None),
    }
}

#[derive(Debug, Clone, Default)]
struct Entry {
    state: TunnelState,
    /// Configuration the running tunnel was started from
    runtime: Option<TunnelConfig>,
    /// Clock value of the last change
    version: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TunnelName, Entry>,
    clock: u64,
    removals: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// What [`TunnelTable::read`] saw, to be handed back to
/// [`TunnelTable::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seen {
    state: TunnelState,
    /// Zero when the tunnel had no entry
    version: u64,
    removals: u64,
}

impl Seen {
    pub fn state(&self) -> TunnelState {
        self.state
    }
}

/// Authoritative tunnel states held by the manager
#[derive(Debug, Default)]
pub struct TunnelTable {
    inner: Mutex<Inner>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; `Unknown` for tunnels never seen
    pub fn get(&self, name: &TunnelName) -> TunnelState {
        self.read(name).state
    }

    /// Current state, remembered for a later [`TunnelTable::observe`]
    pub fn read(&self, name: &TunnelName) -> Seen {
        let inner = self.inner.lock().unwrap();
        let (state, version) = inner
            .entries
            .get(name)
            .map(|e| (e.state, e.version))
            .unwrap_or_default();
        Seen {
            state,
            version,
            removals: inner.removals,
        }
    }

    /// Record a state observed at the service manager
    ///
    /// The observation is dropped when a transition is in flight, when the
    /// entry changed since `seen`, or when it is itself transitional. The
    /// returned state is what callers should report.
    pub fn observe(&self, name: &TunnelName, seen: Seen, observed: TunnelState) -> TunnelState {
        let mut inner = self.inner.lock().unwrap();
        let removals = inner.removals;
        match inner.entries.get(name) {
            Some(entry) if entry.state.is_transitional() || entry.version != seen.version => {
                return entry.state;
            }
            Some(_) => {}
            None if seen.version != 0 || seen.removals != removals => return observed,
            None => {}
        }
        if observed.is_transitional() {
            return observed;
        }

        let version = inner.tick();
        let entry = inner.entries.entry(name.clone()).or_default();
        entry.state = observed;
        entry.version = version;
        if observed != TunnelState::Started {
            entry.runtime = None;
        }
        observed
    }

    /// Atomically check and enter a transition
    pub fn begin(&self, name: &TunnelName, op: Operation) -> Result<Step, StateError> {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.tick();
        let entry = inner.entries.entry(name.clone()).or_default();
        match transition(entry.state, op) {
            Ok(Step::Begin(next)) => {
                entry.state = next;
                entry.version = version;
                Ok(Step::Begin(next))
            }
            Ok(already) => Ok(already),
            Err(Some(state)) => Err(StateError::Busy {
                name: name.to_string(),
                op,
                state,
            }),
            Err(None) => Err(StateError::Unresolved(name.to_string())),
        }
    }

    /// Leave a transition
    pub fn finish(&self, name: &TunnelName, state: TunnelState, runtime: Option<TunnelConfig>) {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.tick();
        let entry = inner.entries.entry(name.clone()).or_default();
        entry.state = state;
        entry.runtime = runtime;
        entry.version = version;
    }

    /// Forget a deleted tunnel
    pub fn remove(&self, name: &TunnelName) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(name).is_some() {
            inner.removals += 1;
        }
    }

    /// Snapshot of the running configuration
    pub fn runtime_config(&self, name: &TunnelName) -> Option<TunnelConfig> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(name)
            .and_then(|e| e.runtime.clone())
    }

    /// Tunnels currently in the given state
    pub fn in_state(&self, state: TunnelState) -> Vec<TunnelName> {
        let mut names: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TunnelName {
        TunnelName::new(s).unwrap()
    }

    #[test]
    fn test_start_from_stopped_goes_through_starting() {
        let table = TunnelTable::new();
        let office = name("office");
        table.observe(&office, table.read(&office), TunnelState::Stopped);

        assert_eq!(
            table.begin(&office, Operation::Start).unwrap(),
            Step::Begin(TunnelState::Starting)
        );
        assert_eq!(table.get(&office), TunnelState::Starting);

        table.finish(&office, TunnelState::Started, None);
        assert_eq!(table.get(&office), TunnelState::Started);
    }

    #[test]
    fn test_delete_while_starting_is_rejected() {
        let table = TunnelTable::new();
        let office = name("office");
        table.begin(&office, Operation::Start).unwrap();

        let result = table.begin(&office, Operation::Delete);
        assert!(matches!(
            result,
            Err(StateError::Busy { state: TunnelState::Starting, .. })
        ));
        assert_eq!(table.get(&office), TunnelState::Starting);
    }

    #[test]
    fn test_every_op_rejected_during_transitions() {
        for state in [TunnelState::Starting, TunnelState::Stopping, TunnelState::Deleting] {
            for op in [Operation::Start, Operation::Stop, Operation::Delete] {
                assert_eq!(transition(state, op), Err(Some(state)));
            }
        }
    }

    #[test]
    fn test_idempotent_requests() {
        assert_eq!(
            transition(TunnelState::Started, Operation::Start),
            Ok(Step::Already(TunnelState::Started))
        );
        assert_eq!(
            transition(TunnelState::Stopped, Operation::Stop),
            Ok(Step::Already(TunnelState::Stopped))
        );
    }

    #[test]
    fn test_unknown_must_be_resolved_for_stop_and_delete() {
        let table = TunnelTable::new();
        let office = name("office");
        assert!(matches!(
            table.begin(&office, Operation::Stop),
            Err(StateError::Unresolved(_))
        ));
        let seen = table.read(&office);
        assert_eq!(table.observe(&office, seen, TunnelState::Started), TunnelState::Started);
        assert!(table.begin(&office, Operation::Stop).is_ok());
    }

    #[test]
    fn test_observation_replaces_settled_state() {
        let table = TunnelTable::new();
        let office = name("office");
        table.finish(&office, TunnelState::Started, None);

        // The worker went away behind the manager's back
        let seen = table.read(&office);
        assert_eq!(table.observe(&office, seen, TunnelState::Stopped), TunnelState::Stopped);
        assert_eq!(table.get(&office), TunnelState::Stopped);
    }

    #[test]
    fn test_observation_never_overrides_transition() {
        let table = TunnelTable::new();
        let office = name("office");
        let seen = table.read(&office);
        table.begin(&office, Operation::Start).unwrap();

        assert_eq!(table.observe(&office, seen, TunnelState::Stopped), TunnelState::Starting);
        let seen = table.read(&office);
        assert_eq!(table.observe(&office, seen, TunnelState::Stopped), TunnelState::Starting);
    }

    #[test]
    fn test_stale_observation_dropped() {
        let table = TunnelTable::new();
        let office = name("office");
        table.finish(&office, TunnelState::Stopped, None);
        let seen = table.read(&office);

        // A start completes between the query and the record
        table.begin(&office, Operation::Start).unwrap();
        table.finish(&office, TunnelState::Started, None);

        assert_eq!(table.observe(&office, seen, TunnelState::Stopped), TunnelState::Started);
        assert_eq!(table.get(&office), TunnelState::Started);
    }

    #[test]
    fn test_observation_after_delete_does_not_resurrect() {
        let table = TunnelTable::new();
        let office = name("office");
        let seen = table.read(&office);
        table.finish(&office, TunnelState::Stopped, None);
        table.remove(&office);

        assert_eq!(table.observe(&office, seen, TunnelState::Stopped), TunnelState::Stopped);
        assert!(table.in_state(TunnelState::Stopped).is_empty());
    }

    #[test]
    fn test_transitional_observation_not_recorded() {
        let table = TunnelTable::new();
        let office = name("office");
        let seen = table.read(&office);
        assert_eq!(table.observe(&office, seen, TunnelState::Starting), TunnelState::Starting);
        assert_eq!(table.get(&office), TunnelState::Unknown);
    }

    #[test]
    fn test_remove_forgets_tunnel() {
        let table = TunnelTable::new();
        let office = name("office");
        table.finish(&office, TunnelState::Stopped, None);
        table.remove(&office);
        assert_eq!(table.get(&office), TunnelState::Unknown);
    }
}
