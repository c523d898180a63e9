// Role context and drain state
// A replica-scoped record of the current role, which stream (if any) is
// draining, and whether the replica is closing or faulted. All mutation
// goes through transition methods that assert legality.

use crate::state_provider::{ApplyContext, ReplicaRole};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Which stream the replica is currently draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainingStream {
    Invalid,
    Recovery,
    State,
    CopyLog,
    Replication,
    Primary,
}

struct RoleState {
    role: ReplicaRole,
    draining: DrainingStream,
}

/// Mutex-protected role + drain stream; mutated only via transition
/// methods. Faulting is sticky and observable from any thread.
pub struct RoleContextDrainState {
    state: Mutex<RoleState>,
    closing: AtomicBool,
    faulted: AtomicBool,
}

impl RoleContextDrainState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoleState {
                role: ReplicaRole::Unknown,
                draining: DrainingStream::Invalid,
            }),
            closing: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> ReplicaRole {
        self.state.lock().role
    }

    pub fn draining_stream(&self) -> DrainingStream {
        self.state.lock().draining
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// The apply context implied by the current role and drain stream.
    pub fn apply_redo_context(&self) -> ApplyContext {
        let state = self.state.lock();
        match state.draining {
            DrainingStream::Recovery => ApplyContext::RecoveryRedo,
            DrainingStream::State | DrainingStream::CopyLog | DrainingStream::Replication => {
                ApplyContext::SecondaryRedo
            }
            _ => ApplyContext::PrimaryRedo,
        }
    }

    pub fn on_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
        info!("replica closing");
    }

    pub fn on_recovery(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            state.draining,
            DrainingStream::Invalid,
            "recovery can only start from an idle drain state"
        );
        state.draining = DrainingStream::Recovery;
    }

    pub fn on_recovery_completed(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            state.draining,
            DrainingStream::Recovery,
            "recovery completion without recovery"
        );
        state.draining = DrainingStream::Invalid;
    }

    pub fn on_drain_state(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.draining, DrainingStream::Invalid);
        state.draining = DrainingStream::State;
    }

    pub fn on_drain_copy_log(&self) {
        let mut state = self.state.lock();
        // Idempotent: the copy stream may announce the log stage via a
        // progress vector and a false-progress marker in either order
        assert!(matches!(
            state.draining,
            DrainingStream::Invalid | DrainingStream::State | DrainingStream::CopyLog
        ));
        state.draining = DrainingStream::CopyLog;
    }

    pub fn on_drain_replication(&self) {
        let mut state = self.state.lock();
        assert!(matches!(
            state.draining,
            DrainingStream::Invalid | DrainingStream::CopyLog
        ));
        state.draining = DrainingStream::Replication;
    }

    pub fn on_drain_completed(&self) {
        self.state.lock().draining = DrainingStream::Invalid;
    }

    pub fn change_role(&self, role: ReplicaRole) {
        let mut state = self.state.lock();
        if state.role == ReplicaRole::Idle {
            assert!(
                matches!(role, ReplicaRole::Active | ReplicaRole::None),
                "idle replicas promote to active or get removed"
            );
        }
        info!(from = ?state.role, to = ?role, "replica role change");
        state.role = role;
        if role == ReplicaRole::Primary {
            state.draining = DrainingStream::Primary;
        }
    }

    /// Sticky fault: the host observes it and drives the replica to
    /// closing. Safe to call from any pipeline.
    pub fn report_fault(&self, reason: &str) {
        if !self.faulted.swap(true, Ordering::SeqCst) {
            error!(reason, "replica fault reported");
        }
    }
}

impl Default for RoleContextDrainState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_round_trip() {
        let role = RoleContextDrainState::new();
        assert_eq!(role.draining_stream(), DrainingStream::Invalid);
        role.on_recovery();
        assert_eq!(role.apply_redo_context(), ApplyContext::RecoveryRedo);
        role.on_recovery_completed();
        assert_eq!(role.draining_stream(), DrainingStream::Invalid);
    }

    #[test]
    #[should_panic]
    fn recovery_completion_requires_recovery() {
        let role = RoleContextDrainState::new();
        role.on_recovery_completed();
    }

    #[test]
    fn drain_sequence_and_contexts() {
        let role = RoleContextDrainState::new();
        role.change_role(ReplicaRole::Idle);
        role.on_drain_state();
        assert_eq!(role.apply_redo_context(), ApplyContext::SecondaryRedo);
        role.on_drain_copy_log();
        role.on_drain_replication();
        role.on_drain_completed();
        role.change_role(ReplicaRole::Active);
        assert_eq!(role.role(), ReplicaRole::Active);
    }

    #[test]
    fn fault_is_sticky() {
        let role = RoleContextDrainState::new();
        assert!(!role.is_faulted());
        role.report_fault("test");
        role.report_fault("again");
        assert!(role.is_faulted());
    }
}
