// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Loop lifecycle state cell.
//!
//! Pure CAS transitions; callers enforce semantic legality. The cell is
//! isolated in its own cache line so a busy ingress queue on a neighboring
//! line never bounces this one between cores.

use std::sync::atomic::{AtomicU8, Ordering};

/// Loop lifecycle states. Values are stable for cross-version debugging.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Awake = 0,
    Running = 1,
    Sleeping = 2,
    Terminating = 3,
    Terminated = 4,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Awake,
            1 => Self::Running,
            2 => Self::Sleeping,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

/// Padding on both sides of the atomic to prevent false sharing with
/// whatever the allocator places next to it.
#[repr(align(128))]
pub struct StateCell {
    cell: AtomicU8,
}

impl StateCell {
    pub fn new(initial: LoopState) -> Self {
        Self {
            cell: AtomicU8::new(initial as u8),
        }
    }

    pub fn load(&self) -> LoopState {
        LoopState::from_u8(self.cell.load(Ordering::Acquire))
    }

    pub fn store(&self, state: LoopState) {
        self.cell.store(state as u8, Ordering::Release);
    }

    /// CAS from `from` to `to`. Returns the state actually observed on
    /// failure so the caller can decide what to do next without a
    /// second load (avoids a TOCTOU window between failure and re-read).
    pub fn try_transition(&self, from: LoopState, to: LoopState) -> Result<(), LoopState> {
        match self.cell.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(observed) => Err(LoopState::from_u8(observed)),
        }
    }

    /// CAS from any of `froms` to `to`. Any thread may request
    /// `{Running|Sleeping} -> Terminating`.
    pub fn transition_any(&self, froms: &[LoopState], to: LoopState) -> Result<LoopState, LoopState> {
        loop {
            let current = self.load();
            if !froms.contains(&current) {
                return Err(current);
            }
            match self.cell.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(_) => continue,
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.load() == LoopState::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.load() == LoopState::Terminated
    }

    /// True for {Awake, Running, Sleeping}.
    pub fn can_accept_work(&self) -> bool {
        matches!(
            self.load(),
            LoopState::Awake | LoopState::Running | LoopState::Sleeping
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn initial_state_round_trips() {
        let cell = StateCell::new(LoopState::Awake);
        assert_eq!(cell.load(), LoopState::Awake);
    }

    #[test]
    fn try_transition_succeeds_and_fails() {
        let cell = StateCell::new(LoopState::Awake);
        assert!(cell.try_transition(LoopState::Awake, LoopState::Running).is_ok());
        assert_eq!(
            cell.try_transition(LoopState::Awake, LoopState::Sleeping),
            Err(LoopState::Running)
        );
    }

    #[test]
    fn can_accept_work_excludes_terminating() {
        let cell = StateCell::new(LoopState::Terminating);
        assert!(!cell.can_accept_work());
        cell.store(LoopState::Terminated);
        assert!(cell.is_terminal());
    }

    #[test]
    fn zombie_state_guard_never_overwrites_terminating() {
        // A concurrent thread wins the Terminating transition between
        // the loop thread's decision to sleep and its CAS attempt.
        let cell = Arc::new(StateCell::new(LoopState::Running));
        let other = cell.clone();
        other
            .transition_any(&[LoopState::Running, LoopState::Sleeping], LoopState::Terminating)
            .unwrap();

        // The loop thread must observe the failure and must not force
        // Sleeping unconditionally.
        let result = cell.try_transition(LoopState::Running, LoopState::Sleeping);
        assert_eq!(result, Err(LoopState::Terminating));
    }

    #[test]
    fn transition_any_races_to_single_winner() {
        let cell = Arc::new(StateCell::new(LoopState::Running));
        let mut handles = vec![];
        for _ in 0..8 {
            let cell = cell.clone();
            handles.push(thread::spawn(move || {
                cell.transition_any(&[LoopState::Running], LoopState::Terminating)
                    .is_ok()
            }));
        }
        let wins: usize = handles.into_iter().map(|h| h.join().unwrap() as usize).sum();
        assert_eq!(wins, 1);
        assert_eq!(cell.load(), LoopState::Terminating);
    }
}
