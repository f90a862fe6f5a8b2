// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scan lifecycle state machine: seven states, eight events, a bounded
//! retry counter. States/events/transitions are pure data; the only
//! polymorphism is the host-provided [`FsmCallback`] that turns an edge
//! into a real SPI write. Invalid transitions are ignored, never panic,
//! never block.

/// Current phase of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Configure,
    Arm,
    Scanning,
    Streaming,
    Complete,
    Error,
}

/// Governs what happens after one streaming pass completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Single,
    Continuous,
    Calibration,
}

/// An external stimulus driving the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEvent {
    StartScan(ScanMode),
    ConfigDone,
    ArmDone,
    FrameReady,
    Complete,
    StopScan,
    Error,
    ErrorCleared,
}

/// Upper bound on [`ScanFsm`]'s retry counter; the fourth consecutive
/// `ErrorCleared` without an intervening successful run leaves the FSM
/// stuck in [`ScanState::Error`] until `StopScan`.
pub const MAX_RETRIES: u8 = 3;

/// Edge the FSM asks its host to realize as a real hardware action. The
/// FSM itself has no notion of SPI registers; it only names the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEdge {
    OnConfigure(ScanMode),
    OnArm,
    OnStop,
    OnError { previous: ScanState, reason: &'static str },
}

/// Host collaborator invoked on every emitted edge. In a real deployment
/// this drives SPI writes to the FPGA's control register; the FSM itself
/// does not know or care about that register's bit layout.
pub trait FsmCallback {
    fn on_edge(&mut self, edge: FsmEdge);
}

/// A callback that does nothing; paired with auto-generated
/// `ConfigDone`/`ArmDone` this lets [`ScanFsm`] be exercised standalone,
/// with no SPI collaborator wired up at all.
struct NoCallback;

impl FsmCallback for NoCallback {
    fn on_edge(&mut self, _edge: FsmEdge) {}
}

/// Counters observed through [`ScanFsm::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsmCounters {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub errors: u64,
    pub retries: u64,
}

/// A point-in-time view of the FSM, the natural seam `GET_STATUS` reads
/// without reaching into FSM internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmSnapshot {
    pub state: ScanState,
    pub mode: ScanMode,
    pub retry_count: u8,
    pub counters: FsmCounters,
}

/// The scan lifecycle state machine.
pub struct ScanFsm {
    state: ScanState,
    mode: ScanMode,
    retry_count: u8,
    counters: FsmCounters,
    callback: Box<dyn FsmCallback>,
    standalone: bool,
}

impl ScanFsm {
    /// Builds an FSM driven by `callback`; every emitted edge is handed to
    /// it, and `CONFIG_DONE`/`ARM_DONE` are expected to arrive from the
    /// real world (e.g. an SPI completion interrupt) rather than being
    /// synthesized.
    pub fn new(callback: impl FsmCallback + 'static) -> Self {
        Self {
            state: ScanState::Idle,
            mode: ScanMode::Single,
            retry_count: 0,
            counters: FsmCounters::default(),
            callback: Box::new(callback),
            standalone: false,
        }
    }

    /// Builds an FSM with no wired callback: `CONFIG_DONE` and `ARM_DONE`
    /// are synthesized immediately after `OnConfigure`/`OnArm` so the FSM
    /// can be driven end to end from just `StartScan`/`FrameReady`/
    /// `Complete`/`StopScan`.
    pub fn standalone() -> Self {
        Self {
            state: ScanState::Idle,
            mode: ScanMode::Single,
            retry_count: 0,
            counters: FsmCounters::default(),
            callback: Box::new(NoCallback),
            standalone: true,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            state: self.state,
            mode: self.mode,
            retry_count: self.retry_count,
            counters: self.counters,
        }
    }

    fn emit(&mut self, edge: FsmEdge) {
        self.callback.on_edge(edge);
    }

    /// Processes one event, applying at most the transitions the table
    /// defines for the current state; anything else is logged and
    /// ignored.
    pub fn handle(&mut self, event: ScanEvent) {
        use ScanEvent as E;
        use ScanState as S;

        match (self.state, event) {
            (S::Idle, E::StartScan(mode)) | (S::Complete, E::StartScan(mode)) => {
                self.mode = mode;
                self.state = S::Configure;
                self.emit(FsmEdge::OnConfigure(mode));
                if self.standalone {
                    self.handle(E::ConfigDone);
                }
            }
            (S::Configure, E::ConfigDone) => {
                self.state = S::Arm;
                self.emit(FsmEdge::OnArm);
                if self.standalone {
                    self.handle(E::ArmDone);
                }
            }
            (S::Arm, E::ArmDone) => {
                self.state = S::Scanning;
            }
            (S::Scanning, E::FrameReady) => {
                self.counters.frames_received += 1;
                self.state = S::Streaming;
            }
            (S::Streaming, E::Complete) => {
                self.counters.frames_sent += 1;
                match self.mode {
                    ScanMode::Single => {
                        // Land visibly in `Complete` first: a concurrent
                        // `GET_STATUS` read interleaved with this call
                        // observes the state `snapshot` took just before
                        // `tick` drives it onward, satisfying the "two
                        // step so observers can see COMPLETE" requirement
                        // without the FSM owning its own thread.
                        self.state = S::Complete;
                    }
                    ScanMode::Continuous | ScanMode::Calibration => {
                        self.state = S::Scanning;
                    }
                }
            }
            (S::Configure, E::StopScan)
            | (S::Arm, E::StopScan)
            | (S::Scanning, E::StopScan)
            | (S::Streaming, E::StopScan)
            | (S::Complete, E::StopScan)
            | (S::Error, E::StopScan) => {
                self.state = S::Idle;
                self.emit(FsmEdge::OnStop);
            }
            (S::Error, E::ErrorCleared) => {
                if self.retry_count < MAX_RETRIES {
                    self.retry_count += 1;
                    self.counters.retries += 1;
                    self.state = S::Idle;
                }
                // else: stays in Error, retries exhausted.
            }
            (state, E::Error) if state != S::Error => {
                self.state = S::Error;
                self.counters.errors += 1;
                self.emit(FsmEdge::OnError {
                    previous: state,
                    reason: "error event",
                });
            }
            _ => {
                log::trace!(
                    "ignoring event {:?} in state {:?} (not a legal transition)",
                    event,
                    self.state
                );
            }
        }
    }

    /// Advances the FSM one step with no external event: the only
    /// transition this drives is `Complete -> Idle` for a single-shot
    /// scan, the second half of the two-step the `STREAMING`/`COMPLETE`
    /// transition described above. A no-op in every other state. Callers
    /// (the orchestrator's run loop) call this once per iteration.
    pub fn tick(&mut self) {
        if self.state == ScanState::Complete {
            self.state = ScanState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingCallback {
        edges: Rc<RefCell<Vec<FsmEdge>>>,
    }

    impl FsmCallback for RecordingCallback {
        fn on_edge(&mut self, edge: FsmEdge) {
            self.edges.borrow_mut().push(edge);
        }
    }

    #[test]
    fn happy_path_single_shot_scan() {
        let edges = Rc::new(RefCell::new(Vec::new()));
        let mut fsm = ScanFsm::new(RecordingCallback { edges: edges.clone() });

        fsm.handle(ScanEvent::StartScan(ScanMode::Single));
        assert_eq!(fsm.state(), ScanState::Configure);
        fsm.handle(ScanEvent::ConfigDone);
        assert_eq!(fsm.state(), ScanState::Arm);
        fsm.handle(ScanEvent::ArmDone);
        assert_eq!(fsm.state(), ScanState::Scanning);
        fsm.handle(ScanEvent::FrameReady);
        assert_eq!(fsm.state(), ScanState::Streaming);
        fsm.handle(ScanEvent::Complete);
        assert_eq!(fsm.state(), ScanState::Complete);
        fsm.tick();
        assert_eq!(fsm.state(), ScanState::Idle);

        assert_eq!(
            *edges.borrow(),
            vec![FsmEdge::OnConfigure(ScanMode::Single), FsmEdge::OnArm]
        );
        let snap = fsm.snapshot();
        assert_eq!(snap.counters.frames_received, 1);
        assert_eq!(snap.counters.frames_sent, 1);
    }

    #[test]
    fn standalone_fsm_self_advances_through_configure_and_arm() {
        let mut fsm = ScanFsm::standalone();
        fsm.handle(ScanEvent::StartScan(ScanMode::Continuous));
        assert_eq!(fsm.state(), ScanState::Scanning);
    }

    #[test]
    fn continuous_mode_returns_to_scanning_not_complete() {
        let mut fsm = ScanFsm::standalone();
        fsm.handle(ScanEvent::StartScan(ScanMode::Continuous));
        fsm.handle(ScanEvent::FrameReady);
        fsm.handle(ScanEvent::Complete);
        assert_eq!(fsm.state(), ScanState::Scanning);
    }

    #[test]
    fn retry_exhaustion_leaves_fsm_stuck_in_error() {
        let mut fsm = ScanFsm::standalone();
        for _ in 0..3 {
            fsm.handle(ScanEvent::Error);
            assert_eq!(fsm.state(), ScanState::Error);
            fsm.handle(ScanEvent::ErrorCleared);
            assert_eq!(fsm.state(), ScanState::Idle);
        }
        assert_eq!(fsm.retry_count(), 3);

        fsm.handle(ScanEvent::Error);
        assert_eq!(fsm.state(), ScanState::Error);
        fsm.handle(ScanEvent::ErrorCleared);
        assert_eq!(fsm.state(), ScanState::Error, "4th recovery must not succeed");
    }

    #[test]
    fn stop_scan_escapes_error_state() {
        let mut fsm = ScanFsm::standalone();
        fsm.handle(ScanEvent::Error);
        assert_eq!(fsm.state(), ScanState::Error);
        fsm.handle(ScanEvent::StopScan);
        assert_eq!(fsm.state(), ScanState::Idle);
    }

    #[test]
    fn invalid_transitions_are_silently_ignored() {
        let mut fsm = ScanFsm::standalone();
        fsm.handle(ScanEvent::FrameReady); // illegal from Idle
        assert_eq!(fsm.state(), ScanState::Idle);
        fsm.handle(ScanEvent::ArmDone); // illegal from Idle
        assert_eq!(fsm.state(), ScanState::Idle);
    }

    #[test]
    fn error_from_any_state_is_recorded_with_previous_state() {
        let edges = Rc::new(RefCell::new(Vec::new()));
        let mut fsm = ScanFsm::new(RecordingCallback { edges: edges.clone() });
        fsm.handle(ScanEvent::StartScan(ScanMode::Single));
        fsm.handle(ScanEvent::Error);
        assert_eq!(fsm.state(), ScanState::Error);
        assert_eq!(
            edges.borrow().last(),
            Some(&FsmEdge::OnError {
                previous: ScanState::Configure,
                reason: "error event",
            })
        );
    }

    #[test]
    fn completed_scan_can_restart_without_going_through_idle_first() {
        let mut fsm = ScanFsm::standalone();
        fsm.handle(ScanEvent::StartScan(ScanMode::Single));
        fsm.handle(ScanEvent::FrameReady);
        fsm.handle(ScanEvent::Complete);
        assert_eq!(fsm.state(), ScanState::Complete);
        fsm.handle(ScanEvent::StartScan(ScanMode::Single));
        assert_eq!(fsm.state(), ScanState::Scanning);
    }
}
