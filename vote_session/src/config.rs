// ********* Input data structures ***********

use std::error::Error;
use std::fmt::Display;

/// One key of the voting keyboard, bound to a candidate running for a position.
///
/// The full set of bindings forms the ballot mapping. A key may be bound at
/// most once; a position may carry several competing bindings.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct KeyBinding {
    pub key: String,
    pub candidate: String,
    pub position: String,
}

/// A named batch of students ("Session 1", "Session 2", ...), with the number
/// of finalized ballots recorded while it was active.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Cohort {
    pub name: String,
    pub count: u64,
}

// ******** Output data structures *********

/// Identity of one student's session. Deferred work (the delayed finalize)
/// carries the sequence number it was scheduled for and is dropped if the
/// session has ended in the meantime.
pub type SessionSeq = u64;

/// Side effects requested by the state machine.
///
/// The machine never talks to a display, a speaker or a timer directly: it
/// returns the effects and the caller renders them. None of them may feed
/// back into the session state, except `ScheduleFinalize` which re-enters
/// through a `Finalize` event.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Effect {
    ShowCandidate(String),
    ClearDisplay,
    /// Clear the student display after the given number of milliseconds.
    ClearDisplayAfter(u64),
    ShortTone,
    LongTone,
    Progress {
        filled: usize,
        total: usize,
    },
    ScheduleFinalize {
        seq: SessionSeq,
        delay_ms: u64,
    },
}

/// Everything that can happen to the kiosk, staff commands included.
///
/// The event loop matches on this exhaustively; there is no other channel
/// into the session state.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum KioskEvent {
    KeyDown(String),
    KeyUp(String),
    Arm,
    Abort { code: String },
    Finalize { seq: SessionSeq },
    NewCohort { code: String },
    Shutdown { code: String },
}

/// Errors raised when building a ballot mapping or committing a ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum SessionError {
    /// The mapping declares no position at all.
    NoPositions,
    /// The same key is bound to two candidates.
    DuplicateKey { key: String },
    /// A binding references a position that is not declared.
    UnknownPosition { key: String, position: String },
    /// A declared position has no candidate bound to it.
    PositionWithoutCandidates { position: String },
    /// A finalize was requested before every position had a vote.
    IncompleteBallot { filled: usize, total: usize },
    /// A durable store refused a write.
    Ledger { message: String },
}

impl Error for SessionError {}

impl Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NoPositions => write!(f, "the ballot mapping declares no position"),
            SessionError::DuplicateKey { key } => {
                write!(f, "the key {:?} is bound more than once", key)
            }
            SessionError::UnknownPosition { key, position } => {
                write!(
                    f,
                    "the key {:?} references unknown position {:?}",
                    key, position
                )
            }
            SessionError::PositionWithoutCandidates { position } => {
                write!(f, "the position {:?} has no candidate", position)
            }
            SessionError::IncompleteBallot { filled, total } => {
                write!(
                    f,
                    "ballot incomplete: {} of {} positions filled",
                    filled, total
                )
            }
            SessionError::Ledger { message } => write!(f, "ledger failure: {}", message),
        }
    }
}

/// Durable storage for ballots, as seen by the state machine.
///
/// Rows follow the fixed position order of the mapping. `commit` must append
/// the row to every copy of the vote table and remove the scratch record;
/// `write_scratch` overwrites the single in-progress row (blanks allowed) and
/// is best-effort only.
pub trait Ledger {
    fn write_scratch(&mut self, row: &[Option<String>]) -> Result<(), SessionError>;
    fn clear_scratch(&mut self) -> Result<(), SessionError>;
    fn commit(&mut self, row: &[String]) -> Result<(), SessionError>;
    fn persist_cohorts(&mut self, cohorts: &[Cohort]) -> Result<(), SessionError>;
}

// ********* Configuration **********

/// Tunable behavior of a voting session.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct KioskRules {
    /// Whether the student-facing feedback display is in use.
    pub student_screen_enabled: bool,
    /// How long the last symbol stays on the display, in milliseconds. Also
    /// the delay between session completion and the ballot commit.
    pub feedback_delay_ms: u64,
}

impl KioskRules {
    pub const DEFAULT_RULES: KioskRules = KioskRules {
        student_screen_enabled: true,
        feedback_delay_ms: 2000,
    };

    /// The wait between the last vote and the commit. Zero when there is no
    /// display to leave time for.
    pub fn finalize_delay_ms(&self) -> u64 {
        if self.student_screen_enabled {
            self.feedback_delay_ms
        } else {
            0
        }
    }
}
