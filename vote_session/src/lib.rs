mod config;
use log::{debug, info, warn};

use std::collections::HashMap;

pub use crate::config::*;

// **** Private structures ****

// Index into the fixed, ordered position list of the mapping.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
struct PositionId(u32);

/// The static key -> (candidate, position) lookup table.
///
/// Built once at startup from the kiosk configuration and read-only
/// afterwards. Construction fails fast on a conflicting or incomplete set of
/// bindings; an unbound key at runtime is not an error, only a `None`.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BallotMapping {
    // In ballot order. The order of this list is the column order of every
    // persisted row.
    positions: Vec<String>,
    bindings: HashMap<String, (String, PositionId)>,
}

impl BallotMapping {
    pub fn new(positions: &[String], bindings: &[KeyBinding]) -> Result<BallotMapping, SessionError> {
        if positions.is_empty() {
            return Err(SessionError::NoPositions);
        }
        let ids: HashMap<&str, PositionId> = positions
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), PositionId(idx as u32)))
            .collect();
        let mut map: HashMap<String, (String, PositionId)> = HashMap::new();
        for b in bindings.iter() {
            let pid = match ids.get(b.position.as_str()) {
                Some(pid) => *pid,
                None => {
                    return Err(SessionError::UnknownPosition {
                        key: b.key.clone(),
                        position: b.position.clone(),
                    })
                }
            };
            if map.insert(b.key.clone(), (b.candidate.clone(), pid)).is_some() {
                return Err(SessionError::DuplicateKey { key: b.key.clone() });
            }
        }
        for (idx, name) in positions.iter().enumerate() {
            let covered = map.values().any(|(_, pid)| pid.0 == idx as u32);
            if !covered {
                return Err(SessionError::PositionWithoutCandidates {
                    position: name.clone(),
                });
            }
        }
        debug!(
            "BallotMapping: {} keys over {} positions",
            map.len(),
            positions.len()
        );
        Ok(BallotMapping {
            positions: positions.to_vec(),
            bindings: map,
        })
    }

    /// The bound candidate and position for this key, if any.
    pub fn lookup(&self, key: &str) -> Option<(&str, &str)> {
        self.bindings
            .get(key)
            .map(|(cand, pid)| (cand.as_str(), self.positions[pid.0 as usize].as_str()))
    }

    pub fn positions(&self) -> &[String] {
        &self.positions
    }

    pub fn num_positions(&self) -> usize {
        self.positions.len()
    }
}

/// The phases of a voting session.
///
/// `Completing` covers the window between the last vote and the commit, while
/// the feedback display still shows the last symbol.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum SessionState {
    Idle,
    Armed,
    Completing,
}

/// The in-progress ballot of the current student.
///
/// One instance exists for the lifetime of the kiosk; `arm` starts a session
/// for the next student and a finalize or abort returns it to `Idle`. All
/// mutation goes through the methods below and must be serialized by the
/// caller (one consumer loop owns the session).
pub struct VoteSession {
    mapping: BallotMapping,
    rules: KioskRules,
    state: SessionState,
    votes: HashMap<PositionId, String>,
    // Set on any key-down while a session runs, bound or not. A key must be
    // released before its next press registers.
    last_key: Option<String>,
    seq: SessionSeq,
}

impl VoteSession {
    pub fn new(mapping: BallotMapping, rules: &KioskRules) -> VoteSession {
        VoteSession {
            mapping,
            rules: *rules,
            state: SessionState::Idle,
            votes: HashMap::new(),
            last_key: None,
            seq: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn seq(&self) -> SessionSeq {
        self.seq
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.votes.len(), self.mapping.num_positions())
    }

    /// Starts a session for the next student. Valid from `Idle` only; an arm
    /// request while a session runs is dropped.
    pub fn arm(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Idle {
            warn!("arm: a session is already in progress, ignoring");
            return vec![];
        }
        self.votes.clear();
        self.last_key = None;
        self.seq += 1;
        self.state = SessionState::Armed;
        info!("session {} armed", self.seq);
        vec![
            Effect::ClearDisplay,
            Effect::Progress {
                filled: 0,
                total: self.mapping.num_positions(),
            },
        ]
    }

    /// One key-down edge from the keyboard.
    ///
    /// Silently dropped when no session runs, when the key is still held,
    /// when the key is unbound, or when the key's position already has a
    /// vote. Keyboards are noisy; none of these are errors.
    pub fn key_down(&mut self, key: &str, ledger: &mut dyn Ledger) -> Vec<Effect> {
        if self.state == SessionState::Idle {
            return vec![];
        }
        if self.last_key.as_deref() == Some(key) {
            debug!("key_down: {:?} still held, ignoring", key);
            return vec![];
        }
        self.last_key = Some(key.to_string());

        let (candidate, pid) = match self.bindings_get(key) {
            Some(p) => p,
            None => {
                debug!("key_down: {:?} is not bound, ignoring", key);
                return vec![];
            }
        };
        if self.votes.contains_key(&pid) {
            debug!(
                "key_down: position {:?} already has a vote, ignoring {:?}",
                self.mapping.positions[pid.0 as usize], key
            );
            return vec![];
        }

        self.votes.insert(pid, candidate.clone());
        let filled = self.votes.len();
        let total = self.mapping.num_positions();
        info!(
            "session {}: vote recorded for {:?} ({}/{})",
            self.seq, self.mapping.positions[pid.0 as usize], filled, total
        );

        let mut effects = vec![Effect::ShortTone];
        if self.rules.student_screen_enabled {
            effects.push(Effect::ShowCandidate(candidate));
            effects.push(Effect::ClearDisplayAfter(self.rules.feedback_delay_ms));
        }
        effects.push(Effect::Progress { filled, total });

        // The scratch row is a forensic aid only: a failed write must not
        // stop the voting flow.
        if let Err(e) = ledger.write_scratch(&self.scratch_row()) {
            warn!("session {}: scratch write failed, continuing: {}", self.seq, e);
        }

        if filled == total {
            self.state = SessionState::Completing;
            effects.push(Effect::ScheduleFinalize {
                seq: self.seq,
                delay_ms: self.rules.finalize_delay_ms(),
            });
        }
        effects
    }

    /// One key-up edge. Re-arms the held-key suppression for this key,
    /// whatever the fill state of its position.
    pub fn key_up(&mut self, key: &str) {
        if self.last_key.as_deref() == Some(key) {
            self.last_key = None;
        }
    }

    /// Commits the completed ballot. Called by the deferred completion (with
    /// the sequence number it was scheduled for) or by a staff stop/abort on
    /// a `Completing` session.
    ///
    /// A request for another sequence number or outside `Completing` is a
    /// no-op: it is a timer from a session that has already ended. A ledger
    /// failure is returned and leaves the votes in place so that staff can
    /// retry.
    pub fn finalize(
        &mut self,
        seq: SessionSeq,
        ledger: &mut dyn Ledger,
        roster: &mut CohortRoster,
    ) -> Result<Vec<Effect>, SessionError> {
        if seq != self.seq || self.state != SessionState::Completing {
            debug!(
                "finalize: stale request for session {} (current {}, state {:?}), ignoring",
                seq, self.seq, self.state
            );
            return Ok(vec![]);
        }
        let row = self.full_row()?;
        ledger.commit(&row)?;
        self.reset_to_idle();
        roster.record_student();
        let current = roster.current();
        info!(
            "ballot committed; cohort {:?} now at {} students, {} in total",
            current.name,
            current.count,
            roster.total_students()
        );
        ledger.persist_cohorts(roster.cohorts())?;
        Ok(vec![Effect::LongTone, Effect::ClearDisplay])
    }

    /// Staff reset. A completed-but-uncommitted session is finalized; a
    /// partially filled one is discarded without a ledger write (blank
    /// columns are never committed); an empty or idle one is simply cleared.
    pub fn abort(
        &mut self,
        ledger: &mut dyn Ledger,
        roster: &mut CohortRoster,
    ) -> Result<Vec<Effect>, SessionError> {
        match self.state {
            SessionState::Idle => Ok(vec![]),
            SessionState::Completing => {
                info!("abort: session {} is complete, committing it", self.seq);
                self.finalize(self.seq, ledger, roster)
            }
            SessionState::Armed => {
                if !self.votes.is_empty() {
                    warn!(
                        "abort: discarding partial ballot with {} of {} votes",
                        self.votes.len(),
                        self.mapping.num_positions()
                    );
                    if let Err(e) = ledger.clear_scratch() {
                        warn!("abort: could not remove the scratch record: {}", e);
                    }
                }
                self.reset_to_idle();
                Ok(vec![Effect::ClearDisplay])
            }
        }
    }

    fn reset_to_idle(&mut self) {
        self.state = SessionState::Idle;
        self.votes.clear();
        self.last_key = None;
        // Invalidates any finalize still scheduled against this session.
        self.seq += 1;
    }

    fn bindings_get(&self, key: &str) -> Option<(String, PositionId)> {
        self.mapping.bindings.get(key).cloned()
    }

    fn scratch_row(&self) -> Vec<Option<String>> {
        (0..self.mapping.num_positions())
            .map(|idx| self.votes.get(&PositionId(idx as u32)).cloned())
            .collect()
    }

    fn full_row(&self) -> Result<Vec<String>, SessionError> {
        let mut row: Vec<String> = Vec::new();
        for idx in 0..self.mapping.num_positions() {
            match self.votes.get(&PositionId(idx as u32)) {
                Some(candidate) => row.push(candidate.clone()),
                None => {
                    return Err(SessionError::IncompleteBallot {
                        filled: self.votes.len(),
                        total: self.mapping.num_positions(),
                    })
                }
            }
        }
        Ok(row)
    }
}

/// The ordered list of cohorts. The last entry is the active one.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CohortRoster {
    cohorts: Vec<Cohort>,
}

impl CohortRoster {
    /// Rebuilds the roster from the persisted rows and opens the next
    /// numbered cohort as the active one. With no history, this starts at
    /// "Session 1".
    pub fn bootstrap(persisted: Vec<Cohort>) -> CohortRoster {
        let mut cohorts = persisted;
        let name = next_cohort_name(&cohorts);
        info!(
            "roster: {} past cohorts, opening {:?}",
            cohorts.len(),
            name
        );
        cohorts.push(Cohort { name, count: 0 });
        CohortRoster { cohorts }
    }

    /// Opens the next numbered cohort and makes it active.
    pub fn start_next(&mut self) -> &Cohort {
        let name = next_cohort_name(&self.cohorts);
        self.cohorts.push(Cohort { name, count: 0 });
        self.current()
    }

    /// One more finalized ballot in the active cohort.
    pub fn record_student(&mut self) {
        if let Some(c) = self.cohorts.last_mut() {
            c.count += 1;
        }
    }

    pub fn current(&self) -> &Cohort {
        // Non-empty by construction.
        self.cohorts.last().unwrap()
    }

    pub fn cohorts(&self) -> &[Cohort] {
        &self.cohorts
    }

    pub fn total_students(&self) -> u64 {
        self.cohorts.iter().map(|c| c.count).sum()
    }
}

fn next_cohort_name(cohorts: &[Cohort]) -> String {
    let last_num = cohorts
        .last()
        .and_then(|c| c.name.split_whitespace().last())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    format!("Session {}", last_num + 1)
}
