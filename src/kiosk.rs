use log::{debug, error, info, warn};

use vote_session::*;

use snafu::{prelude::*, Snafu};

use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::args::Args;
use crate::kiosk::config_reader::*;
use crate::kiosk::io_csv::{CsvLedger, LedgerPaths};

pub mod io_csv;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum KioskError {
    #[snafu(display("Error opening configuration file {path}"))]
    OpeningConfig {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing configuration file {path}"))]
    ParsingConfig {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Invalid ballot mapping: {source}"))]
    InvalidMapping { source: SessionError },
    #[snafu(display("Error accessing {path}"))]
    CsvFile { source: csv::Error, path: String },
    #[snafu(display("Could not save the session roster: {source}"))]
    SaveRoster { source: SessionError },
    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type KioskResult<T> = Result<T, KioskError>;

pub mod config_reader {
    use crate::kiosk::*;

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct KeyBindingConfig {
        pub key: String,
        pub candidate: String,
        pub position: String,
    }

    /// Overrides for the CSV file names, all relative to the data directory.
    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct FileLocations {
        pub votes: Option<String>,
        #[serde(rename = "backupVotes")]
        pub backup_votes: Option<String>,
        pub scratch: Option<String>,
        #[serde(rename = "sessionData")]
        pub session_data: Option<String>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct KioskConfig {
        /// The contested positions, in ballot order. This order is the column
        /// order of every CSV row.
        pub positions: Vec<String>,
        #[serde(rename = "keyBindings")]
        pub key_bindings: Vec<KeyBindingConfig>,
        #[serde(rename = "staffPin")]
        pub staff_pin: String,
        #[serde(rename = "enableStudentScreen")]
        pub enable_student_screen: Option<bool>,
        #[serde(rename = "feedbackDelayMs")]
        pub feedback_delay_ms: Option<u64>,
        pub files: Option<FileLocations>,
    }

    impl KioskConfig {
        pub fn rules(&self) -> KioskRules {
            KioskRules {
                student_screen_enabled: self.enable_student_screen.unwrap_or(true),
                feedback_delay_ms: self
                    .feedback_delay_ms
                    .unwrap_or(KioskRules::DEFAULT_RULES.feedback_delay_ms),
            }
        }

        pub fn bindings(&self) -> Vec<KeyBinding> {
            self.key_bindings
                .iter()
                .map(|b| KeyBinding {
                    key: b.key.clone(),
                    candidate: b.candidate.clone(),
                    position: b.position.clone(),
                })
                .collect()
        }

        pub fn ledger_paths(&self, data_dir: &Path) -> LedgerPaths {
            let mut paths = LedgerPaths::in_dir(data_dir);
            if let Some(files) = &self.files {
                if let Some(f) = &files.votes {
                    paths.votes = data_dir.join(f);
                }
                if let Some(f) = &files.backup_votes {
                    paths.backup_votes = data_dir.join(f);
                }
                if let Some(f) = &files.scratch {
                    paths.scratch = data_dir.join(f);
                }
                if let Some(f) = &files.session_data {
                    paths.session_data = data_dir.join(f);
                }
            }
            paths
        }
    }

    pub fn read_config(path: &str) -> KioskResult<KioskConfig> {
        let contents = fs::read_to_string(path).context(OpeningConfigSnafu { path })?;
        let config: KioskConfig =
            serde_json::from_str(contents.as_str()).context(ParsingConfigSnafu { path })?;
        debug!("read_config: {:?}", config);
        Ok(config)
    }
}

/// Authorization gate in front of the staff commands. Arming is open; reset,
/// new-cohort and stop are not.
pub trait AccessGate {
    fn check(&self, code: &str) -> bool;
}

pub struct StaffPin {
    pin: String,
}

impl StaffPin {
    pub fn new(pin: &str) -> StaffPin {
        StaffPin {
            pin: pin.to_string(),
        }
    }
}

impl AccessGate for StaffPin {
    fn check(&self, code: &str) -> bool {
        self.pin == code
    }
}

/// The student-facing feedback display. Implementations clear themselves and
/// never touch the session.
pub trait FeedbackSurface {
    fn show(&self, text: &str);
    fn clear(&self);
    fn clear_after(&self, delay: Duration);
}

/// Console rendition of the student display.
pub struct ConsoleDisplay;

impl FeedbackSurface for ConsoleDisplay {
    fn show(&self, text: &str) {
        println!("==== {} ====", text);
    }

    fn clear(&self) {
        println!();
    }

    fn clear_after(&self, delay: Duration) {
        thread::spawn(move || {
            thread::sleep(delay);
            println!();
        });
    }
}

pub trait AudioSurface {
    fn short_tone(&self);
    fn long_tone(&self);
}

/// Terminal-bell tones, fired from their own thread so the event loop never
/// waits on them.
pub struct BellAudio;

impl BellAudio {
    fn bell(times: usize) {
        thread::spawn(move || {
            use std::io::Write;
            for _ in 0..times {
                print!("\x07");
                let _ = std::io::stdout().flush();
                thread::sleep(Duration::from_millis(150));
            }
        });
    }
}

impl AudioSurface for BellAudio {
    fn short_tone(&self) {
        BellAudio::bell(1);
    }

    fn long_tone(&self) {
        BellAudio::bell(3);
    }
}

/// The staff/keyboard line protocol, one event per line:
/// `down K`, `up K`, `arm`, `abort PIN`, `new-session PIN`, `stop PIN`.
///
/// `Finalize` is deliberately not parseable: it only enters the queue from
/// the completion timer, with the session sequence it was scheduled for.
fn parse_event(line: &str) -> Option<KioskEvent> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "down" => Some(KioskEvent::KeyDown(parts.next()?.to_string())),
        "up" => Some(KioskEvent::KeyUp(parts.next()?.to_string())),
        "arm" | "start" => Some(KioskEvent::Arm),
        "abort" | "reset" => Some(KioskEvent::Abort {
            code: parts.next().unwrap_or("").to_string(),
        }),
        "new-session" => Some(KioskEvent::NewCohort {
            code: parts.next().unwrap_or("").to_string(),
        }),
        "stop" | "quit" => Some(KioskEvent::Shutdown {
            code: parts.next().unwrap_or("").to_string(),
        }),
        _ => None,
    }
}

fn spawn_stdin_reader(tx: Sender<KioskEvent>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_event(trimmed) {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                None => warn!("unrecognized command {:?}", trimmed),
            }
        }
    });
}

/// Renders the effects requested by the state machine. Deferred finalizes go
/// back into the queue through their own timer thread.
fn run_effects(
    effects: &[Effect],
    tx: &Sender<KioskEvent>,
    display: &dyn FeedbackSurface,
    audio: &dyn AudioSurface,
) {
    for effect in effects.iter() {
        match effect {
            Effect::ShowCandidate(name) => display.show(name),
            Effect::ClearDisplay => display.clear(),
            Effect::ClearDisplayAfter(ms) => display.clear_after(Duration::from_millis(*ms)),
            Effect::ShortTone => audio.short_tone(),
            Effect::LongTone => audio.long_tone(),
            Effect::Progress { filled, total } => println!("Votes cast: {}/{}", filled, total),
            Effect::ScheduleFinalize { seq, delay_ms } => {
                let tx2 = tx.clone();
                let (seq, delay_ms) = (*seq, *delay_ms);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(delay_ms));
                    let _ = tx2.send(KioskEvent::Finalize { seq });
                });
            }
        }
    }
}

fn refuse(action: &str) {
    error!("authorization failed for {:?}", action);
    eprintln!("Incorrect staff PIN: {} refused.", action);
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
enum LoopAction {
    Continue,
    Stop,
}

/// Applies one event to the kiosk state, collecting the effects to render.
/// All session, roster and ledger mutation goes through here.
fn handle_event(
    event: KioskEvent,
    session: &mut VoteSession,
    roster: &mut CohortRoster,
    ledger: &mut dyn Ledger,
    gate: &dyn AccessGate,
    effects: &mut Vec<Effect>,
) -> KioskResult<LoopAction> {
    match event {
        KioskEvent::KeyDown(key) => effects.extend(session.key_down(&key, ledger)),
        KioskEvent::KeyUp(key) => session.key_up(&key),
        KioskEvent::Arm => effects.extend(session.arm()),
        KioskEvent::Finalize { seq } => match session.finalize(seq, ledger, roster) {
            Ok(e) => effects.extend(e),
            Err(e) => {
                // The votes are still in place; staff can retry with
                // another stop or abort once the disk is back.
                error!("ballot commit failed, votes retained: {}", e);
                eprintln!("COMMIT FAILED: {}. The ballot is still pending.", e);
            }
        },
        KioskEvent::Abort { code } => {
            if !gate.check(&code) {
                refuse("reset");
                return Ok(LoopAction::Continue);
            }
            match session.abort(ledger, roster) {
                Ok(e) => {
                    effects.extend(e);
                    println!("Voting session has been reset.");
                }
                Err(e) => {
                    error!("ballot commit failed during reset: {}", e);
                    eprintln!("COMMIT FAILED: {}. The ballot is still pending.", e);
                }
            }
        }
        KioskEvent::NewCohort { code } => {
            if !gate.check(&code) {
                refuse("new session");
                return Ok(LoopAction::Continue);
            }
            if session.is_active() {
                warn!("new-session refused: a student is voting");
                eprintln!("Refused: a voting session is in progress.");
                return Ok(LoopAction::Continue);
            }
            let name = roster.start_next().name.clone();
            ledger
                .persist_cohorts(roster.cohorts())
                .context(SaveRosterSnafu {})?;
            println!("Current session is now {:?}.", name);
        }
        KioskEvent::Shutdown { code } => {
            if !gate.check(&code) {
                refuse("stop");
                return Ok(LoopAction::Continue);
            }
            if session.state() == SessionState::Completing {
                let seq = session.seq();
                match session.finalize(seq, ledger, roster) {
                    Ok(e) => effects.extend(e),
                    Err(e) => {
                        error!("ballot commit failed, refusing to stop: {}", e);
                        eprintln!("COMMIT FAILED: {}. The ballot is still pending.", e);
                        return Ok(LoopAction::Continue);
                    }
                }
            } else if session.is_active() {
                // A partial ballot is discarded, never committed.
                if let Err(e) = session.abort(ledger, roster) {
                    error!("reset during stop failed: {}", e);
                    return Ok(LoopAction::Continue);
                }
            }
            ledger
                .persist_cohorts(roster.cohorts())
                .context(SaveRosterSnafu {})?;
            info!(
                "kiosk stopped; {} students voted in total",
                roster.total_students()
            );
            return Ok(LoopAction::Stop);
        }
    }
    Ok(LoopAction::Continue)
}

pub fn run_kiosk(args: &Args) -> KioskResult<()> {
    let config = read_config(&args.config)?;

    let data_dir: PathBuf = match &args.data_dir {
        Some(d) => PathBuf::from(d),
        None => Path::new(&args.config)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let mapping = BallotMapping::new(&config.positions, &config.bindings())
        .context(InvalidMappingSnafu {})?;
    let rules = config.rules();
    let mut ledger = CsvLedger::open(config.ledger_paths(&data_dir), &config.positions)?;
    let mut roster = CohortRoster::bootstrap(ledger.read_cohorts()?);
    ledger
        .persist_cohorts(roster.cohorts())
        .context(SaveRosterSnafu {})?;
    info!(
        "current cohort: {:?}; {} students voted so far",
        roster.current().name,
        roster.total_students()
    );

    let (tx, rx) = channel();
    spawn_stdin_reader(tx.clone());

    let gate = StaffPin::new(&config.staff_pin);
    let display = ConsoleDisplay;
    let audio = BellAudio;
    let mut session = VoteSession::new(mapping, &rules);

    println!("Kiosk ready. Commands: arm | down K | up K | abort PIN | new-session PIN | stop PIN");

    for event in rx.iter() {
        let mut effects: Vec<Effect> = Vec::new();
        let action = handle_event(
            event,
            &mut session,
            &mut roster,
            &mut ledger,
            &gate,
            &mut effects,
        )?;
        run_effects(&effects, &tx, &display, &audio);
        if action == LoopAction::Stop {
            // The process exits right after this returns, which also
            // releases the input thread blocked on stdin.
            return Ok(());
        }
    }

    // Stdin went away without a stop command. Keep the roster current anyway.
    if let Err(e) = ledger.persist_cohorts(roster.cohorts()) {
        warn!("could not save the roster on exit: {}", e);
    }
    Ok(())
}

/// Keyboard test mode: echoes the binding of every key name typed on stdin.
/// No session is armed and no file is written.
pub fn run_keyboard_test(args: &Args) -> KioskResult<()> {
    let config = read_config(&args.config)?;
    let mapping = BallotMapping::new(&config.positions, &config.bindings())
        .context(InvalidMappingSnafu {})?;

    println!("Keyboard test mode. Type a key name and press enter (Ctrl-D to leave).");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let key = line.trim();
        if key.is_empty() {
            continue;
        }
        match mapping.lookup(key) {
            Some((candidate, position)) => println!("{} -> {} ({})", key, candidate, position),
            None => println!("{} -> unbound", key),
        }
    }
    Ok(())
}
