// Primitives for the CSV vote ledger.

use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Writer, WriterBuilder};
use log::{debug, info, warn};
use snafu::prelude::*;

use vote_session::{Cohort, Ledger, SessionError};

use crate::kiosk::{CsvFileSnafu, KioskResult};

/// Locations of the four CSV files the kiosk writes.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct LedgerPaths {
    pub votes: PathBuf,
    pub backup_votes: PathBuf,
    pub scratch: PathBuf,
    pub session_data: PathBuf,
}

impl LedgerPaths {
    pub fn in_dir(dir: &Path) -> LedgerPaths {
        LedgerPaths {
            votes: dir.join("votes.csv"),
            backup_votes: dir.join("backup_votes.csv"),
            scratch: dir.join("votes_temp.csv"),
            session_data: dir.join("session_data.csv"),
        }
    }
}

/// CSV-backed ledger: two identical append-only vote tables, a single-row
/// scratch record and the cohort roster.
///
/// The vote tables carry the position names as their header and one candidate
/// per column afterwards, in the fixed position order. They are only ever
/// appended to.
pub struct CsvLedger {
    paths: LedgerPaths,
    positions: Vec<String>,
    // The row of a half-finished commit: already in the primary table, not
    // yet in the backup. A retry must only write the missing copy.
    pending: Option<Vec<String>>,
}

impl CsvLedger {
    /// Opens the ledger, creating the vote tables with their header row when
    /// they do not exist yet.
    pub fn open(paths: LedgerPaths, positions: &[String]) -> KioskResult<CsvLedger> {
        for path in [&paths.votes, &paths.backup_votes] {
            if !path.exists() {
                info!("creating vote table {:?}", path);
                let mut writer = Writer::from_path(path).context(CsvFileSnafu {
                    path: path.display().to_string(),
                })?;
                writer.write_record(positions).context(CsvFileSnafu {
                    path: path.display().to_string(),
                })?;
                writer.flush().map_err(csv::Error::from).context(CsvFileSnafu {
                    path: path.display().to_string(),
                })?;
            }
        }
        Ok(CsvLedger {
            paths,
            positions: positions.to_vec(),
            pending: None,
        })
    }

    /// The persisted cohort roster, in file order. Rows that do not carry
    /// exactly a name and a count are skipped.
    pub fn read_cohorts(&self) -> KioskResult<Vec<Cohort>> {
        if !self.paths.session_data.exists() {
            return Ok(vec![]);
        }
        let path = self.paths.session_data.display().to_string();
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.paths.session_data)
            .context(CsvFileSnafu { path: path.clone() })?;
        let mut res: Vec<Cohort> = Vec::new();
        for record in reader.records() {
            let record = record.context(CsvFileSnafu { path: path.clone() })?;
            if record.len() != 2 {
                warn!("read_cohorts: skipping malformed row {:?}", record);
                continue;
            }
            let count = match record[1].parse::<u64>() {
                Ok(c) => c,
                Err(_) => {
                    warn!("read_cohorts: skipping row with bad count {:?}", record);
                    continue;
                }
            };
            res.push(Cohort {
                name: record[0].to_string(),
                count,
            });
        }
        debug!("read_cohorts: {} cohorts", res.len());
        Ok(res)
    }

    /// Every committed ballot of the primary vote table, in commit order.
    pub fn read_ballots(&self) -> KioskResult<Vec<Vec<String>>> {
        let path = self.paths.votes.display().to_string();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.paths.votes)
            .context(CsvFileSnafu { path: path.clone() })?;
        let mut res: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            let record = record.context(CsvFileSnafu { path: path.clone() })?;
            res.push(record.iter().map(|c| c.to_string()).collect());
        }
        Ok(res)
    }

    fn append_row(path: &Path, row: &[String]) -> Result<(), SessionError> {
        let file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| io_failure(path, &e))?;
        let mut writer = WriterBuilder::new().from_writer(file);
        writer.write_record(row).map_err(|e| io_failure(path, &e))?;
        writer.flush().map_err(|e| io_failure(path, &e))
    }
}

fn io_failure(path: &Path, e: &dyn std::fmt::Display) -> SessionError {
    SessionError::Ledger {
        message: format!("{}: {}", path.display(), e),
    }
}

impl Ledger for CsvLedger {
    fn write_scratch(&mut self, row: &[Option<String>]) -> Result<(), SessionError> {
        let flat: Vec<String> = row.iter().map(|c| c.clone().unwrap_or_default()).collect();
        let mut writer =
            Writer::from_path(&self.paths.scratch).map_err(|e| io_failure(&self.paths.scratch, &e))?;
        writer
            .write_record(&flat)
            .map_err(|e| io_failure(&self.paths.scratch, &e))?;
        writer
            .flush()
            .map_err(|e| io_failure(&self.paths.scratch, &e))
    }

    fn clear_scratch(&mut self) -> Result<(), SessionError> {
        match fs::remove_file(&self.paths.scratch) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure(&self.paths.scratch, &e)),
        }
    }

    fn commit(&mut self, row: &[String]) -> Result<(), SessionError> {
        if row.len() != self.positions.len() || row.iter().any(|c| c.is_empty()) {
            return Err(SessionError::Ledger {
                message: format!("refusing to commit an incomplete row: {:?}", row),
            });
        }
        if self.pending.as_deref() != Some(row) {
            CsvLedger::append_row(&self.paths.votes, row)?;
            self.pending = Some(row.to_vec());
        }
        CsvLedger::append_row(&self.paths.backup_votes, row)?;
        self.pending = None;
        // The scratch record has served its purpose; losing the delete is
        // not worth failing the ballot over.
        if let Err(e) = self.clear_scratch() {
            warn!("commit: could not remove the scratch record: {}", e);
        }
        debug!(
            "commit: appended one row to {:?} and {:?}",
            self.paths.votes, self.paths.backup_votes
        );
        Ok(())
    }

    fn persist_cohorts(&mut self, cohorts: &[Cohort]) -> Result<(), SessionError> {
        let mut writer = Writer::from_path(&self.paths.session_data)
            .map_err(|e| io_failure(&self.paths.session_data, &e))?;
        for c in cohorts.iter() {
            writer
                .write_record(&[c.name.clone(), c.count.to_string()])
                .map_err(|e| io_failure(&self.paths.session_data, &e))?;
        }
        writer
            .flush()
            .map_err(|e| io_failure(&self.paths.session_data, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths(name: &str) -> LedgerPaths {
        let dir = std::env::temp_dir().join(format!("votekiosk-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        LedgerPaths::in_dir(&dir)
    }

    fn positions() -> Vec<String> {
        vec!["Head Boy".to_string(), "Sports Captain".to_string()]
    }

    fn row(a: &str, b: &str) -> Vec<String> {
        vec![a.to_string(), b.to_string()]
    }

    #[test]
    fn commit_round_trip_in_order() {
        let paths = temp_paths("round-trip");
        let mut ledger = CsvLedger::open(paths.clone(), &positions()).unwrap();
        ledger.commit(&row("Fahmi", "Bibi")).unwrap();
        ledger.commit(&row("Rayan", "Marwa")).unwrap();

        assert_eq!(
            ledger.read_ballots().unwrap(),
            vec![row("Fahmi", "Bibi"), row("Rayan", "Marwa")]
        );
        // The backup is byte-identical to the primary table.
        assert_eq!(
            fs::read_to_string(&paths.votes).unwrap(),
            fs::read_to_string(&paths.backup_votes).unwrap()
        );
    }

    #[test]
    fn reopening_does_not_truncate() {
        let paths = temp_paths("reopen");
        let mut ledger = CsvLedger::open(paths.clone(), &positions()).unwrap();
        ledger.commit(&row("Fahmi", "Bibi")).unwrap();
        drop(ledger);

        let ledger = CsvLedger::open(paths, &positions()).unwrap();
        assert_eq!(ledger.read_ballots().unwrap(), vec![row("Fahmi", "Bibi")]);
    }

    #[test]
    fn commit_refuses_blanks() {
        let paths = temp_paths("blanks");
        let mut ledger = CsvLedger::open(paths, &positions()).unwrap();
        assert!(ledger.commit(&row("Fahmi", "")).is_err());
        assert!(ledger.commit(&["Fahmi".to_string()]).is_err());
        assert!(ledger.read_ballots().unwrap().is_empty());
    }

    #[test]
    fn scratch_is_overwritten_and_removed_on_commit() {
        let paths = temp_paths("scratch");
        let mut ledger = CsvLedger::open(paths.clone(), &positions()).unwrap();

        ledger
            .write_scratch(&[Some("Fahmi".to_string()), None])
            .unwrap();
        assert_eq!(fs::read_to_string(&paths.scratch).unwrap(), "Fahmi,\n");

        ledger
            .write_scratch(&[Some("Fahmi".to_string()), Some("Bibi".to_string())])
            .unwrap();
        assert_eq!(fs::read_to_string(&paths.scratch).unwrap(), "Fahmi,Bibi\n");

        ledger.commit(&row("Fahmi", "Bibi")).unwrap();
        assert!(!paths.scratch.exists());
        // Removing an absent scratch is not an error.
        ledger.clear_scratch().unwrap();
    }

    #[test]
    fn retried_commit_writes_each_table_once() {
        let paths = temp_paths("retry");
        let mut ledger = CsvLedger::open(paths.clone(), &positions()).unwrap();

        // The backup table becomes unwritable after the primary append.
        fs::remove_file(&paths.backup_votes).unwrap();
        fs::create_dir(&paths.backup_votes).unwrap();
        assert!(ledger.commit(&row("Fahmi", "Bibi")).is_err());

        fs::remove_dir(&paths.backup_votes).unwrap();
        ledger.commit(&row("Fahmi", "Bibi")).unwrap();

        // One ballot, once per table.
        assert_eq!(ledger.read_ballots().unwrap(), vec![row("Fahmi", "Bibi")]);
        assert_eq!(
            fs::read_to_string(&paths.backup_votes).unwrap(),
            "Fahmi,Bibi\n"
        );

        // The next, identical ballot is a fresh commit, not a retry.
        ledger.commit(&row("Fahmi", "Bibi")).unwrap();
        assert_eq!(ledger.read_ballots().unwrap().len(), 2);
    }

    #[test]
    fn cohort_roster_round_trip() {
        let paths = temp_paths("cohorts");
        let mut ledger = CsvLedger::open(paths, &positions()).unwrap();
        assert!(ledger.read_cohorts().unwrap().is_empty());

        let cohorts = vec![
            Cohort {
                name: "Session 1".to_string(),
                count: 12,
            },
            Cohort {
                name: "Session 2".to_string(),
                count: 0,
            },
        ];
        ledger.persist_cohorts(&cohorts).unwrap();
        assert_eq!(ledger.read_cohorts().unwrap(), cohorts);

        // A later rewrite replaces the whole roster.
        let updated = vec![Cohort {
            name: "Session 1".to_string(),
            count: 13,
        }];
        ledger.persist_cohorts(&updated).unwrap();
        assert_eq!(ledger.read_cohorts().unwrap(), updated);
    }
}
