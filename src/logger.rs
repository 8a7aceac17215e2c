//! Event logger - append-only session log plus snapshots
//!
//! Layout of a session directory:
//!
//! ```text
//! <log_dir>/
//!   events.jsonl   one durable event per line, append-only
//!   state.json     latest snapshot, replaced atomically
//! ```
//!
//! A snapshot is trusted only when its `durable_event_count` equals the
//! number of records in `events.jsonl`; otherwise the log wins and the
//! session is rebuilt by replay.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventSink;
use crate::error::{Result, WarrenError};
use crate::event::Event;
use crate::ids::SessionId;
use crate::session::{Session, Snapshot};

pub const LOG_FILE: &str = "events.jsonl";
pub const STATE_FILE: &str = "state.json";
const STATE_TMP_FILE: &str = "state.json.tmp";

/// Single writer of one session's log
pub struct EventLogger {
    session_id: SessionId,
    log_dir: PathBuf,
    file: Option<File>,
    /// Length of the log's complete records
    bytes: u64,
    count: u64,
    counts_by_type: HashMap<String, u64>,
    last_modified: DateTime<Utc>,
    snapshots: Arc<SnapshotWriter>,
}

impl EventLogger {
    /// Open the log in `log_dir`, creating the directory if needed
    ///
    /// Unless `clear_existing` is set, an existing log is kept: a trailing
    /// partial record is cut off and the durable count is recomputed from
    /// what remains.
    pub fn open(session_id: SessionId, log_dir: impl Into<PathBuf>, clear_existing: bool) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        let aof_path = log_dir.join(LOG_FILE);

        let mut counts_by_type = HashMap::new();
        let mut count = 0;

        let file = if clear_existing {
            File::create(&aof_path)?
        } else {
            if aof_path.exists() {
                for event in recover_log(&aof_path)? {
                    count += 1;
                    *counts_by_type.entry(event.kind().to_string()).or_insert(0) += 1;
                }
            }
            OpenOptions::new().create(true).append(true).open(&aof_path)?
        };
        let bytes = file.metadata()?.len();

        info!(
            session_id = %session_id,
            log_dir = %log_dir.display(),
            existing_events = count,
            "Opened event log"
        );

        Ok(Self {
            session_id,
            file: Some(file),
            bytes,
            count,
            counts_by_type,
            last_modified: Utc::now(),
            snapshots: Arc::new(SnapshotWriter::new(log_dir.clone())),
            log_dir,
        })
    }

    /// Persist one event; transient events are dropped
    pub fn append(&mut self, event: &Event) -> Result<()> {
        if !event.is_durable() {
            return Ok(());
        }
        let file = self.file.as_mut().ok_or(WarrenError::SessionClosed)?;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        // One write per record so a crash leaves at most one partial line
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            if let Err(rollback) = file.set_len(self.bytes) {
                warn!(error = %rollback, "Could not cut off partial record");
            }
            return Err(e.into());
        }

        self.bytes += line.len() as u64;
        self.count += 1;
        *self.counts_by_type.entry(event.kind().to_string()).or_insert(0) += 1;
        self.last_modified = Utc::now();
        Ok(())
    }

    /// Write the session snapshot with the current durable count
    pub fn write_snapshot(&self, session: &Session) -> Result<()> {
        self.snapshots.write(&session.to_snapshot(self.count))?;
        Ok(())
    }

    /// Shared writer for snapshots taken off the logging path
    pub fn snapshot_writer(&self) -> Arc<SnapshotWriter> {
        Arc::clone(&self.snapshots)
    }

    /// Flush a final snapshot and release the log file
    pub fn close(&mut self, session: &Session) -> Result<()> {
        let mut file = self.file.take().ok_or(WarrenError::SessionClosed)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        self.write_snapshot(session)?;
        info!(session_id = %self.session_id, events = self.count, "Closed event log");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Durable events written to this log
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn counts_by_type(&self) -> &HashMap<String, u64> {
        &self.counts_by_type
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.log_dir.join(STATE_FILE)
    }

    /// Recover a session from `log_dir`
    ///
    /// Uses the snapshot when it agrees with the log, otherwise replays the
    /// log from empty state. `title` seeds the replay when no snapshot title
    /// is available.
    pub fn load(log_dir: &Path, session_id: SessionId, title: Option<String>) -> Result<Session> {
        let events = read_log(&log_dir.join(LOG_FILE))?;
        let log_count = events.len() as u64;

        let snapshot = read_snapshot(&log_dir.join(STATE_FILE));
        let title = match &snapshot {
            Some(s) => s.title.clone().or(title),
            None => title,
        };

        if let Some(snapshot) = snapshot {
            match verify_snapshot(&snapshot, log_count) {
                Ok(()) => {
                    debug!(session_id = %session_id, events = log_count, "Snapshot matches log");
                    return Ok(Session::from_snapshot(snapshot));
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "Discarding snapshot, replaying log"),
            }
        }

        let session = Session::replay(session_id, title, &events)?;
        info!(session_id = %session.id, events = log_count, "Rebuilt session from log");
        Ok(session)
    }
}

/// Writes `state.json` for one session directory
///
/// Writes are serialized, and a snapshot older than the last one written is
/// skipped, so snapshots taken concurrently never move the file backwards.
pub struct SnapshotWriter {
    log_dir: PathBuf,
    last_count: Mutex<Option<u64>>,
}

impl SnapshotWriter {
    fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            last_count: Mutex::new(None),
        }
    }

    /// Returns false if a newer snapshot was already written
    pub fn write(&self, snapshot: &Snapshot) -> Result<bool> {
        let mut last_count = self.last_count.lock();
        if last_count.map_or(false, |n| snapshot.durable_event_count < n) {
            debug!(events = snapshot.durable_event_count, "Skipping stale snapshot");
            return Ok(false);
        }

        let tmp_path = self.log_dir.join(STATE_TMP_FILE);
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, self.log_dir.join(STATE_FILE))?;

        *last_count = Some(snapshot.durable_event_count);
        debug!(session_id = %snapshot.session_id, events = snapshot.durable_event_count, "Wrote snapshot");
        Ok(true)
    }
}

impl EventSink for EventLogger {
    fn record(&mut self, event: &Event) -> Result<()> {
        self.append(event)
    }
}

/// Fail with `LogIntegrity` unless the snapshot count matches the log
pub fn verify_snapshot(snapshot: &Snapshot, log_count: u64) -> Result<()> {
    if snapshot.durable_event_count == log_count {
        Ok(())
    } else {
        Err(WarrenError::LogIntegrity {
            snapshot_count: snapshot.durable_event_count,
            log_count,
        })
    }
}

fn read_snapshot(path: &Path) -> Option<Snapshot> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable snapshot");
            None
        }
    }
}

/// Parse the complete records of a log
///
/// Returns the events and the byte length of the valid prefix. A final
/// record that is unterminated or unparsable counts as torn and is left out;
/// a bad record anywhere else is an error.
fn parse_log(raw: &str) -> Result<(Vec<Event>, usize)> {
    let mut events = Vec::new();
    let mut valid_len = 0;
    let mut rest = raw;

    while let Some(end) = rest.find('\n') {
        let line = &rest[..end];
        rest = &rest[end + 1..];

        if !line.trim().is_empty() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(_) if rest.is_empty() => break,
                Err(e) => return Err(e.into()),
            }
        }
        valid_len = raw.len() - rest.len();
    }

    Ok((events, valid_len))
}

/// Read a log without modifying it
pub fn read_log(path: &Path) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    let (events, _) = parse_log(&raw)?;
    Ok(events.into_iter().filter(Event::is_durable).collect())
}

/// Read a log and cut off a torn trailing record
fn recover_log(path: &Path) -> Result<Vec<Event>> {
    let raw = fs::read_to_string(path)?;
    let (events, valid_len) = parse_log(&raw)?;

    if valid_len < raw.len() {
        warn!(
            path = %path.display(),
            discarded_bytes = raw.len() - valid_len,
            "Discarding partial record at end of log"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_all()?;
    }

    Ok(events.into_iter().filter(Event::is_durable).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunState;
    use crate::ids::NodeId;
    use crate::message::ChatMessage;
    use tempfile::TempDir;

    fn spawn_root() -> Event {
        Event::NodeSpawn {
            id: NodeId::root(),
            parent: None,
            always_included_messages: vec![],
            chat_history: vec![],
            tools: vec![],
        }
    }

    fn session_events() -> Vec<Event> {
        vec![
            spawn_root(),
            Event::state_change(NodeId::root(), RunState::Running),
            Event::MessageAppended { id: NodeId::root(), msg: ChatMessage::user("task") },
        ]
    }

    /// Log the events while folding them into a session
    fn write_session(dir: &Path, events: &[Event]) -> (EventLogger, Session) {
        let mut logger = EventLogger::open(SessionId::new("s1"), dir, true).unwrap();
        let mut session = Session::new(SessionId::new("s1"), Some("title".into()));
        for event in events {
            session.apply(event).unwrap();
            logger.append(event).unwrap();
        }
        (logger, session)
    }

    #[test]
    fn test_append_writes_one_line_per_durable_event() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _) = write_session(dir.path(), &session_events());
        logger
            .append(&Event::StreamDelta { id: NodeId::root(), delta: "x".into() })
            .unwrap();

        let raw = fs::read_to_string(logger.log_path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert_eq!(logger.count(), 3);
        assert_eq!(logger.counts_by_type().get("node_spawn"), Some(&1));
        assert!(!raw.contains("stream_delta"));
    }

    #[test]
    fn test_reopen_recomputes_count() {
        let dir = TempDir::new().unwrap();
        let (logger, _) = write_session(dir.path(), &session_events());
        drop(logger);

        let reopened = EventLogger::open(SessionId::new("s1"), dir.path(), false).unwrap();
        assert_eq!(reopened.count(), 3);
        assert_eq!(reopened.counts_by_type().get("node_state_change"), Some(&1));
    }

    #[test]
    fn test_clear_existing_truncates() {
        let dir = TempDir::new().unwrap();
        let (logger, _) = write_session(dir.path(), &session_events());
        drop(logger);

        let cleared = EventLogger::open(SessionId::new("s1"), dir.path(), true).unwrap();
        assert_eq!(cleared.count(), 0);
        assert_eq!(fs::read_to_string(cleared.log_path()).unwrap(), "");
    }

    #[test]
    fn test_partial_trailing_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let (logger, _) = write_session(dir.path(), &session_events());
        let path = logger.log_path();
        drop(logger);

        // Simulate a crash in the middle of an append
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"type":"message_appended","id":"ro"#).unwrap();
        drop(file);

        let mut reopened = EventLogger::open(SessionId::new("s1"), dir.path(), false).unwrap();
        assert_eq!(reopened.count(), 3);
        assert!(fs::read_to_string(&path).unwrap().ends_with("}\n"));

        reopened.append(&Event::error("after crash")).unwrap();
        assert_eq!(read_log(&path).unwrap().len(), 4);
    }

    #[test]
    fn test_corrupt_middle_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);
        let good = serde_json::to_string(&Event::error("ok")).unwrap();
        fs::write(&path, format!("{good}\ngarbage\n{good}\n")).unwrap();

        assert!(matches!(read_log(&path), Err(WarrenError::Serialization(_))));
    }

    #[test]
    fn test_close_writes_snapshot_once() {
        let dir = TempDir::new().unwrap();
        let (mut logger, session) = write_session(dir.path(), &session_events());

        logger.close(&session).unwrap();
        assert!(logger.is_closed());
        assert!(matches!(logger.close(&session), Err(WarrenError::SessionClosed)));
        assert!(matches!(logger.append(&Event::error("late")), Err(WarrenError::SessionClosed)));

        let snapshot: Snapshot =
            serde_json::from_str(&fs::read_to_string(logger.state_path()).unwrap()).unwrap();
        assert_eq!(snapshot.durable_event_count, 3);
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(!dir.path().join(STATE_TMP_FILE).exists());
    }

    #[test]
    fn test_close_without_events() {
        let dir = TempDir::new().unwrap();
        let mut logger = EventLogger::open(SessionId::new("empty"), dir.path(), true).unwrap();
        let session = Session::new(SessionId::new("empty"), None);

        tokio_test::assert_ok!(logger.close(&session));
        let loaded = EventLogger::load(dir.path(), SessionId::new("empty"), None).unwrap();
        assert!(loaded.nodes().is_empty());
    }

    #[test]
    fn test_load_trusts_consistent_snapshot() {
        let dir = TempDir::new().unwrap();
        let (mut logger, session) = write_session(dir.path(), &session_events());
        logger.close(&session).unwrap();

        let loaded = EventLogger::load(dir.path(), SessionId::new("s1"), None).unwrap();
        assert_eq!(loaded.to_snapshot(3), session.to_snapshot(3));
    }

    #[test]
    fn test_stale_snapshot_is_not_written() {
        let dir = TempDir::new().unwrap();
        let (logger, session) = write_session(dir.path(), &session_events());
        let writer = logger.snapshot_writer();

        assert!(writer.write(&session.to_snapshot(3)).unwrap());
        assert!(!writer.write(&session.to_snapshot(2)).unwrap());

        let on_disk: Snapshot =
            serde_json::from_str(&fs::read_to_string(logger.state_path()).unwrap()).unwrap();
        assert_eq!(on_disk.durable_event_count, 3);
    }

    #[test]
    fn test_load_rebuilds_on_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let events = session_events();
        let (mut logger, session) = write_session(dir.path(), &events[..2]);
        logger.write_snapshot(&session).unwrap();

        // Log moves on without a new snapshot
        logger.append(&events[2]).unwrap();
        let stale: Snapshot =
            serde_json::from_str(&fs::read_to_string(logger.state_path()).unwrap()).unwrap();
        assert!(matches!(
            verify_snapshot(&stale, 3),
            Err(WarrenError::LogIntegrity { snapshot_count: 2, log_count: 3 })
        ));

        let loaded = EventLogger::load(dir.path(), SessionId::new("s1"), None).unwrap();
        assert_eq!(loaded.durable_event_count, 3);
        assert_eq!(loaded.root().unwrap().history.len(), 1);
        assert_eq!(loaded.title.as_deref(), Some("title"));
    }
}
