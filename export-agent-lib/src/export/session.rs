//! Per-entity-type output streams with incremental cursors.
//!
//! A [`SessionManager`] opens one [`Session`] per entity type (and optionally per parent
//! object, such as the reviews of one pull request). Each session:
//!
//! - reads the cursor left by the previous run when it is opened,
//! - writes its records as gzip-compressed JSON lines into its own file under
//!   `uploads/<type>/`, so concurrent sessions never share a writer,
//! - persists the new cursor when [`Session::done`] is called, unless a send failed or
//!   the session was marked failed.
//!
//! `done` must be called exactly once per session, including on error paths. Calling it
//! again is a no-op.

use super::store::LastProcessedStore;
use crate::Result;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use core::sync::atomic::{AtomicU64, Ordering};
use flate2::Compression;
use flate2::write::GzEncoder;
use ohno::{IntoAppError, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

const LOG_TARGET: &str = "   session";

/// Extension of session record files.
pub const RECORDS_EXTENSION: &str = "jsonl.gz";

/// Extension of session summary files.
pub const SUMMARY_EXTENSION: &str = "summary.json";

/// Marker of the newest already-processed item of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    /// Last-updated time of the newest processed item.
    Time(DateTime<Utc>),

    /// Provider continuation token.
    Token(String),
}

impl Cursor {
    #[must_use]
    pub const fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(t) => Some(*t),
            Self::Token(_) => None,
        }
    }

    /// Combine the current cursor with a candidate.
    ///
    /// Timestamps only move forward; tokens are always replaced.
    #[must_use]
    pub fn advance(current: Option<Self>, candidate: Self) -> Self {
        match (current, candidate) {
            (Some(Self::Time(cur)), Self::Time(new)) => Self::Time(cur.max(new)),
            (_, candidate) => candidate,
        }
    }
}

/// Identity of the object a child session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub entity_type: String,
    pub id: String,
}

impl ParentRef {
    #[must_use]
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

/// Written next to the records file when a session completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub failed: bool,
}

/// Opens sessions for one integration run.
#[derive(Debug)]
pub struct SessionManager {
    store: Arc<LastProcessedStore>,
    uploads_dir: Utf8PathBuf,
    scope: String,
    reprocess_historical: bool,
    next_file: AtomicU64,
}

impl SessionManager {
    /// `scope` keys this run's cursors in the store, usually the integration name.
    #[must_use]
    pub fn new(
        store: Arc<LastProcessedStore>,
        uploads_dir: impl Into<Utf8PathBuf>,
        scope: impl Into<String>,
        reprocess_historical: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            uploads_dir: uploads_dir.into(),
            scope: scope.into(),
            reprocess_historical,
            next_file: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn uploads_dir(&self) -> &Utf8Path {
        &self.uploads_dir
    }

    #[must_use]
    pub const fn reprocess_historical(&self) -> bool {
        self.reprocess_historical
    }

    /// Open an incremental session for `entity_type`.
    pub fn open(&self, entity_type: &str) -> Result<Session> {
        self.open_inner(entity_type, None, true)
    }

    /// Open an incremental session for `entity_type` scoped to `parent`.
    pub fn open_child(&self, entity_type: &str, parent: ParentRef) -> Result<Session> {
        self.open_inner(entity_type, Some(parent), true)
    }

    /// Open a session that neither reads nor writes a cursor.
    pub fn open_non_incremental(&self, entity_type: &str) -> Result<Session> {
        self.open_inner(entity_type, None, false)
    }

    fn open_inner(&self, entity_type: &str, parent: Option<ParentRef>, incremental: bool) -> Result<Session> {
        if entity_type.is_empty() {
            bail!("cannot open a session without an entity type");
        }

        let mut key_path = vec![self.scope.clone(), entity_type.to_string()];
        if let Some(p) = &parent {
            key_path.push(p.entity_type.clone());
            key_path.push(p.id.clone());
        }

        let previous = if incremental && !self.reprocess_historical {
            self.store.get_as::<Cursor, _>(key_path.as_slice())?
        } else {
            None
        };

        let dir = self.uploads_dir.join(sanitize(entity_type));
        let seq = self.next_file.fetch_add(1, Ordering::Relaxed);
        let stem = format!("{}-{seq:05}", sanitize(&self.scope));

        log::debug!(
            target: LOG_TARGET,
            "Opened session '{entity_type}'{} with cursor {previous:?}",
            parent.as_ref().map(|p| format!(" for {} '{}'", p.entity_type, p.id)).unwrap_or_default()
        );

        Ok(Session {
            entity_type: entity_type.to_string(),
            parent,
            store: incremental.then(|| Arc::clone(&self.store)),
            key_path,
            previous: previous.clone(),
            records_path: dir.join(format!("{stem}.{RECORDS_EXTENSION}")),
            summary_path: dir.join(format!("{stem}.{SUMMARY_EXTENSION}")),
            state: Mutex::new(SessionState {
                writer: None,
                total: None,
                count: 0,
                cursor: previous,
                failed: false,
                done: false,
            }),
        })
    }
}

#[derive(Debug)]
struct SessionState {
    writer: Option<GzEncoder<BufWriter<File>>>,
    total: Option<u64>,
    count: u64,
    cursor: Option<Cursor>,
    failed: bool,
    done: bool,
}

/// One output stream for an entity type within a run.
///
/// Safe to share between tasks; sends are serialized per session.
#[derive(Debug)]
pub struct Session {
    entity_type: String,
    parent: Option<ParentRef>,
    store: Option<Arc<LastProcessedStore>>,
    key_path: Vec<String>,
    previous: Option<Cursor>,
    records_path: Utf8PathBuf,
    summary_path: Utf8PathBuf,
    state: Mutex<SessionState>,
}

impl Session {
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub const fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn records_path(&self) -> &Utf8Path {
        &self.records_path
    }

    /// The cursor left by the previous successful run, `None` if there was none.
    #[must_use]
    pub const fn last_processed_cursor(&self) -> Option<&Cursor> {
        self.previous.as_ref()
    }

    /// The previous run's cursor as a time, `None` if absent or token based.
    #[must_use]
    pub fn last_processed_time(&self) -> Option<DateTime<Utc>> {
        self.previous.as_ref().and_then(Cursor::as_time)
    }

    /// Record the total number of items expected. Informational only.
    pub fn set_total(&self, total: u64) {
        self.state.lock().expect("lock not poisoned").total = Some(total);
    }

    /// Number of records sent so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.state.lock().expect("lock not poisoned").count
    }

    /// Emit one record.
    ///
    /// A failure poisons the session: its cursor will not be persisted.
    pub fn send<T: Serialize + ?Sized>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record).into_app_err_with(|| format!("encoding {} record", self.entity_type))?;
        line.push(b'\n');

        let mut state = self.state.lock().expect("lock not poisoned");
        if state.done {
            bail!("session '{}' is already done", self.entity_type);
        }

        let result = self.write_line(&mut state, &line);
        match result {
            Ok(()) => {
                state.count += 1;
                Ok(())
            }
            Err(e) => {
                state.failed = true;
                Err(e)
            }
        }
    }

    fn write_line(&self, state: &mut SessionState, line: &[u8]) -> Result<()> {
        if state.writer.is_none() {
            state.writer = Some(self.create_writer()?);
        }

        let Some(writer) = state.writer.as_mut() else {
            bail!("session '{}' has no writer", self.entity_type);
        };

        writer
            .write_all(line)
            .into_app_err_with(|| format!("writing to '{}'", self.records_path))
    }

    fn create_writer(&self) -> Result<GzEncoder<BufWriter<File>>> {
        if let Some(dir) = self.records_path.parent() {
            fs::create_dir_all(dir).into_app_err_with(|| format!("creating directory '{dir}'"))?;
        }

        let file = File::create(&self.records_path).into_app_err_with(|| format!("creating '{}'", self.records_path))?;
        Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
    }

    /// Offer a new cursor; persisted on [`Session::done`].
    pub fn advance_cursor(&self, candidate: Cursor) {
        let mut state = self.state.lock().expect("lock not poisoned");
        let current = state.cursor.take();
        state.cursor = Some(Cursor::advance(current, candidate));
    }

    /// Shorthand for advancing a time-based cursor.
    pub fn advance_time(&self, updated_at: DateTime<Utc>) {
        self.advance_cursor(Cursor::Time(updated_at));
    }

    /// Keep the stored cursor unchanged when this session completes.
    pub fn mark_failed(&self) {
        self.state.lock().expect("lock not poisoned").failed = true;
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.lock().expect("lock not poisoned").failed
    }

    /// Close the output and persist the cursor. Later calls do nothing.
    pub fn done(&self) -> Result<()> {
        let mut state = self.state.lock().expect("lock not poisoned");
        if state.done {
            return Ok(());
        }
        state.done = true;

        let close_result = match state.writer.take() {
            Some(writer) => finish(writer).into_app_err_with(|| format!("closing '{}'", self.records_path)),
            None => Ok(()),
        };

        if let Err(e) = &close_result {
            log::warn!(target: LOG_TARGET, "Could not close session '{}': {e:#}", self.entity_type);
            state.failed = true;
        }

        let summary = SessionSummary {
            entity_type: self.entity_type.clone(),
            parent: self.parent.clone(),
            total: state.total,
            count: state.count,
            cursor: state.cursor.clone(),
            failed: state.failed,
        };

        if let Err(e) = self.write_summary(&summary) {
            log::warn!(target: LOG_TARGET, "Could not write summary for session '{}': {e:#}", self.entity_type);
        }

        close_result?;

        if state.failed {
            log::info!(target: LOG_TARGET, "Session '{}' failed, keeping previous cursor", self.entity_type);
            return Ok(());
        }

        if let Some(store) = &self.store
            && let Some(cursor) = &state.cursor
            && Some(cursor) != self.previous.as_ref()
        {
            store.set(self.key_path.as_slice(), cursor)?;
        }

        log::debug!(target: LOG_TARGET, "Session '{}' done with {} records", self.entity_type, state.count);
        Ok(())
    }

    fn write_summary(&self, summary: &SessionSummary) -> Result<()> {
        if let Some(dir) = self.summary_path.parent() {
            fs::create_dir_all(dir).into_app_err_with(|| format!("creating directory '{dir}'"))?;
        }

        let json = serde_json::to_vec_pretty(summary).into_app_err("encoding session summary")?;
        fs::write(&self.summary_path, json).into_app_err_with(|| format!("writing '{}'", self.summary_path))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.get_mut().is_ok_and(|s| !s.done) {
            log::warn!(target: LOG_TARGET, "Session '{}' dropped without done(); cursor not saved", self.entity_type);
        }
    }
}

fn finish(writer: GzEncoder<BufWriter<File>>) -> std::io::Result<()> {
    let mut inner = writer.finish()?;
    inner.flush()
}

/// Make an entity type or scope safe to use as a single path component.
fn sanitize(s: &str) -> String {
    s.replace("..", "__")
        .replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
}

/// Sends each distinct user once per run.
///
/// Users are referenced from many places (authors, reviewers, assignees); the first
/// reference exports the record and later ones are dropped.
#[derive(Debug)]
pub struct UserSender {
    session: Session,
    seen: Mutex<HashSet<String>>,
}

impl UserSender {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Send `user` unless a user with the same `key` was already sent.
    ///
    /// Returns whether the record was sent.
    pub fn send<T: Serialize + ?Sized>(&self, key: &str, user: &T) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }

        if !self.seen.lock().expect("lock not poisoned").insert(key.to_string()) {
            return Ok(false);
        }

        self.session.send(user)?;
        Ok(true)
    }

    pub fn done(&self) -> Result<()> {
        self.session.done()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn setup(reprocess: bool) -> (tempfile::TempDir, Arc<SessionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = Arc::new(LastProcessedStore::open(root.join("last_processed.json")).unwrap());
        (dir, SessionManager::new(store, root.join("uploads"), "mock", reprocess))
    }

    fn reopen(dir: &tempfile::TempDir, reprocess: bool) -> Arc<SessionManager> {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = Arc::new(LastProcessedStore::open(root.join("last_processed.json")).unwrap());
        SessionManager::new(store, root.join("uploads"), "mock", reprocess)
    }

    fn read_lines(path: &Utf8Path) -> Vec<serde_json::Value> {
        let mut text = String::new();
        let _ = GzDecoder::new(File::open(path).unwrap()).read_to_string(&mut text).unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_records_are_written_as_gzip_lines() {
        let (_dir, mgr) = setup(false);
        let session = mgr.open("sourcecode.Commit").unwrap();
        session.send(&serde_json::json!({"sha": "a"})).unwrap();
        session.send(&serde_json::json!({"sha": "b"})).unwrap();
        session.done().unwrap();

        let lines = read_lines(session.records_path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["sha"], "b");
        assert!(session.records_path().as_str().contains("sourcecode.Commit"));
    }

    #[test]
    fn test_cursor_persists_across_runs() {
        let (dir, mgr) = setup(false);
        let session = mgr.open("sourcecode.PullRequest").unwrap();
        assert!(session.last_processed_cursor().is_none());
        session.advance_time(day(10));
        session.done().unwrap();

        let mgr = reopen(&dir, false);
        let session = mgr.open("sourcecode.PullRequest").unwrap();
        assert_eq!(session.last_processed_time(), Some(day(10)));
        session.done().unwrap();
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let (dir, mgr) = setup(false);
        let session = mgr.open("t").unwrap();
        session.advance_time(day(10));
        session.done().unwrap();

        let mgr = reopen(&dir, false);
        let session = mgr.open("t").unwrap();
        session.advance_time(day(3));
        session.done().unwrap();

        let mgr = reopen(&dir, false);
        let session = mgr.open("t").unwrap();
        assert_eq!(session.last_processed_time(), Some(day(10)));
        session.done().unwrap();
    }

    #[test]
    fn test_done_is_idempotent() {
        let (dir, mgr) = setup(false);
        let session = mgr.open("t").unwrap();
        session.send(&1).unwrap();
        session.advance_time(day(5));
        session.done().unwrap();
        session.advance_time(day(20));
        session.done().unwrap();

        let _ = session.send(&2).unwrap_err();
        assert_eq!(read_lines(session.records_path()).len(), 1);

        let mgr = reopen(&dir, false);
        assert_eq!(mgr.open("t").unwrap().last_processed_time(), Some(day(5)));
    }

    #[test]
    fn test_failed_session_keeps_previous_cursor() {
        let (dir, mgr) = setup(false);
        let session = mgr.open("t").unwrap();
        session.advance_time(day(5));
        session.done().unwrap();

        let mgr = reopen(&dir, false);
        let session = mgr.open("t").unwrap();
        session.advance_time(day(9));
        session.mark_failed();
        session.done().unwrap();

        let mgr = reopen(&dir, false);
        let session = mgr.open("t").unwrap();
        assert_eq!(session.last_processed_time(), Some(day(5)));
        session.done().unwrap();
    }

    #[test]
    fn test_child_sessions_have_separate_cursors() {
        let (dir, mgr) = setup(false);
        let a = mgr.open_child("review", ParentRef::new("pr", "1")).unwrap();
        let b = mgr.open_child("review", ParentRef::new("pr", "2")).unwrap();
        a.advance_time(day(1));
        b.advance_time(day(2));
        a.done().unwrap();
        b.done().unwrap();
        assert_ne!(a.records_path(), b.records_path());

        let mgr = reopen(&dir, false);
        let a = mgr.open_child("review", ParentRef::new("pr", "1")).unwrap();
        assert_eq!(a.last_processed_time(), Some(day(1)));
        assert_eq!(a.parent().unwrap().id, "1");
        a.done().unwrap();
    }

    #[test]
    fn test_reprocess_historical_ignores_cursor() {
        let (dir, mgr) = setup(false);
        let session = mgr.open("t").unwrap();
        session.advance_time(day(5));
        session.done().unwrap();

        let mgr = reopen(&dir, true);
        let session = mgr.open("t").unwrap();
        assert!(session.last_processed_cursor().is_none());
        session.done().unwrap();
    }

    #[test]
    fn test_non_incremental_session_never_stores() {
        let (dir, mgr) = setup(false);
        let session = mgr.open_non_incremental("users").unwrap();
        session.advance_time(day(5));
        session.done().unwrap();

        let mgr = reopen(&dir, false);
        assert!(mgr.open("users").unwrap().last_processed_cursor().is_none());
    }

    #[test]
    fn test_summary_written_on_done() {
        let (_dir, mgr) = setup(false);
        let session = mgr.open("t").unwrap();
        session.set_total(3);
        session.send(&"x").unwrap();
        session.done().unwrap();

        let summary_path = session.records_path().as_str().replace(RECORDS_EXTENSION, SUMMARY_EXTENSION);
        let summary: SessionSummary = serde_json::from_slice(&fs::read(summary_path).unwrap()).unwrap();
        assert_eq!(summary.total, Some(3));
        assert_eq!(summary.count, 1);
        assert!(!summary.failed);
    }

    #[test]
    fn test_token_cursor_is_replaced() {
        let cur = Cursor::advance(Some(Cursor::Token("a".into())), Cursor::Token("b".into()));
        assert_eq!(cur, Cursor::Token("b".into()));
        let cur = Cursor::advance(Some(Cursor::Time(day(9))), Cursor::Time(day(2)));
        assert_eq!(cur, Cursor::Time(day(9)));
    }

    #[test]
    fn test_user_sender_dedups() {
        let (_dir, mgr) = setup(false);
        let users = UserSender::new(mgr.open_non_incremental("users").unwrap());
        assert!(users.send("u1", &"alice").unwrap());
        assert!(!users.send("u1", &"alice again").unwrap());
        assert!(users.send("u2", &"bob").unwrap());
        assert!(!users.send("", &"nobody").unwrap());
        users.done().unwrap();
    }

    #[test]
    fn test_sanitize_entity_names() {
        assert_eq!(sanitize("sourcecode.PullRequest"), "sourcecode.PullRequest");
        assert_eq!(sanitize("../etc"), "___etc");
        assert_eq!(sanitize("a/b:c"), "a_b_c");
    }
}
