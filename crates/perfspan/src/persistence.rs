//! On-disk state: the retry queue and the persisted sampler state.
//!
//! ```text
//! <root>/v1/retry-queue/retry-<19-digit unix nanos>.json
//! <root>/v1/persistent-state.json
//! <root>/device-id
//! ```
//!
//! Only the worker thread touches these files, so none of the types here do
//! any locking of their own beyond what is needed to share them.

use crate::clock;
use crate::device_id::DeviceIdFilePersistence;
use crate::error::PersistenceError;
use crate::payload::TracePayload;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const FILENAME_PREFIX: &str = "retry-";
const FILENAME_SUFFIX: &str = ".json";

/// Root of everything the pipeline stores on disk.
#[derive(Debug, Clone)]
pub struct Persistence {
    root: PathBuf,
}

impl Persistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versioned(&self) -> PathBuf {
        self.root.join("v1")
    }

    pub fn retry_queue(&self, max_payload_age: Duration) -> RetryQueue {
        RetryQueue::new(self.versioned().join("retry-queue"), max_payload_age)
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState::load(self.versioned().join("persistent-state.json"))
    }

    pub fn device_id(&self) -> DeviceIdFilePersistence {
        DeviceIdFilePersistence::new(self.root.join("device-id"))
    }

    /// Deletes everything under the versioned directory.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        let dir = self.versioned();
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(dir, e)),
        }
    }
}

// =============================================================================
// RETRY QUEUE
// =============================================================================

/// Undelivered payloads, one file each.
///
/// Despite the name this is a stack: [`next`](Self::next) returns the
/// *newest* payload, since recent telemetry matters more than a backlog that
/// is ageing towards [`sweep`](Self::sweep) anyway.
#[derive(Debug)]
pub struct RetryQueue {
    dir: PathBuf,
    max_age: Duration,
}

impl RetryQueue {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, timestamp: u64) -> PathBuf {
        self.dir
            .join(format!("{FILENAME_PREFIX}{timestamp:019}{FILENAME_SUFFIX}"))
    }

    /// Stores a payload as `Name: Value` CRLF header lines, a blank line, and
    /// the raw body.
    pub fn add(&self, payload: &TracePayload) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;
        let path = self.file_for(payload.timestamp);

        let mut content = Vec::with_capacity(payload.body.len() + 256);
        for (name, value) in &payload.headers {
            content.extend_from_slice(name.as_bytes());
            content.extend_from_slice(b": ");
            content.extend_from_slice(value.as_bytes());
            content.extend_from_slice(b"\r\n");
        }
        content.extend_from_slice(b"\r\n");
        content.extend_from_slice(&payload.body);

        let mut file = fs::File::create(&path).map_err(|e| PersistenceError::io(&path, e))?;
        file.write_all(&content)
            .and_then(|()| file.sync_data())
            .map_err(|e| PersistenceError::io(&path, e))?;
        debug!(path = %path.display(), "payload queued for retry");
        Ok(())
    }

    /// The newest stored payload, after sweeping out expired ones.
    ///
    /// A file that cannot be decoded is deleted and `None` returned.
    pub fn next(&self) -> Option<TracePayload> {
        self.sweep();

        let newest = self
            .list()
            .into_iter()
            .filter_map(|(timestamp, path)| timestamp.map(|t| (t, path)))
            .max_by_key(|(timestamp, _)| *timestamp)?;

        match decode_file(&newest.1, newest.0) {
            Ok(payload) => Some(payload),
            Err(e) => {
                discard_if_corrupt(&newest.1, &e);
                None
            }
        }
    }

    pub fn remove(&self, timestamp: u64) {
        remove_file(&self.file_for(timestamp));
    }

    /// Deletes payloads older than the maximum age, and any file whose name
    /// does not parse.
    pub fn sweep(&self) {
        let max_age = u64::try_from(self.max_age.as_nanos()).unwrap_or(u64::MAX);
        let oldest_allowed = clock::unix_nanos_now().saturating_sub(max_age);
        for (timestamp, path) in self.list() {
            if timestamp.unwrap_or(0) < oldest_allowed {
                debug!(path = %path.display(), "sweeping expired retry payload");
                remove_file(&path);
            }
        }
    }

    /// Number of files currently queued.
    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for (_, path) in self.list() {
            remove_file(&path);
        }
    }

    fn list(&self) -> Vec<(Option<u64>, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .map(|entry| {
                let name = entry.file_name();
                (parse_timestamp(&name.to_string_lossy()), entry.path())
            })
            .collect()
    }
}

/// Deletes a file that can never be decoded. Anything else, such as a
/// transient read error, leaves the file for a later pass.
fn discard_if_corrupt(path: &Path, error: &PersistenceError) {
    if error.is_corruption() {
        warn!(error = %error, "discarding corrupt retry payload");
        remove_file(path);
    } else {
        warn!(error = %error, "could not read retry payload; keeping it");
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not delete retry payload");
        }
    }
}

pub(crate) fn parse_timestamp(filename: &str) -> Option<u64> {
    filename
        .strip_prefix(FILENAME_PREFIX)?
        .strip_suffix(FILENAME_SUFFIX)?
        .parse()
        .ok()
}

fn decode_file(path: &Path, timestamp: u64) -> Result<TracePayload, PersistenceError> {
    let file = fs::File::open(path).map_err(|e| PersistenceError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let headers = read_headers(&mut reader).map_err(|e| match e {
        HeaderError::Io(e) => PersistenceError::io(path, e),
        HeaderError::Corrupt(reason) => PersistenceError::Corrupt {
            path: path.to_owned(),
            reason,
        },
    })?;

    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| PersistenceError::io(path, e))?;
    Ok(TracePayload::new(timestamp, body, headers))
}

enum HeaderError {
    Io(io::Error),
    Corrupt(&'static str),
}

/// Reads `Name: Value` lines up to the first empty line.
fn read_headers(reader: &mut impl BufRead) -> Result<Vec<(String, String)>, HeaderError> {
    let mut headers = Vec::new();
    let mut line = Vec::with_capacity(128);
    loop {
        line.clear();
        if !read_until_crlf(reader, &mut line).map_err(HeaderError::Io)? {
            return Err(HeaderError::Corrupt("unexpected end of file in headers"));
        }
        if line.is_empty() {
            return Ok(headers);
        }
        let line = std::str::from_utf8(&line)
            .map_err(|_| HeaderError::Corrupt("header line is not utf-8"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(HeaderError::Corrupt("header line has no separator"))?;
        headers.push((name.to_owned(), value.trim_start().to_owned()));
    }
}

/// Strict CRLF line reader. Consumes one byte at a time so the binary body
/// that follows is left untouched; a CR not followed by LF is kept as data.
///
/// Returns `false` on end of input before a CRLF.
fn read_until_crlf(reader: &mut impl BufRead, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut pending_cr = false;
    loop {
        let byte = {
            let buf = reader.fill_buf()?;
            match buf.first() {
                Some(&b) => b,
                None => return Ok(false),
            }
        };
        reader.consume(1);

        if pending_cr {
            if byte == b'\n' {
                return Ok(true);
            }
            out.push(b'\r');
            pending_cr = false;
        }
        if byte == b'\r' {
            pending_cr = true;
        } else {
            out.push(byte);
        }
    }
}

// =============================================================================
// PERSISTENT STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateValues {
    #[serde(rename = "pValue")]
    pub p_value: f64,
    /// Epoch milliseconds.
    #[serde(rename = "pValueExpiry")]
    pub p_value_expiry: i64,
}

impl Default for StateValues {
    fn default() -> Self {
        Self {
            p_value: 1.0,
            p_value_expiry: 0,
        }
    }
}

/// Sampler state that outlives the process.
///
/// Loaded once; every update is written straight back. Failures either way
/// leave the in-memory values authoritative.
#[derive(Debug)]
pub struct PersistentState {
    path: PathBuf,
    values: Mutex<StateValues>,
}

impl PersistentState {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match read_state(&path) {
            Ok(values) => values,
            Err(e) => {
                debug!(error = %e, "using default persistent state");
                StateValues::default()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn values(&self) -> StateValues {
        *self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn p_value(&self) -> f64 {
        self.values().p_value
    }

    pub fn p_value_expiry(&self) -> i64 {
        self.values().p_value_expiry
    }

    /// Applies `update` and saves the result.
    pub fn update(&self, update: impl FnOnce(&mut StateValues)) {
        let snapshot = {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            update(&mut values);
            *values
        };
        if let Err(e) = write_state(&self.path, &snapshot) {
            debug!(error = %e, "could not save persistent state");
        }
    }
}

fn read_state(path: &Path) -> Result<StateValues, PersistenceError> {
    let bytes = fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_state(path: &Path, values: &StateValues) -> Result<(), PersistenceError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
    }
    let json = serde_json::to_vec(values)?;

    // Readers see either the old file or the new one, never a partial write
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
    file.write_all(&json)
        .and_then(|()| file.sync_data())
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
}
