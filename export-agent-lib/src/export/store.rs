//! Persisted incremental state.
//!
//! [`LastProcessedStore`] is a JSON document of nested objects addressed by key paths
//! such as `["github", "sourcecode.PullRequest", "repo-42"]`. Every write replaces the
//! file atomically so a crash mid-write leaves the previous state intact.

use crate::Result;
use camino::{Utf8Path, Utf8PathBuf};
use ohno::{IntoAppError, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

const LOG_TARGET: &str = "     store";

/// Key-path addressed JSON state shared by all sessions of a run.
#[derive(Debug)]
pub struct LastProcessedStore {
    path: Utf8PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl LastProcessedStore {
    /// Load the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();

        let data = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Map::new(),
            Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes)
                .into_app_err_with(|| format!("parsing incremental state file '{path}'"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(target: LOG_TARGET, "No incremental state at '{path}', starting fresh");
                Map::new()
            }
            Err(e) => return Err(e).into_app_err_with(|| format!("reading incremental state file '{path}'")),
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Value stored at `key_path`, if any.
    #[must_use]
    pub fn get<S: AsRef<str>>(&self, key_path: &[S]) -> Option<Value> {
        let data = self.data.lock().expect("lock not poisoned");

        let (last, parents) = key_path.split_last()?;
        let mut node = &*data;
        for key in parents {
            node = node.get(key.as_ref())?.as_object()?;
        }
        node.get(last.as_ref()).cloned()
    }

    /// Value stored at `key_path`, decoded as `T`.
    pub fn get_as<T: DeserializeOwned, S: AsRef<str>>(&self, key_path: &[S]) -> Result<Option<T>> {
        self.get(key_path)
            .map(serde_json::from_value)
            .transpose()
            .into_app_err_with(|| format!("decoding incremental state at '{}'", join(key_path)))
    }

    /// Store `value` at `key_path` and persist the whole document.
    pub fn set<S: AsRef<str>>(&self, key_path: &[S], value: impl Serialize) -> Result<()> {
        let Some((last, parents)) = key_path.split_last() else {
            bail!("cannot store incremental state under an empty key path");
        };

        let value = serde_json::to_value(value).into_app_err("encoding incremental state")?;

        let mut data = self.data.lock().expect("lock not poisoned");
        let mut node = &mut *data;
        for key in parents {
            let entry = node
                .entry(key.as_ref().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = entry.as_object_mut().expect("entry was just made an object");
        }
        let _ = node.insert(last.as_ref().to_string(), value);

        self.save(&data)
    }

    fn save(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent).into_app_err_with(|| format!("creating directory '{parent}'"))?;
        }

        let tmp = Utf8PathBuf::from(format!("{}.tmp", self.path));
        {
            let file = fs::File::create(&tmp).into_app_err_with(|| format!("creating '{tmp}'"))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, data).into_app_err_with(|| format!("writing '{tmp}'"))?;
            writer.flush().into_app_err_with(|| format!("flushing '{tmp}'"))?;
        }

        fs::rename(&tmp, &self.path).into_app_err_with(|| format!("replacing incremental state file '{}'", self.path))
    }
}

fn join<S: AsRef<str>>(key_path: &[S]) -> String {
    key_path.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("/")
}
