use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::prelude::*;
use ring::hmac;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{debug, error};

use crate::error::StorageError;
use crate::models::{Response, Survey};

const SURVEYS: &str = "surveys";
const RESPONSES: &str = "responses";
const MASTER_PASSWORD: &str = "masterPassword";

/// Flat string storage the survey records live in.
pub trait KeyValue: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Bytes used by all keys and values.
    fn size(&self) -> usize;

    fn quota(&self) -> usize;
}

fn check_quota(
    used: usize,
    replaced: usize,
    key: &str,
    value: &str,
    quota: usize,
) -> Result<(), StorageError> {
    let needed = used - replaced + key.len() + value.len();
    if needed > quota {
        Err(StorageError::QuotaExceeded {
            needed,
            available: quota,
        })
    } else {
        Ok(())
    }
}

fn poisoned() -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::Other, "couldn't lock store"))
}

#[derive(Debug)]
pub struct MemoryKeyValue {
    entries: Mutex<BTreeMap<String, String>>,
    quota: usize,
}

impl MemoryKeyValue {
    #[cfg(test)]
    pub fn new() -> MemoryKeyValue {
        MemoryKeyValue::with_quota(usize::MAX)
    }

    pub fn with_quota(quota: usize) -> MemoryKeyValue {
        MemoryKeyValue {
            entries: Mutex::new(BTreeMap::new()),
            quota,
        }
    }
}

#[cfg(test)]
impl Default for MemoryKeyValue {
    fn default() -> MemoryKeyValue {
        MemoryKeyValue::new()
    }
}

impl KeyValue for MemoryKeyValue {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_err| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_err| poisoned())?;

        let used = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        check_quota(used, replaced, key, value, self.quota)?;

        entries.insert(key.into(), value.into());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_err| poisoned())?;
        entries.remove(key);
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }

    fn quota(&self) -> usize {
        self.quota
    }
}

/// One `<key>.json` file per key under a data directory.
#[derive(Debug)]
pub struct FileKeyValue {
    dir: PathBuf,
    quota: usize,
    lock: Mutex<()>,
}

impl FileKeyValue {
    pub fn open(dir: impl AsRef<Path>, quota: usize) -> Result<FileKeyValue, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(FileKeyValue {
            dir,
            quota,
            lock: Mutex::new(()),
        })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn entry_len(&self, key: &str) -> usize {
        fs::metadata(self.path(key))
            .map(|meta| key.len() + meta.len() as usize)
            .unwrap_or(0)
    }
}

impl KeyValue for FileKeyValue {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_err| poisoned())?;

        check_quota(self.size(), self.entry_len(key), key, value, self.quota)?;

        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, self.path(key))?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().map_err(|_err| poisoned())?;

        match fs::remove_file(self.path(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn size(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_err) => return 0,
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let key = name.strip_suffix(".json")?;
                if key.starts_with('.') {
                    return None;
                }
                Some(self.entry_len(key))
            })
            .sum()
    }

    fn quota(&self) -> usize {
        self.quota
    }
}

/// Persisted values that live beside the survey records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    KioskSurvey,
    Language,
    Direction,
}

impl Flag {
    fn key(self) -> &'static str {
        match self {
            Flag::KioskSurvey => "kioskModeSurveyId",
            Flag::Language => "appLanguage",
            Flag::Direction => "preferredDirection",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub surveys: usize,
    pub responses: usize,
    pub total: usize,
    pub available: usize,
}

/// Survey and response records over a [`KeyValue`] backend. Every write is a
/// read-modify-write of the whole list.
#[derive(Clone, Debug)]
pub struct Store {
    kv: Arc<dyn KeyValue>,
}

impl Store {
    pub fn new(kv: impl KeyValue + 'static) -> Store {
        Store { kv: Arc::new(kv) }
    }

    #[cfg(test)]
    pub fn in_memory() -> Store {
        Store::new(MemoryKeyValue::new())
    }

    /// The stored list as raw JSON values. Records are kept even when they
    /// don't parse, so writes never drop them.
    fn read_values(&self, key: &str) -> Vec<Value> {
        let raw = match self.kv.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                error!("Error loading {}: {}", key, err);
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|err| {
            error!("Error loading {}: {}", key, err);
            Vec::new()
        })
    }

    /// Parses each record on its own and skips the ones that don't fit.
    fn read_list<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        self.read_values(key)
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(err) => {
                    error!("Skipping {} record {}: {}", key, index, err);
                    None
                }
            })
            .collect()
    }

    fn write_list<T: Serialize>(&self, key: &str, list: &[T]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(list)?;
        self.kv.set(key, &raw).map_err(|err| {
            error!("Error saving {}: {}", key, err);
            err
        })
    }

    pub fn surveys(&self) -> Vec<Survey> {
        self.read_list(SURVEYS)
    }

    pub fn survey(&self, id: &str) -> Option<Survey> {
        self.surveys().into_iter().find(|survey| survey.id == id)
    }

    pub fn published_surveys(&self) -> Vec<Survey> {
        self.surveys()
            .into_iter()
            .filter(|survey| survey.published)
            .collect()
    }

    /// Inserts a new survey or replaces the one with the same id in place.
    pub fn save_survey(&self, survey: &Survey) -> Result<(), StorageError> {
        let mut surveys = self.read_values(SURVEYS);
        let record = serde_json::to_value(survey)?;

        match surveys
            .iter_mut()
            .find(|s| field(s, "id") == Some(survey.id.as_str()))
        {
            Some(existing) => *existing = record,
            None => surveys.push(record),
        }

        self.write_list(SURVEYS, &surveys)
    }

    /// Deletes the survey and every response recorded against it.
    pub fn delete_survey(&self, id: &str) -> Result<(), StorageError> {
        let mut surveys = self.read_values(SURVEYS);
        surveys.retain(|survey| field(survey, "id") != Some(id));

        self.delete_responses(id)?;
        self.write_list(SURVEYS, &surveys)
    }

    pub fn all_responses(&self) -> Vec<Response> {
        self.read_list(RESPONSES)
    }

    pub fn responses(&self, survey_id: &str) -> Vec<Response> {
        self.all_responses()
            .into_iter()
            .filter(|response| response.survey_id == survey_id)
            .collect()
    }

    pub fn save_response(&self, response: &Response) -> Result<(), StorageError> {
        let mut responses = self.read_values(RESPONSES);
        responses.push(serde_json::to_value(response)?);
        self.write_list(RESPONSES, &responses)
    }

    pub fn delete_responses(&self, survey_id: &str) -> Result<(), StorageError> {
        let mut responses = self.read_values(RESPONSES);
        responses.retain(|response| field(response, "surveyId") != Some(survey_id));

        self.write_list(RESPONSES, &responses)
    }

    /// Drops every response of every survey. Returns how many were removed.
    pub fn clear_all_responses(&self) -> Result<usize, StorageError> {
        let removed = self.read_values(RESPONSES).len();
        self.write_list::<Value>(RESPONSES, &[])?;
        Ok(removed)
    }

    pub fn master_password(&self) -> Option<String> {
        let encoded = match self.kv.get(MASTER_PASSWORD) {
            Ok(encoded) => encoded?,
            Err(err) => {
                error!("Error loading master password: {}", err);
                return None;
            }
        };

        let decoded = STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());

        if decoded.is_none() {
            error!("Error loading master password: not valid base64");
        }

        decoded
    }

    pub fn has_master_password(&self) -> bool {
        matches!(self.kv.get(MASTER_PASSWORD), Ok(Some(encoded)) if !encoded.is_empty())
    }

    pub fn set_master_password(&self, password: &str) -> Result<(), StorageError> {
        self.kv.set(MASTER_PASSWORD, &STANDARD.encode(password))
    }

    pub fn remove_master_password(&self) -> Result<(), StorageError> {
        self.kv.remove(MASTER_PASSWORD)
    }

    /// Accepts the master password or, when given, the survey's own password.
    /// Both comparisons are exact and case-sensitive.
    pub fn verify_password(&self, input: &str, survey_password: Option<&str>) -> bool {
        // HMAC tags under a per-call key, compared in constant time.
        let mut key = [0u8; 32];
        thread_rng().fill(&mut key);
        let key = hmac::Key::new(hmac::HMAC_SHA256, &key);

        let matches = |expected: &str| {
            let tag = hmac::sign(&key, expected.as_bytes());
            hmac::verify(&key, input.as_bytes(), tag.as_ref()).is_ok()
        };

        if let Some(master) = self.master_password() {
            if !master.is_empty() && matches(&master) {
                return true;
            }
        }

        match survey_password {
            Some(password) if !password.is_empty() => matches(password),
            _ => false,
        }
    }

    pub fn flag(&self, flag: Flag) -> Option<String> {
        self.kv.get(flag.key()).unwrap_or_else(|err| {
            error!("Error loading {}: {}", flag.key(), err);
            None
        })
    }

    pub fn set_flag(&self, flag: Flag, value: &str) -> Result<(), StorageError> {
        debug!("{} = {}", flag.key(), value);
        self.kv.set(flag.key(), value)
    }

    pub fn clear_flag(&self, flag: Flag) -> Result<(), StorageError> {
        self.kv.remove(flag.key())
    }

    pub fn storage_info(&self) -> StorageInfo {
        let len = |key: &str| {
            self.kv
                .get(key)
                .ok()
                .flatten()
                .map(|raw| raw.len())
                .unwrap_or(0)
        };

        let surveys = len(SURVEYS);
        let responses = len(RESPONSES);
        let total = surveys + responses;

        StorageInfo {
            surveys,
            responses,
            total,
            available: self.kv.quota().saturating_sub(self.kv.size()),
        }
    }
}

fn field<'a>(record: &'a Value, name: &str) -> Option<&'a str> {
    record.get(name).and_then(Value::as_str)
}

/// Time-based id with a random base36 suffix, e.g. `id_1704189600000_k3j9x0a2b`.
pub fn generate_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut rng = thread_rng();
    let suffix = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect::<String>();

    format!("id_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn save_survey_inserts_then_replaces() {
        let store = Store::in_memory();
        let mut survey = fixtures::survey("s1");

        store.save_survey(&survey).unwrap();
        survey.title = "Renamed".into();
        store.save_survey(&survey).unwrap();

        let surveys = store.surveys();
        assert_eq!(surveys.len(), 1);
        assert_eq!(surveys[0].title, "Renamed");
        assert_eq!(store.survey("s1").unwrap().title, "Renamed");
        assert!(store.survey("missing").is_none());
    }

    #[test]
    fn published_surveys_filters_drafts() {
        let store = Store::in_memory();
        let mut published = fixtures::survey("s1");
        published.published = true;
        store.save_survey(&published).unwrap();
        store.save_survey(&fixtures::survey("s2")).unwrap();

        let ids = store
            .published_surveys()
            .into_iter()
            .map(|s| s.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["s1".to_string()]);
    }

    #[test]
    fn delete_survey_cascades_to_its_responses_only() {
        let store = Store::in_memory();
        store.save_survey(&fixtures::survey("s1")).unwrap();
        store.save_survey(&fixtures::survey("s2")).unwrap();
        store
            .save_response(&fixtures::response("r1", "s1", "2024-01-01T10:00:00Z"))
            .unwrap();
        store
            .save_response(&fixtures::response("r2", "s2", "2024-01-01T11:00:00Z"))
            .unwrap();
        store
            .save_response(&fixtures::response("r3", "s1", "2024-01-01T12:00:00Z"))
            .unwrap();

        store.delete_survey("s1").unwrap();

        assert!(store.survey("s1").is_none());
        assert!(store.responses("s1").is_empty());
        let others = store.responses("s2");
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, "r2");
    }

    #[test]
    fn delete_and_clear_responses() {
        let store = Store::in_memory();
        store
            .save_response(&fixtures::response("r1", "s1", "2024-01-01T10:00:00Z"))
            .unwrap();
        store
            .save_response(&fixtures::response("r2", "s2", "2024-01-01T10:00:00Z"))
            .unwrap();

        store.delete_responses("s1").unwrap();
        assert!(store.responses("s1").is_empty());
        assert_eq!(store.responses("s2").len(), 1);

        assert_eq!(store.clear_all_responses().unwrap(), 1);
        assert!(store.all_responses().is_empty());
    }

    #[test]
    fn corrupt_records_read_as_empty() {
        let kv = MemoryKeyValue::new();
        kv.set(SURVEYS, "{not json").unwrap();
        let store = Store::new(kv);

        assert!(store.surveys().is_empty());
    }

    #[test]
    fn unreadable_records_are_skipped_and_kept() {
        let kv = Arc::new(MemoryKeyValue::new());
        let good = serde_json::to_value(fixtures::survey("s1")).unwrap();
        let bad = serde_json::json!({
            "id": "s2",
            "title": "Seven stars",
            "createdAt": "2024-01-01T00:00:00Z",
            "questions": [{"id": "q", "type": "rating", "maxRating": 7, "question": "?"}],
        });
        kv.set(SURVEYS, &serde_json::to_string(&vec![good, bad]).unwrap())
            .unwrap();
        let store = Store {
            kv: kv.clone() as Arc<dyn KeyValue>,
        };

        let surveys = store.surveys();
        assert_eq!(surveys.len(), 1);
        assert_eq!(surveys[0].id, "s1");

        store.save_survey(&fixtures::survey("s3")).unwrap();
        store.delete_survey("s1").unwrap();

        let raw: Vec<Value> =
            serde_json::from_str(&kv.get(SURVEYS).unwrap().unwrap()).unwrap();
        let ids = raw
            .iter()
            .filter_map(|record| field(record, "id"))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["s2", "s3"]);
        assert_eq!(store.surveys().len(), 1);
    }

    #[test]
    fn quota_exceeded_leaves_previous_state() {
        let store = Store::new(MemoryKeyValue::with_quota(4000));
        store.save_survey(&fixtures::survey("s1")).unwrap();

        let mut big = fixtures::survey("s2");
        big.description = "x".repeat(5000);
        let err = store.save_survey(&big).unwrap_err();

        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(store.surveys().len(), 1);
    }

    #[test]
    fn master_password_is_stored_base64() {
        let kv = Arc::new(MemoryKeyValue::new());
        let store = Store {
            kv: kv.clone() as Arc<dyn KeyValue>,
        };

        assert!(!store.has_master_password());
        store.set_master_password("s3cret").unwrap();

        assert!(store.has_master_password());
        assert_eq!(kv.get(MASTER_PASSWORD).unwrap().unwrap(), "czNjcmV0");
        assert_eq!(store.master_password().unwrap(), "s3cret");

        store.remove_master_password().unwrap();
        assert!(!store.has_master_password());
        assert!(store.master_password().is_none());
    }

    #[test]
    fn verify_password_accepts_master_or_survey_password() {
        let store = Store::in_memory();
        store.set_master_password("master").unwrap();

        assert!(store.verify_password("master", None));
        assert!(store.verify_password("master", Some("survey")));
        assert!(store.verify_password("survey", Some("survey")));
        assert!(!store.verify_password("Survey", Some("survey")));
        assert!(!store.verify_password("survey", None));
        assert!(!store.verify_password("", Some("")));
    }

    #[test]
    fn flags_set_and_clear() {
        let store = Store::in_memory();
        assert!(store.flag(Flag::KioskSurvey).is_none());

        store.set_flag(Flag::KioskSurvey, "s1").unwrap();
        assert_eq!(store.flag(Flag::KioskSurvey).as_deref(), Some("s1"));

        store.clear_flag(Flag::KioskSurvey).unwrap();
        assert!(store.flag(Flag::KioskSurvey).is_none());
    }

    #[test]
    fn storage_info_counts_record_bytes() {
        let store = Store::new(MemoryKeyValue::with_quota(10_000));
        store.save_survey(&fixtures::survey("s1")).unwrap();

        let info = store.storage_info();
        assert!(info.surveys > 0);
        assert_eq!(info.responses, 0);
        assert_eq!(info.total, info.surveys);
        assert_eq!(info.available, 10_000 - SURVEYS.len() - info.surveys);
    }

    #[test]
    fn generated_ids_are_distinct_and_shaped() {
        let a = generate_id();
        let b = generate_id();

        assert_ne!(a, b);
        let parts = a.split('_').collect::<Vec<_>>();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "id");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let store = Store::new(FileKeyValue::open(dir.path(), usize::MAX).unwrap());
        store.save_survey(&fixtures::survey("s1")).unwrap();
        store.set_flag(Flag::Language, "ar").unwrap();

        let reopened = Store::new(FileKeyValue::open(dir.path(), usize::MAX).unwrap());
        assert_eq!(reopened.survey("s1").unwrap(), fixtures::survey("s1"));
        assert_eq!(reopened.flag(Flag::Language).as_deref(), Some("ar"));

        reopened.clear_flag(Flag::Language).unwrap();
        reopened.clear_flag(Flag::Language).unwrap();
        assert!(reopened.flag(Flag::Language).is_none());
    }

    #[test]
    fn file_store_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKeyValue::open(dir.path(), 64).unwrap();

        kv.set("small", "abc").unwrap();
        let err = kv.set("big", &"y".repeat(100)).unwrap_err();

        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert!(kv.get("big").unwrap().is_none());
        assert_eq!(kv.size(), "small".len() + 3);
    }
}
