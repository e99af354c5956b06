//! The build repository: persisted target states, object directories and
//! named output links, all under `bbxbuild/` in the main project.

pub mod config;
pub mod hash;
pub mod lock;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::RepoError;
use crate::value::Value;

pub use config::RunConfig;
pub use hash::{FileDigest, InputHashes, ObjectHash, TargetId, TargetIdData};
pub use lock::DirectoryLocker;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TargetOutcome {
    Succeeded { end_time: i64, result: Value },
    Failed { fail_time: i64, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub run_id: String,
    pub start_time: i64,
    /// [`InputHashes::digest`] at start.
    pub input_hashes: Hash32,
    /// `None` while the target is running.
    pub outcome: Option<TargetOutcome>,
}

/// The persisted part of the repo. Maps are keyed by hex target ids.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RepoData {
    target_states: BTreeMap<String, TargetState>,
    target_id_data: BTreeMap<String, TargetIdData>,
    output_names: BTreeMap<String, String>,
}

/// What a rule learns about its target when it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedTarget {
    pub hash_changed: bool,
    pub prev_build_time: Option<i64>,
    pub prev_result: Option<Value>,
    /// Set when an earlier result may be used without running the rule.
    pub reusable: Option<Value>,
    pub object_hash: ObjectHash,
}

#[derive(Debug)]
struct RepoState {
    data: RepoData,
    transient: HashMap<TargetId, Value>,
    dirty: bool,
    last_flush: Instant,
}

#[derive(Debug)]
pub struct Repo {
    root: Utf8PathBuf,
    run_id: String,
    config: RunConfig,
    locker: DirectoryLocker,
    state: Mutex<RepoState>,
}

impl Repo {
    pub const DIR: &'static str = "bbxbuild";

    /// Opens the repo at `root`, usually `<main project>/bbxbuild`. A
    /// missing directory is created; an unreadable store starts empty.
    pub fn open(root: impl AsRef<Utf8Path>, run_id: Option<String>) -> Result<Self, RepoError> {
        let root = root.as_ref().to_path_buf();
        for dir in ["objects", "outputs", "shared"] {
            fs::create_dir_all(root.join(dir))?;
        }

        let config = RunConfig::load_or_create(&root.join("config.json"))?;
        let data = load_data(&root.join("repo.cbor"));
        let run_id = run_id.unwrap_or_else(new_run_id);
        tracing::debug!(%root, %run_id, targets = data.target_states.len(), "opened repo");

        Ok(Repo {
            root,
            run_id,
            config,
            locker: DirectoryLocker::new(),
            state: Mutex::new(RepoState {
                data,
                transient: HashMap::new(),
                dirty: false,
                last_flush: Instant::now(),
            }),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn locker(&self) -> &DirectoryLocker {
        &self.locker
    }

    pub fn object_dir(&self, id: TargetId) -> Utf8PathBuf {
        self.root.join("objects").join(id.to_hex())
    }

    pub fn target_state(&self, id: TargetId) -> Option<TargetState> {
        self.lock().data.target_states.get(&id.to_hex()).cloned()
    }

    /// Records the start of `id` and compares its inputs with the last
    /// recorded start.
    pub fn target_started(&self, data: &TargetIdData, id: TargetId, inputs: &InputHashes) -> StartedTarget {
        let digest = inputs.digest();
        let key = id.to_hex();
        let now = now_secs();

        let mut state = self.lock();
        let prev = state.data.target_states.get(&key).cloned();
        let hash_changed = prev.as_ref().is_none_or(|prev| prev.input_hashes != digest);

        let (prev_build_time, prev_result) = match prev.as_ref().and_then(|prev| prev.outcome.as_ref()) {
            Some(TargetOutcome::Succeeded { end_time, result }) => (Some(*end_time), Some(result.clone())),
            _ => (None, None),
        };

        let reusable = match &prev {
            Some(prev) if !hash_changed => match &prev.outcome {
                Some(TargetOutcome::Succeeded { end_time, result })
                    if prev.run_id == self.run_id || self.config.allows_reuse(now - end_time) =>
                {
                    Some(result.clone())
                }
                _ => None,
            },
            _ => None,
        };

        if reusable.is_none() {
            state.data.target_states.insert(
                key.clone(),
                TargetState {
                    run_id: self.run_id.clone(),
                    start_time: now,
                    input_hashes: digest,
                    outcome: None,
                },
            );
            state.data.target_id_data.insert(key, data.clone());
            state.dirty = true;
        }

        StartedTarget {
            hash_changed,
            prev_build_time,
            prev_result,
            reusable,
            object_hash: ObjectHash::new(id, inputs),
        }
    }

    /// Records a result. Transient results live for this process only.
    pub fn target_succeeded(&self, id: TargetId, result: Value, transient: bool) {
        let mut state = self.lock();
        if transient {
            state.transient.insert(id, result);
            return;
        }
        if let Some(target) = state.data.target_states.get_mut(&id.to_hex()) {
            target.outcome = Some(TargetOutcome::Succeeded {
                end_time: now_secs(),
                result,
            });
            state.dirty = true;
        }
    }

    pub fn target_failed(&self, id: TargetId, message: impl Into<String>) {
        let mut state = self.lock();
        if let Some(target) = state.data.target_states.get_mut(&id.to_hex()) {
            target.outcome = Some(TargetOutcome::Failed {
                fail_time: now_secs(),
                message: message.into(),
            });
            state.dirty = true;
        }
    }

    /// The result of `id` if it succeeded during this run.
    pub fn run_result(&self, id: TargetId) -> Option<Value> {
        let state = self.lock();
        if let Some(value) = state.transient.get(&id) {
            return Some(value.clone());
        }
        match state.data.target_states.get(&id.to_hex()) {
            Some(TargetState {
                run_id,
                outcome: Some(TargetOutcome::Succeeded { result, .. }),
                ..
            }) if *run_id == self.run_id => Some(result.clone()),
            _ => None,
        }
    }

    /// Points `outputs/<name>` at the object directory of `id`. Returns
    /// `false`, leaving any old link alone, when the target wrote nothing.
    pub fn link_output(&self, name: &str, id: TargetId) -> Result<bool, RepoError> {
        let object = self.object_dir(id);
        if !object.is_dir() {
            return Ok(false);
        }

        let link = self.root.join("outputs").join(name);
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&link)?,
            Ok(_) => fs::remove_file(&link)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(&object, &link)?;
        #[cfg(not(unix))]
        fs::write(&link, object.as_str())?;

        let mut state = self.lock();
        state.data.output_names.insert(name.to_string(), id.to_hex());
        state.dirty = true;
        Ok(true)
    }

    pub fn output_target(&self, name: &str) -> Option<TargetId> {
        let state = self.lock();
        let hex = state.data.output_names.get(name)?;
        Hash32::from_hex(hex).map(TargetId)
    }

    /// Directory shared by every target of every run, e.g. a download cache.
    pub fn prepare_shared_directory(&self, name: &str) -> Result<Utf8PathBuf, RepoError> {
        let dir = self.root.join("shared").join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Writes the store if something changed and the last write is old
    /// enough.
    pub fn flush(&self) -> Result<(), RepoError> {
        let mut state = self.lock();
        if state.dirty && state.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.write(&mut state)?;
        }
        Ok(())
    }

    /// Writes the store now.
    pub fn commit(&self) -> Result<(), RepoError> {
        let mut state = self.lock();
        self.write(&mut state)
    }

    pub fn shutdown(&self) -> Result<(), RepoError> {
        self.commit()?;
        tracing::debug!(root = %self.root, "repo committed");
        Ok(())
    }

    fn write(&self, state: &mut RepoState) -> Result<(), RepoError> {
        let path = self.root.join("repo.cbor");
        let temp = self.root.join("repo.cbor.tmp");

        let file = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(&state.data, file).map_err(|err| RepoError::Encode(err.to_string()))?;
        fs::rename(&temp, &path)?;

        state.dirty = false;
        state.last_flush = Instant::now();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_data(path: &Utf8Path) -> RepoData {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return RepoData::default(),
        Err(err) => {
            tracing::warn!(%path, "couldn't open repo store, starting empty: {err}");
            return RepoData::default();
        }
    };

    match ciborium::from_reader::<RepoData, _>(BufReader::new(file)) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(%path, "corrupt repo store, starting empty: {err}");
            RepoData::default()
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seed = format!("{nanos}:{}", std::process::id());
    Hash32::hash(seed.as_bytes()).to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::RuleIdentity;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn target(root: &Utf8Path) -> (TargetIdData, TargetId, BTreeMap<String, Value>) {
        let args = BTreeMap::from([("src".to_string(), Value::File(root.join("a.txt")))]);
        let data = TargetIdData {
            source: "main".into(),
            rule: RuleIdentity {
                package: "main".into(),
                name: "copy".into(),
                class: "Copy".into(),
                method: None,
                implementation: None,
            },
            args: args.clone(),
        };
        let id = data.target_id().unwrap();
        (data, id, args)
    }

    #[test]
    fn test_hash_changed_tracks_inputs_across_runs() {
        let (_dir, root) = scratch();
        fs::write(root.join("a.txt"), "one").unwrap();
        let (data, id, args) = target(&root);

        let repo = Repo::open(root.join(Repo::DIR), Some("run1".into())).unwrap();
        let started = repo.target_started(&data, id, &InputHashes::compute(&args).unwrap());
        assert!(started.hash_changed);
        repo.target_succeeded(id, Value::string("done"), false);
        assert_eq!(repo.run_result(id), Some(Value::string("done")));
        repo.shutdown().unwrap();

        let repo = Repo::open(root.join(Repo::DIR), Some("run2".into())).unwrap();
        assert_eq!(repo.run_result(id), None);
        let started = repo.target_started(&data, id, &InputHashes::compute(&args).unwrap());
        assert!(!started.hash_changed);
        assert_eq!(started.prev_result, Some(Value::string("done")));
        assert_eq!(started.reusable, None);
        repo.target_succeeded(id, Value::string("again"), false);

        fs::write(root.join("a.txt"), "two").unwrap();
        let started = repo.target_started(&data, id, &InputHashes::compute(&args).unwrap());
        assert!(started.hash_changed);
    }

    #[test]
    fn test_reuse_within_run_and_by_config() {
        let (_dir, root) = scratch();
        fs::write(root.join("a.txt"), "one").unwrap();
        let (data, id, args) = target(&root);
        let inputs = InputHashes::compute(&args).unwrap();

        let repo = Repo::open(root.join(Repo::DIR), Some("run1".into())).unwrap();
        repo.target_started(&data, id, &inputs);
        repo.target_succeeded(id, Value::Boolean(true), false);
        let again = repo.target_started(&data, id, &inputs);
        assert_eq!(again.reusable, Some(Value::Boolean(true)));
        repo.shutdown().unwrap();

        fs::write(
            root.join(Repo::DIR).join("config.json"),
            r#"{ "target_result_reuse_secs": -1 }"#,
        )
        .unwrap();
        let repo = Repo::open(root.join(Repo::DIR), Some("run2".into())).unwrap();
        let next_run = repo.target_started(&data, id, &inputs);
        assert_eq!(next_run.reusable, Some(Value::Boolean(true)));
    }

    #[test]
    fn test_failures_and_transient_results() {
        let (_dir, root) = scratch();
        let (data, id, args) = target(&root);
        let repo = Repo::open(root.join(Repo::DIR), None).unwrap();

        let started = repo.target_started(&data, id, &InputHashes::compute(&args).unwrap());
        assert!(started.hash_changed);
        repo.target_failed(id, "boom");
        assert!(matches!(
            repo.target_state(id).and_then(|state| state.outcome),
            Some(TargetOutcome::Failed { message, .. }) if message == "boom"
        ));
        assert_eq!(repo.run_result(id), None);

        repo.target_succeeded(id, Value::string("tmp"), true);
        assert_eq!(repo.run_result(id), Some(Value::string("tmp")));
    }

    #[test]
    fn test_corrupt_store_starts_empty() {
        let (_dir, root) = scratch();
        let dir = root.join(Repo::DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("repo.cbor"), b"\xff\x00garbage").unwrap();

        let repo = Repo::open(&dir, None).unwrap();
        let (_, id, _) = target(&root);
        assert_eq!(repo.target_state(id), None);
        repo.commit().unwrap();
        assert!(Repo::open(&dir, None).is_ok());
    }

    #[test]
    fn test_link_output_requires_object_dir() {
        let (_dir, root) = scratch();
        let (_, id, _) = target(&root);
        let repo = Repo::open(root.join(Repo::DIR), None).unwrap();

        assert!(!repo.link_output("x", id).unwrap());

        fs::create_dir_all(repo.object_dir(id)).unwrap();
        assert!(repo.link_output("x", id).unwrap());
        assert!(repo.link_output("x", id).unwrap());
        assert!(repo.root().join("outputs/x").exists());
        assert_eq!(repo.output_target("x"), Some(id));

        let shared = repo.prepare_shared_directory("maven").unwrap();
        assert!(shared.is_dir());
    }
}
