use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::plugin::RuleIdentity;
use crate::value::Value;

/// Identity of one rule invocation: which project called which rule with
/// which arguments. Equal invocations share their object directory and
/// their persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub Hash32);

/// Everything a [`TargetId`] is derived from, kept for tooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdData {
    /// Package of the project containing the call.
    pub source: String,
    pub rule: RuleIdentity,
    pub args: BTreeMap<String, Value>,
}

impl TargetIdData {
    pub fn target_id(&self) -> Result<TargetId, ciborium::ser::Error<io::Error>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)?;
        Ok(TargetId(Hash32::hash(&buffer)))
    }
}

impl TargetId {
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDigest {
    pub size: u64,
    pub hash: Hash32,
}

/// Snapshot of the filesystem inputs of a target: every file reachable from
/// a path-like argument, with directories walked recursively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputHashes {
    pub files: BTreeMap<Utf8PathBuf, FileDigest>,
    /// Directories with their sorted entry names.
    pub directories: BTreeMap<Utf8PathBuf, Vec<String>>,
    /// Paths that didn't exist when hashed.
    pub missing: Vec<Utf8PathBuf>,
}

impl InputHashes {
    pub fn compute(args: &BTreeMap<String, Value>) -> io::Result<Self> {
        let mut paths = Vec::new();
        for value in args.values() {
            value.visit_paths(&mut |path| paths.push(path.to_path_buf()));
        }
        paths.sort();
        paths.dedup();

        let mut hashes = InputHashes::default();
        for path in paths {
            hashes.add(&path)?;
        }
        Ok(hashes)
    }

    fn add(&mut self, path: &Utf8Path) -> io::Result<()> {
        if self.files.contains_key(path) || self.directories.contains_key(path) {
            return Ok(());
        }

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.missing.push(path.to_path_buf());
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if meta.is_dir() {
            let mut names = Vec::new();
            for entry in path.read_dir_utf8()? {
                names.push(entry?.file_name().to_string());
            }
            names.sort();
            for name in &names {
                self.add(&path.join(name))?;
            }
            self.directories.insert(path.to_path_buf(), names);
        } else {
            let digest = FileDigest {
                size: meta.len(),
                hash: Hash32::hash_file(path)?,
            };
            self.files.insert(path.to_path_buf(), digest);
        }
        Ok(())
    }

    /// Single hash over the whole snapshot, what gets persisted and compared.
    pub fn digest(&self) -> Hash32 {
        let mut buffer = Vec::new();
        for (path, file) in &self.files {
            buffer.extend_from_slice(b"f");
            buffer.extend_from_slice(path.as_str().as_bytes());
            buffer.push(0);
            buffer.extend_from_slice(&file.size.to_le_bytes());
            buffer.extend_from_slice(file.hash.as_bytes());
        }
        for (path, names) in &self.directories {
            buffer.extend_from_slice(b"d");
            buffer.extend_from_slice(path.as_str().as_bytes());
            for name in names {
                buffer.push(0);
                buffer.extend_from_slice(name.as_bytes());
            }
            buffer.push(0);
        }
        for path in &self.missing {
            buffer.extend_from_slice(b"m");
            buffer.extend_from_slice(path.as_str().as_bytes());
            buffer.push(0);
        }
        Hash32::hash(&buffer)
    }
}

/// Identity of a target together with the state of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub Hash32);

impl ObjectHash {
    pub fn new(target: TargetId, inputs: &InputHashes) -> Self {
        let digest = inputs.digest();
        ObjectHash(Hash32::hash_all([
            target.0.as_bytes().as_slice(),
            digest.as_bytes().as_slice(),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> RuleIdentity {
        RuleIdentity {
            package: "main".into(),
            name: "compile".into(),
            class: "Compile".into(),
            method: None,
            implementation: None,
        }
    }

    #[test]
    fn test_target_id_depends_on_args() {
        let data = |value: &str| TargetIdData {
            source: "main".into(),
            rule: rule(),
            args: BTreeMap::from([("src".to_string(), Value::string(value))]),
        };

        let a = data("a").target_id().unwrap();
        assert_eq!(a, data("a").target_id().unwrap());
        assert_ne!(a, data("b").target_id().unwrap());
    }

    #[test]
    fn test_input_hashes_follow_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::write(root.join("src/a.txt"), "one").unwrap();

        let args = BTreeMap::from([
            ("dir".to_string(), Value::Directory(root.join("src"))),
            ("gone".to_string(), Value::File(root.join("gone.txt"))),
        ]);

        let before = InputHashes::compute(&args).unwrap();
        assert_eq!(before.files.len(), 1);
        assert_eq!(before.missing, vec![root.join("gone.txt")]);
        assert_eq!(before.digest(), InputHashes::compute(&args).unwrap().digest());

        fs::write(root.join("src/a.txt"), "two").unwrap();
        let after = InputHashes::compute(&args).unwrap();
        assert_ne!(before.digest(), after.digest());

        fs::write(root.join("src/b.txt"), "two").unwrap();
        let added = InputHashes::compute(&args).unwrap();
        assert_ne!(after.digest(), added.digest());
    }
}
