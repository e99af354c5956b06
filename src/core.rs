use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `bibix`, this serves two primary purposes:
/// 1. It identifies a target by its rule and arguments ([`TargetId`]), and
///    names the object directory the target writes into.
/// 2. It fingerprints the filesystem inputs reachable from the arguments so
///    a rule can tell whether anything changed since the previous run.
///
/// [`TargetId`]: crate::repo::TargetId
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes the whole file; large files are memory mapped and hashed on the
    /// rayon pool.
    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Hashes several byte slices as one stream.
    pub fn hash_all<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi * 16 + lo) as u8;
        }

        Some(Hash32(bytes))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Makes `path` absolute against the current directory and removes `.` and
/// `..` components without touching the filesystem.
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir()
            .ok()
            .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        {
            Some(cwd) => cwd.join(path),
            None => path.to_path_buf(),
        }
    };

    normalize_lexically(&absolute)
}

/// Removes `.` and `..` components. `..` at the root stays at the root.
pub fn normalize_lexically(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let hash = Hash32::hash(b"bibix");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
        assert_eq!(Hash32::from_hex("zz"), None);
    }

    #[test]
    fn test_hash_all_matches_concatenation() {
        let joined = Hash32::hash(b"helloworld");
        let parts = Hash32::hash_all([b"hello".as_slice(), b"world".as_slice()]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_normalize_lexically() {
        let path = Utf8Path::new("/shared/./maven/../npm/");
        assert_eq!(normalize_lexically(path), Utf8PathBuf::from("/shared/npm"));
        assert_eq!(
            normalize_lexically(Utf8Path::new("/../a")),
            Utf8PathBuf::from("/a")
        );
    }
}
