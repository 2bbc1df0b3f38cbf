//! Flat-file cache tier.
//!
//! Each key maps to one JSON file, `<root>/<key>.json`, so the key's `/`
//! separators become directories. Writes land in a sibling temp file that is
//! renamed into place, so readers never see a half-written value.
//!
//! Entries expire by file age: with a non-zero ttl, a file whose modification
//! time is older than the ttl is a miss and is removed on read.
//!
//! Listing resolves key patterns as path globs under the root, so `*` stays
//! within one directory level and `**` spans any depth.

use std::fs::{self, Metadata};
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use serde_json::Value;
use strata_core::{
    BackendError, BackendKind, CacheConfig, CacheError, CachePaths, CacheResult, KEY_SEPARATOR,
};

use super::pattern::{glob_to_path, validate_key};
use super::{decode_value, encode_value, no_keys, CacheBackend, KeyIter};

const EXTENSION: &str = ".json";

fn op_error(path: &Path, e: io::Error) -> BackendError {
    BackendError::Operation {
        backend: BackendKind::Filesystem,
        reason: format!("{}: {e}", path.display()),
    }
}

/// Flat-file key/value tier.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    root: PathBuf,
    ttl: Option<Duration>,
}

impl FilesystemCache {
    /// Use `root` as the cache directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>, ttl: u64) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BackendError::Open {
            backend: BackendKind::Filesystem,
            reason: format!("{}: {e}", root.display()),
        })?;
        tracing::debug!(root = %root.display(), ttl, "Filesystem cache opened");
        Ok(Self {
            root,
            ttl: (ttl > 0).then(|| Duration::from_secs(ttl)),
        })
    }

    /// Build from a tier config.
    ///
    /// Options:
    /// - `path`: cache directory (default: `<cache root>/objects`)
    pub fn from_config(config: &CacheConfig, paths: &CachePaths) -> CacheResult<Self> {
        let root = config
            .option_path("path")
            .unwrap_or_else(|| paths.objects_dir());
        Self::open(root, config.ttl)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative form of a key, accepting keys already prefixed with the root.
    ///
    /// `None` if the key escapes the root or names nothing.
    fn relative(&self, key: &str) -> Option<PathBuf> {
        let path = Path::new(key);
        let path = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };
        let mut relative = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        (!relative.as_os_str().is_empty()).then_some(relative)
    }

    /// File holding a key's value.
    pub fn file_for(&self, key: &str) -> Option<PathBuf> {
        let relative = self.relative(key)?;
        let mut file = self.root.join(relative).into_os_string();
        file.push(EXTENSION);
        Some(PathBuf::from(file))
    }

    fn is_fresh(&self, metadata: &Metadata) -> bool {
        let Some(ttl) = self.ttl else {
            return true;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map_or(true, |age| age <= ttl)
    }

    /// Key stored in a value file under the root.
    fn key_for(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            parts.push(component.as_os_str().to_str()?);
        }
        parts.join("/").strip_suffix(EXTENSION).map(str::to_string)
    }

    /// Lazily resolve a path glob relative to the root into fresh keys.
    fn matching(&self, relative_glob: &str) -> KeyIter {
        let root = Pattern::escape(&self.root.to_string_lossy());
        let full = format!("{root}/{relative_glob}");
        let paths = match glob::glob(&full) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(pattern = %full, error = %e, "Invalid cache pattern");
                return no_keys();
            }
        };

        let cache = self.clone();
        Box::new(paths.filter_map(move |entry| {
            let file = match entry {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(error = %e, "Filesystem cache scan failed");
                    return None;
                }
            };
            let metadata = fs::metadata(&file).ok()?;
            if !metadata.is_file() || !cache.is_fresh(&metadata) {
                return None;
            }
            cache.key_for(&file)
        }))
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl CacheBackend for FilesystemCache {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    fn set(&self, key: &str, value: &Value) -> CacheResult<()> {
        validate_key(key)?;
        let file = self.file_for(key).ok_or_else(|| CacheError::InvalidKey {
            key: key.to_string(),
            reason: "key does not name a file under the cache root".to_string(),
        })?;
        let encoded = encode_value(value)?;

        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).map_err(|e| op_error(parent, e))?;
        }

        let mut temp_name = file.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!(".{}.tmp", std::process::id()));
        let temp = file.with_file_name(temp_name);

        fs::write(&temp, encoded).map_err(|e| op_error(&temp, e))?;
        if let Err(e) = fs::rename(&temp, &file) {
            let _ = fs::remove_file(&temp);
            return Err(op_error(&file, e).into());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Value> {
        let file = self.file_for(key)?;
        let metadata = match fs::metadata(&file) {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(file = %file.display(), error = %e, "Filesystem cache read failed");
                }
                return None;
            }
        };

        if !self.is_fresh(&metadata) {
            tracing::debug!(key, "Filesystem cache entry expired");
            if let Err(e) = remove_file_if_present(&file) {
                tracing::warn!(file = %file.display(), error = %e, "Failed to remove expired entry");
            }
            return None;
        }

        match fs::read_to_string(&file) {
            Ok(raw) => Some(decode_value(&raw)),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(file = %file.display(), error = %e, "Filesystem cache read failed");
                }
                None
            }
        }
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        let Some(relative) = self.relative(key) else {
            return Ok(());
        };
        let dir = self.root.join(&relative);
        let mut file = dir.clone().into_os_string();
        file.push(EXTENSION);
        let file = PathBuf::from(file);

        remove_file_if_present(&file).map_err(|e| op_error(&file, e))?;
        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(op_error(&dir, e).into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> KeyIter {
        self.matching(&format!("**/*{EXTENSION}"))
    }

    fn list(&self, pattern: &str) -> KeyIter {
        let root = self.root.to_string_lossy();
        let pattern = pattern
            .strip_prefix(root.as_ref())
            .map_or(pattern, |rest| rest.trim_start_matches(['/', '\\']));

        let escapes_root = pattern.is_empty()
            || Path::new(pattern).is_absolute()
            || pattern.split(KEY_SEPARATOR).any(|segment| segment == "..");
        if escapes_root {
            return no_keys();
        }

        let mut relative_glob = glob_to_path(pattern);
        // `**` must stand alone as a path component.
        if relative_glob.ends_with("**") {
            relative_glob.push_str("/*");
        }
        relative_glob.push_str(EXTENSION);
        self.matching(&relative_glob)
    }

    fn clear(&self) -> CacheResult<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(op_error(&self.root, e).into()),
            _ => {}
        }
        fs::create_dir_all(&self.root).map_err(|e| op_error(&self.root, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_cache(ttl: u64) -> (FilesystemCache, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let cache = FilesystemCache::open(temp_dir.path().join("objects"), ttl)
            .expect("cache creation should succeed");
        (cache, temp_dir)
    }

    fn sorted(iter: KeyIter) -> Vec<String> {
        let mut keys: Vec<String> = iter.collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_set_and_get() {
        let (cache, _temp_dir) = create_test_cache(1000);
        let value = json!({"id": "i1", "dir": "/train"});

        cache.set("items/i1/object", &value).expect("set should succeed");
        assert_eq!(cache.get("items/i1/object"), Some(value));
        assert!(cache.root().join("items/i1/object.json").is_file());
    }

    #[test]
    fn test_absolute_key_form() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("items/i1/object", &json!(1)).expect("set should succeed");

        let absolute = cache.root().join("items/i1/object");
        assert_eq!(cache.get(&absolute.to_string_lossy()), Some(json!(1)));
    }

    #[test]
    fn test_non_json_payload_reads_as_string() {
        let (cache, _temp_dir) = create_test_cache(1000);
        let file = cache.root().join("raw.json");
        fs::write(&file, "not json").expect("write should succeed");
        assert_eq!(cache.get("raw"), Some(json!("not json")));
    }

    #[test]
    fn test_set_leaves_no_temp_files() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("items/i1/object", &json!(1)).expect("set should succeed");
        cache.set("items/i1/object", &json!(2)).expect("set should succeed");

        let names: Vec<String> = fs::read_dir(cache.root().join("items/i1"))
            .expect("dir should exist")
            .map(|entry| {
                entry
                    .expect("entry should read")
                    .file_name()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["object.json"]);
    }

    #[test]
    fn test_set_rejects_escaping_keys() {
        let (cache, _temp_dir) = create_test_cache(1000);
        assert!(cache.set("../outside", &json!(1)).is_err());
        assert!(cache.set("", &json!(1)).is_err());
        assert!(cache.set("/etc/passwd", &json!(1)).is_err());
    }

    #[test]
    fn test_delete_removes_subtree() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("datasets/d1", &json!("dataset")).expect("set should succeed");
        cache.set("datasets/d1/items/i1", &json!("item")).expect("set should succeed");
        cache.set("datasets/d2", &json!("other")).expect("set should succeed");

        cache.delete("datasets/d1").expect("delete should succeed");

        assert_eq!(cache.get("datasets/d1"), None);
        assert_eq!(cache.get("datasets/d1/items/i1"), None);
        assert_eq!(cache.get("datasets/d2"), Some(json!("other")));
        assert!(!cache.root().join("datasets/d1").exists());
    }

    #[test]
    fn test_delete_absent_and_empty_keys() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("keep", &json!(1)).expect("set should succeed");

        cache.delete("missing/key").expect("delete should succeed");
        cache.delete("").expect("delete should succeed");
        assert_eq!(cache.get("keep"), Some(json!(1)));
    }

    #[test]
    fn test_keys_walks_tree() {
        let (cache, _temp_dir) = create_test_cache(1000);
        for key in ["a", "b/c", "b/d/e/object"] {
            cache.set(key, &json!(key)).expect("set should succeed");
        }
        assert_eq!(sorted(cache.keys()), vec!["a", "b/c", "b/d/e/object"]);
        assert_eq!(sorted(cache.keys()), sorted(cache.keys()));
    }

    #[test]
    fn test_list_single_and_any_level() {
        let (cache, _temp_dir) = create_test_cache(1000);
        for key in [
            "projects/p1/datasets/d1",
            "projects/p2/datasets/d2",
            "projects/p1/datasets/d1/items/i1",
            "orgs/o1/projects/p1",
        ] {
            cache.set(key, &json!(1)).expect("set should succeed");
        }

        assert_eq!(
            sorted(cache.list("projects/**/datasets/*")),
            vec!["projects/p1/datasets/d1", "projects/p2/datasets/d2"]
        );
        assert_eq!(
            sorted(cache.list("projects/*/datasets/d1/*/*")),
            vec!["projects/p1/datasets/d1/items/i1"]
        );
        assert!(cache.list("missing/*").next().is_none());
    }

    #[test]
    fn test_list_treats_glob_syntax_in_keys_literally() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("items/a[1]/object", &json!(1)).expect("set should succeed");
        cache.set("items/a1/object", &json!(2)).expect("set should succeed");

        assert_eq!(sorted(cache.list("items/a[1]/*")), vec!["items/a[1]/object"]);
        assert_eq!(
            sorted(cache.list("items/**")),
            vec!["items/a1/object", "items/a[1]/object"]
        );
    }

    #[test]
    fn test_list_rejects_escaping_patterns() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("items/i1/object", &json!(1)).expect("set should succeed");

        assert!(cache.list("../*").next().is_none());
        assert!(cache.list("/etc/*").next().is_none());
        assert!(cache.list("").next().is_none());
    }

    #[test]
    fn test_list_absolute_pattern() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("items/i1/object", &json!(1)).expect("set should succeed");

        let pattern = format!("{}/items/*/object", cache.root().display());
        assert_eq!(sorted(cache.list(&pattern)), vec!["items/i1/object"]);
    }

    #[test]
    fn test_ttl_by_modification_time() {
        let (cache, _temp_dir) = create_test_cache(1);
        cache.set("items/i1/object", &json!(1)).expect("set should succeed");
        assert!(cache.get("items/i1/object").is_some());

        std::thread::sleep(Duration::from_millis(1200));

        assert_eq!(cache.keys().count(), 0);
        assert_eq!(cache.get("items/i1/object"), None);
        assert!(!cache.root().join("items/i1/object.json").exists());
    }

    #[test]
    fn test_clear() {
        let (cache, _temp_dir) = create_test_cache(1000);
        cache.set("a/b", &json!(1)).expect("set should succeed");
        cache.clear().expect("clear should succeed");
        assert_eq!(cache.keys().count(), 0);
        assert!(cache.root().is_dir());
    }
}
