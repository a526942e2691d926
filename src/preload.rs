//! Preload: seed a cache from a directory of serialized snapshots.
//!
//! Every `<stem>.data` file holds one serialized value; the stem
//! becomes the key. Entries go in through the public store API with no
//! TTL and exclusive semantics, so a restarted host never clobbers
//! fresher data already in the segment.

use std::fs;
use std::path::Path;

use log::{debug, error};

use crate::cache::Cache;

/// Scan `path` in name order and store every `.data` file found.
/// Returns true when at least one entry was stored. Refused in
/// multi-threaded hosting mode.
pub fn preload(cache: &Cache, path: &Path) -> bool {
    if cache.inner_threading() {
        error!(
            "cannot load data from preload path {} in thread-safe mode",
            path.display()
        );
        return false;
    }

    let Ok(dir) = fs::read_dir(path) else {
        return false;
    };

    let mut files: Vec<_> = dir
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "data"))
        .collect();
    files.sort();

    let mut loaded = false;
    for file in files {
        let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.is_empty() {
            continue;
        }
        let Ok(contents) = fs::read(&file) else {
            continue;
        };
        let Some(value) = cache.effective_serializer().unserialize(&contents) else {
            debug!("skipping {}: not a serialized value", file.display());
            continue;
        };
        if cache.store(stem.as_bytes(), &value, 0, true) {
            loaded = true;
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::serializer::default_serializer;
    use crate::value::Value;

    fn write_data(dir: &Path, stem: &str, value: &Value) {
        let bytes = default_serializer().serialize(value).unwrap();
        fs::write(dir.join(format!("{stem}.data")), bytes).unwrap();
    }

    #[test]
    fn loads_data_files_and_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path(), "greeting", &Value::str("hello"));
        write_data(dir.path(), "count", &Value::Int(3));
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::write(dir.path().join("broken.data"), b"\xFF\xFF").unwrap();

        let cache = Cache::create(&CacheConfig {
            shm_size: 1 << 20,
            ..CacheConfig::default()
        })
        .unwrap();

        assert!(preload(&cache, dir.path()));
        let now = crate::cache::now_secs();
        let found = cache.find(b"greeting", now).unwrap();
        assert_eq!(found.value(), Value::str("hello"));
        drop(found);
        assert!(cache.exists(b"count", now));
        assert!(!cache.exists(b"notes", now));
        assert!(!cache.exists(b"broken", now));
        cache.destroy();
    }

    #[test]
    fn preload_is_exclusive_against_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path(), "key", &Value::str("from disk"));

        let cache = Cache::create(&CacheConfig {
            shm_size: 1 << 20,
            ..CacheConfig::default()
        })
        .unwrap();
        assert!(cache.store(b"key", &Value::str("already here"), 0, false));

        assert!(!preload(&cache, dir.path()));
        let found = cache.find(b"key", crate::cache::now_secs()).unwrap();
        assert_eq!(found.value(), Value::str("already here"));
        drop(found);
        cache.destroy();
    }

    #[test]
    fn refused_in_threading_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path(), "key", &Value::Int(1));

        let cache = Cache::create(&CacheConfig {
            shm_size: 1 << 20,
            threading: true,
            ..CacheConfig::default()
        })
        .unwrap();
        assert!(!preload(&cache, dir.path()));
        cache.destroy();
    }

    #[test]
    fn missing_directory_reports_failure() {
        let cache = Cache::create(&CacheConfig {
            shm_size: 1 << 20,
            ..CacheConfig::default()
        })
        .unwrap();
        assert!(!preload(&cache, Path::new("/no/such/directory")));
        cache.destroy();
    }
}
