//! File helpers shared by the store and the per-contributor ledgers

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Suffix of in-flight temp files; never staged, never scanned
pub const TMP_SUFFIX: &str = ".tmp";

/// Write to a temp file in the target's directory, then rename over the target.
///
/// Readers and git snapshots observe either the old or the new content, never
/// a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}{}", name, Uuid::new_v4().simple(), TMP_SUFFIX));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Read a file, mapping "not found" to `None`
pub fn read_optional(path: &Path) -> std::io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read and parse a JSON file; unparsable content is reported as `Corrupt`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let Some(content) = read_optional(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Recursively collect files under `root` whose name satisfies `wanted`, sorted.
///
/// A missing root yields an empty list.
pub fn find_files(root: &Path, wanted: &dyn Fn(&str) -> bool) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.ends_with(TMP_SUFFIX) && wanted(&name) {
                    found.push(path);
                }
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Render a relative path with forward slashes, as stored in index files
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("deep/nested/file.json");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "two");

        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_find_files_skips_temp_and_sorts() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/c")).unwrap();
        fs::write(dir.path().join("b/c/node.json"), "{}").unwrap();
        fs::write(dir.path().join("node.json"), "{}").unwrap();
        fs::write(dir.path().join("b/.node.json.abc.tmp"), "{}").unwrap();
        fs::write(dir.path().join("b/other.txt"), "").unwrap();

        let found = find_files(dir.path(), &|name| name == "node.json").unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.windows(2).all(|w| w[0] <= w[1]));
        assert!(find_files(&dir.path().join("missing"), &|_| true).unwrap().is_empty());
    }

    #[test]
    fn test_read_json_reports_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            read_json::<serde_json::Value>(&path),
            Err(StoreError::Corrupt { .. })
        ));
        assert!(read_json::<serde_json::Value>(&dir.path().join("none.json")).unwrap().is_none());
    }
}
