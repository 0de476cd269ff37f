use std::{
    fs,
    io::{self, Write},
    path::Path,
};
use tempfile::NamedTempFile;

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn stage(path: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    ensure_parent_dir(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    Ok(tmp)
}

/// Writes `bytes` to a temp file beside `path` and renames it into place, so
/// readers see either the old file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    stage(path, bytes)?.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes files that are only meaningful together. Every temp file is
/// complete before the first rename; if a later rename fails, the targets
/// already replaced are removed so no mismatched pair is left behind.
pub fn write_all_atomic(entries: &[(&Path, &[u8])]) -> io::Result<()> {
    let mut staged = Vec::with_capacity(entries.len());
    for &(path, bytes) in entries {
        staged.push((path, stage(path, bytes)?));
    }
    let mut replaced: Vec<&Path> = Vec::with_capacity(staged.len());
    for (path, tmp) in staged {
        if let Err(e) = tmp.persist(path) {
            for done in replaced {
                let _ = fs::remove_file(done);
            }
            return Err(e.error);
        }
        replaced.push(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_parents_and_replaces() {
        let td = tempdir().expect("tempdir");
        let target = td.path().join("nested/dir/out.txt");
        write_atomic(&target, b"first").expect("first write");
        write_atomic(&target, b"second").expect("second write");
        assert_eq!(fs::read_to_string(&target).expect("read back"), "second");
        let leftovers = fs::read_dir(target.parent().expect("parent"))
            .expect("list dir")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn write_all_atomic_touches_nothing_when_staging_fails() {
        let td = tempdir().expect("tempdir");
        let first = td.path().join("a.csv");
        fs::write(&first, "old").expect("seed");
        let blocker = td.path().join("plain-file");
        fs::write(&blocker, "x").expect("seed blocker");
        let second = blocker.join("b.csv");

        write_all_atomic(&[(first.as_path(), &b"new"[..]), (second.as_path(), &b"new"[..])])
            .expect_err("parent is a file");
        assert_eq!(fs::read_to_string(&first).expect("read first"), "old");
        assert_eq!(fs::read_dir(td.path()).expect("list dir").count(), 2);
    }

    #[test]
    fn write_all_atomic_rolls_back_on_failed_rename() {
        let td = tempdir().expect("tempdir");
        let first = td.path().join("a.csv");
        let second = td.path().join("b.csv");
        fs::create_dir(&second).expect("directory in the way");
        fs::write(second.join("keep"), "x").expect("fill directory");

        write_all_atomic(&[(first.as_path(), &b"one"[..]), (second.as_path(), &b"two"[..])])
            .expect_err("cannot replace a directory");
        assert!(!first.exists());
        let names: Vec<String> = fs::read_dir(td.path())
            .expect("list dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b.csv"]);
    }
}
