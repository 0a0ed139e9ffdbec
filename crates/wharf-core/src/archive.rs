//! Archive entry indexing and repackaging (spec.md §4.1, §4.3).
//!
//! An archive is a ZIP-format bundle of application files. Indexing walks
//! every non-directory entry in archive order, hashes its payload with
//! SHA-256, and records `path -> lower-hex digest`. Repackaging does the
//! reverse: it walks a scratch directory and writes a fresh ZIP at the
//! installed-archive path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use wharf_types::{ArchiveEntry, EntryIndex};
use zip::write::{FileOptions, SimpleFileOptions};
use zip::{ZipArchive, ZipWriter};

/// Build the entry index of an archive at `path`. Pure and deterministic:
/// two calls on byte-identical archives yield equal indexes. On a path
/// collision within the archive, the later entry wins (archive semantics).
pub fn index_archive(path: &Path) -> Result<EntryIndex> {
    let file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", path.display()))?;

    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("failed to read archive entry {} of {}", i, path.display()))?;

        if entry.is_dir() {
            continue;
        }

        let entry_path = entry.name().replace('\\', "/");
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read archive entry {}", entry_path))?;

        let digest = hex::encode(Sha256::digest(&buf));
        entries.push(ArchiveEntry { path: entry_path, digest });
    }

    Ok(EntryIndex::from_entries(entries))
}

/// Build the entry index of an archive supplied as an in-memory byte slice
/// (e.g. a request body received by the agent).
pub fn index_archive_bytes(bytes: &[u8]) -> Result<EntryIndex> {
    let reader = std::io::Cursor::new(bytes);
    let mut zip = ZipArchive::new(reader).context("failed to read archive bytes")?;

    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("failed to read archive entry {} of in-memory archive", i))?;
        if entry.is_dir() {
            continue;
        }
        let entry_path = entry.name().replace('\\', "/");
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read archive entry {}", entry_path))?;
        let digest = hex::encode(Sha256::digest(&buf));
        entries.push(ArchiveEntry { path: entry_path, digest });
    }

    Ok(EntryIndex::from_entries(entries))
}

/// Sum the uncompressed sizes of the named entries in the archive at
/// `path`. Used by the preflight pipeline to estimate `bytesToUpload`
/// (spec.md §4.6 step 3) without reading payloads twice.
pub fn sum_entry_sizes(path: &Path, paths: &std::collections::HashSet<String>) -> Result<u64> {
    let file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", path.display()))?;

    let mut total = 0u64;
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .with_context(|| format!("failed to read archive entry {} of {}", i, path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let entry_path = entry.name().replace('\\', "/");
        if paths.contains(&entry_path) {
            total += entry.size();
        }
    }
    Ok(total)
}

/// Read the raw bytes of the named entries out of the archive at `path`,
/// base64-unaware — callers encode as needed. Used by the single-host
/// deployer to build the inline/chunked upload payloads.
pub fn read_entries(path: &Path, paths: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
    let file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", path.display()))?;

    let wanted: std::collections::HashSet<&str> = paths.iter().map(String::as_str).collect();
    let mut out = Vec::with_capacity(paths.len());
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("failed to read archive entry {} of {}", i, path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let entry_path = entry.name().replace('\\', "/");
        if wanted.contains(entry_path.as_str()) {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut buf)
                .with_context(|| format!("failed to read archive entry {}", entry_path))?;
            out.push((entry_path, buf));
        }
    }
    Ok(out)
}

/// Extract every entry of an archive into `dest_dir`, preserving relative
/// paths. Used by the reconciler to materialize the installed archive into
/// a scratch directory before applying a diff.
pub fn extract_archive(path: &Path, dest_dir: &Path) -> Result<()> {
    let file =
        File::open(path).with_context(|| format!("failed to open archive {}", path.display()))?;
    let mut zip = ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", path.display()))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .with_context(|| format!("failed to read archive entry {} of {}", i, path.display()))?;
        let entry_path = entry.name().replace('\\', "/");
        let out_path = dest_dir.join(&entry_path);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create dir {}", out_path.display()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }

        let mut out_file = File::create(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out_file)
            .with_context(|| format!("failed to extract {}", out_path.display()))?;
    }

    Ok(())
}

/// Recursively repackage `src_dir` into a new ZIP archive at `out_path`.
/// Entries are added in directory-walk order; directory entries themselves
/// are not written (mirrors the no-directory-entries archive model in
/// spec.md §3).
pub fn repackage_dir(src_dir: &Path, out_path: &Path) -> Result<()> {
    let tmp_path = out_path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)
            .with_context(|| format!("failed to create archive {}", tmp_path.display()))?;
        let mut writer = ZipWriter::new(file);
        let options: SimpleFileOptions =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let mut entries = Vec::new();
        collect_files(src_dir, src_dir, &mut entries)?;
        entries.sort();

        for rel_path in entries {
            let abs_path = src_dir.join(&rel_path);
            let name = rel_path.to_string_lossy().replace('\\', "/");
            writer
                .start_file(&name, options)
                .with_context(|| format!("failed to start archive entry {}", name))?;
            let mut contents = Vec::new();
            File::open(&abs_path)
                .with_context(|| format!("failed to open {}", abs_path.display()))?
                .read_to_end(&mut contents)
                .with_context(|| format!("failed to read {}", abs_path.display()))?;
            writer
                .write_all(&contents)
                .with_context(|| format!("failed to write archive entry {}", name))?;
        }

        writer.finish().context("failed to finalize archive")?;
    }

    fs::rename(&tmp_path, out_path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            out_path.display()
        )
    })?;

    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<std::path::PathBuf>,
) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read dir {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("walked path is under root")
                .to_path_buf();
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zip::write::FileOptions as WFileOptions;

    fn write_test_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).expect("create archive");
        let mut writer = ZipWriter::new(file);
        let options: SimpleFileOptions = WFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(content).expect("write file");
        }
        writer.finish().expect("finish archive");
    }

    #[test]
    fn index_archive_is_deterministic() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("app.war");
        write_test_archive(&path, &[("WEB-INF/web.xml", b"<web/>"), ("index.html", b"hi")]);

        let idx1 = index_archive(&path).expect("index 1");
        let idx2 = index_archive(&path).expect("index 2");
        assert_eq!(idx1, idx2);
        assert_eq!(idx1.len(), 2);
    }

    #[test]
    fn index_archive_last_writer_wins_on_collision() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("app.war");
        write_test_archive(&path, &[("a.txt", b"first"), ("a.txt", b"second")]);

        let idx = index_archive(&path).expect("index");
        let expected = hex::encode(Sha256::digest(b"second"));
        assert_eq!(idx.get("a.txt"), Some(expected.as_str()));
    }

    #[test]
    fn extract_then_repackage_round_trips_entries() {
        let td = tempdir().expect("tempdir");
        let archive_path = td.path().join("app.war");
        write_test_archive(
            &archive_path,
            &[("index.html", b"hello"), ("WEB-INF/web.xml", b"<web/>")],
        );

        let scratch = td.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        extract_archive(&archive_path, &scratch).expect("extract");

        let out_path = td.path().join("app2.war");
        repackage_dir(&scratch, &out_path).expect("repackage");

        let original_index = index_archive(&archive_path).expect("index original");
        let repackaged_index = index_archive(&out_path).expect("index repackaged");
        assert_eq!(original_index, repackaged_index);
    }

    #[test]
    fn sum_entry_sizes_counts_only_requested_paths() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("app.war");
        write_test_archive(&path, &[("a.txt", b"hello"), ("b.txt", b"longer-content")]);

        let wanted: std::collections::HashSet<String> = ["a.txt".to_string()].into_iter().collect();
        let total = sum_entry_sizes(&path, &wanted).expect("sum");
        assert_eq!(total, 5);
    }

    #[test]
    fn read_entries_returns_requested_payloads_only() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("app.war");
        write_test_archive(&path, &[("a.txt", b"one"), ("b.txt", b"two")]);

        let entries = read_entries(&path, &["b.txt".to_string()]).expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], ("b.txt".to_string(), b"two".to_vec()));
    }

    #[test]
    fn index_archive_bytes_matches_index_archive() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("app.war");
        write_test_archive(&path, &[("index.html", b"hi")]);

        let bytes = fs::read(&path).expect("read bytes");
        let from_bytes = index_archive_bytes(&bytes).expect("index bytes");
        let from_file = index_archive(&path).expect("index file");
        assert_eq!(from_bytes, from_file);
    }
}
