//! Packager: serialise a [`BookManifest`] into the EPUB archive.
//!
//! `mimetype` is the first entry, stored uncompressed with no extra field,
//! so its contents sit at byte offset 38 where readers sniff for them.
//! Every other entry is deflated. Timestamps and permissions are fixed, so
//! the same manifest always produces the same bytes.
//!
//! The archive is built in memory and written through a temporary file in
//! the destination directory that is renamed into place only once it is
//! complete. A failed write never leaves a partial `.epub` behind.

use crate::epub::BookManifest;
use crate::error::PackagingError;
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

pub const MIMETYPE: &[u8] = b"application/epub+zip";

fn options(method: CompressionMethod) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    match method {
        CompressionMethod::Deflated => options.compression_level(Some(6)),
        _ => options,
    }
}

/// The complete archive as bytes.
pub fn package_bytes(manifest: &BookManifest) -> zip::result::ZipResult<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = options(CompressionMethod::Stored);
    let deflated = options(CompressionMethod::Deflated);

    zip.start_file("mimetype", stored)?;
    zip.write_all(MIMETYPE)?;

    for file in &manifest.files {
        zip.start_file(file.path.as_str(), deflated)?;
        zip.write_all(&file.data)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Write the archive to `path` atomically.
pub fn write(manifest: &BookManifest, path: &Path) -> Result<(), PackagingError> {
    let io_err = |source: std::io::Error| PackagingError::Io {
        path: path.to_path_buf(),
        source,
    };

    let bytes = package_bytes(manifest).map_err(|e| PackagingError::Zip {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(&bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    info!("Wrote {} ({} bytes, {} entries)", path.display(), bytes.len(), manifest.files.len() + 1);
    Ok(())
}

/// Write the unpacked package tree under `dir`, for inspection.
pub fn write_sources(manifest: &BookManifest, dir: &Path) -> Result<(), PackagingError> {
    let io_err = |path: &Path, source: std::io::Error| PackagingError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mimetype = dir.join("mimetype");
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    std::fs::write(&mimetype, MIMETYPE).map_err(|e| io_err(&mimetype, e))?;

    for file in &manifest.files {
        let target = dir.join(&file.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        std::fs::write(&target, &file.data).map_err(|e| io_err(&target, e))?;
    }
    debug!("Wrote package sources to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epub::BookBuilder;
    use crate::output::DocumentMetadata;
    use crate::pipeline::section::Document;
    use std::io::Read;

    fn manifest() -> BookManifest {
        let mut b = BookBuilder::new(DocumentMetadata::titled("Packaged"));
        b.add_document(
            Document {
                id: "sec01".into(),
                filename: "one.xhtml".into(),
                numbering: None,
                title: "One".into(),
                body: "<h1>One</h1>".into(),
                image_refs: vec![],
            },
            vec![],
        );
        b.build()
    }

    #[test]
    fn mimetype_is_first_and_stored() {
        let bytes = package_bytes(&manifest()).unwrap();
        assert_eq!(&bytes[0..4], b"PK\x03\x04");
        assert_eq!(&bytes[30..38], b"mimetype");
        assert_eq!(&bytes[38..58], MIMETYPE);

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let first = archive.by_index(0).unwrap();
        assert_eq!(first.name(), "mimetype");
        assert_eq!(first.compression(), CompressionMethod::Stored);
        drop(first);
        let opf = archive.by_name("OEBPS/content.opf").unwrap();
        assert_eq!(opf.compression(), CompressionMethod::Deflated);
    }

    #[test]
    fn packaging_is_deterministic() {
        let m = manifest();
        assert_eq!(package_bytes(&m).unwrap(), package_bytes(&m).unwrap());
    }

    #[test]
    fn write_is_atomic_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("book.epub");
        write(&manifest(), &out).unwrap();
        write(&manifest(), &out).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(out.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("book.epub")]);

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out).unwrap()).unwrap();
        let mut container = String::new();
        archive
            .by_name("META-INF/container.xml")
            .unwrap()
            .read_to_string(&mut container)
            .unwrap();
        assert!(container.contains("OEBPS/content.opf"));
    }

    #[test]
    fn write_into_missing_parent_file_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let out = blocker.join("book.epub");
        match write(&manifest(), &out) {
            Err(PackagingError::Io { path, .. }) => assert_eq!(path, out),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!out.exists());
    }

    #[test]
    fn sources_tree_mirrors_archive() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest();
        write_sources(&m, dir.path()).unwrap();
        assert_eq!(std::fs::read(dir.path().join("mimetype")).unwrap(), MIMETYPE);
        for f in &m.files {
            assert_eq!(std::fs::read(dir.path().join(&f.path)).unwrap(), f.data);
        }
    }
}
