use crate::apk::ArchiveEntry;
use crate::error::{PartialFailure, Result};
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Stored entries are aligned so they can be mapped in place.
pub const STORED_ALIGNMENT: u16 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZipFileOptions {
    Aligned(u16),
    Compressed,
}

impl ZipFileOptions {
    pub fn for_entry(entry: &ArchiveEntry) -> Self {
        if entry.compress {
            Self::Compressed
        } else {
            Self::Aligned(STORED_ALIGNMENT)
        }
    }

    pub fn alignment(self) -> u16 {
        match self {
            Self::Aligned(align) => align,
            Self::Compressed => 1,
        }
    }

    pub fn compression_method(&self) -> CompressionMethod {
        match self {
            Self::Compressed => CompressionMethod::Deflated,
            Self::Aligned(_) => CompressionMethod::Stored,
        }
    }
}

pub struct Zip<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl Zip<Cursor<Vec<u8>>> {
    pub fn in_memory() -> Self {
        Self::from_writer(Cursor::new(Vec::new()))
    }
}

impl<W: Write + Seek> Zip<W> {
    pub fn from_writer(w: W) -> Self {
        Self {
            zip: ZipWriter::new(w),
        }
    }

    pub fn create_file(&mut self, dest: &str, opts: ZipFileOptions, contents: &[u8]) -> Result<()> {
        self.start_file(dest, opts)?;
        self.zip.write_all(contents)?;
        Ok(())
    }

    pub fn add_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        self.create_file(
            &entry.path,
            ZipFileOptions::for_entry(entry),
            &entry.payload,
        )
    }

    fn start_file(&mut self, dest: &str, opts: ZipFileOptions) -> Result<()> {
        // No zip64: entries and archives stay below 4 GiB.
        let zopts = FileOptions::default()
            .compression_method(opts.compression_method())
            .large_file(false);
        self.zip.start_file_aligned(dest, zopts, opts.alignment())?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}

/// Writes `entries` in order into a fresh archive.
pub fn write_entries(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut zip = Zip::in_memory();
    for entry in entries {
        zip.add_entry(entry)?;
    }
    Ok(zip.finish()?.into_inner())
}

/// Reads every file entry of an archive in central directory order. Entries
/// that cannot be inflated are reported instead of failing the whole read.
pub fn read_entries<R: Read + Seek>(r: R) -> Result<(Vec<ArchiveEntry>, Vec<PartialFailure>)> {
    let mut archive = ZipArchive::new(r)?;
    let mut entries = Vec::with_capacity(archive.len());
    let mut failures = vec![];
    for i in 0..archive.len() {
        let mut file = match archive.by_index(i) {
            Ok(file) => file,
            Err(err) => {
                failures.push(PartialFailure::new(format!("#{}", i), err));
                continue;
            }
        };
        if file.is_dir() {
            continue;
        }
        let path = file.name().to_string();
        let compress = file.compression() != CompressionMethod::Stored;
        let mut payload = Vec::with_capacity(file.size() as usize);
        match file.read_to_end(&mut payload) {
            Ok(_) => entries.push(ArchiveEntry {
                path,
                payload,
                compress,
            }),
            Err(err) => failures.push(PartialFailure::new(path, err)),
        }
    }
    Ok((entries, failures))
}

pub fn read_archive(path: &Path) -> Result<(Vec<ArchiveEntry>, Vec<PartialFailure>)> {
    read_entries(File::open(path)?)
}
