//! Builds an unsigned archive from a decompiled source tree.

use crate::apk::compiler::{
    compile_manifest, compile_xml, encode_resource_table, is_binary_xml, StringTable,
};
use crate::apk::dex::encode_dex;
use crate::apk::manifest::ManifestInfo;
use crate::apk::tool::ApktoolYml;
use crate::apk::{ArchiveEntry, UnsignedArchive, DEX_PATH, MANIFEST_PATH, RESOURCES_PATH};
use crate::core::config::{BuildConfig, ManifestDefaults, PackagerConfig};
use crate::error::{Error, PartialFailure, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub const STRINGS_PATH: &str = "res/values/strings.xml";
pub const PADDING_PATH: &str = "assets/.padding";
/// Upper bound on the filler, whatever `original_size` claims.
pub const MAX_PADDING: u64 = 16 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// Top-level directories that never belong in the archive.
const SKIPPED_DIRS: &[&str] = &["META-INF", "original", "build"];

/// Top-level files the assembler synthesizes or that only describe the tree.
const SKIPPED_FILES: &[&str] = &[MANIFEST_PATH, DEX_PATH, RESOURCES_PATH, "apktool.yml"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileClass {
    ResourceXml,
    Image,
    Asset,
    NativeLib,
    Other,
}

impl FileClass {
    pub fn of(path: &str) -> Self {
        let extension = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if path.starts_with("res/") && extension == "xml" {
            Self::ResourceXml
        } else if path.starts_with("res/") && IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            Self::Image
        } else if path.starts_with("assets/") {
            Self::Asset
        } else if path.starts_with("lib/") {
            Self::NativeLib
        } else {
            Self::Other
        }
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() != 1 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        SKIPPED_DIRS.contains(&name.as_ref()) || name.starts_with("smali")
    } else {
        SKIPPED_FILES.contains(&name.as_ref())
    }
}

/// `/`-separated path of `path` below `root`.
fn archive_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .iter()
        .map(|seg| seg.to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}

struct SourceFile {
    path: String,
    source: PathBuf,
    len: u64,
}

pub struct Assembler {
    defaults: ManifestDefaults,
    build: BuildConfig,
}

impl Assembler {
    pub fn new(config: &PackagerConfig) -> Self {
        Self {
            defaults: config.defaults.clone(),
            build: config.build.clone(),
        }
    }

    /// Assembles `source_dir`. The manifest is read from `manifest_path`
    /// when given, otherwise from `AndroidManifest.xml` in `source_dir` if
    /// there is one. Without a manifest, none is packaged.
    pub fn assemble(&self, source_dir: &Path, manifest_path: Option<&Path>) -> Result<UnsignedArchive> {
        if !source_dir.is_dir() {
            return Err(Error::NotFound(source_dir.to_path_buf()));
        }
        let manifest_path = match manifest_path {
            Some(path) if path.is_file() => Some(path.to_path_buf()),
            Some(path) => return Err(Error::NotFound(path.to_path_buf())),
            None => Some(source_dir.join(MANIFEST_PATH)).filter(|path| path.is_file()),
        };

        let mut failures = vec![];
        let files = self.walk(source_dir, &mut failures);
        let mut total_bytes = files.iter().map(|file| file.len).sum::<u64>();

        let manifest = match &manifest_path {
            Some(path) => {
                let bytes = fs::read(path)?;
                total_bytes += bytes.len() as u64;
                Some(ManifestInfo::extract(&bytes).to_manifest(&self.defaults))
            }
            None => None,
        };

        let label = manifest
            .as_ref()
            .and_then(|manifest| manifest.application.label.as_deref())
            .filter(|label| !label.starts_with('@'))
            .unwrap_or(&self.defaults.app_label);
        let mut resources = StringTable::seeded(label);
        self.merge_strings(source_dir, &mut resources);

        let mut entries = Vec::with_capacity(files.len() + 3);
        if let Some(manifest) = &manifest {
            let bytes = compile_manifest(manifest, &resources)?.to_bytes()?;
            tracing::debug!("encoded {} ({} bytes)", MANIFEST_PATH, bytes.len());
            entries.push(ArchiveEntry::new(MANIFEST_PATH, bytes));
        }

        for file in &files {
            let class = FileClass::of(&file.path);
            tracing::debug!("{} -> {:?}", file.path, class);
            let payload = match fs::read(&file.source) {
                Ok(payload) => payload,
                Err(err) => {
                    failures.push(PartialFailure::new(&file.path, err));
                    continue;
                }
            };
            let payload = match class {
                FileClass::ResourceXml => match compile_resource_xml(&payload, &resources) {
                    Ok(payload) => payload,
                    Err(err) => {
                        failures.push(PartialFailure::new(&file.path, err));
                        continue;
                    }
                },
                _ => payload,
            };
            entries.push(ArchiveEntry::new(file.path.as_str(), payload));
        }

        let estimate = match ApktoolYml::read(source_dir).and_then(|yml| yml.original_size) {
            Some(original_size) => original_size,
            None => (total_bytes as f64 * self.build.dex_size_ratio) as u64,
        };
        let package = manifest
            .as_ref()
            .map(|manifest| manifest.package.as_str())
            .unwrap_or(&self.defaults.package);
        let dex = ArchiveEntry::new(DEX_PATH, encode_dex(estimate, self.build.max_dex_size)?);
        let arsc = ArchiveEntry::new(RESOURCES_PATH, encode_resource_table(package, &resources)?);

        let mut archive = UnsignedArchive { entries, failures };
        if self.build.pad_small_archives {
            self.pad(&mut archive, &dex, &arsc, estimate)?;
        }
        archive.entries.push(dex);
        archive.entries.push(arsc);
        tracing::info!(
            "assembled {} entries from `{}` ({} skipped)",
            archive.entries.len(),
            source_dir.display(),
            archive.failures.len()
        );
        Ok(archive)
    }

    fn walk(&self, source_dir: &Path, failures: &mut Vec<PartialFailure>) -> Vec<SourceFile> {
        let mut files = vec![];
        let walker = WalkDir::new(source_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_skipped(entry));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(|path| archive_path(source_dir, path))
                        .unwrap_or_default();
                    failures.push(PartialFailure::new(path, err));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = archive_path(source_dir, entry.path()) else {
                failures.push(PartialFailure::new(
                    entry.path().to_string_lossy(),
                    "path is not valid UTF-8",
                ));
                continue;
            };
            let len = entry.metadata().map(|meta| meta.len()).unwrap_or_default();
            files.push(SourceFile {
                path,
                source: entry.into_path(),
                len,
            });
        }
        files
    }

    fn merge_strings(&self, source_dir: &Path, resources: &mut StringTable) {
        let path = source_dir.join(STRINGS_PATH);
        let Ok(bytes) = fs::read(&path) else {
            return;
        };
        if is_binary_xml(&bytes) {
            tracing::debug!("{} is already compiled, keeping seeded strings", STRINGS_PATH);
            return;
        }
        let merged = std::str::from_utf8(&bytes)
            .map_err(|err| Error::encoding(err.to_string()))
            .and_then(|xml| resources.extend_from_values_xml(xml));
        match merged {
            Ok(count) => tracing::debug!("merged {} strings from {}", count, STRINGS_PATH),
            // The file itself is reported when the walk reaches it.
            Err(err) => tracing::debug!("no strings from {}: {}", STRINGS_PATH, err),
        }
    }

    /// Adds a stored filler entry when the archive is implausibly small.
    fn pad(
        &self,
        archive: &mut UnsignedArchive,
        dex: &ArchiveEntry,
        arsc: &ArchiveEntry,
        estimate: u64,
    ) -> Result<()> {
        let mut entries = archive.entries.clone();
        entries.push(dex.clone());
        entries.push(arsc.clone());
        let size = crate::apk::zip::write_entries(&entries)?.len() as u64;
        if size >= self.build.min_archive_size {
            return Ok(());
        }
        let target = (estimate / 3).max(self.build.padding_target);
        let filler = target.saturating_sub(size).min(MAX_PADDING);
        tracing::debug!("padding archive of {} bytes with {} bytes", size, filler);
        archive.entries.push(ArchiveEntry::new(
            PADDING_PATH,
            vec![0; filler as usize],
        ));
        Ok(())
    }
}

/// Compiles a text resource XML, or passes an already binary one through.
fn compile_resource_xml(payload: &[u8], resources: &StringTable) -> Result<Vec<u8>> {
    if is_binary_xml(payload) {
        return Ok(payload.to_vec());
    }
    let xml = std::str::from_utf8(payload).map_err(|err| Error::encoding(err.to_string()))?;
    compile_xml(xml, resources)?.to_bytes()
}

/// [`Assembler::assemble`] with the default configuration.
pub fn assemble(source_dir: &Path, manifest_path: Option<&Path>) -> Result<UnsignedArchive> {
    Assembler::new(&PackagerConfig::default()).assemble(source_dir, manifest_path)
}
