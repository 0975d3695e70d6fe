//! JAR (v1) signing: `META-INF/MANIFEST.MF` with one digest section per
//! entry, `META-INF/CERT.SF` digesting the manifest and each section, and a
//! placeholder `CERT.RSA` block (see [`pkcs7`]).

pub mod pkcs7;

use crate::apk::compiler::{compile_manifest, encode_resource_table, StringTable};
use crate::apk::dex::encode_dex;
use crate::apk::manifest::ManifestInfo;
use crate::apk::{
    ArchiveEntry, SignedArchive, UnsignedArchive, DEX_PATH, MANIFEST_PATH, RESOURCES_PATH,
};
use crate::core::config::{ManifestDefaults, PackagerConfig};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const MANIFEST_MF: &str = "META-INF/MANIFEST.MF";
pub const CERT_SF: &str = "META-INF/CERT.SF";
pub const CERT_RSA: &str = "META-INF/CERT.RSA";

/// Manifests shorter than this are regenerated.
pub const MIN_MANIFEST_SIZE: usize = 100;
pub const MIN_SIGNATURE_FILE_SIZE: usize = 50;

/// Longest manifest line in bytes, excluding the line break.
const MAX_LINE_BYTES: usize = 72;
const LINE_BREAK: &[u8] = b"\r\n";
const SECTION_END: &[u8] = b"\r\n\r\n";

#[derive(Clone, Debug)]
pub struct SignOptions {
    pub created_by: String,
    pub built_by: String,
    /// Written as `Build-Date` and `Signature-Date`.
    pub timestamp: DateTime<Utc>,
    /// Used for a backfilled manifest and resource table.
    pub defaults: ManifestDefaults,
    pub dex_estimate: u64,
    pub max_dex_size: u64,
}

impl SignOptions {
    pub fn from_config(config: &PackagerConfig) -> Self {
        Self {
            created_by: config.signing.created_by.clone(),
            built_by: config.signing.built_by.clone(),
            timestamp: Utc::now(),
            defaults: config.defaults.clone(),
            dex_estimate: config.build.default_dex_estimate,
            max_dex_size: config.build.max_dex_size,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn date(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl Default for SignOptions {
    fn default() -> Self {
        Self::from_config(&PackagerConfig::default())
    }
}

/// Digests of one entry's uncompressed payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DigestRecord {
    pub path: String,
    pub sha1: [u8; 20],
    pub sha256: [u8; 32],
}

impl DigestRecord {
    pub fn of(entry: &ArchiveEntry) -> Self {
        let mut record = Self {
            path: entry.path.clone(),
            sha1: [0; 20],
            sha256: [0; 32],
        };
        record.sha1.copy_from_slice(&Sha1::digest(&entry.payload));
        record.sha256.copy_from_slice(&Sha256::digest(&entry.payload));
        record
    }
}

fn sha1_base64(bytes: &[u8]) -> String {
    STANDARD.encode(Sha1::digest(bytes))
}

/// Appends `name: value` and its line break, continuing lines longer than
/// [`MAX_LINE_BYTES`] on lines that start with a single space.
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{}: {}", name, value);
    let mut rest = line.as_str();
    let mut limit = MAX_LINE_BYTES;
    loop {
        let mut end = rest.len().min(limit);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(LINE_BREAK);
        if tail.is_empty() {
            break;
        }
        out.push(b' ');
        rest = tail;
        limit = MAX_LINE_BYTES - 1;
    }
}

fn section(attributes: &[(&str, &str)]) -> Vec<u8> {
    let mut out = vec![];
    for (name, value) in attributes {
        write_attribute(&mut out, name, value);
    }
    out.extend_from_slice(LINE_BREAK);
    out
}

/// `MANIFEST.MF` kept as the exact bytes of each section.
struct JarManifest {
    main: Vec<u8>,
    sections: Vec<(String, Vec<u8>)>,
}

impl JarManifest {
    fn build(digests: &[DigestRecord], options: &SignOptions) -> Self {
        let date = options.date();
        let main = section(&[
            ("Manifest-Version", "1.0"),
            ("Built-By", options.built_by.as_str()),
            ("Created-By", options.created_by.as_str()),
            ("Build-Date", date.as_str()),
        ]);
        let sections = digests
            .iter()
            .map(|record| {
                let sha1 = STANDARD.encode(record.sha1);
                let sha256 = STANDARD.encode(record.sha256);
                let bytes = section(&[
                    ("Name", record.path.as_str()),
                    ("SHA1-Digest", sha1.as_str()),
                    ("SHA-256-Digest", sha256.as_str()),
                ]);
                (record.path.clone(), bytes)
            })
            .collect();
        Self { main, sections }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.main.clone();
        for (_, bytes) in &self.sections {
            out.extend_from_slice(bytes);
        }
        out
    }

    fn signature_file(&self, manifest: &[u8], options: &SignOptions) -> Vec<u8> {
        let date = options.date();
        let manifest_digest = sha1_base64(manifest);
        let main_digest = sha1_base64(&self.main);
        let mut out = section(&[
            ("Signature-Version", "1.0"),
            ("Created-By", options.created_by.as_str()),
            ("Signature-Date", date.as_str()),
            ("SHA1-Digest-Manifest", manifest_digest.as_str()),
            ("SHA1-Digest-Manifest-Main-Attributes", main_digest.as_str()),
        ]);
        for (name, bytes) in &self.sections {
            let digest = sha1_base64(bytes);
            out.extend(section(&[("Name", name.as_str()), ("SHA1-Digest", digest.as_str())]));
        }
        out
    }
}

fn default_manifest(defaults: &ManifestDefaults) -> Result<Vec<u8>> {
    let manifest = ManifestInfo::default().to_manifest(defaults);
    compile_manifest(&manifest, &StringTable::seeded(&defaults.app_label))?.to_bytes()
}

/// Synthesizes whichever core entry is missing.
fn backfill(entries: &mut Vec<ArchiveEntry>, options: &SignOptions) -> Result<()> {
    let manifest_len = entries
        .iter()
        .find(|entry| entry.path == MANIFEST_PATH)
        .map(|entry| entry.payload.len());
    if manifest_len.map_or(true, |len| len < MIN_MANIFEST_SIZE) {
        match manifest_len {
            Some(len) => tracing::warn!("regenerating {} of {} bytes", MANIFEST_PATH, len),
            None => tracing::warn!("backfilling missing {}", MANIFEST_PATH),
        }
        entries.retain(|entry| entry.path != MANIFEST_PATH);
        entries.insert(
            0,
            ArchiveEntry::new(MANIFEST_PATH, default_manifest(&options.defaults)?),
        );
    }
    if !entries.iter().any(|entry| entry.path == DEX_PATH) {
        tracing::warn!("backfilling missing {}", DEX_PATH);
        let dex = encode_dex(options.dex_estimate, options.max_dex_size)?;
        entries.push(ArchiveEntry::new(DEX_PATH, dex));
    }
    if !entries.iter().any(|entry| entry.path == RESOURCES_PATH) {
        tracing::warn!("backfilling missing {}", RESOURCES_PATH);
        let resources = StringTable::seeded(&options.defaults.app_label);
        let arsc = encode_resource_table(&options.defaults.package, &resources)?;
        entries.push(ArchiveEntry::new(RESOURCES_PATH, arsc));
    }
    Ok(())
}

/// Signs `archive`. Prior `META-INF/` entries are dropped and missing core
/// entries are synthesized first.
pub fn sign(archive: UnsignedArchive, options: &SignOptions) -> Result<SignedArchive> {
    let UnsignedArchive { entries, failures } = archive;
    for path in [MANIFEST_PATH, DEX_PATH] {
        if !entries.iter().any(|entry| entry.path == path) {
            tracing::warn!("input archive has no {}", path);
        }
    }
    let mut entries = entries
        .into_iter()
        .filter(|entry| {
            let keep = !entry.is_signature_file();
            if !keep {
                tracing::debug!("dropping previous signature entry {}", entry.path);
            }
            keep
        })
        .collect::<Vec<_>>();
    backfill(&mut entries, options)?;

    let digests = entries.iter().map(DigestRecord::of).collect::<Vec<_>>();
    let manifest = JarManifest::build(&digests, options);
    let manifest_bytes = manifest.to_bytes();
    let signature_file = manifest.signature_file(&manifest_bytes, options);
    let signature_block = pkcs7::signature_block(&signature_file, &options.built_by);
    tracing::debug!(
        "signature files: {} / {} / {} bytes",
        manifest_bytes.len(),
        signature_file.len(),
        signature_block.len()
    );

    entries.push(ArchiveEntry::new(MANIFEST_MF, manifest_bytes));
    entries.push(ArchiveEntry::new(CERT_SF, signature_file));
    entries.push(ArchiveEntry::new(CERT_RSA, signature_block));
    Ok(SignedArchive { entries, failures })
}

/// Signs the archive at `input` and writes the result to `output`.
pub fn sign_apk(input: &Path, output: &Path, options: &SignOptions) -> Result<SignedArchive> {
    if !input.is_file() {
        return Err(Error::NotFound(input.to_path_buf()));
    }
    let signed = sign(UnsignedArchive::open(input)?, options)?;
    let bytes = signed.to_bytes()?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, &bytes)?;
    if let Err(err) = validate_signed_archive(&bytes) {
        tracing::warn!("signed archive failed validation: {}", err);
    }
    tracing::info!(
        "signed `{}` -> `{}` ({} entries)",
        input.display(),
        output.display(),
        signed.entries.len()
    );
    Ok(signed)
}

/// Checks the sizes a signed archive must at least have: a manifest of
/// [`MIN_MANIFEST_SIZE`] bytes, `classes.dex`, `resources.arsc` and the
/// three signature files of [`MIN_SIGNATURE_FILE_SIZE`] bytes each.
pub fn validate_signed_archive(bytes: &[u8]) -> Result<()> {
    let archive = UnsignedArchive::from_bytes(bytes)?;
    let len = |path: &str| archive.entry(path).map(|entry| entry.payload.len());
    let require = |path: &str, min: usize| match len(path) {
        Some(len) if len >= min => Ok(()),
        Some(len) => Err(Error::encoding(format!(
            "{} is {} bytes, expected at least {}",
            path, len, min
        ))),
        None => Err(Error::encoding(format!("{} is missing", path))),
    };
    require(MANIFEST_PATH, MIN_MANIFEST_SIZE)?;
    require(DEX_PATH, 1)?;
    require(RESOURCES_PATH, 1)?;
    for path in [MANIFEST_MF, CERT_SF, CERT_RSA] {
        require(path, MIN_SIGNATURE_FILE_SIZE)?;
    }
    Ok(())
}

/// Splits manifest bytes at blank lines. Every section keeps its
/// terminating blank line.
fn split_sections(bytes: &[u8]) -> Vec<&[u8]> {
    let mut sections = vec![];
    let mut start = 0;
    while let Some(pos) = bytes[start..]
        .windows(SECTION_END.len())
        .position(|window| window == SECTION_END)
    {
        let end = start + pos + SECTION_END.len();
        sections.push(&bytes[start..end]);
        start = end;
    }
    if start < bytes.len() {
        sections.push(&bytes[start..]);
    }
    sections
}

/// Attributes of one section with continuation lines joined.
fn attributes(section: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(section);
    let mut lines: Vec<String> = vec![];
    for line in text.split("\r\n") {
        if let (Some(continued), Some(last)) = (line.strip_prefix(' '), lines.last_mut()) {
            last.push_str(continued);
        } else if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
        .into_iter()
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn mismatch(what: impl std::fmt::Display) -> Error {
    Error::encoding(format!("digest mismatch: {}", what))
}

/// Checks the digest chain of a signed archive: entry payloads against
/// `MANIFEST.MF`, the manifest and each of its sections against `CERT.SF`.
/// Returns the number of verified entries.
pub fn verify_signed_archive(bytes: &[u8]) -> Result<usize> {
    let archive = UnsignedArchive::from_bytes(bytes)?;
    let required = |path: &str| {
        archive
            .entry(path)
            .map(|entry| entry.payload.as_slice())
            .ok_or_else(|| Error::encoding(format!("{} is missing", path)))
    };
    let manifest = required(MANIFEST_MF)?;
    let signature_file = required(CERT_SF)?;
    required(CERT_RSA)?;

    let manifest_sections = split_sections(manifest);
    let Some((main, sections)) = manifest_sections.split_first() else {
        return Err(Error::encoding(format!("{} is empty", MANIFEST_MF)));
    };
    let sf_sections = split_sections(signature_file);
    let Some((sf_main, sf_sections)) = sf_sections.split_first() else {
        return Err(Error::encoding(format!("{} is empty", CERT_SF)));
    };

    let sf_header = attributes(sf_main);
    if sf_header.get("SHA1-Digest-Manifest") != Some(&sha1_base64(manifest)) {
        return Err(mismatch(MANIFEST_MF));
    }
    if sf_header.get("SHA1-Digest-Manifest-Main-Attributes") != Some(&sha1_base64(main)) {
        return Err(mismatch("manifest main attributes"));
    }

    let sf_digests = sf_sections
        .iter()
        .map(|section| attributes(section))
        .filter_map(|mut attrs| Some((attrs.remove("Name")?, attrs.remove("SHA1-Digest")?)))
        .collect::<HashMap<_, _>>();
    if sf_digests.len() != sections.len() {
        return Err(mismatch(format!(
            "{} manifest sections, {} signed",
            sections.len(),
            sf_digests.len()
        )));
    }

    let mut entry_digests = HashMap::new();
    for section in sections {
        let attrs = attributes(section);
        let name = attrs
            .get("Name")
            .ok_or_else(|| Error::encoding("manifest section without a name"))?;
        if sf_digests.get(name) != Some(&sha1_base64(section)) {
            return Err(mismatch(format!("section {}", name)));
        }
        entry_digests.insert(name.clone(), attrs);
    }

    let mut verified = 0;
    for entry in archive.entries.iter().filter(|entry| !entry.is_signature_file()) {
        let attrs = entry_digests
            .get(&entry.path)
            .ok_or_else(|| mismatch(format!("{} is not in the manifest", entry.path)))?;
        let record = DigestRecord::of(entry);
        if attrs.get("SHA1-Digest") != Some(&STANDARD.encode(record.sha1))
            || attrs.get("SHA-256-Digest") != Some(&STANDARD.encode(record.sha256))
        {
            return Err(mismatch(&entry.path));
        }
        verified += 1;
    }
    if verified != entry_digests.len() {
        return Err(mismatch("manifest names entries the archive lacks"));
    }
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn options() -> SignOptions {
        SignOptions::default().with_timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
    }

    fn unsigned(entries: Vec<ArchiveEntry>) -> UnsignedArchive {
        UnsignedArchive {
            entries,
            failures: vec![],
        }
    }

    fn paths(archive: &SignedArchive) -> Vec<&str> {
        archive.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn wraps_long_lines() {
        let mut out = vec![];
        let value = "x".repeat(150);
        write_attribute(&mut out, "Name", &value);
        let text = String::from_utf8(out).unwrap();
        let lines = text.split_terminator("\r\n").collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), 72);
        assert!(lines[1].starts_with(' ') && lines[1].len() == 72);
        assert_eq!(lines[2], format!(" {}", "x".repeat(150 + 6 - 72 - 71)));
        let attrs = attributes(text.as_bytes());
        assert_eq!(attrs["Name"], value);
    }

    #[test]
    fn backfills_missing_core_entries() {
        let signed = sign(unsigned(vec![]), &options()).unwrap();
        assert_eq!(
            paths(&signed),
            vec![MANIFEST_PATH, DEX_PATH, RESOURCES_PATH, MANIFEST_MF, CERT_SF, CERT_RSA]
        );
        assert!(signed.entries[0].payload.len() >= MIN_MANIFEST_SIZE);
        for entry in &signed.entries[3..] {
            assert!(entry.payload.len() >= MIN_SIGNATURE_FILE_SIZE);
        }
        let info = ManifestInfo::from_binary(&signed.entries[0].payload).unwrap();
        assert_eq!(info.package.as_deref(), Some("com.example.modifiedapp"));
        let bytes = signed.to_bytes().unwrap();
        validate_signed_archive(&bytes).unwrap();
        assert_eq!(verify_signed_archive(&bytes).unwrap(), 3);
    }

    #[test]
    fn regenerates_tiny_manifest_and_drops_old_signature() {
        let archive = unsigned(vec![
            ArchiveEntry::new(MANIFEST_PATH, b"<manifest/>".to_vec()),
            ArchiveEntry::new("assets/a.bin", vec![1; 10]),
            ArchiveEntry::new("META-INF/OLD.SF", b"stale".to_vec()),
        ]);
        let signed = sign(archive, &options()).unwrap();
        assert_eq!(
            paths(&signed),
            vec![
                MANIFEST_PATH,
                "assets/a.bin",
                DEX_PATH,
                RESOURCES_PATH,
                MANIFEST_MF,
                CERT_SF,
                CERT_RSA
            ]
        );
        assert!(signed.entries[0].payload.len() >= MIN_MANIFEST_SIZE);
    }

    #[test]
    fn signature_file_digests_manifest_sections() {
        let signed = sign(
            unsigned(vec![ArchiveEntry::new("assets/a.txt", b"hello".to_vec())]),
            &options(),
        )
        .unwrap();
        let manifest = &signed.entry(MANIFEST_MF).unwrap().payload;
        let sf = &signed.entry(CERT_SF).unwrap().payload;
        let text = String::from_utf8(manifest.clone()).unwrap();
        assert!(text.starts_with("Manifest-Version: 1.0\r\nBuilt-By: apkpack\r\n"));
        assert!(text.contains("Build-Date: 2024-01-02T03:04:05Z\r\n"));

        let sections = split_sections(manifest);
        assert_eq!(sections.concat(), *manifest);
        let hello = sections
            .iter()
            .find(|s| s.starts_with(b"Name: assets/a.txt\r\n"))
            .unwrap();
        assert!(hello.ends_with(b"\r\n\r\n"));
        assert_eq!(
            attributes(hello)["SHA1-Digest"],
            STANDARD.encode(Sha1::digest(b"hello"))
        );
        let sf_text = String::from_utf8(sf.clone()).unwrap();
        assert!(sf_text.starts_with("Signature-Version: 1.0\r\n"));
        assert!(sf_text.contains(&format!(
            "Name: assets/a.txt\r\nSHA1-Digest: {}\r\n\r\n",
            sha1_base64(hello)
        )));
        assert!(sf_text.contains(&format!("SHA1-Digest-Manifest: {}\r\n", sha1_base64(manifest))));
    }

    #[test]
    fn signing_is_deterministic_for_a_fixed_timestamp() {
        let entries = vec![ArchiveEntry::new("assets/a.txt", b"hello".to_vec())];
        let first = sign(unsigned(entries.clone()), &options()).unwrap();
        let second = sign(unsigned(entries), &options()).unwrap();
        assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
    }

    #[test]
    fn verify_detects_tampering() {
        let signed = sign(
            unsigned(vec![ArchiveEntry::new("assets/a.txt", b"hello".to_vec())]),
            &options(),
        )
        .unwrap();
        let mut tampered = signed.clone();
        let index = tampered
            .entries
            .iter()
            .position(|e| e.path == "assets/a.txt")
            .unwrap();
        tampered.entries[index].payload = b"jello".to_vec();
        assert!(matches!(
            verify_signed_archive(&tampered.to_bytes().unwrap()),
            Err(Error::Encoding(_))
        ));

        let mut extra = signed;
        extra
            .entries
            .insert(1, ArchiveEntry::new("assets/b.txt", b"new".to_vec()));
        assert!(verify_signed_archive(&extra.to_bytes().unwrap()).is_err());
    }

    #[test]
    fn validate_rejects_unsigned_archives() {
        let bytes = unsigned(vec![ArchiveEntry::new(DEX_PATH, vec![0; 200])])
            .to_bytes()
            .unwrap();
        assert!(validate_signed_archive(&bytes).is_err());
    }
}
