pub mod assemble;
pub mod compiler;
pub mod dex;
pub mod manifest;
pub mod res;
pub mod sign;
pub mod tool;
pub mod zip;

use crate::error::{PartialFailure, Result};
use std::io::Cursor;
use std::path::Path;

pub use assemble::{assemble, Assembler};
pub use compiler::{encode_manifest_xml, encode_resource_table, StringTable};
pub use dex::encode_minimal_dex;
pub use sign::{sign, sign_apk, validate_signed_archive, verify_signed_archive, SignOptions};

pub const MANIFEST_PATH: &str = "AndroidManifest.xml";
pub const DEX_PATH: &str = "classes.dex";
pub const RESOURCES_PATH: &str = "resources.arsc";
pub const META_INF: &str = "META-INF/";

/// File extensions deflated inside the archive. Everything else is stored.
const COMPRESSED_EXTENSIONS: &[&str] = &["xml", "MF", "SF", "txt", "json", "properties"];

/// One named payload of an archive. Paths use `/` separators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveEntry {
    pub path: String,
    pub payload: Vec<u8>,
    pub compress: bool,
}

impl ArchiveEntry {
    /// Creates an entry, deflating text formats.
    pub fn new(path: impl Into<String>, payload: Vec<u8>) -> Self {
        let path = path.into();
        let compress = Path::new(&path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| COMPRESSED_EXTENSIONS.contains(&ext))
            .unwrap_or(false);
        Self {
            path,
            payload,
            compress,
        }
    }

    pub fn is_signature_file(&self) -> bool {
        self.path.starts_with(META_INF)
    }
}

/// Output of the assembler: the manifest (when one was built), the walked
/// files in walk order, `classes.dex` and `resources.arsc`.
#[derive(Clone, Debug, Default)]
pub struct UnsignedArchive {
    pub entries: Vec<ArchiveEntry>,
    pub failures: Vec<PartialFailure>,
}

impl UnsignedArchive {
    /// Reads an archive as the signer sees it. Unreadable entries become
    /// failures and are left out.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (entries, failures) = zip::read_entries(Cursor::new(bytes))?;
        Ok(Self { entries, failures })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let (entries, failures) = zip::read_archive(path)?;
        Ok(Self { entries, failures })
    }

    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        zip::write_entries(&self.entries)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

/// An unsigned archive with `META-INF/MANIFEST.MF`, `CERT.SF` and
/// `CERT.RSA` appended in that order.
#[derive(Clone, Debug, Default)]
pub struct SignedArchive {
    pub entries: Vec<ArchiveEntry>,
    pub failures: Vec<PartialFailure>,
}

impl SignedArchive {
    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        zip::write_entries(&self.entries)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}
