pub mod attributes;
pub mod table;
pub mod xml;

use crate::apk::manifest::{AndroidManifest, ManifestInfo};
use crate::apk::res::Chunk;
use crate::core::config::ManifestDefaults;
use crate::error::{Error, Result};

pub use table::{encode_resource_table, StringTable};
pub use xml::{compile_xml, is_binary_xml};

pub fn compile_manifest(manifest: &AndroidManifest, resources: &StringTable) -> Result<Chunk> {
    if manifest.package.is_empty() {
        return Err(Error::encoding("manifest needs a package name"));
    }
    let xml = manifest.to_xml()?;
    compile_xml(&xml, resources)
}

/// Encodes a launchable binary `AndroidManifest.xml`. The first of
/// `activities` (or `.MainActivity` when there are none) receives the
/// `MAIN`/`LAUNCHER` intent filter.
pub fn encode_manifest_xml(
    app_package: &str,
    permissions: &[String],
    activities: &[String],
    app_label: &str,
) -> Result<Vec<u8>> {
    if app_package.is_empty() {
        return Err(Error::encoding("manifest needs a package name"));
    }
    let info = ManifestInfo {
        package: Some(app_package.to_string()),
        label: Some(app_label.to_string()),
        activities: activities.to_vec(),
        permissions: permissions.to_vec(),
        ..Default::default()
    };
    let manifest = info.to_manifest(&ManifestDefaults::default());
    compile_manifest(&manifest, &StringTable::default())?.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::res::{ChunkType, ResChunkHeader, Wire};
    use std::io::Cursor;

    fn chunk_headers(bytes: &[u8]) -> Vec<(usize, ResChunkHeader)> {
        let top = ResChunkHeader::read(&mut Cursor::new(bytes)).unwrap();
        let mut headers = vec![(0, top)];
        let mut pos = top.header_size as usize;
        while pos < bytes.len() {
            let header = ResChunkHeader::read(&mut Cursor::new(&bytes[pos..])).unwrap();
            headers.push((pos, header));
            pos += header.size as usize;
        }
        assert_eq!(pos, bytes.len());
        headers
    }

    #[test]
    fn manifest_chunks_are_self_describing() {
        let bytes = encode_manifest_xml(
            "com.x",
            &["android.permission.INTERNET".to_string()],
            &[],
            "Foo",
        )
        .unwrap();
        assert!(bytes.len() >= 100);
        let headers = chunk_headers(&bytes);
        assert_eq!(headers[0].1.ty, ChunkType::Xml as u16);
        assert_eq!(headers[0].1.size as usize, bytes.len());
        assert_eq!(headers[1].1.ty, ChunkType::StringPool as u16);
        assert_eq!(headers[2].1.ty, ChunkType::XmlResourceMap as u16);
        assert_eq!(headers[3].1.ty, ChunkType::XmlStartNamespace as u16);
        assert_eq!(
            headers.last().unwrap().1.ty,
            ChunkType::XmlEndNamespace as u16
        );
        for (pos, header) in &headers[1..] {
            // sizes re-read from the emitted bytes line up end to end
            let reparsed = Chunk::parse(&mut Cursor::new(&bytes[*pos..])).unwrap();
            assert_eq!(reparsed.to_bytes().unwrap().len(), header.size as usize);
        }
    }

    #[test]
    fn resource_map_covers_framework_attributes() {
        let bytes = encode_manifest_xml("com.x", &[], &[".Main".to_string()], "Foo").unwrap();
        let Chunk::Xml(chunks) = Chunk::from_bytes(&bytes).unwrap() else {
            panic!("expected xml");
        };
        let (Chunk::StringPool(strings), Chunk::XmlResourceMap(map)) = (&chunks[0], &chunks[1])
        else {
            panic!("expected string pool and resource map");
        };
        for id in [
            0x0101_0000, // theme
            0x0101_0001, // label
            0x0101_0002, // icon
            0x0101_0003, // name
            0x0101_0010, // exported
            0x0101_020c, // minSdkVersion
            0x0101_021b, // versionCode
            0x0101_021c, // versionName
            0x0101_0270, // targetSdkVersion
            0x0101_0280, // allowBackup
        ] {
            assert!(map.contains(&id), "missing 0x{:08x}", id);
        }
        assert_eq!(strings[map.iter().position(|id| *id == 0x0101_0003).unwrap()], "name");
        let info = ManifestInfo::from_binary(&bytes).unwrap();
        assert_eq!(info.package.as_deref(), Some("com.x"));
        assert_eq!(info.activities, vec![".Main".to_string()]);
        assert_eq!(info.label.as_deref(), Some("Foo"));
    }

    #[test]
    fn empty_package_is_an_encoding_error() {
        assert!(matches!(
            encode_manifest_xml("", &[], &[], "Foo"),
            Err(Error::Encoding(_))
        ));
    }
}
