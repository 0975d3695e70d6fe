use apkpack::apk::dex::{check_dex, DEX_MAGIC};
use apkpack::apk::manifest::ManifestInfo;
use apkpack::apk::sign::{CERT_RSA, CERT_SF, MANIFEST_MF};
use apkpack::apk::{
    assemble, encode_resource_table, sign, sign_apk, verify_signed_archive, ArchiveEntry,
    SignOptions, StringTable, UnsignedArchive, DEX_PATH, MANIFEST_PATH, RESOURCES_PATH,
};
use apkpack::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{TimeZone, Utc};
use sha1::{Digest, Sha1};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tempfile::tempdir;
use zip::ZipArchive;

fn write(root: &Path, path: &str, contents: &[u8]) {
    let path = root.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn options() -> SignOptions {
    SignOptions::default().with_timestamp(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
}

/// Entry names as listed by the central directory.
fn central_directory(bytes: &[u8]) -> Vec<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_owned())
        .collect()
}

fn sample_tree(root: &Path) {
    write(
        root,
        MANIFEST_PATH,
        br#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="org.sample">
    <uses-permission android:name="android.permission.INTERNET" />
    <application android:label="@string/app_name">
        <activity android:name=".Home" />
    </application>
</manifest>"#,
    );
    write(
        root,
        "res/values/strings.xml",
        br#"<resources><string name="app_name">Sample</string></resources>"#,
    );
    write(
        root,
        "res/layout/main.xml",
        br#"<LinearLayout xmlns:android="http://schemas.android.com/apk/res/android">
            <TextView android:text="@string/app_name" />
        </LinearLayout>"#,
    );
    write(root, "assets/config.json", br#"{"a": 1}"#);
}

#[test]
fn assembled_archive_reopens_with_expected_entries() {
    let dir = tempdir().unwrap();
    sample_tree(dir.path());
    let archive = assemble(dir.path(), None).unwrap();
    assert!(archive.failures.is_empty());
    let bytes = archive.to_bytes().unwrap();
    let mut names = central_directory(&bytes);
    assert_eq!(names.first().map(String::as_str), Some(MANIFEST_PATH));
    names.sort();
    assert_eq!(
        names,
        vec![
            MANIFEST_PATH,
            "assets/config.json",
            DEX_PATH,
            "res/layout/main.xml",
            "res/values/strings.xml",
            RESOURCES_PATH,
        ]
    );

    let reopened = UnsignedArchive::from_bytes(&bytes).unwrap();
    let info = ManifestInfo::from_binary(&reopened.entry(MANIFEST_PATH).unwrap().payload).unwrap();
    assert_eq!(info.package.as_deref(), Some("org.sample"));
    assert_eq!(info.activities, vec![".Home".to_string()]);
    assert_eq!(info.permissions, vec!["android.permission.INTERNET".to_string()]);
    check_dex(&reopened.entry(DEX_PATH).unwrap().payload).unwrap();
}

#[test]
fn empty_directory_yields_only_dex_and_arsc() {
    let dir = tempdir().unwrap();
    let archive = assemble(dir.path(), None).unwrap();
    assert!(archive.failures.is_empty());
    assert_eq!(
        central_directory(&archive.to_bytes().unwrap()),
        vec![DEX_PATH, RESOURCES_PATH]
    );
}

#[test]
fn signing_without_manifest_backfills_it() {
    let archive = UnsignedArchive {
        entries: vec![ArchiveEntry::new("assets/readme.txt", b"hello".to_vec())],
        failures: vec![],
    };
    let signed = sign(archive, &options()).unwrap();
    assert!(signed.entry(MANIFEST_PATH).unwrap().payload.len() >= 100);
    for path in [MANIFEST_MF, CERT_SF, CERT_RSA] {
        assert!(signed.entry(path).unwrap().payload.len() >= 50, "{} too small", path);
    }
    let names = central_directory(&signed.to_bytes().unwrap());
    assert_eq!(&names[names.len() - 3..], [MANIFEST_MF, CERT_SF, CERT_RSA]);
}

#[test]
fn digest_chain_is_consistent() {
    let dir = tempdir().unwrap();
    sample_tree(dir.path());
    let unsigned = dir.path().join("out/unsigned.apk");
    let signed_path = dir.path().join("out/signed.apk");
    fs::create_dir_all(unsigned.parent().unwrap()).unwrap();
    assemble(dir.path(), None).unwrap().write(&unsigned).unwrap();
    sign_apk(&unsigned, &signed_path, &options()).unwrap();

    let bytes = fs::read(&signed_path).unwrap();
    let archive = UnsignedArchive::from_bytes(&bytes).unwrap();
    let manifest = &archive.entry(MANIFEST_MF).unwrap().payload;
    let sf = String::from_utf8(archive.entry(CERT_SF).unwrap().payload.clone()).unwrap();

    let manifest_digest = sf
        .lines()
        .find_map(|line| line.strip_prefix("SHA1-Digest-Manifest: "))
        .unwrap();
    assert_eq!(
        STANDARD.decode(manifest_digest).unwrap(),
        Sha1::digest(manifest).to_vec()
    );

    let text = String::from_utf8(manifest.clone()).unwrap();
    let sections = text.split_inclusive("\r\n\r\n").skip(1).collect::<Vec<_>>();
    assert_eq!(sections.len(), 6);
    for section in sections {
        let name = section.lines().next().unwrap().trim_start_matches("Name: ");
        let expected = format!(
            "Name: {}\r\nSHA1-Digest: {}\r\n\r\n",
            name,
            STANDARD.encode(Sha1::digest(section.as_bytes()))
        );
        assert!(sf.contains(&expected), "no signed section for {}", name);
    }
    assert_eq!(verify_signed_archive(&bytes).unwrap(), 6);
}

#[test]
fn resigning_replaces_previous_signature() {
    let first = sign(assemble(tempdir().unwrap().path(), None).unwrap(), &options()).unwrap();
    let reread = UnsignedArchive::from_bytes(&first.to_bytes().unwrap()).unwrap();
    let later = options().with_timestamp(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    let second = sign(reread, &later).unwrap();
    let names = central_directory(&second.to_bytes().unwrap());
    assert_eq!(names.iter().filter(|n| n.starts_with("META-INF/")).count(), 3);
    assert_ne!(
        first.entry(MANIFEST_MF).unwrap().payload,
        second.entry(MANIFEST_MF).unwrap().payload
    );
    verify_signed_archive(&second.to_bytes().unwrap()).unwrap();
}

#[test]
fn builds_are_deterministic() {
    let dir = tempdir().unwrap();
    sample_tree(dir.path());
    let first = assemble(dir.path(), None).unwrap().to_bytes().unwrap();
    let second = assemble(dir.path(), None).unwrap().to_bytes().unwrap();
    assert_eq!(first, second);

    let table = [("app_name", "Foo")].into_iter().collect::<StringTable>();
    assert_eq!(
        encode_resource_table("com.x", &table).unwrap(),
        encode_resource_table("com.x", &table).unwrap()
    );
}

#[test]
fn undecodable_resource_is_reported_and_skipped() {
    let dir = tempdir().unwrap();
    sample_tree(dir.path());
    write(dir.path(), "res/values/weird.xml", &[0x00, 0xff, 0x13, 0x37, 0xfe]);
    let archive = assemble(dir.path(), None).unwrap();
    assert!(archive.entry("res/values/weird.xml").is_none());
    assert_eq!(archive.failures.len(), 1);
    assert_eq!(archive.failures[0].path, "res/values/weird.xml");
    assert!(archive.entry("res/layout/main.xml").is_some());
    assert!(archive.entry(DEX_PATH).is_some());
    assert!(archive.entry(RESOURCES_PATH).is_some());
}

#[test]
fn minimal_dex_is_self_consistent() {
    let bytes = apkpack::apk::encode_minimal_dex(100_000).unwrap();
    assert!(bytes.len() >= 4096);
    assert_eq!(&bytes[..8], DEX_MAGIC);
    let header = check_dex(&bytes).unwrap();
    assert_eq!(header.map_off as usize, bytes.len() - 100);
}

#[test]
fn signing_a_missing_archive_is_not_found() {
    let dir = tempdir().unwrap();
    let result = sign_apk(
        &dir.path().join("absent.apk"),
        &dir.path().join("out.apk"),
        &options(),
    );
    assert!(matches!(result, Err(Error::NotFound(_))));
}
