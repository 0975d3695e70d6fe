//! `AndroidManifest.xml` model and extraction of the values the packager
//! needs from an existing manifest, text or binary.

use crate::apk::res::Chunk;
use crate::core::config::{ManifestDefaults, ANDROID_NAMESPACE};
use crate::error::{Error, Result};
use roxmltree::Document;
use serde::{Serialize, Serializer};

pub const ACTION_MAIN: &str = "android.intent.action.MAIN";
pub const CATEGORY_LAUNCHER: &str = "android.intent.category.LAUNCHER";

/// Root `<manifest>` of a generated manifest. Serialised with quick-xml, so
/// `None` attributes and empty lists are left out.
#[derive(Clone, Debug, Serialize)]
#[serde(rename = "manifest")]
pub struct AndroidManifest {
    #[serde(rename(serialize = "xmlns:android"))]
    ns_android: String,
    pub package: String,
    #[serde(rename(serialize = "android:versionCode"))]
    pub version_code: Option<u32>,
    #[serde(rename(serialize = "android:versionName"))]
    pub version_name: Option<String>,
    #[serde(rename(serialize = "uses-sdk"))]
    pub sdk: Sdk,
    #[serde(rename(serialize = "uses-permission"))]
    pub uses_permission: Vec<Permission>,
    pub application: Application,
}

impl AndroidManifest {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            ns_android: ANDROID_NAMESPACE.to_string(),
            package: package.into(),
            version_code: None,
            version_name: None,
            sdk: Sdk::default(),
            uses_permission: vec![],
            application: Application::default(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|err| Error::encoding(err.to_string()))
    }
}

/// `<application>`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Application {
    #[serde(rename(serialize = "android:allowBackup"))]
    pub allow_backup: Option<bool>,
    #[serde(rename(serialize = "android:icon"))]
    pub icon: Option<String>,
    #[serde(rename(serialize = "android:label"))]
    pub label: Option<String>,
    #[serde(rename(serialize = "android:theme"))]
    pub theme: Option<String>,
    #[serde(rename(serialize = "activity"))]
    pub activities: Vec<Activity>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Activity {
    #[serde(rename(serialize = "android:name"))]
    pub name: Option<String>,
    #[serde(rename(serialize = "android:exported"))]
    pub exported: Option<bool>,
    #[serde(rename(serialize = "intent-filter"))]
    pub intent_filters: Vec<IntentFilter>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IntentFilter {
    /// One `<action android:name=".."/>` per entry.
    #[serde(rename(serialize = "action"), serialize_with = "serialize_named")]
    pub actions: Vec<String>,
    #[serde(rename(serialize = "category"), serialize_with = "serialize_named")]
    pub categories: Vec<String>,
}

impl IntentFilter {
    pub fn launcher() -> Self {
        Self {
            actions: vec![ACTION_MAIN.to_string()],
            categories: vec![CATEGORY_LAUNCHER.to_string()],
        }
    }
}

#[derive(Serialize)]
struct Named<'a> {
    #[serde(rename = "android:name")]
    name: &'a str,
}

fn serialize_named<S: Serializer>(
    names: &[String],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(names.iter().map(|name| Named { name }))
}

/// `<uses-permission>`.
#[derive(Clone, Debug, Serialize)]
pub struct Permission {
    #[serde(rename(serialize = "android:name"))]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Sdk {
    #[serde(rename(serialize = "android:minSdkVersion"))]
    pub min_sdk_version: Option<u32>,
    #[serde(rename(serialize = "android:targetSdkVersion"))]
    pub target_sdk_version: Option<u32>,
}

/// The parts of a source manifest that survive into the packaged one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ManifestInfo {
    pub package: Option<String>,
    pub label: Option<String>,
    pub activities: Vec<String>,
    pub permissions: Vec<String>,
    pub version_code: Option<u32>,
    pub version_name: Option<String>,
}

impl ManifestInfo {
    /// Reads a manifest that is either text or binary XML. Text that does
    /// not parse still yields its `package` attribute when one can be found.
    pub fn extract(bytes: &[u8]) -> Self {
        if bytes.starts_with(&[0x03, 0x00]) {
            match Self::from_binary(bytes) {
                Ok(info) => return info,
                Err(err) => tracing::warn!("unreadable binary manifest: {}", err),
            }
        }
        let text = String::from_utf8_lossy(bytes);
        match Self::from_text(&text) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!("malformed manifest, scanning for package: {}", err);
                Self {
                    package: scan_package(&text),
                    ..Default::default()
                }
            }
        }
    }

    pub fn from_text(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|err| Error::encoding(err.to_string()))?;
        let root = doc.root_element();
        if !root.has_tag_name("manifest") {
            return Err(Error::encoding(format!(
                "expected <manifest>, found <{}>",
                root.tag_name().name()
            )));
        }
        let android = |node: roxmltree::Node, name: &str| {
            node.attribute((ANDROID_NAMESPACE, name)).map(str::to_string)
        };
        let mut info = Self {
            package: root.attribute("package").map(str::to_string),
            version_code: android(root, "versionCode").and_then(|v| v.parse().ok()),
            version_name: android(root, "versionName"),
            ..Default::default()
        };
        for node in root.descendants().filter(|node| node.is_element()) {
            match node.tag_name().name() {
                "application" => info.label = android(node, "label"),
                "activity" => info.activities.extend(android(node, "name")),
                "uses-permission" => info.permissions.extend(android(node, "name")),
                _ => {}
            }
        }
        Ok(info)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let chunks = match Chunk::from_bytes(bytes)? {
            Chunk::Xml(chunks) => chunks,
            _ => return Err(Error::encoding("manifest is not an xml chunk")),
        };
        let strings = match chunks.first() {
            Some(Chunk::StringPool(strings)) => strings,
            _ => return Err(Error::encoding("manifest lacks a string pool")),
        };
        let string = |index: i32| -> Option<String> {
            usize::try_from(index)
                .ok()
                .and_then(|index| strings.get(index))
                .cloned()
        };

        let mut info = Self::default();
        for chunk in &chunks {
            let Chunk::XmlStartElement(_, el, attrs) = chunk else {
                continue;
            };
            let attr = |name: &str| {
                attrs
                    .iter()
                    .find(|attr| string(attr.name).as_deref() == Some(name))
            };
            let string_attr = |name: &str| attr(name).and_then(|attr| string(attr.raw_value));
            match string(el.name).as_deref() {
                Some("manifest") => {
                    info.package = string_attr("package");
                    info.version_name = string_attr("versionName");
                    info.version_code = attr("versionCode").map(|attr| attr.typed_value.data);
                }
                Some("application") => info.label = string_attr("label"),
                Some("activity") => info.activities.extend(string_attr("name")),
                Some("uses-permission") => info.permissions.extend(string_attr("name")),
                _ => {}
            }
        }
        Ok(info)
    }

    /// Builds the manifest to package, filling gaps from `defaults`. The
    /// first activity is exported and launchable.
    pub fn to_manifest(&self, defaults: &ManifestDefaults) -> AndroidManifest {
        let mut manifest = AndroidManifest::new(
            self.package
                .clone()
                .filter(|package| !package.is_empty())
                .unwrap_or_else(|| defaults.package.clone()),
        );
        manifest.version_code = Some(self.version_code.unwrap_or(defaults.version_code));
        manifest.version_name = Some(
            self.version_name
                .clone()
                .unwrap_or_else(|| defaults.version_name.clone()),
        );
        manifest.sdk = Sdk {
            min_sdk_version: Some(defaults.min_sdk),
            target_sdk_version: Some(defaults.target_sdk),
        };
        manifest.uses_permission = self
            .permissions
            .iter()
            .map(|name| Permission { name: name.clone() })
            .collect();

        let mut activities = self.activities.clone();
        if activities.is_empty() {
            activities.push(defaults.activity.clone());
        }
        manifest.application = Application {
            allow_backup: Some(true),
            icon: Some("@mipmap/ic_launcher".to_string()),
            label: Some(
                self.label
                    .clone()
                    .unwrap_or_else(|| defaults.app_label.clone()),
            ),
            theme: Some("@android:style/Theme.Material".to_string()),
            activities: activities
                .into_iter()
                .enumerate()
                .map(|(i, name)| Activity {
                    name: Some(name),
                    exported: (i == 0).then_some(true),
                    intent_filters: if i == 0 {
                        vec![IntentFilter::launcher()]
                    } else {
                        vec![]
                    },
                })
                .collect(),
        };
        manifest
    }
}

/// Finds `package="..."` in text that is not well-formed XML.
fn scan_package(text: &str) -> Option<String> {
    let start = text.find("package=")? + "package=".len();
    let rest = &text[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_string()).filter(|package| !package.is_empty())
}
