use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ANDROID_NAMESPACE: &str = "http://schemas.android.com/apk/res/android";

/// Config keys are all lowercase. Every group carries `#[serde(default)]`,
/// so omitting a group keeps the defaults for that group only.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct PackagerConfig {
    #[serde(default)]
    pub defaults: ManifestDefaults,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Values used wherever a manifest has to be synthesized or a source
/// manifest is missing one of them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ManifestDefaults {
    #[serde(default = "default_package")]
    pub package: String,
    #[serde(default = "default_app_label")]
    pub app_label: String,
    #[serde(default = "default_activity")]
    pub activity: String,
    #[serde(default = "default_version_code")]
    pub version_code: u32,
    #[serde(default = "default_version_name")]
    pub version_name: String,
    #[serde(default = "default_min_sdk")]
    pub min_sdk: u32,
    #[serde(default = "default_target_sdk")]
    pub target_sdk: u32,
}

fn default_package() -> String {
    "com.example.modifiedapp".to_string()
}

fn default_app_label() -> String {
    "Modified App".to_string()
}

fn default_activity() -> String {
    ".MainActivity".to_string()
}

fn default_version_code() -> u32 {
    1
}

fn default_version_name() -> String {
    "1.0".to_string()
}

fn default_min_sdk() -> u32 {
    21
}

fn default_target_sdk() -> u32 {
    33
}

impl Default for ManifestDefaults {
    fn default() -> Self {
        Self {
            package: default_package(),
            app_label: default_app_label(),
            activity: default_activity(),
            version_code: default_version_code(),
            version_name: default_version_name(),
            min_sdk: default_min_sdk(),
            target_sdk: default_target_sdk(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BuildConfig {
    /// Share of the total input bytes assumed to be code when no better
    /// estimate is recorded in `apktool.yml`.
    #[serde(default = "default_dex_size_ratio")]
    pub dex_size_ratio: f64,
    /// Size estimate used when a `classes.dex` is backfilled during signing.
    #[serde(default = "default_dex_estimate")]
    pub default_dex_estimate: u64,
    #[serde(default = "default_max_dex_size")]
    pub max_dex_size: u64,
    #[serde(default)]
    pub pad_small_archives: bool,
    #[serde(default = "default_min_archive_size")]
    pub min_archive_size: u64,
    #[serde(default = "default_padding_target")]
    pub padding_target: u64,
}

fn default_dex_size_ratio() -> f64 {
    0.4
}

fn default_dex_estimate() -> u64 {
    500_000
}

fn default_max_dex_size() -> u64 {
    8 * 1024 * 1024
}

fn default_min_archive_size() -> u64 {
    50_000
}

fn default_padding_target() -> u64 {
    200_000
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            dex_size_ratio: default_dex_size_ratio(),
            default_dex_estimate: default_dex_estimate(),
            max_dex_size: default_max_dex_size(),
            pad_small_archives: false,
            min_archive_size: default_min_archive_size(),
            padding_target: default_padding_target(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SigningConfig {
    #[serde(default = "default_created_by")]
    pub created_by: String,
    #[serde(default = "default_built_by")]
    pub built_by: String,
}

fn default_created_by() -> String {
    format!("apkpack {}", VERSION)
}

fn default_built_by() -> String {
    "apkpack".to_string()
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            created_by: default_created_by(),
            built_by: default_built_by(),
        }
    }
}

/// Overrides for the external decompiler. When unset, `apktool` and `java`
/// are looked up on `PATH`.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ToolsConfig {
    pub apktool: Option<PathBuf>,
    pub java: Option<PathBuf>,
}

pub fn parse_config(full_config_path: &Path) -> PackagerConfig {
    let content = match fs::read_to_string(full_config_path) {
        Ok(content) => content,
        Err(err) => {
            tracing::debug!(
                "no config at `{}` ({}), using defaults",
                full_config_path.display(),
                err
            );
            return PackagerConfig::default();
        }
    };
    match toml::from_str::<PackagerConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            // Config malformed, use the default config and the user can modify it again
            tracing::warn!(
                "malformed config `{}`: {}",
                full_config_path.display(),
                err
            );
            PackagerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn with_config_file(content: &str, f: impl Fn(&Path)) {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("apkpack.toml");
        fs::write(&file_path, content).unwrap();
        f(&file_path)
    }

    #[test]
    fn should_read_every_group() {
        with_config_file(
            r#"
                [defaults]
                package = "org.sample.app"
                app_label = "Sample"

                [build]
                dex_size_ratio = 0.25
                pad_small_archives = true

                [signing]
                created_by = "tester"

                [tools]
                apktool = "/opt/apktool.jar"
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.defaults.package, "org.sample.app");
                assert_eq!(config.defaults.app_label, "Sample");
                assert_eq!(config.defaults.activity, ".MainActivity");
                assert_eq!(config.build.dex_size_ratio, 0.25);
                assert!(config.build.pad_small_archives);
                assert_eq!(config.build.min_archive_size, 50_000);
                assert_eq!(config.signing.created_by, "tester");
                assert_eq!(config.signing.built_by, "apkpack");
                assert_eq!(
                    config.tools.apktool.as_deref(),
                    Some(Path::new("/opt/apktool.jar"))
                );
                assert_eq!(config.tools.java, None);
            },
        );
    }

    #[test]
    fn should_keep_defaults_for_missing_groups() {
        with_config_file(
            r#"
                [signing]
                built_by = "ci"
            "#,
            |path| {
                let config = parse_config(path);
                assert_eq!(config.signing.built_by, "ci");
                assert_eq!(config.defaults, ManifestDefaults::default());
                assert_eq!(config.build, BuildConfig::default());
            },
        );
    }

    #[test]
    fn should_fall_back_on_malformed_config() {
        with_config_file("[build\ndex_size_ratio = ", |path| {
            assert_eq!(parse_config(path), PackagerConfig::default());
        });
    }

    #[test]
    fn should_fall_back_on_missing_file() {
        let dir = tempdir().unwrap();
        let config = parse_config(&dir.path().join("absent.toml"));
        assert_eq!(config, PackagerConfig::default());
    }
}
