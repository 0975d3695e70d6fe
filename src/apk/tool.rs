//! Decompile and build strategies. An external `apktool` is used when one
//! can be found; whenever it is missing or fails, the built-in ZIP
//! extraction and [`Assembler`] take over.

use crate::apk::assemble::Assembler;
use crate::apk::manifest::ManifestInfo;
use crate::apk::sign::{sign_apk, verify_signed_archive, SignOptions};
use crate::apk::{ArchiveEntry, MANIFEST_PATH, META_INF};
use crate::core::config::{ManifestDefaults, PackagerConfig, ToolsConfig};
use crate::error::{Error, PartialFailure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

pub const APKTOOL_YML: &str = "apktool.yml";
const APKTOOL_VERSION: &str = "2.7.0";

/// Directories every decompiled tree starts with.
const SKELETON_DIRS: &[&str] = &[
    "res/drawable-hdpi",
    "res/drawable-mdpi",
    "res/drawable-xhdpi",
    "res/drawable-xxhdpi",
    "res/drawable-xxxhdpi",
    "res/layout",
    "res/values",
    "res/xml",
    "smali/com/example/app",
    "assets",
    "original/META-INF",
];

const SAMPLE_COLORS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<resources>
    <color name="primary_color">#2196F3</color>
    <color name="secondary_color">#FFC107</color>
</resources>
"#;

/// Metadata file of a decompiled tree. Fields this crate does not know are
/// carried through unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApktoolYml {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "apkFileName", skip_serializing_if = "Option::is_none")]
    pub apk_file_name: Option<String>,
    #[serde(rename = "isFrameworkApk")]
    pub is_framework_apk: bool,
    #[serde(rename = "compressionType")]
    pub compression_type: bool,
    /// Size of the archive the tree was decompiled from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ApktoolYml {
    pub fn new(apk: &Path, original_size: u64) -> Self {
        Self {
            version: Some(APKTOOL_VERSION.to_string()),
            apk_file_name: apk
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            original_size: Some(original_size),
            ..Default::default()
        }
    }

    /// Reads `apktool.yml` from `dir`, if there is a readable one.
    pub fn read(dir: &Path) -> Option<Self> {
        let path = dir.join(APKTOOL_YML);
        let content = fs::read_to_string(&path).ok()?;
        match serde_yaml::from_str(&content) {
            Ok(yml) => Some(yml),
            Err(err) => {
                tracing::debug!("ignoring `{}`: {}", path.display(), err);
                None
            }
        }
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).map_err(|err| Error::encoding(err.to_string()))?;
        fs::write(dir.join(APKTOOL_YML), content)?;
        Ok(())
    }
}

/// A way of turning an archive into a source tree and back.
pub trait ApkTool {
    fn name(&self) -> &str;

    fn decompile(&self, apk: &Path, out_dir: &Path) -> Result<Vec<PartialFailure>>;

    fn build(&self, source_dir: &Path, out_apk: &Path) -> Result<Vec<PartialFailure>>;
}

/// The `apktool` program, either a launcher script or a jar run by `java`.
#[derive(Clone, Debug)]
pub struct Apktool {
    program: PathBuf,
    java: Option<PathBuf>,
}

impl Apktool {
    pub fn detect(tools: &ToolsConfig) -> Option<Self> {
        let program = match &tools.apktool {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => {
                tracing::warn!("configured apktool `{}` does not exist", path.display());
                return None;
            }
            None => which::which("apktool").ok()?,
        };
        let is_jar = program
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("jar"))
            .unwrap_or(false);
        let java = if is_jar {
            let java = tools.java.clone().or_else(|| which::which("java").ok());
            if java.is_none() {
                tracing::warn!("`{}` needs java, which was not found", program.display());
            }
            Some(java?)
        } else {
            None
        };
        tracing::debug!("using apktool at `{}`", program.display());
        Some(Self { program, java })
    }

    fn setup_base_command(&self) -> Command {
        match &self.java {
            Some(java) => {
                let mut command = Command::new(java);
                command.arg("-jar").arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        }
    }

    fn run(mut command: Command, what: &str) -> Result<()> {
        let output = command
            .output()
            .map_err(|err| Error::Tool(format!("running `{}`: {}", what, err)))?;
        if !output.status.success() {
            return Err(Error::Tool(format!(
                "`{}` failed ({}): {}",
                what,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl ApkTool for Apktool {
    fn name(&self) -> &str {
        "apktool"
    }

    fn decompile(&self, apk: &Path, out_dir: &Path) -> Result<Vec<PartialFailure>> {
        let mut command = self.setup_base_command();
        command.arg("d").arg(apk).arg("-o").arg(out_dir).arg("-f");
        Self::run(command, "apktool d")?;
        Ok(vec![])
    }

    fn build(&self, source_dir: &Path, out_apk: &Path) -> Result<Vec<PartialFailure>> {
        let mut command = self.setup_base_command();
        command.arg("b").arg(source_dir).arg("-o").arg(out_apk);
        Self::run(command, "apktool b")?;
        Ok(vec![])
    }
}

/// Plain ZIP extraction one way, the [`Assembler`] the other.
#[derive(Clone, Debug, Default)]
pub struct Builtin {
    config: PackagerConfig,
}

impl Builtin {
    pub fn new(config: &PackagerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Assembles `source_dir` into `out_apk` without signing it.
    pub fn assemble_to(
        &self,
        source_dir: &Path,
        out_apk: &Path,
        manifest_path: Option<&Path>,
    ) -> Result<Vec<PartialFailure>> {
        let archive = Assembler::new(&self.config).assemble(source_dir, manifest_path)?;
        if let Some(parent) = out_apk.parent() {
            fs::create_dir_all(parent)?;
        }
        archive.write(out_apk)?;
        tracing::info!("wrote `{}`", out_apk.display());
        Ok(archive.failures)
    }
}

impl ApkTool for Builtin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn decompile(&self, apk: &Path, out_dir: &Path) -> Result<Vec<PartialFailure>> {
        for dir in SKELETON_DIRS {
            fs::create_dir_all(out_dir.join(dir))?;
        }
        let mut failures = vec![];
        match crate::apk::zip::read_archive(apk) {
            Ok((entries, read_failures)) => {
                failures.extend(read_failures);
                for entry in &entries {
                    if let Err(err) = extract_entry(out_dir, entry) {
                        failures.push(PartialFailure::new(&entry.path, err));
                    }
                }
                tracing::debug!("extracted {} entries", entries.len());
            }
            Err(err) => {
                tracing::warn!(
                    "`{}` is not a readable archive ({}), writing sample resources",
                    apk.display(),
                    err
                );
                write_sample_resources(out_dir, &self.config.defaults)?;
            }
        }

        let manifest = out_dir.join(MANIFEST_PATH);
        if !manifest.is_file() {
            fs::write(&manifest, sample_manifest(&self.config.defaults)?)?;
        }
        ApktoolYml::new(apk, fs::metadata(apk)?.len()).write(out_dir)?;
        Ok(failures)
    }

    fn build(&self, source_dir: &Path, out_apk: &Path) -> Result<Vec<PartialFailure>> {
        self.assemble_to(source_dir, out_apk, None)
    }
}

/// Signature files keep apktool's layout under `original/`.
fn extracted_path(out_dir: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    if relative.as_os_str().is_empty()
        || !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(Error::encoding(format!("unsafe entry path `{}`", path)));
    }
    Ok(if path.starts_with(META_INF) {
        out_dir.join("original").join(relative)
    } else {
        out_dir.join(relative)
    })
}

fn extract_entry(out_dir: &Path, entry: &ArchiveEntry) -> Result<()> {
    let dest = extracted_path(out_dir, &entry.path)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, &entry.payload)?;
    Ok(())
}

fn sample_manifest(defaults: &ManifestDefaults) -> Result<String> {
    let xml = ManifestInfo::default().to_manifest(defaults).to_xml()?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{}\n", xml))
}

fn write_sample_resources(out_dir: &Path, defaults: &ManifestDefaults) -> Result<()> {
    let values = out_dir.join("res/values");
    fs::create_dir_all(&values)?;
    let strings = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<resources>
    <string name="app_name">{}</string>
    <string name="hello_world">Hello World!</string>
    <string name="button_text">Click Me</string>
</resources>
"#,
        quick_xml::escape::escape(&defaults.app_label)
    );
    fs::write(values.join("strings.xml"), strings)?;
    fs::write(values.join("colors.xml"), SAMPLE_COLORS)?;
    Ok(())
}

/// Result of one command, printed as JSON by the CLI.
#[derive(Debug, Default, Serialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PartialFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn succeeded(failures: Vec<PartialFailure>) -> Self {
        Self {
            success: true,
            failures,
            error: None,
        }
    }

    pub fn failed(err: Error) -> Self {
        tracing::error!("{}", err);
        Self {
            success: false,
            failures: vec![],
            error: Some(err.to_string()),
        }
    }
}

impl From<Result<Vec<PartialFailure>>> for Outcome {
    fn from(result: Result<Vec<PartialFailure>>) -> Self {
        match result {
            Ok(failures) => Self::succeeded(failures),
            Err(err) => Self::failed(err),
        }
    }
}

/// The strategy chosen for this run. Detection happens once, up front.
pub struct Toolchain {
    external: Option<Apktool>,
    builtin: Builtin,
}

impl Toolchain {
    pub fn detect(config: &PackagerConfig) -> Self {
        let external = Apktool::detect(&config.tools);
        if external.is_none() {
            tracing::info!("apktool not available, using built-in decompile and build");
        }
        Self {
            external,
            builtin: Builtin::new(config),
        }
    }

    /// A toolchain that never runs external programs.
    pub fn builtin(config: &PackagerConfig) -> Self {
        Self {
            external: None,
            builtin: Builtin::new(config),
        }
    }

    pub fn decompile(&self, apk: &Path, out_dir: &Path) -> Outcome {
        if !apk.is_file() {
            return Outcome::failed(Error::NotFound(apk.to_path_buf()));
        }
        if let Some(external) = &self.external {
            match external.decompile(apk, out_dir) {
                Ok(failures) => {
                    record_original_size(apk, out_dir);
                    return Outcome::succeeded(failures);
                }
                Err(err) => tracing::warn!(
                    "{} failed, falling back to plain extraction: {}",
                    external.name(),
                    err
                ),
            }
        }
        self.builtin.decompile(apk, out_dir).into()
    }

    /// Builds `source_dir` into an unsigned archive. An explicit manifest
    /// is only understood by the built-in assembler.
    pub fn compile(&self, source_dir: &Path, out_apk: &Path, manifest: Option<&Path>) -> Outcome {
        if !source_dir.is_dir() {
            return Outcome::failed(Error::NotFound(source_dir.to_path_buf()));
        }
        if manifest.is_some() {
            return self.builtin.assemble_to(source_dir, out_apk, manifest).into();
        }
        if let Some(external) = &self.external {
            match external.build(source_dir, out_apk) {
                Ok(failures) => return Outcome::succeeded(failures),
                Err(err) => tracing::warn!(
                    "{} failed, falling back to the built-in assembler: {}",
                    external.name(),
                    err
                ),
            }
        }
        self.builtin.build(source_dir, out_apk).into()
    }

    pub fn sign(&self, input: &Path, output: &Path) -> Outcome {
        let options = SignOptions::from_config(&self.builtin.config);
        sign_apk(input, output, &options)
            .map(|signed| signed.failures)
            .into()
    }

    pub fn verify(&self, apk: &Path) -> Outcome {
        let result: Result<Vec<PartialFailure>> = match fs::read(apk) {
            Ok(bytes) => verify_signed_archive(&bytes).map(|entries| {
                tracing::info!("`{}`: {} entries verified", apk.display(), entries);
                vec![]
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(apk.to_path_buf()))
            }
            Err(err) => Err(err.into()),
        };
        result.into()
    }
}

/// apktool writes its own metadata; add the archive size the assembler
/// uses for its code size estimate.
fn record_original_size(apk: &Path, out_dir: &Path) {
    let (Some(mut yml), Ok(meta)) = (ApktoolYml::read(out_dir), fs::metadata(apk)) else {
        tracing::debug!("leaving {} untouched", APKTOOL_YML);
        return;
    };
    yml.original_size = Some(meta.len());
    if let Err(err) = yml.write(out_dir) {
        tracing::debug!("could not update {}: {}", APKTOOL_YML, err);
    }
}
