use anyhow::{Context, Result};
use apkpack::apk::tool::{Outcome, Toolchain};
use apkpack::core::config::parse_config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, defaults are used when it is missing
    #[clap(long, default_value = "apkpack.toml")]
    config: PathBuf,
    /// Log at debug level unless `RUST_LOG` says otherwise
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Commands,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = parse_config(&args.config);
    let toolchain = Toolchain::detect(&config);
    let outcome = args.command.run(&toolchain);
    let json = serde_json::to_string_pretty(&outcome).context("Serializing outcome")?;
    println!("{}", json);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[derive(Subcommand)]
enum Commands {
    /// Unpack an APK into a source tree
    Decompile { apk: PathBuf, out_dir: PathBuf },
    /// Build an unsigned APK from a source tree
    Compile {
        src_dir: PathBuf,
        out_apk: PathBuf,
        /// Manifest to use instead of the one in the source tree
        #[clap(long)]
        manifest: Option<PathBuf>,
    },
    /// Sign an APK, replacing any previous signature
    Sign { in_apk: PathBuf, out_apk: PathBuf },
    /// Check the signature digests of an APK
    Verify { apk: PathBuf },
}

impl Commands {
    pub fn run(self, toolchain: &Toolchain) -> Outcome {
        match self {
            Self::Decompile { apk, out_dir } => toolchain.decompile(&apk, &out_dir),
            Self::Compile {
                src_dir,
                out_apk,
                manifest,
            } => toolchain.compile(&src_dir, &out_apk, manifest.as_deref()),
            Self::Sign { in_apk, out_apk } => toolchain.sign(&in_apk, &out_apk),
            Self::Verify { apk } => toolchain.verify(&apk),
        }
    }
}
