//! fur-bake - fur length/visibility mask baker
//!
//! Bakes per-material length and alpha masks from glTF surfaces described
//! in a fur-bake.toml manifest.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use fur_bake::{BakeSession, ProgressAction, TickStatus};
use std::path::PathBuf;

use fur_bake_cli::{BakeManifest, write_outputs};

#[derive(Parser)]
#[command(name = "fur-bake")]
#[command(about = "Fur length/visibility mask baker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bake textures from a manifest file
    Bake {
        /// Path to fur-bake.toml manifest
        #[arg(default_value = "fur-bake.toml")]
        manifest: PathBuf,

        /// Output directory (overrides manifest)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Texture size (overrides manifest settings)
        #[arg(short, long)]
        size: Option<u32>,
    },

    /// Validate manifest without baking
    Check {
        /// Path to fur-bake.toml manifest
        #[arg(default_value = "fur-bake.toml")]
        manifest: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bake {
            manifest,
            output,
            size,
        } => {
            tracing::info!("Baking from {:?}", manifest);
            let mut config = BakeManifest::load(&manifest)?;
            if let Some(size) = size {
                config.settings.texture_size = size;
            }
            config.validate()?;

            let input = config.load_input()?;
            let mut session = BakeSession::new(input)?;
            let mut progress = |p: f32, message: &str| {
                tracing::info!("{:>3.0}% {}", p * 100.0, message);
                ProgressAction::Continue
            };

            match session.run_to_end(&mut progress) {
                TickStatus::Completed(baked) => {
                    let dir = output.unwrap_or(config.output);
                    let written = write_outputs(&baked, &dir)?;
                    for path in &written {
                        tracing::info!("Wrote {}", path.display());
                    }
                    tracing::info!("Bake complete!");
                }
                TickStatus::Cancelled | TickStatus::Continue => {
                    bail!("Bake was cancelled, see log for details")
                }
            }
        }

        Commands::Check { manifest } => {
            tracing::info!("Checking manifest {:?}", manifest);
            let config = BakeManifest::load(&manifest)?;
            config.validate()?;
            let input = config.load_input()?;
            tracing::info!(
                "Manifest is valid: {} surfaces, {} occluders, {} normal maps",
                input.surfaces.len(),
                input.occluders.len(),
                input.normal_maps.len()
            );
        }
    }

    Ok(())
}
