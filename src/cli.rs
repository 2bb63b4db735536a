use crate::assembler::parse_and_sort;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::forge_api::{ForgeBackend, ForgeClient};
use crate::fsops::scan_directory;
use crate::params::GenerationParameters;
use crate::payload::ReplayMode;
use crate::queue::{GenerationQueue, QueueHandle, ReplayOutcome, RunSummary};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(
    name = "forge-replay",
    version,
    about = "Replay A1111/Forge generation sidecars to reproduce or upscale images"
)]
pub struct Cli {
    /// Config file (default: forge-replay.yaml/.yml/.json in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Forge base URL, e.g. http://127.0.0.1:7860
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the service is reachable and show its current state
    Status,
    /// Parse and sort a folder without submitting anything
    Plan(ReplayArgs),
    /// Regenerate each image and sort by how closely it matches the original
    Reproduce {
        #[command(flatten)]
        args: ReplayArgs,
        /// Fraction of differing pixels below which an image counts as reproduced
        #[arg(long)]
        tolerance: Option<f64>,
    },
    /// Regenerate each image with a hi-res pass
    Upscale(ReplayArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Folder holding images and their .txt sidecars
    pub dir: PathBuf,

    /// Only replay sidecars whose text contains this keyword
    #[arg(long)]
    pub filter: Option<String>,
}

impl Cli {
    /// Applies flags on top of the loaded configuration.
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(url) = &self.url {
            config.base_url = url.clone();
        }
        if let Command::Reproduce {
            tolerance: Some(tolerance),
            ..
        } = &self.command
        {
            config.tolerance = *tolerance;
        }
    }
}

pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
    let client = ForgeClient::new(&config.base_url, config.api_key.as_deref())?;

    match &cli.command {
        Command::Status => status(&client).await,
        Command::Plan(args) => {
            let items = assemble(&client, args, &config, false).await?;
            for item in &items {
                println!(
                    "{}\t{}\t{}",
                    item.model.name,
                    item.decoder
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string()),
                    item.sidecar_path.display()
                );
            }
            println!("{} item(s)", items.len());
            Ok(())
        }
        Command::Reproduce { args, .. } => {
            replay(&client, args, &config, ReplayMode::Reproduce).await
        }
        Command::Upscale(args) => replay(&client, args, &config, ReplayMode::Upscale).await,
    }
}

async fn status(client: &ForgeClient) -> Result<()> {
    let status = client.probe().await;
    println!("{}", status.message);
    if !status.ok {
        return Err(Error::Api(crate::error::ApiError::NotRunning {
            base_url: client.base_url().to_string(),
        }));
    }

    let options = client.options().await?;
    println!(
        "Model: {}",
        options.sd_model_checkpoint.as_deref().unwrap_or("<none>")
    );
    println!("VAE: {}", options.sd_vae.as_deref().unwrap_or("<none>"));
    println!("Checkpoints: {}", client.models().await?.len());
    println!("Samplers: {}", client.samplers().await?.join(", "));
    println!("Upscalers: {}", client.upscalers().await?.join(", "));
    Ok(())
}

async fn assemble(
    client: &ForgeClient,
    args: &ReplayArgs,
    config: &AppConfig,
    prune: bool,
) -> Result<Vec<GenerationParameters>> {
    let root = canonical_root(&args.dir)?;
    let scanned = scan_directory(&root, &config.folders);
    log::info!(
        "Found {} image(s) and {} sidecar(s) under {}",
        scanned.images.len(),
        scanned.sidecars.len(),
        root.display()
    );

    let mut items = parse_and_sort(client, &root, &scanned, config, prune).await?;
    if let Some(keyword) = args.filter.as_deref() {
        items.retain(|item| item.mentions(keyword));
        log::info!("{} item(s) match \"{}\"", items.len(), keyword);
    }
    Ok(items)
}

async fn replay(
    client: &ForgeClient,
    args: &ReplayArgs,
    config: &AppConfig,
    mode: ReplayMode,
) -> Result<()> {
    let items = assemble(client, args, config, true).await?;
    let root = canonical_root(&args.dir)?;
    let queue = GenerationQueue::new(client, mode, &root, config);
    let handle = queue.handle();

    let summary = run_until_interrupted(client, &handle, queue.run(items), ctrl_c()).await?;

    for outcome in &summary.outcomes {
        if let ReplayOutcome::Failed { sidecar, message } = outcome {
            println!("FAILED {}: {}", sidecar.display(), message);
        }
    }
    println!("{}", summary);
    Ok(())
}

/// Drives `run` to completion unless `shutdown` resolves first. On shutdown
/// with work still pending, the service is told to stop generating.
async fn run_until_interrupted<B, R, S>(
    backend: &B,
    handle: &QueueHandle,
    run: R,
    shutdown: S,
) -> Result<RunSummary>
where
    B: ForgeBackend,
    R: Future<Output = Result<RunSummary>>,
    S: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = shutdown => {
            if handle.pending() > 0 {
                log::warn!("Interrupted with {} item(s) pending; stopping Forge", handle.pending());
                if let Err(error) = backend.interrupt().await {
                    log::error!("Interrupt request failed: {}", error);
                }
            }
            Err(Error::Interrupted)
        }
        summary = run => summary,
    }
}

async fn ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        log::warn!("Ctrl-C handler unavailable: {}", error);
        std::future::pending::<()>().await;
    }
}

fn canonical_root(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(Error::Config(format!("{} is not a directory", dir.display())));
    }
    Ok(dir.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn test_shutdown_with_pending_work_interrupts_forge() {
        let backend = FakeBackend::new(&["modelA"], "modelA");
        let handle = QueueHandle::default();
        handle.set(2);

        let result = run_until_interrupted(
            &backend,
            &handle,
            std::future::pending::<Result<RunSummary>>(),
            async {},
        )
        .await;

        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(backend.calls(), vec!["interrupt"]);
    }

    #[tokio::test]
    async fn test_shutdown_when_idle_skips_interrupt() {
        let backend = FakeBackend::new(&["modelA"], "modelA");
        let handle = QueueHandle::default();

        let result = run_until_interrupted(
            &backend,
            &handle,
            std::future::pending::<Result<RunSummary>>(),
            async {},
        )
        .await;

        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(backend.count("interrupt"), 0);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "forge-replay",
            "--url",
            "http://gpu-box:7861",
            "reproduce",
            "/tmp/images",
            "--tolerance",
            "0.05",
        ]);
        let mut config = AppConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.base_url, "http://gpu-box:7861");
        assert_eq!(config.tolerance, 0.05);
        assert!(matches!(cli.command, Command::Reproduce { .. }));
    }

    #[test]
    fn test_upscale_accepts_filter() {
        let cli = Cli::parse_from(["forge-replay", "upscale", "imgs", "--filter", "1girl"]);
        match cli.command {
            Command::Upscale(args) => {
                assert_eq!(args.dir, PathBuf::from("imgs"));
                assert_eq!(args.filter.as_deref(), Some("1girl"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
