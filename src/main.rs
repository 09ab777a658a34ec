use anyhow::Context;
use clap::{Parser, Subcommand};
use ollama_downloader::config::Config;
use ollama_downloader::error::DownloaderError;
use ollama_downloader::models::download::format_bytes;
use ollama_downloader::models::{
    CleanupReport, DownloadOutcome, HfReference, ModelManager, ModelReference, ModelSource,
    TagsRefresh,
};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ollama-downloader")]
#[command(about = "Verified downloads of Ollama library and Hugging Face models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective settings
    ShowConfig,
    /// List models in the Ollama library
    ListModels {
        /// Page to show, starting at 1
        #[arg(long, requires = "page_size")]
        page: Option<usize>,
        /// Models per page
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// List the tags of a library model, or of every cached model
    ListTags {
        model: Option<String>,
        /// Refresh the tags cache from the library first
        #[arg(long, overrides_with = "no_update")]
        update: bool,
        /// Only read the tags cache, never the library
        #[arg(long, overrides_with = "update")]
        no_update: bool,
    },
    /// Download a model from the Ollama library, e.g. llama3.1:8b
    ModelDownload {
        model_tag: String,
    },
    /// List Hugging Face models that can be downloaded into Ollama
    HfListModels {
        /// Page to show, starting at 1
        #[arg(long, requires = "page_size")]
        page: Option<usize>,
        /// Models per page
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// List the quantisations of a Hugging Face repository
    HfListTags {
        /// Repository as org/repo
        repo: String,
    },
    /// Download a GGUF model from Hugging Face, e.g. org/repo:Q4_K_M
    HfModelDownload {
        user_repo_quant: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<DownloaderError>() {
                Some(err) => {
                    tracing::error!(category = %err.category(), "{err}");
                    eprintln!("Error ({}): {err}", err.category());
                }
                None => {
                    tracing::error!("{e:#}");
                    eprintln!("Error: {e:#}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load().context("Failed to load settings")?;

    if let Commands::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(ExitCode::SUCCESS);
    }

    let manager = ModelManager::new(config)?;
    let cancel = manager.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling downloads");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::ShowConfig => {}
        Commands::ListModels { page, page_size } => {
            let models = manager.list_library_models().await?;
            for model in paginate(&models, page, page_size) {
                println!("{model}");
            }
        }
        Commands::ListTags {
            model,
            update,
            no_update,
        } => {
            let refresh = match (update, no_update) {
                (true, _) => TagsRefresh::Always,
                (false, true) => TagsRefresh::Never,
                (false, false) => TagsRefresh::IfMissing,
            };
            for entry in manager.list_tags(model.as_deref(), refresh).await? {
                for tag in &entry.tags {
                    println!("{}:{tag}", entry.model_name);
                }
            }
        }
        Commands::ModelDownload { model_tag } => {
            let reference: ModelReference = model_tag.parse()?;
            let outcome = manager.download(ModelSource::Ollama(reference)).await;
            return report(outcome);
        }
        Commands::HfListModels { page, page_size } => {
            let models = manager.list_hf_models().await?;
            for model in paginate(&models, page, page_size) {
                println!("{model}");
            }
        }
        Commands::HfListTags { repo } => {
            for quant in manager.list_hf_quants(&repo).await? {
                println!("{repo}:{quant}");
            }
        }
        Commands::HfModelDownload { user_repo_quant } => {
            let reference: HfReference = user_repo_quant.parse()?;
            let outcome = manager.download(ModelSource::HuggingFace(reference)).await;
            return report(outcome);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn report(outcome: DownloadOutcome) -> anyhow::Result<ExitCode> {
    match &outcome.cleanup {
        CleanupReport::Nothing => {}
        CleanupReport::Removed(paths) => {
            eprintln!("Removed {} file(s) left by the failed download", paths.len());
        }
        CleanupReport::Retained(paths) => {
            eprintln!("Kept the following for inspection (remove_downloaded_on_error = false):");
            for path in paths {
                eprintln!("  {}", path.display());
            }
        }
    }

    if outcome.is_completed() {
        let total: u64 = outcome
            .session
            .installed_blobs()
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        println!(
            "✓ {} installed ({} downloaded)",
            outcome.session.source(),
            format_bytes(total)
        );
    }
    outcome.into_result()?;
    Ok(ExitCode::SUCCESS)
}

/// Slice `items` into 1-based pages; without a page everything is shown.
fn paginate<T>(items: &[T], page: Option<usize>, page_size: Option<usize>) -> &[T] {
    let Some(size) = page_size.filter(|s| *s > 0) else {
        return items;
    };
    let page = page.unwrap_or(1).max(1);
    let start = (page - 1).saturating_mul(size).min(items.len());
    let end = start.saturating_add(size).min(items.len());
    &items[start..end]
}
