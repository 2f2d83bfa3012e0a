use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use dicom_series_loader::{
    config::PoolConfig,
    enums::{SortBy, TaskState},
    logging,
    model::DicomModel,
    pool::ExecutionPool,
    presenter::{GlobalBusyTracker, LogIndicator, ProgressPresenter},
    source::SourceDescriptor,
};

#[derive(Parser, Debug)]
#[command(name = "dicom-series-loader", version, about = "Import DICOM files and group them into series")]
struct Cli {
    /// Loaders running at once (default: $DICOM_LOADER_MAX_CONCURRENT or 3)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Ordering used when listing a series
    #[arg(long, value_enum, default_value_t = SortArg::Position)]
    sort_by: SortArg,

    /// Directories (one loader each) or single .dcm files (one loader together)
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortArg {
    Position,
    Table,
    Instance,
    None,
}

impl From<SortArg> for SortBy {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Position => SortBy::ImagePositionPatient,
            SortArg::Table => SortBy::TablePosition,
            SortArg::Instance => SortBy::InstanceNumber,
            SortArg::None => SortBy::None,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init_tracing()?;
    let cli = Cli::parse();

    let mut config = PoolConfig::from_env();
    if let Some(jobs) = cli.jobs {
        config = config.with_max_concurrent_loaders(jobs);
    }

    let model = Arc::new(DicomModel::new());
    let pool = ExecutionPool::new(model.clone(), config)?;
    let busy = GlobalBusyTracker::new();

    let mut sources = Vec::new();
    let mut loose = Vec::new();
    for path in cli.paths {
        if path.is_dir() {
            let source = SourceDescriptor::from_directory(&path)
                .with_context(|| format!("scanning {}", path.display()))?;
            sources.push((path.display().to_string(), source));
        } else {
            loose.push(path);
        }
    }
    if !loose.is_empty() {
        sources.push((format!("{} files", loose.len()), SourceDescriptor::LocalFiles(loose)));
    }

    let mut running = Vec::with_capacity(sources.len());
    for (label, source) in sources {
        let loader = pool.loader(source).build()?;
        let handle = pool.execute(loader)?;
        busy.track(&handle);
        let indicator = Arc::new(LogIndicator::new(label));
        let binding = ProgressPresenter::attach(&handle, &indicator);
        running.push((handle, indicator, binding));
    }
    pool.shutdown();

    let mut failed = 0;
    for (handle, _indicator, _binding) in &running {
        if handle.finished().await.state == TaskState::Failed {
            failed += 1;
        }
    }
    tokio::task::spawn_blocking(move || pool.await_termination(None)).await?;

    let sort_by = SortBy::from(cli.sort_by);
    for uid in model.series_uids() {
        let series = model.series(&uid, sort_by);
        let modality = series
            .first()
            .and_then(|instance| instance.modality.as_deref())
            .unwrap_or("-");
        println!("{uid}\t{modality}\t{} instances", series.len());
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} loaders failed", running.len());
    }
    Ok(())
}
