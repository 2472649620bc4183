// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use odm_catalog::pipeline::filename_from_url;
use odm_catalog::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "odm-catalog", about = "Queue catalog downloads and install them")]
struct Args {
    /// JSON settings file. Defaults are used when absent.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Category the URLs are installed under.
    #[arg(long, default_value = "roms")]
    category: String,

    /// Override the number of simultaneous downloads (1-4).
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Optional SHA-256 applied when exactly one URL is given.
    #[arg(long)]
    sha256: Option<String>,

    /// Only report which items are already installed.
    #[arg(long)]
    scan: bool,

    #[arg(required = true)]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn")),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("reading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(n) = args.max_concurrent {
        settings.max_concurrent = n;
    }
    let settings = Arc::new(settings.validated());

    let items = build_items(&args)?;

    if args.scan {
        let installed = scan_all(&items, &settings).await;
        for item in &items {
            println!("{:<40} {:?}", item.name, item.presence());
        }
        println!("{} of {} installed", installed, items.len());
        return Ok(());
    }

    let transport = Arc::new(HttpTransport::new(&settings).context("building http client")?);
    let pipeline = Pipeline::new(transport, settings.clone());
    let queue = Arc::new(DownloadQueue::new(pipeline));

    for item in &items {
        let id = queue.enqueue(item.clone()).await;
        info!(entry = %id, url = %item.url, "enqueued");
    }

    let ctrl_c_queue = queue.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling downloads");
            for entry in ctrl_c_queue.snapshot().await {
                let _ = ctrl_c_queue.cancel(entry.id).await;
            }
        }
    });

    let finished = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let entries = queue.snapshot().await;
        for entry in &entries {
            render(entry);
        }
        if entries.iter().all(|e| e.status.is_terminal()) {
            break entries;
        }
    };

    queue.shutdown().await;

    let failed: Vec<_> = finished
        .iter()
        .filter(|e| e.status != EntryStatus::Completed)
        .collect();
    for entry in &failed {
        println!("{} {}: {:?} {}", entry.id, entry.name, entry.status, entry.error_message);
    }
    if !failed.is_empty() {
        bail!("{} of {} downloads did not complete", failed.len(), finished.len());
    }
    println!("All {} downloads completed.", finished.len());
    Ok(())
}

fn build_items(args: &Args) -> Result<Vec<Arc<CatalogItem>>> {
    let single = args.urls.len() == 1;
    args.urls
        .iter()
        .map(|url| {
            let name = filename_from_url(url).with_context(|| format!("bad url {}", url))?;
            let display = match name.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                _ => name.clone(),
            };
            let mut item = CatalogItem::new(url.clone(), display, url.clone(), &args.category, 0);
            if let (true, Some(sum)) = (single, &args.sha256) {
                item = item.with_sha256(sum.clone());
            }
            Ok(Arc::new(item))
        })
        .collect()
}

fn render(entry: &EntrySnapshot) {
    let percent = match entry.percent() {
        p if p < 0 => "  ?%".to_string(),
        p => format!("{:>3}%", p),
    };
    println!(
        "[{}] {:<30} {:<12} {} {:>10} {}",
        entry.id,
        entry.name,
        format!("{:?}", entry.status),
        percent,
        format_speed(entry.speed),
        entry.status_text
    );
}
