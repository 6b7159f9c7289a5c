use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use libblockfs::block::{BlockReadier, TlfId, UserId};
use libblockfs::cache::{BlockCache, DiskBlockCache};
use libblockfs::cadapter::{BlockServer, BlockServerClient, LocalFsBlockServer, RetryConfig};
use libblockfs::clock::WallClock;
use libblockfs::config::{Config, load_config};
use libblockfs::crypto::TlfKeys;
use libblockfs::retrieval::BlockRetrievalQueue;
use libblockfs::sync::{FolderBlockOps, FolderBranch, FolderDeps};

#[derive(Parser)]
#[command(name = "libblockfs", version, about = "Block cache and sync engine demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a file, sync it, then read it back through a cold cache.
    Demo {
        /// Block server and disk cache live under this directory
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Bytes to write
        #[arg(long, default_value_t = 1 << 20)]
        size: usize,
    },
    /// Print the status of an existing disk block cache.
    CacheStatus {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn config_from(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => load_config(p.to_str().context("config path is not valid UTF-8")?),
        None => Ok(Config::default()),
    }
}

async fn open_disk_cache(cfg: &Config, dir: &Path) -> Result<Arc<DiskBlockCache>> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create disk cache dir {}", dir.display()))?;
    let limiter = cfg.disk_cache.limiter.build(dir.to_path_buf())?;
    let cache = DiskBlockCache::open(dir, limiter, Arc::new(WallClock::new()))
        .await
        .context("Failed to open disk block cache")?;
    Ok(Arc::new(cache))
}

fn deps(
    cfg: &Config,
    keys: Arc<TlfKeys>,
    server: Arc<dyn BlockServer>,
    retrieval: Arc<BlockRetrievalQueue>,
) -> Result<FolderDeps> {
    Ok(FolderDeps {
        user: UserId([1; 16]),
        kmd: keys,
        server,
        retrieval,
        readier: BlockReadier::default(),
        splitter: Arc::new(cfg.splitter.build()?),
        clock: Arc::new(WallClock::new()),
        config: cfg.sync.clone(),
    })
}

async fn demo(data_dir: PathBuf, cfg: Config, size: usize) -> Result<()> {
    let server: Arc<dyn BlockServer> = Arc::new(BlockServerClient::new(
        LocalFsBlockServer::new(data_dir.join("blocks")),
        RetryConfig::default(),
    ));
    let cache_dir = cfg.disk_cache.dir.clone().unwrap_or_else(|| data_dir.join("cache"));
    let disk = open_disk_cache(&cfg, &cache_dir).await?;

    let tlf = TlfId::random();
    let keys = Arc::new(TlfKeys::random(tlf));
    let folder = FolderBranch::master(tlf);

    let writer_queue = Arc::new(BlockRetrievalQueue::with_prefetch_limit(
        cfg.retrieval.workers,
        cfg.retrieval.max_prefetches,
        server.clone(),
        BlockReadier::default(),
        BlockCache::new(cfg.clean_cache.capacity),
        Some(disk.clone()),
    ));
    let ops = FolderBlockOps::create(folder.clone(), deps(&cfg, keys.clone(), server.clone(), writer_queue.clone())?)
        .await?;

    let dir = ops.path("docs")?;
    let file = ops.path("docs/demo.bin")?;
    ops.create_dir(&dir).await?;
    ops.create_file(&file).await?;

    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    ops.write(&file, 0, &data).await?;
    ops.sync(&file).await?;
    let head = ops.head().await;
    println!("synced {} ({} bytes) at revision {}", file, size, head.revision);
    writer_queue.shutdown().await;

    // Fresh clean cache: every block comes from the server or the disk cache.
    let reader_queue = Arc::new(BlockRetrievalQueue::with_prefetch_limit(
        cfg.retrieval.workers,
        cfg.retrieval.max_prefetches,
        server.clone(),
        BlockReadier::default(),
        BlockCache::new(cfg.clean_cache.capacity),
        Some(disk.clone()),
    ));
    let reader = FolderBlockOps::open(folder, deps(&cfg, keys, server, reader_queue.clone())?, head)?;
    let got = reader.read(&file, 0, size).await?;
    reader_queue.shutdown().await;
    if got != data {
        bail!("read back {} bytes that differ from what was written", got.len());
    }
    println!("read back {} bytes OK", got.len());

    print!("{}", serde_yaml::to_string(&disk.status().await)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo { data_dir, config, size } => {
            let cfg = config_from(config.as_deref())?;
            demo(data_dir, cfg, size).await?;
        }
        Commands::CacheStatus { dir, config } => {
            let cfg = config_from(config.as_deref())?;
            let disk = open_disk_cache(&cfg, &dir).await?;
            print!("{}", serde_yaml::to_string(&disk.status().await)?);
        }
    }
    Ok(())
}
