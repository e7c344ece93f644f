use std::fs;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use leechbit_lib::metainfo::MetaInfo;
use leechbit_lib::storage::{FileStorage, PieceStorage, StorageManager, TorrentFileMetadata};
use leechbit_lib::torrent_meta::TorrentMeta;
use leechbit_lib::tracker::{self, EventType, TrackerRequest};
use leechbit_lib::util::generate_peer_id;
use leechbit_lib::{download, ClientConfig, DownloadOutcome};
use tokio::sync::oneshot;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

const TRACING_ENV: &str = "LEECHBIT_LOG";

#[derive(Parser, Debug)]
#[command(version)]
struct Arguments {
    /// Torrent file to use
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent: String,
    /// Where to save the downloaded torrents
    #[arg(short, long, value_name = "OUTPUT_DIR", default_value = Path::new("./downloads").to_path_buf().into_os_string())]
    pub output_dir: PathBuf,
    /// The port announced to the tracker
    #[arg(short, long, default_value_t = ClientConfig::DEFAULT_PORT)]
    pub port: u16,
    /// How many peers to connect to at most
    #[arg(long, default_value_t = 30)]
    pub max_peers: usize,
    /// Timeout for connecting to a peer and for its handshake
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
    /// How long a single event loop pass waits for peer activity
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,
    /// Drop a peer after it sent this many corrupted pieces
    #[arg(long, default_value_t = 3)]
    pub max_hash_failures: usize,
}

impl Arguments {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            port: self.port,
            max_peers: self.max_peers,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_hash_failures: self.max_hash_failures,
            ..Default::default()
        }
    }
}

#[tokio::main(flavor = "current_thread")]
#[tracing::instrument(err)]
async fn main() -> anyhow::Result<ExitCode> {
    setup_logger();

    let args = Arguments::parse();
    let config = args.client_config();

    let torrent_file = read_file(&args.torrent)?;
    let meta_info = MetaInfo::from_bytes(&torrent_file).context("error while parsing the torrent file")?;
    let meta = TorrentMeta::from_info(&meta_info.info).context("bad torrent metadata")?;

    let file_metadata =
        TorrentFileMetadata::new(&meta_info.info, &args.output_dir).context("bad file layout in the torrent")?;
    let backend = FileStorage::new(&file_metadata.file_infos).context("error while creating a file-based storage")?;
    let mut storage = StorageManager::new(backend, file_metadata, meta.number_of_pieces);

    let verified = storage
        .restore_verified_pieces(&meta)
        .context("error while checking existing data")?;
    if verified == meta.number_of_pieces {
        tracing::info!("all pieces are already downloaded, exiting");
        return Ok(ExitCode::SUCCESS);
    }

    let left = (0..meta.number_of_pieces as u32)
        .filter(|index| !storage.have_bitfield()[*index as usize])
        .map(|index| meta.piece_size(index).map(|size| size as u64))
        .sum::<leechbit_lib::Result<u64>>()?;
    let downloaded = meta.total_length as u64 - left;

    let peer_id = generate_peer_id();
    let client = reqwest::Client::builder()
        .gzip(true)
        .build()
        .context("building reqwest client")?;

    let mut peers = Vec::new();
    for url in meta_info.announce_urls() {
        let request = TrackerRequest::new(
            meta.info_hash,
            peer_id,
            config.port,
            downloaded,
            left,
            Some(EventType::Started),
        );
        match tracker::announce(&client, url, request)
            .await
            .and_then(|response| response.get_peers())
        {
            Ok(tracker_peers) => {
                tracing::info!(url, peers = tracker_peers.len(), "got peers from the tracker");
                peers = tracker_peers;
                break;
            }
            Err(e) => tracing::warn!(url, "tracker announce failed: {:#}", e),
        }
    }
    anyhow::ensure!(!peers.is_empty(), "none of the trackers returned any peers");

    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(());
        }
    });

    match download(meta, storage, peers, peer_id, &config, stop_rx).await? {
        DownloadOutcome::Complete => {
            tracing::info!(output_dir = %args.output_dir.display(), "torrent downloaded");
            Ok(ExitCode::SUCCESS)
        }
        DownloadOutcome::Incomplete { missing } => {
            tracing::warn!(missing = missing.len(), "download is incomplete");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_file(path: &str) -> anyhow::Result<Vec<u8>> {
    let mut buffer = vec![];
    let mut file = fs::File::open(path).with_context(|| format!("opening {}", path))?;
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn setup_logger() {
    let env_filter = EnvFilter::builder()
        .with_env_var(TRACING_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt().compact().with_env_filter(env_filter).finish();

    tracing::subscriber::set_global_default(subscriber).expect("Error setting a global tracing::subscriber");
}
