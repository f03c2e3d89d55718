//! Minimal collector: answers every TCP connection with one CSV sample

use std::path::PathBuf;
use std::time::Instant;

use chrono::Local;
use clap::Parser;
use sysinfo::{Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use sysmon::{Reading, config::load_config, util::init_tracing};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, trace};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Parser)]
#[command(about = "Serve system health samples over TCP")]
struct Args {
    /// Config file (defaults to $SYSMON_CONFIG, then built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct Sampler {
    sys: System,
    networks: Networks,
    last: Instant,
}

impl Sampler {
    fn new() -> Self {
        let mut sampler = Self {
            sys: System::new(),
            networks: Networks::new_with_refreshed_list(),
            last: Instant::now(),
        };
        sampler.refresh();
        sampler
    }

    fn refresh(&mut self) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_disk_usage(),
        );
        self.networks.refresh(true);
    }

    /// Take a sample. Rates are averaged over the time since the last one.
    fn sample(&mut self) -> Reading {
        self.refresh();
        let elapsed = self.last.elapsed().as_secs_f64().max(0.001);
        self.last = Instant::now();

        let memory_usage = match self.sys.total_memory() {
            0 => 0.0,
            total => self.sys.used_memory() as f64 / total as f64 * 100.0,
        };

        let disk_bytes: u64 = self
            .sys
            .processes()
            .values()
            .map(|process| {
                let usage = process.disk_usage();
                usage.read_bytes + usage.written_bytes
            })
            .sum();

        let network_bytes: u64 = self
            .networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();

        Reading {
            cpu_usage: round(f64::from(self.sys.global_cpu_usage())),
            memory_usage: round(memory_usage),
            disk_io: round(disk_bytes as f64 / BYTES_PER_MB / elapsed),
            network_usage: round(network_bytes as f64 / BYTES_PER_MB / elapsed),
            timestamp: Local::now().naive_local(),
        }
    }
}

fn round(value: f64) -> f64 {
    ((value * 100.0).round() / 100.0).max(0.0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("collector");
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = load_config(args.config.as_deref())?;
    let address = config.collector.address();

    let listener = TcpListener::bind(&address).await?;
    info!("collector listening on {address}");

    let mut sampler = Sampler::new();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(connection) => connection,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };

        let record = sampler.sample().to_record();
        serve(socket, peer, record).await;
    }
}

#[instrument(skip(socket, record))]
async fn serve(mut socket: tokio::net::TcpStream, peer: std::net::SocketAddr, record: String) {
    debug!("sending {record}");

    if let Err(e) = socket.write_all(record.as_bytes()).await {
        error!("failed to send sample: {e}");
        return;
    }

    if let Err(e) = socket.shutdown().await {
        debug!("shutdown failed: {e}");
    }
}
