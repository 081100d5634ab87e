//! The archiver daemon.
//!
//! Wires the capture pipeline together: a block source feeding the in-RAM
//! ring, the transform thread draining it into the archive through the disk
//! writer, and the TCP command server.  The main thread then parks until a
//! shutdown command arrives.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fa_capture::{run_capture, BlockSource, DeviceSource, Ring, SyntheticSource, Transform};
use fa_core::config::ArchiverConfig;
use fa_server::{ReadEngine, Server, ShutdownFlag};
use fa_store::{Archive, DiskWriter};

#[derive(Parser)]
#[command(name = "fa-archiver")]
#[command(about = "Continuous FA capture into a circular disk archive")]
struct Cli {
    /// Archive file, prepared with fa-prepare.
    archive: PathBuf,

    /// Configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sniffer device, overriding the configuration.
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Server port, overriding the configuration.
    #[arg(short = 's', long)]
    port: Option<u16>,

    /// Ring buffer size in input blocks, overriding the configuration.
    #[arg(short, long)]
    buffer_blocks: Option<usize>,

    /// Capture a fabricated orbit instead of reading the sniffer device.
    #[arg(long)]
    synthetic: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let mut config = ArchiverConfig::load(cli.config.as_ref())?;
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(blocks) = cli.buffer_blocks {
        config.buffer_blocks = blocks;
    }
    config.validate()?;

    let archive = Arc::new(
        Archive::open(&cli.archive)
            .with_context(|| format!("opening archive {}", cli.archive.display()))?,
    );
    ensure!(
        config.input_frame_count == archive.geometry().input_frame_count as usize,
        "input_frame_count {} does not match the archive's {}",
        config.input_frame_count,
        archive.geometry().input_frame_count,
    );

    let writer = Arc::new(DiskWriter::start(Arc::clone(&archive))?);
    let (ring, ring_writer) = Ring::create(config.input_block_size(), config.buffer_blocks);
    let write_enable = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(ShutdownFlag::new());

    // The transform's reserved reader registers before capture starts so
    // the very first block is archived.
    let mut transform = Transform::new(
        Arc::clone(&archive),
        Arc::clone(&writer),
        Arc::clone(&write_enable),
    );
    let mut reader = ring.add_reader(true);
    let _transform_thread = thread::Builder::new()
        .name("transform".to_string())
        .spawn(move || transform.run(&mut reader))?;

    let source: Box<dyn BlockSource> = if cli.synthetic {
        info!("capturing synthetic data");
        Box::new(SyntheticSource::new(config.sample_frequency))
    } else {
        Box::new(DeviceSource::new(&config.device))
    };
    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || run_capture(source, ring_writer))?;

    let engine = ReadEngine::new(Arc::clone(&archive), Arc::clone(&writer), config.read_buffers);
    let server = Arc::new(Server::new(
        Arc::clone(&archive),
        engine,
        ring.clone(),
        write_enable,
        Arc::clone(&shutdown),
        config.sample_frequency,
    ));
    let listener = TcpListener::bind(("0.0.0.0", config.server_port))
        .with_context(|| format!("binding port {}", config.server_port))?;
    thread::Builder::new().name("server".to_string()).spawn({
        let server = Arc::clone(&server);
        move || {
            if let Err(e) = server.run(listener) {
                error!(error = %e, "server failed");
            }
        }
    })?;

    info!(
        archive = %cli.archive.display(),
        port = config.server_port,
        blocks = archive.geometry().major_block_count,
        "archiver running"
    );
    shutdown.wait();

    // Let the write in flight finish, then leave; the capture and transform
    // threads die with the process.
    info!("shutting down");
    writer.shutdown();
    archive.flush()?;
    Ok(())
}
