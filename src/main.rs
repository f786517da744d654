use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use nvbridge::dispatch::FnTable;
use nvbridge::scsi::state::ControlState;
use nvbridge::sim::{self, SimulatedDevice};
use nvbridge::usb::cbw::{
    CBW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, Direction, TagGenerator,
};
use nvbridge::{Admission, Bridge, BridgeConfig, BridgeError};

/// Drives the bridge core against a simulated host and NVMe controller.
#[derive(Parser, Debug)]
#[command(name = "nvbridge", version)]
struct Args {
    /// JSON bridge configuration; unset fields keep their defaults
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of READ/WRITE commands the host issues
    #[arg(long, default_value_t = 64)]
    commands: u32,

    /// Blocks per READ/WRITE command
    #[arg(long, default_value_t = 8)]
    blocks: u16,

    /// LBA the simulated namespace fails on; repeatable
    #[arg(long, value_name = "LBA")]
    fail_lba: Vec<u64>,

    /// Print the run summary as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    issued: usize,
    passed: usize,
    failed: usize,
    phase_errors: usize,
    data_bytes: usize,
    residue_bytes: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            BridgeConfig::from_json(&text)?
        }
        None => BridgeConfig::default(),
    };

    let mut device = SimulatedDevice::new(cfg.namespace_blocks);
    for &lba in &args.fail_lba {
        device.fail_lba(lba);
    }
    let mut bridge = Bridge::new(device, sim::firmware_routines(), cfg);
    bridge.post_state(ControlState::PowerCheck, 0);

    let (cbw_tx, cbw_rx) = mpsc::channel(8);
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let firmware = tokio::spawn(firmware(bridge, cbw_rx, frame_tx));
    let summary = host(&args, cbw_tx, frame_rx).await?;
    let executed = firmware.await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    info!(?summary, nvme_commands = executed, "run complete");
    Ok(())
}

/// The bridge side: admits wrappers as slots allow and runs the control
/// cycle on a fixed tick. Returns the number of NVMe commands executed.
async fn firmware(
    mut bridge: Bridge<SimulatedDevice, FnTable>,
    mut cbws: mpsc::Receiver<[u8; CBW_SIZE]>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<u64> {
    let mut tick = time::interval(Duration::from_millis(1));
    let mut backlog = VecDeque::new();
    let mut open = true;

    loop {
        tokio::select! {
            received = cbws.recv(), if open && backlog.is_empty() => match received {
                Some(cbw) => backlog.push_back(cbw),
                None => open = false,
            },
            _ = tick.tick() => {
                while let Some(cbw) = backlog.front() {
                    match bridge.accept_cbw(cbw) {
                        Ok(Admission::Admitted(_)) => {}
                        Ok(Admission::Backpressure) => break,
                        Err(BridgeError::Cbw(err)) => warn!(%err, "stalling bulk-out endpoint"),
                        Err(err) => return Err(err.into()),
                    }
                    backlog.pop_front();
                }
                let report = bridge.run_cycle()?;
                if report.drained.processed > 0 {
                    debug!(drained = report.drained.processed, emitted = report.emitted.len(), "cycle");
                }
                for frame in bridge.regs_mut().take_frames() {
                    frames.send(frame)?;
                }
                if !open && backlog.is_empty() && bridge.slots().in_flight() == 0 {
                    break;
                }
            }
        }
    }
    Ok(bridge.regs().executed())
}

fn read_write(tag: u32, write: bool, lba: u32, blocks: u16, block_size: u32) -> CommandBlockWrapper {
    let mut cdb = [0u8; 10];
    cdb[0] = if write { 0x2A } else { 0x28 };
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    let direction = if write {
        Direction::HostToDevice
    } else {
        Direction::DeviceToHost
    };
    CommandBlockWrapper::new(tag, blocks as u32 * block_size, direction, 0, &cdb)
}

/// The host side: issues a mount-like sequence followed by media traffic and
/// matches every status wrapper to its command.
async fn host(
    args: &Args,
    cbws: mpsc::Sender<[u8; CBW_SIZE]>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<Summary> {
    let block_size = 512;
    let mut tags = TagGenerator::new();
    let mut open: HashMap<u32, &'static str> = HashMap::new();
    let mut issue = |name: &'static str, len: u32, direction: Direction, cdb: &[u8]| {
        (name, CommandBlockWrapper::new(tags.tag(), len, direction, 0, cdb))
    };
    let mut wrappers = vec![
        issue("TEST UNIT READY", 0, Direction::HostToDevice, &[0x00; 6]),
        issue("INQUIRY", 36, Direction::DeviceToHost, &[0x12, 0, 0, 0, 36, 0]),
        issue("READ CAPACITY (10)", 8, Direction::DeviceToHost, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
    ];
    let tail = [
        issue("SYNCHRONIZE CACHE (10)", 0, Direction::HostToDevice, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
        issue("READ FORMAT CAPACITIES", 252, Direction::DeviceToHost, &[0x23, 0, 0, 0, 0, 0, 0, 0, 0xFC, 0]),
    ];
    for n in 0..args.commands {
        let lba = n * args.blocks as u32;
        let write = n % 4 == 3;
        let name = if write { "WRITE (10)" } else { "READ (10)" };
        wrappers.push((name, read_write(tags.tag(), write, lba, args.blocks, block_size)));
    }
    wrappers.extend(tail);

    let mut summary = Summary::default();
    for (name, cbw) in &wrappers {
        open.insert(cbw.tag, *name);
        cbws.send(cbw.to_bytes()).await?;
        summary.issued += 1;
    }
    // A corrupted wrapper: the bridge stalls and never answers it.
    let mut garbage = wrappers[0].1.to_bytes();
    garbage[3] = b'X';
    cbws.send(garbage).await?;
    drop(cbws);

    while !open.is_empty() {
        let frame = time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .wrap_err("bridge stopped answering")?
            .ok_or_else(|| eyre!("bridge hung up with {} commands open", open.len()))?;
        let Ok(csw) = CommandStatusWrapper::parse(&frame) else {
            summary.data_bytes += frame.len();
            continue;
        };
        let Some(name) = open.remove(&csw.tag) else {
            warn!(tag = csw.tag, "status for a command never issued");
            continue;
        };
        summary.residue_bytes += csw.data_residue as u64;
        match csw.status {
            CommandStatus::Passed => summary.passed += 1,
            CommandStatus::Failed => summary.failed += 1,
            CommandStatus::PhaseError => summary.phase_errors += 1,
        }
        debug!(tag = csw.tag, name, status = ?csw.status, residue = csw.data_residue, "status");
    }
    Ok(summary)
}
