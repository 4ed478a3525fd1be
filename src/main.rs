use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{Receiver, Sender, bounded, select};

use netdivert::cli::Cli;
use netdivert::driver::MemoryDriver;
use netdivert::error::DivertError;
use netdivert::metadata::Metadata;
use netdivert::output::{self, PacketRecord, Verdict};
use netdivert::packet::Packet;
use netdivert::replay;
use netdivert::rewrite::{self, PortRedirect};
use netdivert::{Divert, Session};

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

fn exit_code(err: &DivertError) -> i32 {
    match err {
        DivertError::Resource { .. } => 1,
        DivertError::InvalidArgument(_)
        | DivertError::UnsupportedProtocol { .. }
        | DivertError::Parse { .. }
        | DivertError::Malformed(_) => 2,
        DivertError::Output(_) | DivertError::Fatal(_) => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli)));

    match result {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
        Err(_) => {
            eprintln!("error: fatal: unexpected panic");
            std::process::exit(4);
        }
    }
}

/// Messages from the capture worker to the output loop.
enum Event {
    Packet(PacketRecord),
    Failed(DivertError),
}

/// What the capture worker does with each packet.
struct LoopConfig {
    redirects: Vec<PortRedirect>,
    sniff: bool,
    drop: bool,
    count: Option<u64>,
}

fn run(cli: Cli) -> Result<(), DivertError> {
    // 0. Install signal handlers for graceful shutdown.
    install_signal_handlers();

    // 1. Pick the capture backend.
    let (divert, replay_driver) = open_backend(&cli)?;

    // 2. Open the session and apply queue parameters.
    let session = Arc::new(divert.open_session(cli.session_config())?);
    for (param, value) in cli.params() {
        session.set_param(param, value)?;
        log::info!("Set {param}={value}");
    }

    // 3. Feed replayed traffic, if any. The worker stops once it has seen
    //    everything that was queued.
    let mut count = cli.count;
    if let (Some(driver), Some(path)) = (&replay_driver, &cli.replay) {
        let packets = replay::load_replay(path)?;
        let queued: usize = packets
            .iter()
            .map(|(raw, meta)| driver.inject(raw, *meta))
            .sum();
        log::info!("Replaying {queued} of {} packets", packets.len());
        count = Some(count.map_or(queued as u64, |c| c.min(queued as u64)));
    }

    let loop_cfg = LoopConfig {
        redirects: cli.redirect.clone(),
        sniff: cli.sniff,
        drop: cli.drop,
        count,
    };

    // 4. Spawn the capture worker.
    // Capacity 1024: records are small and the writer only blocks on stdout.
    let (tx, rx) = bounded::<Event>(1024);
    let worker = {
        let session = Arc::clone(&session);
        thread::Builder::new()
            .name("netdivert-capture".into())
            .spawn(move || capture_loop(&session, &loop_cfg, &tx))
            .map_err(|e| DivertError::Fatal(format!("spawn capture thread: {e}")))?
    };

    // 5. Stream records until the worker finishes or a signal arrives.
    let result = output_loop(&cli, &rx, &session);

    // 6. Closing the session is what unblocks a pending receive.
    if session.is_open()
        && let Err(e) = session.close()
    {
        log::warn!("Close failed: {e}");
    }
    if worker.join().is_err() {
        return Err(DivertError::Fatal("capture thread panicked".to_string()));
    }
    // Records the worker produced after the output loop stopped.
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in rx.try_iter() {
        if let Event::Packet(record) = event {
            output::write_record(&record, cli.format, &mut out)?;
        }
    }
    out.flush().map_err(DivertError::Output)?;

    result
}

fn open_backend(cli: &Cli) -> Result<(Divert, Option<Arc<MemoryDriver>>), DivertError> {
    if cli.replay.is_some() {
        let (divert, driver) = Divert::memory();
        return Ok((divert, Some(driver)));
    }
    open_driver(cli).map(|d| (d, None))
}

#[cfg(target_os = "windows")]
fn open_driver(cli: &Cli) -> Result<Divert, DivertError> {
    match &cli.dll {
        Some(path) => Divert::load(path),
        None => Divert::load_default(),
    }
}

#[cfg(not(target_os = "windows"))]
fn open_driver(_cli: &Cli) -> Result<Divert, DivertError> {
    Err(DivertError::InvalidArgument(
        "the WinDivert backend is only available on Windows; use --replay".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Output loop (main thread)
// ---------------------------------------------------------------------------

fn output_loop(cli: &Cli, rx: &Receiver<Event>, session: &Session) -> Result<(), DivertError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            log::info!("Shutdown requested");
            return Ok(());
        }
        select! {
            recv(rx) -> msg => match msg {
                Ok(Event::Packet(record)) => {
                    output::write_record(&record, cli.format, &mut out)?;
                    out.flush().map_err(DivertError::Output)?;
                }
                Ok(Event::Failed(e)) => return Err(e),
                // Worker finished.
                Err(_) => return Ok(()),
            },
            default(Duration::from_millis(200)) => {
                if !session.is_open() {
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Capture worker
// ---------------------------------------------------------------------------

fn capture_loop(session: &Session, cfg: &LoopConfig, tx: &Sender<Event>) {
    let mut seq: u64 = 0;
    loop {
        if cfg.count.is_some_and(|n| seq >= n) {
            log::info!("Captured {seq} packets, stopping");
            return;
        }

        let (raw, meta) = match session.receive_raw() {
            Ok(received) => received,
            Err(e) => {
                // A close from the main thread ends the pending receive.
                if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) || !session.is_open() {
                    log::debug!("Receive ended by close: {e}");
                } else {
                    let _ = tx.send(Event::Failed(e));
                }
                return;
            }
        };
        seq += 1;

        match handle_packet(session, cfg, seq, raw, meta) {
            Ok(Some(record)) => {
                if tx.send(Event::Packet(record)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Event::Failed(e));
                return;
            }
        }
    }
}

/// Rewrite, checksum and reinject one packet according to `cfg`.
fn handle_packet(
    session: &Session,
    cfg: &LoopConfig,
    seq: u64,
    raw: Vec<u8>,
    meta: Metadata,
) -> Result<Option<PacketRecord>, DivertError> {
    let mut packet = match Packet::parse_with_meta(raw.clone(), Some(meta)) {
        Ok(p) => p,
        Err(e) => {
            // Unparseable packets pass through untouched.
            log::warn!("Packet #{seq} not parsed: {e}");
            if !cfg.sniff && !cfg.drop {
                session.send(&raw, &meta)?;
            }
            return Ok(None);
        }
    };

    let rewritten = !cfg.sniff && rewrite::apply_all(&cfg.redirects, &mut packet)?;
    if rewritten {
        packet.update_checksums();
    }

    let verdict = if cfg.sniff {
        Verdict::Sniffed
    } else if cfg.drop {
        Verdict::Dropped
    } else {
        session.send_packet(&packet)?;
        Verdict::Reinjected
    };
    Ok(Some(PacketRecord::from_packet(
        seq, &packet, verdict, rewritten,
    )))
}
