/*!
 * Suspend Probe - Main Entry Point
 *
 * Exercises the engine end to end:
 * - Initializes tracing and the suspend signals
 * - Suspends a busy worker, inspects its saved context, resumes it
 * - Prints engine statistics as JSON
 */

use anyhow::{bail, Context, Result};
use signal_suspend::{init_signals, init_tracing, SuspendKind, SuspendOutcome, SuspendRoute};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::info;

const ROUNDS: usize = 5;

fn main() -> Result<()> {
    init_tracing();

    let runtime = init_signals();
    info!(signals = ?runtime.signals(), "Suspend probe starting");

    let counter = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();

    let worker = {
        let counter = counter.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("busy-worker".into())
            .spawn(move || -> Result<()> {
                let record = runtime.attach_current_thread()?;
                ready_tx.send(record.tid()).context("probe went away")?;
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
                runtime.detach_current_thread()?;
                Ok(())
            })
            .context("failed to spawn worker")?
    };

    let tid = ready_rx.recv().context("worker exited before attaching")?;
    let coordinator = runtime.coordinator();
    let target = coordinator.thread(tid)?;

    for round in 0..ROUNDS {
        thread::sleep(Duration::from_millis(10));

        if coordinator.request_suspend(&target, SuspendKind::Signal)? != SuspendRoute::Runtime {
            bail!("worker unexpectedly claimed by a foreign runtime");
        }
        let outcome = coordinator.wait_for_suspend(&target);
        let parked_at = counter.load(Ordering::Relaxed);
        let saved = target.saved_context();

        info!(
            round,
            ?outcome,
            counter = parked_at,
            ip = ?saved.instruction_pointer().map(|ip| format!("{:#x}", ip)),
            sp = ?saved.stack_pointer().map(|sp| format!("{:#x}", sp)),
            "Worker suspended"
        );
        if outcome != SuspendOutcome::Captured {
            bail!("worker context was not captured: {:?}", outcome);
        }
        if counter.load(Ordering::Relaxed) != parked_at {
            bail!("worker kept running while suspended");
        }

        coordinator.request_resume(&target)?;
        coordinator.wait_for_resume(&target);
    }

    stop.store(true, Ordering::Relaxed);
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("worker panicked"))??;

    println!("{}", serde_json::to_string_pretty(&runtime.stats())?);
    Ok(())
}
