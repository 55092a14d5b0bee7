//! Pre-fork worker supervision.
//!
//! The supervisor forks before any async runtime exists; each worker then
//! builds its own single-threaded event loop, runs its own lifespan
//! startup, and serves independently. Workers share nothing but the
//! listening socket (and not even that with `reuseport`). Liveness is
//! detected through per-worker heartbeat pipes: a worker whose event loop
//! stops turning stops writing, and the supervisor kills and respawns it.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use pagi_protocol::SharedApp;

use crate::config::ServerConfig;
use crate::lifespan::LifespanError;
use crate::server::{build_listener, run_worker};

/// Normal exit.
pub const EXIT_OK: i32 = 0;
/// Generic worker failure; the supervisor respawns.
pub const EXIT_FAILURE: i32 = 1;
/// Lifespan startup failed; the worker is NOT respawned.
pub const EXIT_LIFESPAN_FAILURE: i32 = 2;

const TICK: Duration = Duration::from_millis(100);

static TERM_FLAG: AtomicBool = AtomicBool::new(false);
static HUP_FLAG: AtomicBool = AtomicBool::new(false);
static TTIN_FLAG: AtomicBool = AtomicBool::new(false);
static TTOU_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn note_signal(sig: c_int) {
    if sig == Signal::SIGTERM as c_int || sig == Signal::SIGINT as c_int {
        TERM_FLAG.store(true, Ordering::SeqCst);
    } else if sig == Signal::SIGHUP as c_int {
        HUP_FLAG.store(true, Ordering::SeqCst);
    } else if sig == Signal::SIGTTIN as c_int {
        TTIN_FLAG.store(true, Ordering::SeqCst);
    } else if sig == Signal::SIGTTOU as c_int {
        TTOU_FLAG.store(true, Ordering::SeqCst);
    }
    // SIGCHLD needs no flag: every tick reaps with WNOHANG anyway.
}

fn install_parent_handlers() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(note_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGCHLD,
    ] {
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("installing the {sig} handler"))?;
    }
    Ok(())
}

struct WorkerSlot {
    pid: Pid,
    num: u32,
    heartbeat_rx: OwnedFd,
    last_beat: Instant,
    /// Removed deliberately (TTOU); do not respawn when reaped.
    retiring: bool,
}

/// Run the pre-fork supervisor. MUST be called before any async runtime or
/// extra threads exist; the parent itself never creates a runtime.
///
/// Returns the process exit code the caller should exit with.
pub fn run_multi_worker(config: ServerConfig, app: SharedApp) -> anyhow::Result<i32> {
    config.validate()?;
    anyhow::ensure!(
        config.workers >= 1,
        "run_multi_worker requires workers >= 1; use Server::run for single-process mode"
    );

    // One shared socket, inherited across fork, unless each worker binds
    // its own with SO_REUSEPORT.
    let shared_listener = if config.reuseport {
        None
    } else {
        Some(build_listener(
            config.bind,
            config.listener_backlog,
            false,
        )?)
    };

    install_parent_handlers()?;

    let mut workers: Vec<WorkerSlot> = Vec::new();
    let mut next_num: u32 = 0;
    for _ in 0..config.workers {
        workers.push(spawn_worker(
            &config,
            &app,
            shared_listener.as_ref(),
            next_num,
        )?);
        next_num += 1;
    }
    let mut target = config.workers as usize;
    tracing::info!(workers = target, addr = %config.bind, "supervisor running");

    let mut shutting_down = false;
    let mut shutdown_deadline = Instant::now();
    let mut recycle_queue: VecDeque<Pid> = VecDeque::new();
    let mut lifespan_failed = false;

    loop {
        std::thread::sleep(TICK);

        drain_heartbeats(&mut workers);

        // Reap everything that exited since the last tick.
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    on_worker_exit(
                        &config,
                        &app,
                        shared_listener.as_ref(),
                        &mut workers,
                        &mut target,
                        &mut next_num,
                        shutting_down,
                        &mut lifespan_failed,
                        pid,
                        Some(code),
                    )?;
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    tracing::warn!(%pid, signal = %sig, "worker killed");
                    on_worker_exit(
                        &config,
                        &app,
                        shared_listener.as_ref(),
                        &mut workers,
                        &mut target,
                        &mut next_num,
                        shutting_down,
                        &mut lifespan_failed,
                        pid,
                        None,
                    )?;
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "waitpid failed");
                    break;
                }
            }
        }

        if TERM_FLAG.swap(false, Ordering::SeqCst) && !shutting_down {
            shutting_down = true;
            shutdown_deadline = Instant::now() + config.shutdown_timeout;
            tracing::info!(
                workers = workers.len(),
                "shutdown requested; forwarding SIGTERM to workers"
            );
            for worker in &workers {
                let _ = signal::kill(worker.pid, Signal::SIGTERM);
            }
        }

        if shutting_down {
            if workers.is_empty() {
                return Ok(if lifespan_failed {
                    EXIT_LIFESPAN_FAILURE
                } else {
                    EXIT_OK
                });
            }
            if Instant::now() >= shutdown_deadline {
                tracing::warn!(
                    remaining = workers.len(),
                    "shutdown deadline passed; escalating to SIGKILL"
                );
                for worker in &workers {
                    let _ = signal::kill(worker.pid, Signal::SIGKILL);
                }
                for worker in &workers {
                    let _ = waitpid(worker.pid, None);
                }
                return Ok(EXIT_OK);
            }
            continue;
        }

        if workers.is_empty() && target == 0 {
            tracing::error!("no workers left and none can be started; exiting");
            return Ok(if lifespan_failed {
                EXIT_LIFESPAN_FAILURE
            } else {
                EXIT_FAILURE
            });
        }

        if HUP_FLAG.swap(false, Ordering::SeqCst) {
            tracing::info!("SIGHUP: rolling worker recycle (code is not reloaded)");
            recycle_queue = workers.iter().map(|w| w.pid).collect();
        }
        // Recycle one worker at a time: only terminate the next one once
        // the previous replacement brought the set back to strength.
        if !recycle_queue.is_empty() && workers.len() >= target {
            if let Some(pid) = recycle_queue.pop_front() {
                if workers.iter().any(|w| w.pid == pid) {
                    tracing::info!(%pid, "recycling worker");
                    let _ = signal::kill(pid, Signal::SIGTERM);
                }
            }
        }

        if TTIN_FLAG.swap(false, Ordering::SeqCst) {
            target += 1;
            tracing::info!(target, "SIGTTIN: adding a worker");
            workers.push(spawn_worker(
                &config,
                &app,
                shared_listener.as_ref(),
                next_num,
            )?);
            next_num += 1;
        }

        if TTOU_FLAG.swap(false, Ordering::SeqCst) {
            if target > 1 {
                target -= 1;
                if let Some(worker) = workers.iter_mut().max_by_key(|w| w.num) {
                    tracing::info!(pid = %worker.pid, target, "SIGTTOU: retiring a worker");
                    worker.retiring = true;
                    let _ = signal::kill(worker.pid, Signal::SIGTERM);
                }
            } else {
                tracing::info!("SIGTTOU ignored: already at one worker");
            }
        }

        if !config.heartbeat_timeout.is_zero() {
            for worker in &workers {
                if worker.last_beat.elapsed() > config.heartbeat_timeout {
                    tracing::warn!(
                        pid = %worker.pid,
                        timeout = ?config.heartbeat_timeout,
                        "worker heartbeat lost; killing"
                    );
                    let _ = signal::kill(worker.pid, Signal::SIGKILL);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn on_worker_exit(
    config: &ServerConfig,
    app: &SharedApp,
    shared_listener: Option<&std::net::TcpListener>,
    workers: &mut Vec<WorkerSlot>,
    target: &mut usize,
    next_num: &mut u32,
    shutting_down: bool,
    lifespan_failed: &mut bool,
    pid: Pid,
    code: Option<i32>,
) -> anyhow::Result<()> {
    let Some(idx) = workers.iter().position(|w| w.pid == pid) else {
        return Ok(());
    };
    let slot = workers.remove(idx);

    if code == Some(EXIT_LIFESPAN_FAILURE) {
        tracing::error!(
            %pid,
            "worker failed lifespan startup (exit code 2); not respawning"
        );
        *lifespan_failed = true;
        *target = target.saturating_sub(1);
        return Ok(());
    }
    if shutting_down || slot.retiring {
        return Ok(());
    }
    if workers.len() < *target {
        tracing::info!(%pid, code = ?code, num = slot.num, "respawning worker");
        workers.push(spawn_worker(config, app, shared_listener, slot.num)?);
        *next_num = (*next_num).max(slot.num + 1);
    }
    Ok(())
}

fn set_nonblocking(fd: &impl AsFd) -> nix::Result<()> {
    fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map(|_| ())
}

fn spawn_worker(
    config: &ServerConfig,
    app: &SharedApp,
    shared_listener: Option<&std::net::TcpListener>,
    num: u32,
) -> anyhow::Result<WorkerSlot> {
    let (heartbeat_rx, heartbeat_tx) = unistd::pipe().context("creating the heartbeat pipe")?;
    set_nonblocking(&heartbeat_rx).context("heartbeat read end")?;
    set_nonblocking(&heartbeat_tx).context("heartbeat write end")?;

    // Fork happens strictly before any runtime exists in the child.
    match unsafe { unistd::fork() }.context("fork")? {
        ForkResult::Parent { child } => {
            drop(heartbeat_tx);
            tracing::info!(pid = %child, num, "worker spawned");
            Ok(WorkerSlot {
                pid: child,
                num,
                heartbeat_rx,
                last_beat: Instant::now(),
                retiring: false,
            })
        }
        ForkResult::Child => {
            drop(heartbeat_rx);
            let code = worker_process(config, app.clone(), shared_listener, num, heartbeat_tx);
            std::process::exit(code);
        }
    }
}

/// Everything a worker does between fork and exit. All worker-owned FDs are
/// closed explicitly before the process exits.
fn worker_process(
    config: &ServerConfig,
    app: SharedApp,
    shared_listener: Option<&std::net::TcpListener>,
    num: u32,
    heartbeat_tx: OwnedFd,
) -> i32 {
    // Only the parent coordinates interactive interrupts; the parent's
    // flag handlers must not fire in this process either.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::SigIgn);
        for sig in [
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
            Signal::SIGCHLD,
        ] {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
    }

    let listener = match shared_listener {
        Some(listener) => match listener.try_clone() {
            Ok(l) => l,
            Err(err) => {
                tracing::error!(error = %err, "worker cannot clone the shared listener");
                return EXIT_FAILURE;
            }
        },
        None => match build_listener(config.bind, config.listener_backlog, true) {
            Ok(l) => l,
            Err(err) => {
                tracing::error!(error = %err, "worker cannot bind its own listener");
                return EXIT_FAILURE;
            }
        },
    };

    // The cooperative model: one event loop per worker, single-threaded.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(error = %err, "worker cannot build its event loop");
            return EXIT_FAILURE;
        }
    };

    let heartbeat_timeout = config.heartbeat_timeout;
    let result = runtime.block_on(async move {
        if !heartbeat_timeout.is_zero() {
            let interval = heartbeat_timeout / 5;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    // A full pipe means the parent is behind on draining;
                    // skipping a beat is fine, the byte is only a liveness
                    // token.
                    match unistd::write(heartbeat_tx.as_fd(), &[1u8]) {
                        Ok(_) | Err(Errno::EAGAIN) => {}
                        Err(err) => {
                            tracing::debug!(error = %err, "heartbeat pipe gone; supervisor exited?");
                            return;
                        }
                    }
                }
            });
        }
        run_worker(config.clone(), app, listener, num).await
    });

    // The runtime (and with it every connection, buffer, and the listening
    // socket) is dropped before exit.
    drop(runtime);

    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            if let Some(LifespanError::StartupFailed(message)) =
                err.downcast_ref::<LifespanError>()
            {
                tracing::error!(message = %message, num, "worker lifespan startup failed");
                EXIT_LIFESPAN_FAILURE
            } else {
                tracing::error!(error = %err, num, "worker failed");
                EXIT_FAILURE
            }
        }
    }
}

fn drain_heartbeats(workers: &mut [WorkerSlot]) {
    let mut buf = [0u8; 64];
    for worker in workers.iter_mut() {
        loop {
            match unistd::read(worker.heartbeat_rx.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => worker.last_beat = Instant::now(),
                Err(Errno::EAGAIN) => break,
                Err(err) => {
                    tracing::debug!(pid = %worker.pid, error = %err, "heartbeat read failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_OK, EXIT_LIFESPAN_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_LIFESPAN_FAILURE);
    }

    #[test]
    fn signal_handler_sets_the_right_flags() {
        note_signal(Signal::SIGTTIN as c_int);
        assert!(TTIN_FLAG.swap(false, Ordering::SeqCst));
        note_signal(Signal::SIGTERM as c_int);
        assert!(TERM_FLAG.swap(false, Ordering::SeqCst));
        assert!(!HUP_FLAG.load(Ordering::SeqCst));
    }
}
