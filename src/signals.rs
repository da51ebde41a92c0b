//! Process signal handling.
//!
//! SIGINT and SIGTERM both route into [`CleanupCoordinator::trigger`], whose
//! at-most-once guard makes repeated or overlapping signals harmless. Terminating the
//! process afterwards is left to the entry point.

use crate::cleanup::{CleanupCoordinator, CleanupReport};
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// How long an interrupted run may keep going so in-flight tasks can release
/// what they started after cleanup began
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }

    /// Conventional `128 + signo` exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }
}

/// Installed handlers for the shutdown signals.
///
/// Handlers are registered by [`ShutdownListener::install`], so signals arriving
/// before the first `recv` are not lost.
#[derive(Debug)]
pub struct ShutdownListener {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl ShutdownListener {
    /// Must be called from within a tokio runtime
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
                _ = self.terminate.recv() => ShutdownSignal::Terminate,
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl+C handler unavailable; waiting indefinitely");
                std::future::pending::<()>().await;
            }
            ShutdownSignal::Interrupt
        }
    }
}

/// Wait for the first shutdown signal, then tear everything down
pub async fn cleanup_on_signal(
    mut listener: ShutdownListener,
    cleanup: &CleanupCoordinator,
) -> (ShutdownSignal, CleanupReport) {
    let received = listener.recv().await;
    let report = teardown(received, cleanup).await;
    (received, report)
}

async fn teardown(received: ShutdownSignal, cleanup: &CleanupCoordinator) -> CleanupReport {
    info!(signal = received.name(), "🛑 Received shutdown signal");

    let report = cleanup.trigger(received.name()).await;
    if !report.is_clean() {
        warn!(
            failures = report.failures.len(),
            "Some resources could not be released"
        );
    }
    report
}

/// How a supervised run ended
#[derive(Debug)]
pub enum Supervised<T> {
    Completed(T),
    /// A signal arrived first. `drained` holds the run's own result when it wound
    /// down within the drain timeout.
    Interrupted {
        signal: ShutdownSignal,
        report: CleanupReport,
        drained: Option<T>,
    },
}

/// Drive `run` until it finishes or `shutdown` resolves.
///
/// On a signal, cleanup is triggered first and `run` is then polled for up to
/// `drain_timeout`. Resources it finishes starting in that window are refused by the
/// coordinator and released by the runner, so nothing started mid-flight outlives
/// the process. A panic inside `run` triggers cleanup with reason `error` before it
/// is resumed.
pub async fn supervise<F, S>(
    run: F,
    shutdown: S,
    cleanup: &CleanupCoordinator,
    drain_timeout: Duration,
) -> Supervised<F::Output>
where
    F: Future,
    S: Future<Output = ShutdownSignal>,
{
    let run = AssertUnwindSafe(run).catch_unwind();
    tokio::pin!(run);
    tokio::pin!(shutdown);

    let outcome = tokio::select! {
        finished = &mut run => finished.map(Supervised::Completed),
        received = &mut shutdown => {
            let report = teardown(received, cleanup).await;
            match tokio::time::timeout(drain_timeout, &mut run).await {
                Ok(Ok(result)) => Ok(Supervised::Interrupted {
                    signal: received,
                    report,
                    drained: Some(result),
                }),
                Ok(Err(panic)) => Err(panic),
                Err(_) => {
                    warn!(
                        timeout_ms = drain_timeout.as_millis() as u64,
                        "Run did not wind down after cleanup; abandoning it"
                    );
                    Ok(Supervised::Interrupted {
                        signal: received,
                        report,
                        drained: None,
                    })
                }
            }
        }
    };

    match outcome {
        Ok(supervised) => supervised,
        Err(panic) => {
            error!("Run panicked; releasing resources");
            cleanup.trigger("error").await;
            std::panic::resume_unwind(panic)
        }
    }
}
