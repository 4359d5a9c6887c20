//! `optd serve`: run the Scheduler, Watchdog, Auto-Reoptimizer, and
//! leadership-lease loops concurrently until a shutdown signal arrives
//! (`SPEC_FULL.md` §5, §9, §10.5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use optd_broker::Broker;
use optd_core::leadership::{self, Leadership};
use optd_core::notifier::{CompositeNotifier, Notifier};
use optd_core::{reoptimizer, scheduler, watchdog};
use optd_db::thresholds::Thresholds;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{Instrument, error, info, warn};

/// Run every control loop until the process is asked to stop.
///
/// Thresholds are held behind an [`ArcSwap`] snapshot shared by every
/// loop, refreshed wholesale from the Store every `reload_interval` so a
/// loop iteration never reads a mix of an old and a new generation (§9).
pub async fn run_serve(pool: PgPool, broker: Broker, handoff_dir: PathBuf) -> Result<()> {
    let initial = Thresholds::from_env();
    let poll_interval = initial.supervisor_poll_interval;
    let reload_interval = initial.reload_interval;
    let thresholds = Arc::new(ArcSwap::from_pointee(initial));

    let notifier: Arc<dyn Notifier> = Arc::new(CompositeNotifier::from_env());
    let leader = Leadership::new(broker.clone(), leadership::DEFAULT_LEASE_TTL);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(reload_loop(pool.clone(), Arc::clone(&thresholds), reload_interval, shutdown_rx.clone()));
    let renewal_leader = leader.clone();
    let renewal_shutdown = shutdown_rx.clone();
    tasks.spawn(async move { renewal_leader.run(renewal_shutdown).await });
    tasks.spawn(scheduler_loop(
        pool.clone(),
        broker.clone(),
        Arc::clone(&thresholds),
        Arc::clone(&notifier),
        leader.clone(),
        poll_interval,
        shutdown_rx.clone(),
    ));
    tasks.spawn(watchdog_loop(
        pool.clone(),
        broker.clone(),
        Arc::clone(&thresholds),
        Arc::clone(&notifier),
        leader.clone(),
        poll_interval,
        shutdown_rx.clone(),
    ));
    tasks.spawn(reoptimizer_loop(
        pool.clone(),
        broker.clone(),
        Arc::clone(&thresholds),
        Arc::clone(&notifier),
        leader.clone(),
        handoff_dir,
        poll_interval,
        shutdown_rx.clone(),
    ));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight iterations");
    let _ = shutdown_tx.send(true);

    let forced = tokio::select! {
        _ = drain(&mut tasks) => false,
        _ = wait_for_shutdown_signal() => true,
    };

    if forced {
        warn!("second shutdown signal received, forcing immediate exit");
        std::process::exit(1);
    }

    leader.release().await.ok();
    pool.close().await;
    info!("optd serve shut down");
    Ok(())
}

async fn drain(tasks: &mut tokio::task::JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

/// Wait for `SIGINT` (`Ctrl+C`) or, on Unix, `SIGTERM`.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    }
}

async fn reload_loop(pool: PgPool, thresholds: Arc<ArcSwap<Thresholds>>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = *thresholds.load_full();
                match current.refresh_from_db(&pool).await {
                    Ok(next) => thresholds.store(Arc::new(next)),
                    Err(err) => warn!(%err, "failed to refresh thresholds from store"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn scheduler_loop(
    pool: PgPool,
    broker: Broker,
    thresholds: Arc<ArcSwap<Thresholds>>,
    notifier: Arc<dyn Notifier>,
    leader: Leadership,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !leader.is_held() {
                    continue;
                }
                let snapshot = *thresholds.load_full();
                let result = scheduler::run_once(&pool, &broker, &snapshot, notifier.as_ref())
                    .instrument(tracing::info_span!("scheduler.iteration"))
                    .await;
                match result {
                    Ok(report) => info!(?report, "scheduler iteration complete"),
                    Err(err) => error!(%err, "scheduler iteration failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn watchdog_loop(
    pool: PgPool,
    broker: Broker,
    thresholds: Arc<ArcSwap<Thresholds>>,
    notifier: Arc<dyn Notifier>,
    leader: Leadership,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !leader.is_held() {
                    continue;
                }
                let snapshot = *thresholds.load_full();
                let result = watchdog::run_once(&pool, &broker, &snapshot, notifier.as_ref())
                    .instrument(tracing::info_span!("watchdog.iteration"))
                    .await;
                match result {
                    Ok(report) => info!(?report, "watchdog iteration complete"),
                    Err(err) => error!(%err, "watchdog iteration failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn reoptimizer_loop(
    pool: PgPool,
    broker: Broker,
    thresholds: Arc<ArcSwap<Thresholds>>,
    notifier: Arc<dyn Notifier>,
    leader: Leadership,
    handoff_dir: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !leader.is_held() {
                    continue;
                }
                let snapshot = *thresholds.load_full();
                let result = reoptimizer::run_once(&pool, &broker, &snapshot, notifier.as_ref(), &handoff_dir)
                    .instrument(tracing::info_span!("reoptimizer.iteration"))
                    .await;
                match result {
                    Ok(outcome) => info!(?outcome, "reoptimizer iteration complete"),
                    Err(err) => error!(%err, "reoptimizer iteration failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

