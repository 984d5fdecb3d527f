// Background health checks for the connection pool.
//
// Every `health_check_interval` the watchdog probes idle connections and drops
// the ones that stopped answering. It exits when the pool is closed.

use tokio::task::JoinHandle;

use super::ConnectionPool;

pub fn spawn(pool: ConnectionPool) -> JoinHandle<()> {
    let interval = pool.settings().health_check_interval;
    let shutdown = pool.shutdown_token();

    tokio::spawn(async move {
        tracing::info!("pool watchdog: started (interval={}s)", interval.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let report = pool.run_health_check().await;
            if report.removed == 0 {
                tracing::debug!("pool watchdog: {} connections healthy", report.checked);
            } else {
                tracing::warn!(
                    "pool watchdog: removed {} of {} connections",
                    report.removed,
                    report.checked
                );
            }
        }

        tracing::info!("pool watchdog: stopped");
    })
}
