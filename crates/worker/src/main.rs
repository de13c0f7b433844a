use crmsync::api;
use crmsync::clock::{Clock, SystemClock};
use crmsync::config;
use crmsync::crm::HttpCrmSync;
use crmsync::db;
use crmsync::jobs::maintenance::run_maintenance;
use crmsync::jobs::runner::Dispatcher;
use crmsync::telemetry;

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init(cfg.log_json);

    info!(
        worker_id = %cfg.worker_id,
        batch_size = cfg.batch_size,
        poll_interval_secs = cfg.poll_interval_secs,
        lease_seconds = cfg.lease_seconds,
        sync_timeout_secs = cfg.sync_timeout_secs,
        retention_days = cfg.retention_days,
        maintenance_interval_secs = cfg.maintenance_interval_secs,
        admin = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        immediate_first_retry = cfg.immediate_first_retry,
        "crmsync worker starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = db::open_store_from_config(&cfg, clock.clone(), cfg.migrate_on_startup).await?;

    let endpoint = cfg
        .crm_endpoint
        .clone()
        .context("CRMSYNC_CRM_ENDPOINT is missing")?;
    let crm = HttpCrmSync::new(endpoint, cfg.crm_token.clone(), cfg.sync_timeout())?;
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(crm),
        cfg.dispatcher_config(),
    ));

    // ---- API task ----
    let api_addr = cfg.admin_addr.clone();
    let app = api::router(api::ApiState {
        store: store.clone(),
        dispatcher: dispatcher.clone(),
        clock: clock.clone(),
        retention_days: cfg.retention_days,
    });

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Maintenance task ----
    let maintenance_handle = {
        let store = store.clone();
        let retention_days = cfg.retention_days;
        let mut tick = tokio::time::interval(cfg.maintenance_interval());
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                if let Err(e) = run_maintenance(store.as_ref(), retention_days).await {
                    error!(error = %e, "maintenance pass failed");
                }
            }
            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        })
    };

    // ---- Dispatch loop task ----
    let dispatch_handle = {
        let dispatcher = dispatcher.clone();
        let mut tick = tokio::time::interval(cfg.poll_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tick.tick().await;
                // A failed cycle leaves jobs leased; the next reclaim picks them up.
                if let Err(e) = dispatcher.run_cycle().await {
                    error!(error = %e, "dispatch cycle aborted");
                }
            }
            #[allow(unreachable_code)]
            Ok::<(), anyhow::Error>(())
        })
    };

    tokio::select! {
        res = api_handle => res??,
        res = maintenance_handle => res??,
        res = dispatch_handle => res??,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested; in-flight jobs will be reclaimed after their lease");
        }
    }

    Ok(())
}
