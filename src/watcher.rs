//! The API watcher: a single worker task that reconciles the projection with
//! the ledger, catches up, then follows new events and refreshes the mempool
//! view. The task owns the projection's write connection for its lifetime.

use anyhow::Result;
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database;
use crate::event::Event;
use crate::{mempool, projection};

const PROGRESS_INTERVAL: i64 = 50_000;

pub struct ApiWatcher {
    api_db: sqlx::SqlitePool,
    ledger_db: sqlx::SqlitePool,
    config: Config,
    stop_rx: watch::Receiver<bool>,
    /// Mempool transactions known to produce unrecoverable uniqueness
    /// violations; process-lifetime, owned here.
    mempool_skip_list: HashSet<String>,
    last_mempool_sync: Option<Instant>,
}

/// Control handle for a running watcher task.
pub struct ApiWatcherHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<Result<()>>,
}

impl ApiWatcherHandle {
    /// Signal the watcher to stop, wait for the in-flight transaction to
    /// finish, and surface whatever ended the loop.
    pub async fn stop(self) -> Result<()> {
        info!("Stopping API watcher...");
        let _ = self.stop_tx.send(true);
        self.join.await??;
        info!("API watcher stopped");
        Ok(())
    }
}

/// Bring the projection store up (migrations, reserved assets) and spawn the
/// watcher task.
pub async fn start(config: &Config) -> Result<ApiWatcherHandle> {
    info!("Initializing API watcher...");
    let api_db = database::open_projection_db(&config.storage.api_database_path()).await?;
    database::apply_migrations(&api_db, config.watcher.migration_lock_timeout()).await?;
    database::seed_reserved_assets(&api_db).await?;
    let ledger_db = database::open_ledger_db(&config.storage.ledger_database_path()).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher = ApiWatcher {
        api_db,
        ledger_db,
        config: config.clone(),
        stop_rx,
        mempool_skip_list: HashSet::new(),
        last_mempool_sync: None,
    };
    let join = tokio::spawn(watcher.run());
    Ok(ApiWatcherHandle { stop_tx, join })
}

/// Truncate the projection tail until its head event matches the ledger by
/// fingerprint. Afterwards the projection is a prefix of the ledger; the loop
/// runs one single-event rollback per level of divergence.
pub async fn reconcile(api_db: &sqlx::SqlitePool, ledger_db: &sqlx::SqlitePool) -> Result<()> {
    loop {
        let Some(head) = database::get_last_stored_event(api_db).await? else {
            return Ok(());
        };
        let ledger_event = database::get_ledger_event(ledger_db, head.message_index).await?;
        let aligned = match &ledger_event {
            Some(event) => event.event_hash == head.event_hash,
            None => false,
        };
        if aligned {
            return Ok(());
        }
        warn!(
            message_index = head.message_index,
            "Projection head diverged from ledger, rolling back one event"
        );
        projection::rollback_last_event(api_db).await?;
    }
}

/// Standalone rollback of every event at or above `block_index`; the
/// operational entry point used when the ledger rewinds out from under a
/// stopped watcher.
pub async fn rollback(config: &Config, block_index: i64) -> Result<()> {
    let api_db = database::open_projection_db(&config.storage.api_database_path()).await?;
    let result = projection::rollback(&api_db, block_index).await;
    api_db.close().await;
    result
}

impl ApiWatcher {
    async fn run(mut self) -> Result<()> {
        info!("Starting API watcher...");
        let result = self.watch().await;
        if let Err(error) = &result {
            error!("API watcher halted: {error:#}");
        }
        // Release both handles deterministically, success or not.
        self.api_db.close().await;
        self.ledger_db.close().await;
        result
    }

    async fn watch(&mut self) -> Result<()> {
        self.catch_up().await?;
        self.follow().await
    }

    fn stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn catch_up(&mut self) -> Result<()> {
        reconcile(&self.api_db, &self.ledger_db).await?;
        mempool::clean_all(&self.api_db).await?;

        let to_parse = database::get_event_to_parse_count(&self.api_db, &self.ledger_db).await?;
        if to_parse > 0 {
            info!("{to_parse} events to catch up...");
        }

        let start = Instant::now();
        let mut parsed: i64 = 0;
        while !self.stopping() {
            let Some(event) =
                database::get_next_event_to_parse(&self.api_db, &self.ledger_db).await?
            else {
                break;
            };
            let block_parsed = event.event == "BLOCK_PARSED";
            projection::parse_event(&self.api_db, &event).await?;
            parsed += 1;
            if parsed % PROGRESS_INTERVAL == 0 {
                let duration = start.elapsed().as_secs_f64();
                let expected = duration / parsed as f64 * to_parse as f64;
                info!(
                    "{parsed}/{to_parse} events parsed in {duration:.2} seconds \
                     (expected {expected:.2} seconds)"
                );
            }
            if block_parsed {
                self.maybe_synchronize_mempool().await?;
            }
        }
        if parsed > 0 {
            info!(
                "{parsed} events parsed in {:.2} seconds",
                start.elapsed().as_secs_f64()
            );
        }
        Ok(())
    }

    /// Apply the next ledger event, if one is pending. A next event below the
    /// projection's head block means the ledger rewound: truncate first.
    async fn parse_next_event(&mut self) -> Result<Option<Event>> {
        let Some(event) =
            database::get_next_event_to_parse(&self.api_db, &self.ledger_db).await?
        else {
            return Ok(None);
        };

        if !event.is_mempool() {
            if let Some(last_block) = database::get_last_block_index(&self.api_db).await? {
                if last_block > event.block_index {
                    warn!(
                        last_block,
                        next_block = event.block_index,
                        "Ledger rewound below projection head, rolling back"
                    );
                    projection::rollback(&self.api_db, event.block_index).await?;
                }
            }
        }

        projection::parse_event(&self.api_db, &event).await?;
        Ok(Some(event))
    }

    async fn follow(&mut self) -> Result<()> {
        while !self.stopping() {
            let parsed = self.parse_next_event().await?;
            let mempool_due = match &parsed {
                Some(event) => event.event == "BLOCK_PARSED",
                None => {
                    self.idle_sleep().await;
                    true
                }
            };
            if mempool_due {
                self.maybe_synchronize_mempool().await?;
            }
        }
        Ok(())
    }

    /// Rebuild the mempool view, rate-limited by the configured floor so
    /// back-to-back blocks don't trigger back-to-back rebuilds.
    async fn maybe_synchronize_mempool(&mut self) -> Result<()> {
        if self.stopping() {
            return Ok(());
        }
        let due = self
            .last_mempool_sync
            .map(|at| at.elapsed() >= self.config.watcher.mempool_sync_interval())
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        mempool::synchronize(
            &self.api_db,
            &self.ledger_db,
            &mut self.mempool_skip_list,
            self.config.watcher.tolerate_mempool_errors,
        )
        .await?;
        self.last_mempool_sync = Some(Instant::now());
        Ok(())
    }

    async fn idle_sleep(&mut self) {
        let sleep = tokio::time::sleep(self.config.watcher.poll_interval());
        tokio::select! {
            _ = sleep => {}
            _ = self.stop_rx.changed() => {}
        }
    }
}
