use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info, warn};

use super::{Collection, Collector};
use crate::feed::PriceFeed;
use crate::history::PriceHistory;
use crate::process::DataQuality;

/// What the background collection is doing and how its last round went.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobState {
    pub running: bool,
    pub runs: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    /// REAL if any feed produced real prices in the last round.
    pub last_quality: Option<DataQuality>,
    pub last_stored: usize,
    pub last_error: Option<String>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the job state and the periodic collection task.
pub struct Supervisor {
    collector: Arc<Collector>,
    feeds: Arc<Vec<PriceFeed>>,
    history: Option<Arc<PriceHistory>>,
    state: Arc<Mutex<JobState>>,
    task: AsyncMutex<Option<Running>>,
}

fn lock(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    // a panicked round must not wedge status reporting
    state.lock().unwrap_or_else(|p| p.into_inner())
}

impl Supervisor {
    pub fn new(
        collector: Collector,
        feeds: Vec<PriceFeed>,
        history: Option<Arc<PriceHistory>>,
    ) -> Self {
        Self {
            collector: Arc::new(collector),
            feeds: Arc::new(feeds),
            history,
            state: Arc::new(Mutex::new(JobState::default())),
            task: AsyncMutex::new(None),
        }
    }

    pub fn status(&self) -> JobState {
        lock(&self.state).clone()
    }

    /// One collection round over every feed, without the background task.
    pub async fn run_once(&self) -> Vec<Collection> {
        run_round(&self.collector, &self.feeds, self.history.as_ref(), &self.state).await
    }

    /// Spawn the periodic collection. The first round starts immediately.
    pub async fn start(&self, every: Duration) -> Result<()> {
        if every.is_zero() {
            bail!("collection interval must be greater than zero");
        }
        let mut task = self.task.lock().await;
        if task.is_some() {
            bail!("collection is already running");
        }

        let (shutdown, mut rx) = watch::channel(false);
        let collector = Arc::clone(&self.collector);
        let feeds = Arc::clone(&self.feeds);
        let history = self.history.clone();
        let state = Arc::clone(&self.state);
        lock(&state).running = true;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_round(&collector, &feeds, history.as_ref(), &state).await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            lock(&state).running = false;
            info!("collection stopped");
        });

        info!(every = ?every, feeds = self.feeds.len(), "collection started");
        *task = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Signal the background task and wait for it. Returns `false` if it
    /// was not running.
    pub async fn stop(&self) -> Result<bool> {
        let Some(running) = self.task.lock().await.take() else {
            return Ok(false);
        };
        // a closed channel also ends the loop
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            lock(&self.state).running = false;
            bail!("collection task failed: {}", e);
        }
        Ok(true)
    }
}

async fn run_round(
    collector: &Collector,
    feeds: &[PriceFeed],
    history: Option<&Arc<PriceHistory>>,
    state: &Mutex<JobState>,
) -> Vec<Collection> {
    lock(state).last_started = Some(Utc::now());

    let mut collections = Vec::with_capacity(feeds.len());
    let mut errors = Vec::new();
    for feed in feeds {
        let result = match history {
            Some(h) => collector.collect_and_store(feed, h).await,
            None => collector.collect(feed).await,
        };
        match result {
            Ok(c) => {
                if let Some(e) = &c.store_error {
                    errors.push(format!("{}: {}", feed.kind, e));
                }
                collections.push(c);
            }
            Err(e) => {
                error!(feed = %feed.kind, error = %format!("{:#}", e), "collection failed");
                errors.push(format!("{}: {:#}", feed.kind, e));
            }
        }
    }

    if let Some(h) = history {
        let h = Arc::clone(h);
        match tokio::task::spawn_blocking(move || h.vacuum()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{:#}", e), "history vacuum failed"),
            Err(e) => warn!(error = %e, "history vacuum task failed"),
        }
    }

    let stored: usize = collections.iter().map(|c| c.stored).sum();
    let quality = if collections.iter().any(|c| c.quality() == DataQuality::Real) {
        DataQuality::Real
    } else {
        DataQuality::Unavailable
    };
    info!(feeds = feeds.len(), stored, quality = quality.as_str(), "round finished");

    let mut s = lock(state);
    s.runs += 1;
    s.last_finished = Some(Utc::now());
    s.last_quality = Some(quality);
    s.last_stored = stored;
    s.last_error = if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    };
    drop(s);

    collections
}
