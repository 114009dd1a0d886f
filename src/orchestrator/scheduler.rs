//! Fixed-interval scheduler driving idempotent cycle starts.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::CycleConfig;
use crate::orchestrator::cycle::MarketCycle;
use crate::orchestrator::instance::{
    manual_key, scheduled_key, truncate_to_interval, InstanceStore,
};
use crate::store::StoreError;

pub struct CycleScheduler {
    cycle: Arc<MarketCycle>,
    instances: Arc<InstanceStore>,
    config: CycleConfig,
    shutdown: watch::Receiver<bool>,
}

impl CycleScheduler {
    pub fn new(
        cycle: Arc<MarketCycle>,
        instances: Arc<InstanceStore>,
        config: CycleConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cycle,
            instances,
            config,
            shutdown,
        }
    }

    /// Run the scheduler loop until shutdown is signalled.
    ///
    /// Every tick derives the current time bucket and attempts an
    /// idempotent start; duplicate ticks for one bucket are no-ops, so
    /// at-least-once timer behavior is safe.
    pub async fn run(mut self) {
        let period = Duration::from_secs(u64::from(self.config.interval_minutes) * 60);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_minutes = self.config.interval_minutes,
            decision_minutes = self.config.decision_minutes,
            "Cycle scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let bucket = truncate_to_interval(Utc::now(), self.config.interval_minutes);
                    let key = scheduled_key(bucket);

                    match self.instances.try_begin(&key).await {
                        Ok(Some(_)) => {
                            run_instance(
                                self.cycle.clone(),
                                self.instances.clone(),
                                key,
                                bucket,
                            )
                            .await;
                        }
                        Ok(None) => {}
                        Err(e) => error!(key, error = %e, "Failed to begin cycle instance"),
                    }
                }
                result = self.shutdown.changed() => {
                    if result.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Cycle scheduler stopped");
    }

    /// Start a manual cycle and return its instance key immediately.
    /// The cycle itself runs in the background (fire-and-forget); its
    /// outcome is observable through the instance record and logs.
    pub async fn trigger_manual(&self) -> Result<String, StoreError> {
        let now = Utc::now();
        let key = manual_key(now);

        if self.instances.try_begin(&key).await?.is_none() {
            // Seconds-resolution keys only collide when triggered twice
            // within one second; treat that as the same run.
            warn!(key, "Manual trigger collided with an in-flight instance");
            return Ok(key);
        }

        info!(key, "Manual market cycle triggered");

        tokio::spawn(run_instance(
            self.cycle.clone(),
            self.instances.clone(),
            key.clone(),
            now,
        ));

        Ok(key)
    }
}

/// Drive one instance through Running to Completed or Failed.
pub async fn run_instance(
    cycle: Arc<MarketCycle>,
    instances: Arc<InstanceStore>,
    key: String,
    cycle_ts: chrono::DateTime<Utc>,
) {
    if let Err(e) = instances.mark_running(&key) {
        error!(key, error = %e, "Failed to mark instance running");
        return;
    }

    match cycle.run(&key, cycle_ts).await {
        Ok(summary) => {
            if let Err(e) = instances.complete(&key, summary) {
                error!(key, error = %e, "Failed to record cycle completion");
            }
        }
        Err(e) => {
            error!(key, error = %e, "Market cycle failed");
            if let Err(store_err) = instances.fail(&key, &e.to_string()) {
                error!(key, error = %store_err, "Failed to record cycle failure");
            }
        }
    }
}
