//! Periodic removal of expired verification codes

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::db::LinkStore;

/// Background task deleting pending codes past their expiry
pub struct Sweeper {
    links: Arc<LinkStore>,
    interval: Duration,
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl Sweeper {
    pub fn new(links: Arc<LinkStore>, interval: Duration) -> Self {
        Self {
            links,
            interval,
            shutdown_rx: None,
        }
    }

    /// Set shutdown receiver
    pub fn set_shutdown(&mut self, rx: broadcast::Receiver<()>) {
        self.shutdown_rx = Some(rx);
    }

    /// One pass; errors are logged and the next tick tries again
    pub fn sweep_once(&self) -> usize {
        match self.links.sweep_expired() {
            Ok(removed) => removed,
            Err(e) => {
                error!(error = %e, "Sweep of expired codes failed");
                0
            }
        }
    }

    /// Run until the shutdown channel fires or closes
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Code sweeper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut shutdown_rx = self.shutdown_rx.take();
        loop {
            match shutdown_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = ticker.tick() => {
                            self.sweep_once();
                        }
                        _ = rx.recv() => {
                            info!("Code sweeper shutdown requested");
                            break;
                        }
                    }
                }
                None => {
                    ticker.tick().await;
                    self.sweep_once();
                }
            }
        }
    }
}
