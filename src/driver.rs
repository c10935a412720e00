//! Runs one CLI action against a [`SwitchTransport`] and prints the outcome.

use crate::error::Result;
use crate::transport::{DP_POWER, StatusSnapshot, SwitchTransport};
use log::{debug, info};
use serde_json::Value;
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::time::sleep;

/// Shortest pause between two polls in tail mode.
pub const MIN_TAIL_INTERVAL: Duration = Duration::from_millis(200);
/// Pause after a write so the device reports its new state.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// What a single invocation does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Poll and print the data points until interrupted.
    Tail(Duration),
    /// Print one full status response.
    Status,
    /// Switch data point 1, then confirm.
    Power(bool),
    /// Print `ON` or `OFF`.
    Confirm,
}

/// Poll interval for a requested number of seconds, floored at 0.2 s.
pub fn tail_interval(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(interval) => interval.max(MIN_TAIL_INTERVAL),
        Err(_) if secs > 0.0 => Duration::MAX,
        Err(_) => MIN_TAIL_INTERVAL,
    }
}

fn power_label(snapshot: &StatusSnapshot) -> &'static str {
    if snapshot.is_on() { "ON" } else { "OFF" }
}

pub struct Driver<T, W> {
    transport: T,
    out: W,
}

impl<T: SwitchTransport, W: Write> Driver<T, W> {
    pub fn new(transport: T, out: W) -> Self {
        Self { transport, out }
    }

    pub fn into_parts(self) -> (T, W) {
        (self.transport, self.out)
    }

    /// Runs `action`. `interrupt` is only polled in tail mode, where its
    /// completion ends the loop successfully.
    pub async fn run<F>(&mut self, action: Action, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        match action {
            Action::Tail(interval) => return self.tail(interval, interrupt).await,
            Action::Status => return self.print_status().await,
            Action::Power(on) => self.set_power(on).await?,
            Action::Confirm => {}
        }
        self.confirm().await
    }

    async fn tail<F>(&mut self, interval: Duration, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Polling every {:?}", interval);
        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                biased;
                _ = &mut interrupt => {
                    writeln!(self.out, "\nStopped.")?;
                    return Ok(());
                }
                res = self.poll_once(interval) => res?,
            }
        }
    }

    async fn poll_once(&mut self, interval: Duration) -> Result<()> {
        let snapshot = self.transport.status().await?;
        let now = chrono::Local::now();
        writeln!(self.out, "{} {}", now.format("%H:%M:%S"), snapshot.dps_json())?;
        self.out.flush()?;
        sleep(interval).await;
        Ok(())
    }

    async fn print_status(&mut self) -> Result<()> {
        let snapshot = self.transport.status().await?;
        writeln!(self.out, "{snapshot}")?;
        Ok(())
    }

    async fn set_power(&mut self, on: bool) -> Result<()> {
        debug!("Setting DPS {} to {}", DP_POWER, on);
        self.transport.set_value(DP_POWER, Value::Bool(on)).await
    }

    async fn confirm(&mut self) -> Result<()> {
        sleep(SETTLE_DELAY).await;
        let snapshot = self.transport.status().await?;
        writeln!(self.out, "{}", power_label(&snapshot))?;
        Ok(())
    }
}
