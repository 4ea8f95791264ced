//! Background polling that keeps the printer from idling out and feeds synthetic temperature
//! reports to the host.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use tokio::{
    runtime::Handle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, Connection};

/// Polls due on a tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Polls {
    pub temperature: bool,
    pub status: bool,
}

impl Polls {
    pub fn any(&self) -> bool {
        self.temperature || self.status
    }
}

/// Tick counters, kept free of any timer so they can be driven directly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveClock {
    temp_ticks: u32,
    status_ticks: u32,
    status_ceiling: u32,
}

impl KeepAliveClock {
    pub fn new(status_ceiling: u32) -> Self {
        Self {
            temp_ticks: 0,
            status_ticks: 0,
            status_ceiling: status_ceiling.max(1),
        }
    }

    /// Advance one tick; `temp_interval` is in ticks, zero disables temperature polls
    pub fn tick(&mut self, temp_interval: u32) -> Polls {
        let mut polls = Polls::default();
        self.status_ticks += 1;
        if self.status_ticks >= self.status_ceiling {
            self.status_ticks = 0;
            polls.status = true;
        }
        if temp_interval == 0 {
            self.temp_ticks = 0;
        } else {
            self.temp_ticks += 1;
            if self.temp_ticks >= temp_interval {
                self.temp_ticks = 0;
                polls.temperature = true;
            }
        }
        polls
    }

    /// Host traffic already keeps the link alive, push the next status poll back
    pub fn reset_status(&mut self) {
        self.status_ticks = 0;
    }
}

/// Shared switches between the connection and its keep-alive task
#[derive(Debug, Default)]
pub struct KeepAliveControl {
    suspended: AtomicUsize,
    activity: AtomicBool,
}

impl KeepAliveControl {
    /// Stop polling until the returned guard is dropped
    pub fn suspend(self: &Arc<Self>) -> Suspension {
        self.suspended.fetch_add(1, Ordering::AcqRel);
        Suspension(Arc::clone(self))
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire) > 0
    }

    pub fn note_activity(&self) {
        self.activity.store(true, Ordering::Release);
    }

    pub fn take_activity(&self) -> bool {
        self.activity.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct Suspension(Arc<KeepAliveControl>);

impl Drop for Suspension {
    fn drop(&mut self) {
        self.0.suspended.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle for the keep-alive task, cancelled on drop
#[derive(Debug)]
pub struct BackgroundTask {
    description: &'static str,
    token: CancellationToken,
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        tracing::debug!("Cancelling {} task", self.description);
        self.token.cancel()
    }
}

pub(crate) fn spawn(
    runtime: &Handle,
    connection: Weak<Connection>,
    tick: Duration,
    status_ceiling: u32,
) -> BackgroundTask {
    let token = CancellationToken::new();
    runtime.spawn(keepalive_task(
        connection,
        token.clone(),
        tick,
        status_ceiling,
    ));
    BackgroundTask {
        description: "keep-alive",
        token,
    }
}

async fn keepalive_task(
    connection: Weak<Connection>,
    token: CancellationToken,
    tick: Duration,
    status_ceiling: u32,
) {
    let mut clock = KeepAliveClock::new(status_ceiling);
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!("Started keep-alive polling every {tick:?}");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => (),
        }
        let Some(conn) = connection.upgrade() else {
            break;
        };
        if conn.keepalive_control().is_suspended() {
            continue;
        }
        if conn.keepalive_control().take_activity() {
            clock.reset_status();
        }
        let polls = clock.tick(conn.temperature_report_ticks());
        if !polls.any() {
            continue;
        }
        match tokio::task::spawn_blocking(move || conn.keepalive_poll(polls)).await {
            Ok(Ok(())) => (),
            Ok(Err(Error::Disconnected)) => break,
            Ok(Err(e)) => tracing::warn!("Keep-alive poll failed: {e}"),
            Err(e) => {
                tracing::error!("Keep-alive poll panicked: {e}");
                break;
            }
        }
    }
    tracing::debug!("Stopped keep-alive polling");
}
