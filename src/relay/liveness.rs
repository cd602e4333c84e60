//! Ping-driven liveness and empty-channel reclamation.
//!
//! The driver ticks with the broker's event loop. A ping round fires only
//! when both thresholds pass: more than `ping_round` wall-clock since the
//! previous round and more than `min_ticks` ticks. Each round first evicts
//! every session whose previous ping went unanswered, then hands everyone
//! else a fresh payload, and finally sweeps empty channels — so a channel
//! may briefly outlive its last member.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use super::message::{Command, Frame};
use super::nick::SERVER_NICK;
use super::server::{Config, ServerState, SharedState};

pub(crate) async fn run(state: SharedState, cfg: Config) {
    let mut interval = time::interval(cfg.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut driver = Driver::new(cfg);
    loop {
        interval.tick().await;
        let mut st = state.write().await;
        if st.stopping {
            break;
        }
        driver.tick(&mut st);
    }
}

pub(crate) struct Driver {
    cfg: Config,
    last_round: Instant,
    ticks: u32,
}

impl Driver {
    pub(crate) fn new(cfg: Config) -> Self {
        Self {
            cfg,
            last_round: Instant::now(),
            ticks: 0,
        }
    }

    /// One event-loop tick; runs a ping round once both thresholds pass.
    pub(crate) fn tick(&mut self, st: &mut ServerState) {
        self.ticks += 1;
        if self.last_round.elapsed() <= self.cfg.ping_round || self.ticks <= self.cfg.min_ticks {
            return;
        }
        self.last_round = Instant::now();
        self.ticks = 0;
        self.round(st);
    }

    fn round(&mut self, st: &mut ServerState) {
        let stale: Vec<String> = st
            .sessions
            .iter()
            .filter(|(_, handle)| handle.pending_ping.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            st.evict(&name, "No ping response", true);
        }

        let payload = unix_millis();
        let names: Vec<String> = st.sessions.keys().cloned().collect();
        for name in &names {
            if let Some(handle) = st.sessions.get_mut(name) {
                handle.pending_ping = Some(payload.clone());
            }
            st.deliver_one(
                name,
                Frame::Command(Command::Ping {
                    src: SERVER_NICK.into(),
                    msg: payload.clone(),
                }),
            );
        }
        debug!(sessions = names.len(), "ping round");

        st.channels.retain(|chan, members| {
            let keep = !members.is_empty();
            if !keep {
                debug!(channel = %chan, "reclaimed empty channel");
            }
            keep
        });
    }
}

fn unix_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}
