//! Turns link notifications into engine calls.

use std::future::Future;

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::engine::Engine;
use crate::link::{is_ready, LinkAttributes, LinkEvent, OperState};

/// What the driver did with one link event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// The name does not match the interface pattern.
    Skipped,
    /// A session was started.
    Added,
    /// The session was asked to stop.
    Removed,
    /// The link matched but needed nothing.
    Unchanged,
}

/// Why [`Driver::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// The shutdown future resolved.
    Shutdown,
    /// The link event channel closed.
    FeedEnded,
}

pub struct Driver {
    engine: Engine,
    pattern: Regex,
}

impl Driver {
    pub fn new(engine: Engine, pattern: Regex) -> Self {
        Self { engine, pattern }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Whether an interface name matches the configured pattern.
    pub fn qualifies(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    /// Start sessions for matching links that are already ready.
    pub fn adopt_existing(&self, links: &[LinkAttributes]) -> usize {
        let mut adopted = 0;

        for link in links {
            if !self.qualifies(&link.name) {
                debug!(interface = %link.name, "did not match pattern, skipping");
                continue;
            }
            if is_ready(link) && !self.engine.exists(link.index) {
                info!(interface = %link.name, index = link.index, "adding existing link");
                self.engine.add(link.index);
                adopted += 1;
            }
        }

        adopted
    }

    pub fn handle(&self, event: &LinkEvent) -> LinkAction {
        let link = event.attributes();

        debug!(
            interface = %link.name,
            index = link.index,
            admin_up = link.admin_up,
            oper_state = %link.oper_state,
            "link event"
        );
        trace!(interface = %link.name, tx_packets = link.tx_packets, "link stats");

        if !self.qualifies(&link.name) {
            debug!(interface = %link.name, "did not match pattern, skipping");
            return LinkAction::Skipped;
        }

        let managed = self.engine.exists(link.index);

        match event {
            LinkEvent::Removed(_) if managed => {
                info!(interface = %link.name, index = link.index, "link deleted");
                self.engine.close(link.index);
                LinkAction::Removed
            }
            LinkEvent::Changed(_) if !managed && is_ready(link) => {
                info!(interface = %link.name, index = link.index, "adding new link");
                self.engine.add(link.index);
                LinkAction::Added
            }
            LinkEvent::Changed(_) if managed && link.oper_state != OperState::Up => {
                info!(interface = %link.name, index = link.index, "link went down");
                self.engine.close(link.index);
                LinkAction::Removed
            }
            _ => {
                debug!(interface = %link.name, "nothing to do");
                LinkAction::Unchanged
            }
        }
    }

    /// Handle events until `shutdown` resolves or the feed closes.
    pub async fn run<F>(&self, events: &mut mpsc::Receiver<LinkEvent>, shutdown: F) -> DriverExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return DriverExit::Shutdown,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(&event);
                    }
                    None => return DriverExit::FeedEnded,
                },
            }
        }
    }
}
