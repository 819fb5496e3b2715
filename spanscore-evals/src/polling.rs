// Copyright 2025 Spanscore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Adaptive polling for execution consumers.
//!
//! The interval rule is a pure function: while any watched execution is
//! non-terminal, refresh every five seconds; once the whole set is terminal,
//! stop entirely. `ExecutionPoller` drives that rule as a cancellable loop.

use crate::store::ExecutionStore;
use parking_lot::RwLock;
use spanscore_core::Execution;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The adaptive interval rule. `None` means polling should stop.
pub fn poll_interval(has_non_terminal: bool) -> Option<Duration> {
    has_non_terminal.then_some(POLL_INTERVAL)
}

/// A cancellable refresh loop over a watched set of executions. Consumers
/// read the most recent snapshot with [`latest`](ExecutionPoller::latest);
/// the loop exits on cancellation or when the set is fully terminal, and no
/// fetch is issued after cancellation.
pub struct ExecutionPoller {
    executions: Arc<dyn ExecutionStore>,
    watched: RwLock<Vec<Uuid>>,
    latest: RwLock<Vec<Execution>>,
    shutdown: RwLock<bool>,
    interval: Duration,
}

impl ExecutionPoller {
    pub fn new(executions: Arc<dyn ExecutionStore>) -> Self {
        Self::with_interval(executions, POLL_INTERVAL)
    }

    pub fn with_interval(executions: Arc<dyn ExecutionStore>, interval: Duration) -> Self {
        Self {
            executions,
            watched: RwLock::new(Vec::new()),
            latest: RwLock::new(Vec::new()),
            shutdown: RwLock::new(false),
            interval,
        }
    }

    pub fn watch(&self, ids: Vec<Uuid>) {
        *self.watched.write() = ids;
    }

    /// The snapshot from the most recent refresh.
    pub fn latest(&self) -> Vec<Execution> {
        self.latest.read().clone()
    }

    pub fn cancel(&self) {
        *self.shutdown.write() = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.read()
    }

    /// One refresh; returns whether anything in the set is still in flight.
    fn refresh(&self) -> bool {
        let ids = self.watched.read().clone();
        let executions = self.executions.get_many(&ids);
        let has_non_terminal = executions.iter().any(|e| !e.status.is_terminal());
        *self.latest.write() = executions;
        has_non_terminal
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if poller.is_cancelled() {
                    debug!("execution poller cancelled");
                    break;
                }
                let has_non_terminal = poller.refresh();
                let interval = poll_interval(has_non_terminal).map(|_| poller.interval);
                match interval {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => {
                        debug!("watched executions all terminal, poller stopping");
                        break;
                    }
                }
            }
        })
    }
}
