use crate::config::{
    ManagerConfig, BLAST_CLIENT_DURATION, KEEPALIVE_TIMEOUT, MAX_CONNECT_ERRORS,
    RETRY_INTERVAL,
};
use crate::id::{fresh_worker_id, WorkerId};
use crate::net;
use crate::protocol::{Response, Work};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;

/// Everything the manager knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub ip: IpAddr,
    /// Port of the worker's blast server; 0 means it cannot serve as
    /// receiver.
    pub blast_port: u16,
    /// Worker currently using this worker as a blast server, if any.
    pub blast_client: Option<WorkerId>,
    pub last_contact: Instant,
    pub connect_errors: u32,
    pub in_src_networks: bool,
    pub in_dest_networks: bool,
}

impl WorkerRecord {
    fn stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_contact) > KEEPALIVE_TIMEOUT
    }
}

/// The authoritative worker registry. Entries are never removed; exclusion
/// is filter-time, by keepalive age. Iteration preserves first-insertion
/// order, which is also the pairing scan order.
#[derive(Debug, Default)]
pub struct Registry {
    workers: Vec<WorkerRecord>,
    ids: HashSet<WorkerId>,
}

/// What `connect_failed` did to the referenced receiver.
#[derive(Debug, PartialEq)]
pub struct ConnectFailure {
    pub ip: IpAddr,
    pub blast_port: u16,
    /// True exactly once, when the counter first crosses the limit.
    pub disabled_now: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a record for a new worker and returns its fresh id. Role
    /// membership is precomputed here, against the configured network sets.
    pub fn register(
        &mut self,
        ip: IpAddr,
        blast_port: u16,
        config: &ManagerConfig,
        now: Instant,
    ) -> WorkerId {
        let worker_id = fresh_worker_id(&mut self.ids);
        self.workers.push(WorkerRecord {
            worker_id: worker_id.clone(),
            ip,
            blast_port,
            blast_client: None,
            last_contact: now,
            connect_errors: 0,
            in_src_networks: net::in_any(ip, &config.src_networks),
            in_dest_networks: net::in_any(ip, &config.dest_networks),
        });
        worker_id
    }

    /// Refreshes `last_contact`; false when the id is unknown.
    pub fn touch(&mut self, worker_id: &str, now: Instant) -> bool {
        match self.get_mut(worker_id) {
            Some(worker) => {
                worker.last_contact = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.worker_id == worker_id)
    }

    fn get_mut(&mut self, worker_id: &str) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| w.worker_id == worker_id)
    }

    /// Picks a receiver for `requester` and builds the `get_work` response.
    /// The caller must have refreshed the requester's keepalive already;
    /// `requester_ip` is the per-request effective address (override or
    /// observed peer).
    pub fn assign(
        &mut self,
        requester_id: &str,
        requester_ip: IpAddr,
        config: &ManagerConfig,
        now: Instant,
        elapsed: f64,
    ) -> Response {
        // release any previous assignment that named this requester,
        // regardless of direction
        self.release_assignments_to(requester_id);

        let remaining = config.remaining(elapsed);
        let requester = self
            .get(requester_id)
            .expect("assign called with an unknown worker_id");

        if !requester.in_src_networks {
            if remaining <= 0.0 {
                return Response::failure("Test ended.".to_string(), None);
            }
            let retry = elapsed.min(KEEPALIVE_TIMEOUT.as_secs_f64() / 2.0);
            return Response::failure(
                format!(
                    "You will only be a server.  Check in again in {:.1} seconds.",
                    retry
                ),
                Some(retry),
            );
        }

        // the peer currently blasting into the requester, if any
        let incoming_client = requester.blast_client.clone();
        let chosen = self.workers.iter().position(|candidate| {
            self.eligible(candidate, requester_ip, incoming_client.as_deref(), now)
        });

        let chosen = match chosen {
            Some(index) => index,
            None => {
                if remaining <= 0.0 {
                    return Response::failure("Test ended.".to_string(), None);
                }
                let retry = RETRY_INTERVAL.as_secs_f64().min(remaining);
                return Response::failure(
                    format!(
                        "No servers found.  Retry in {:.1} seconds.",
                        retry
                    ),
                    Some(retry),
                );
            }
        };

        let duration = BLAST_CLIENT_DURATION.as_secs_f64().min(remaining);
        if duration < 1.0 {
            return Response::failure("Test ended.".to_string(), None);
        }

        let receiver = &mut self.workers[chosen];
        receiver.blast_client = Some(requester_id.to_string());
        Response::Work(Work {
            success: true,
            blast_ip: receiver.ip,
            blast_port: receiver.blast_port,
            blast_id: receiver.worker_id.clone(),
            direction: config.direction,
            duration: duration as u64,
        })
    }

    fn eligible(
        &self,
        candidate: &WorkerRecord,
        requester_ip: IpAddr,
        incoming_client: Option<&str>,
        now: Instant,
    ) -> bool {
        if !candidate.in_dest_networks {
            return false;
        }
        if candidate.blast_port == 0 {
            return false;
        }
        // a pairing never joins two workers on the same machine
        if candidate.ip == requester_ip {
            return false;
        }
        if candidate.connect_errors > MAX_CONNECT_ERRORS {
            return false;
        }
        if candidate.stale(now) {
            return false;
        }
        // skip receivers still held by a live client
        if let Some(holder) = &candidate.blast_client {
            let holder_live =
                self.get(holder).map_or(false, |h| !h.stale(now));
            if holder_live {
                return false;
            }
        }
        // a pair never points both ways at once: if the candidate is
        // currently blasting into the requester, the requester cannot
        // blast back
        if incoming_client == Some(candidate.worker_id.as_str()) {
            return false;
        }
        true
    }

    /// Clears `blast_client` on every receiver that still names `client`.
    fn release_assignments_to(&mut self, client: &str) {
        for worker in &mut self.workers {
            if worker.blast_client.as_deref() == Some(client) {
                worker.blast_client = None;
            }
        }
    }

    /// Counts one peer connect failure against `blast_id`. None when the id
    /// is unknown.
    pub fn record_connect_failure(
        &mut self,
        blast_id: &str,
    ) -> Option<ConnectFailure> {
        let worker = self.get_mut(blast_id)?;
        worker.connect_errors += 1;
        Some(ConnectFailure {
            ip: worker.ip,
            blast_port: worker.blast_port,
            disabled_now: worker.connect_errors == MAX_CONNECT_ERRORS + 1,
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
