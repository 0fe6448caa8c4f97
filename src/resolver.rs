//! Table-entry resolver (§4.3).
//!
//! Holds the cluster's current view of where every replica lives, keyed both
//! by `ServiceIP` (one-to-many, a service can have several replicas) and by
//! `NsIP` (one-to-one). The first lookup for a service that hasn't been seen
//! yet blocks, bounded by a timeout, until a table-query response arrives on
//! the control channel and populates the entry — this is the only place in
//! the datapath that waits on the network.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::control_channel::ControlChannel;
use crate::error::{NetError, Result};
use crate::model::{IpType, JobName, TableEntry};

fn service_ip_addrs(entry: &TableEntry) -> Vec<IpAddr> {
    entry
        .service_ip
        .iter()
        .filter(|e| e.ip_type == IpType::ServiceIp)
        .flat_map(|e| [IpAddr::V4(e.address), IpAddr::V6(e.address_v6)])
        .collect()
}

/// How long `get_table_entry_by_service_ip` waits for a first answer before
/// giving up and returning a timeout error.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

struct ServiceSlot {
    entries: Vec<TableEntry>,
    notify: Arc<Notify>,
}

impl ServiceSlot {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Cluster table-entry cache, refreshed by `table/update` control-channel
/// events and queried on demand by the tunnel engine's egress path.
pub struct Resolver {
    by_service: RwLock<HashMap<JobName, ServiceSlot>>,
    by_nsip: RwLock<HashMap<IpAddr, TableEntry>>,
    by_service_ip: RwLock<HashMap<IpAddr, JobName>>,
    /// Per-ServiceIP waiters for a `ServiceIP` this node has never seen a job
    /// mapping for yet, so a first-contact lookup has something to park on
    /// before it even knows which job's [`ServiceSlot`] to wait for.
    pending_service_ip: RwLock<HashMap<IpAddr, Arc<Notify>>>,
    control: Arc<dyn ControlChannel>,
}

impl Resolver {
    pub fn new(control: Arc<dyn ControlChannel>) -> Self {
        Self {
            by_service: RwLock::new(HashMap::new()),
            by_nsip: RwLock::new(HashMap::new()),
            by_service_ip: RwLock::new(HashMap::new()),
            pending_service_ip: RwLock::new(HashMap::new()),
            control,
        }
    }

    /// Subscribes this resolver to the control plane's table-update topic so
    /// a `table/update` publish populates the cache and wakes any lookup
    /// parked in [`Self::get_table_entry_by_service_ip`]. Call once, after
    /// construction, from the composition root.
    pub async fn subscribe_to_updates(self: &Arc<Self>) {
        let resolver = self.clone();
        if let Err(e) = self
            .control
            .subscribe(
                "table/update",
                Arc::new(move |_topic, payload| resolver.apply_update_payload(payload)),
            )
            .await
        {
            warn!(error = %e, "failed to subscribe resolver to table/update");
        }
    }

    fn apply_update_payload(&self, payload: &[u8]) {
        let entries: Vec<TableEntry> = match serde_json::from_slice(payload) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "dropping malformed table/update payload");
                return;
            }
        };
        let mut by_job: HashMap<JobName, Vec<TableEntry>> = HashMap::new();
        for entry in entries {
            by_job.entry(entry.job_name.clone()).or_default().push(entry);
        }
        for (job_name, group) in by_job {
            self.refresh_service_table(&job_name, group);
        }
    }

    /// Egress-path lookup: which job owns this ServiceIP? Populated from the
    /// `ServiceIp`-tagged rows of each replica's address list on refresh.
    pub fn job_for_service_ip(&self, service_ip: IpAddr) -> Option<JobName> {
        self.by_service_ip.read().get(&service_ip).cloned()
    }

    /// Egress-path lookup, keyed on the raw `ServiceIP` itself rather than a
    /// job name — the caller never has a job name for a ServiceIP it hasn't
    /// resolved yet, that's exactly what this call discovers. Blocks,
    /// bounded by [`RESOLVE_TIMEOUT`], the first time `service_ip` is
    /// requested: publishes a `table/query` request and waits for the
    /// matching `table/update` to land via [`Self::refresh_service_table`].
    pub async fn get_table_entry_by_service_ip(&self, service_ip: IpAddr) -> Result<Vec<TableEntry>> {
        if let Some(found) = self.snapshot_by_service_ip(service_ip) {
            if !found.is_empty() {
                return Ok(found);
            }
        }

        let notify = {
            let mut guard = self.pending_service_ip.write();
            guard
                .entry(service_ip)
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        self.control
            .publish("table/query", service_ip.to_string().as_bytes())
            .await
            .map_err(|e| NetError::ControlChannel(e.to_string()))?;

        let waited = tokio::time::timeout(RESOLVE_TIMEOUT, notify.notified()).await;
        match waited {
            Ok(()) => {
                let found = self.snapshot_by_service_ip(service_ip).unwrap_or_default();
                if found.is_empty() {
                    Err(NetError::ResolverTimeout)
                } else {
                    Ok(found)
                }
            }
            Err(_) => {
                warn!(%service_ip, "resolver timed out waiting for table entries");
                Err(NetError::ResolverTimeout)
            }
        }
    }

    fn snapshot_by_service_ip(&self, service_ip: IpAddr) -> Option<Vec<TableEntry>> {
        let job_name = self.job_for_service_ip(service_ip)?;
        self.snapshot_service(&job_name)
    }

    fn snapshot_service(&self, job_name: &str) -> Option<Vec<TableEntry>> {
        self.by_service
            .read()
            .get(job_name)
            .map(|slot| slot.entries.clone())
    }

    fn wake_service_ip(&self, service_ip: IpAddr) {
        if let Some(notify) = self.pending_service_ip.read().get(&service_ip) {
            notify.notify_waiters();
        }
    }

    /// Publishes a bare `table/query` for `job_name`, used to eagerly repull
    /// a job's table when its `updates_available` topic fires. Fire-and-
    /// forget: the answer lands asynchronously via `table/update` and
    /// [`Self::apply_update_payload`], there's nothing to block on here.
    pub async fn request_job_refresh(&self, job_name: &str) {
        if let Err(e) = self.control.publish("table/query", job_name.as_bytes()).await {
            warn!(job_name, error = %e, "failed to publish table/query refresh");
        }
    }

    /// Ingress-path lookup: does this NsIP belong to a known replica? Never
    /// blocks — an unresolved NsIP on the ingress path is a drop, not a wait.
    pub fn get_table_entry_by_ns_ip(&self, ns_ip: IpAddr) -> Option<TableEntry> {
        self.by_nsip.read().get(&ns_ip).cloned()
    }

    /// Replaces the cached rows for `job_name` wholesale and wakes any
    /// resolver callers blocked on this service.
    pub fn refresh_service_table(&self, job_name: &str, entries: Vec<TableEntry>) {
        debug!(job_name, count = entries.len(), "refreshing service table");
        {
            let mut nsip_guard = self.by_nsip.write();
            let mut svc_guard = self.by_service_ip.write();
            if let Some(old_slot) = self.by_service.read().get(job_name) {
                for old in &old_slot.entries {
                    nsip_guard.remove(&IpAddr::V4(old.nsip));
                    nsip_guard.remove(&IpAddr::V6(old.nsipv6));
                    for sip in service_ip_addrs(old) {
                        svc_guard.remove(&sip);
                    }
                }
            }
            for e in &entries {
                nsip_guard.insert(IpAddr::V4(e.nsip), e.clone());
                nsip_guard.insert(IpAddr::V6(e.nsipv6), e.clone());
                for sip in service_ip_addrs(e) {
                    svc_guard.insert(sip, job_name.to_string());
                }
            }
        }

        let mut guard = self.by_service.write();
        let slot = guard.entry(job_name.to_string()).or_insert_with(ServiceSlot::empty);
        slot.entries = entries;
        slot.notify.notify_waiters();
        drop(guard);

        for sip in self.by_service_ip.read().iter().filter(|(_, j)| j.as_str() == job_name).map(|(ip, _)| *ip) {
            self.wake_service_ip(sip);
        }
    }

    /// Upserts a single entry into its job's slot, keeping any other already
    /// known replicas for that job. Used when a locally-deployed replica
    /// registers; a bulk control-plane `table/update` uses
    /// [`Self::refresh_service_table`] instead, which replaces a job's whole
    /// set.
    pub fn upsert_entry(&self, entry: TableEntry) {
        let job_name = entry.job_name.clone();
        let notify = {
            let mut guard = self.by_service.write();
            let slot = guard.entry(job_name.clone()).or_insert_with(ServiceSlot::empty);
            slot.entries.retain(|e| e.instance_number != entry.instance_number);
            slot.entries.push(entry.clone());
            slot.notify.clone()
        };

        {
            let mut nsip_guard = self.by_nsip.write();
            nsip_guard.insert(IpAddr::V4(entry.nsip), entry.clone());
            nsip_guard.insert(IpAddr::V6(entry.nsipv6), entry.clone());
        }
        {
            let mut svc_guard = self.by_service_ip.write();
            for sip in service_ip_addrs(&entry) {
                svc_guard.insert(sip, job_name.clone());
            }
        }
        notify.notify_waiters();

        for sip in service_ip_addrs(&entry) {
            self.wake_service_ip(sip);
        }
    }

    /// Drops every row for `job_name`, e.g. on job teardown.
    pub fn remove_service_entries(&self, job_name: &str) {
        let removed = self.by_service.write().remove(job_name);
        if let Some(slot) = removed {
            let mut nsip_guard = self.by_nsip.write();
            let mut svc_guard = self.by_service_ip.write();
            for e in &slot.entries {
                nsip_guard.remove(&IpAddr::V4(e.nsip));
                nsip_guard.remove(&IpAddr::V6(e.nsipv6));
                for sip in service_ip_addrs(e) {
                    svc_guard.remove(&sip);
                }
            }
        }
    }

    pub fn is_service_deployed(&self, full_name: &str) -> bool {
        self.by_service
            .read()
            .values()
            .any(|slot| slot.entries.iter().any(|e| e.full_name() == full_name))
    }

    /// Current replica NsIPs for a service, used by the proxy cache's
    /// liveness check.
    pub fn live_ns_ips(&self, job_name: &str) -> Vec<IpAddr> {
        self.by_service
            .read()
            .get(job_name)
            .map(|slot| {
                slot.entries
                    .iter()
                    .flat_map(|e| [IpAddr::V4(e.nsip), IpAddr::V6(e.nsipv6)])
                    .collect()
            })
            .unwrap_or_default()
    }
}
