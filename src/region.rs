//! Region list, pinging and best-region selection.
//!
//! [`RegionSelector`] pings every region concurrently, one tokio task per
//! region, and reports exactly one [`PingOutcome`] per run through
//! [`poll_completed`](RegionSelector::poll_completed). A run started with a
//! valid previous [`RegionSummary`] first re-pings only the previous best
//! region and keeps it if it is still fast enough.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RealtimeError, Result};
use crate::settings::RegionPingConfig;

/// Ping of a region that was not measured yet.
pub const PING_UNMEASURED: u32 = u32::MAX;

// ── Region ──────────────────────────────────────────────────────────

/// A region reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Lower-cased region code.
    pub code: String,
    pub cluster: Option<String>,
    /// Address of the region's matchmaker, used as ping target.
    pub address: String,
    /// Weighted ping in milliseconds, [`PING_UNMEASURED`] until measured.
    pub ping: u32,
}

impl Region {
    /// Parses `"code"` or `"code/cluster"`.
    pub fn new(code_and_cluster: &str, address: impl Into<String>) -> Self {
        let lowered = code_and_cluster.to_lowercase();
        let (code, cluster) = match lowered.split_once('/') {
            Some((code, cluster)) => (code.to_string(), Some(cluster.to_string())),
            None => (lowered, None),
        };
        Self {
            code,
            cluster,
            address: address.into(),
            ping: PING_UNMEASURED,
        }
    }

    pub fn is_measured(&self) -> bool {
        self.ping != PING_UNMEASURED
    }
}

/// Host part of a server address: the port suffix is removed, and so is a
/// `ws://`/`wss://` scheme unless `keep_scheme` is set.
pub fn ping_target(address: &str, keep_scheme: bool) -> String {
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, address),
    };
    let host = match rest.rfind(':') {
        // IPv6 literals keep their colons.
        Some(idx) if !rest.ends_with(']') && rest.get(..idx).is_some_and(|h| !h.is_empty()) => {
            rest.get(..idx).unwrap_or(rest)
        }
        _ => rest,
    };
    match scheme {
        Some(scheme) if keep_scheme => format!("{scheme}://{host}"),
        _ => host.to_string(),
    }
}

/// `(sum - worst + best) / n` of the attempts; a single attempt is returned
/// as is.
///
/// ```
/// use relay_realtime_client::region::weighted_ping;
///
/// assert_eq!(weighted_ping(&[100, 120, 90, 500, 95]), 99);
/// ```
pub fn weighted_ping(results: &[u32]) -> u32 {
    let (Some(&best), Some(&worst)) = (results.iter().min(), results.iter().max()) else {
        return PING_UNMEASURED;
    };
    if results.len() == 1 {
        return best;
    }
    let sum: u64 = results.iter().map(|r| u64::from(*r)).sum();
    let weighted = (sum - u64::from(worst) + u64::from(best)) / results.len() as u64;
    u32::try_from(weighted).unwrap_or(PING_UNMEASURED)
}

/// Best region: every region within `factor` of the lowest ping qualifies,
/// and the alphabetically first code among them wins.
pub fn select_best(regions: &[Region], factor: f64) -> Option<&Region> {
    let lowest = regions.iter().map(|r| r.ping).min()?;
    let cutoff = f64::from(lowest) * factor;
    regions
        .iter()
        .filter(|r| f64::from(r.ping) <= cutoff)
        .min_by(|a, b| a.code.cmp(&b.code))
}

/// Sorted region codes joined by `,`.
pub fn available_codes(regions: &[Region]) -> String {
    let mut codes: Vec<&str> = regions.iter().map(|r| r.code.as_str()).collect();
    codes.sort_unstable();
    codes.join(",")
}

// ── RegionSummary ───────────────────────────────────────────────────

/// Persisted outcome of a region selection: `"{code};{ping};{codes}"`, or
/// only `"{codes}"` when no region answered in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub best: Option<(String, u32)>,
    pub available_codes: String,
}

impl RegionSummary {
    /// Summary of a finished run. The best region is kept only if its ping
    /// is below `max_ping_ms`.
    pub fn new(best: Option<&Region>, regions: &[Region], max_ping_ms: u32) -> Self {
        Self {
            best: best
                .filter(|r| r.ping < max_ping_ms)
                .map(|r| (r.code.clone(), r.ping)),
            available_codes: available_codes(regions),
        }
    }
}

impl fmt::Display for RegionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.best {
            Some((code, ping)) => write!(f, "{code};{ping};{}", self.available_codes),
            None => f.write_str(&self.available_codes),
        }
    }
}

impl FromStr for RegionSummary {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(';').collect();
        match parts.as_slice() {
            [code, ping, codes] => {
                let ping = ping
                    .parse::<u32>()
                    .map_err(|e| RealtimeError::InvalidArgument(format!("region summary ping: {e}")))?;
                Ok(Self {
                    best: Some(((*code).to_string(), ping)),
                    available_codes: (*codes).to_string(),
                })
            }
            [codes] => Ok(Self {
                best: None,
                available_codes: (*codes).to_string(),
            }),
            _ => Err(RealtimeError::InvalidArgument(format!(
                "malformed region summary: {s:?}"
            ))),
        }
    }
}

// ── Pinger ──────────────────────────────────────────────────────────

/// One round trip to a region server.
#[async_trait]
pub trait Pinger: Send + Sync + 'static {
    /// Measures one round trip to `target`, failing or timing out after
    /// `timeout`.
    async fn ping(&self, target: &str, timeout: Duration) -> Result<Duration>;

    /// Whether targets keep their `ws://`/`wss://` scheme.
    fn keeps_scheme(&self) -> bool {
        false
    }
}

/// Pings one region `config.attempts` times in sequence and returns the
/// weighted ping. Failed or late attempts count as `config.max_ping_ms`.
pub async fn ping_region(pinger: &dyn Pinger, address: &str, config: &RegionPingConfig) -> u32 {
    let target = ping_target(address, pinger.keeps_scheme());
    let cap = config.max_ping();
    let mut results = Vec::with_capacity(config.attempts as usize);
    for _ in 0..config.attempts.max(1) {
        let ms = match tokio::time::timeout(cap, pinger.ping(&target, cap)).await {
            Ok(Ok(rtt)) => u32::try_from(rtt.as_millis())
                .unwrap_or(config.max_ping_ms)
                .min(config.max_ping_ms),
            Ok(Err(e)) => {
                debug!(host = %target, error = %e, "ping attempt failed");
                config.max_ping_ms
            }
            Err(_) => config.max_ping_ms,
        };
        results.push(ms);
    }
    weighted_ping(&results)
}

// ── RegionSelector ──────────────────────────────────────────────────

/// Result of one pinging run.
#[derive(Debug, Clone, PartialEq)]
pub struct PingOutcome {
    pub regions: Vec<Region>,
    pub best: Option<Region>,
    pub summary: RegionSummary,
}

struct RunState {
    regions: Vec<Region>,
    remaining: usize,
    aborted: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct Run {
    state: Arc<StdMutex<RunState>>,
    pinger: Arc<dyn Pinger>,
    config: RegionPingConfig,
    done: mpsc::UnboundedSender<PingOutcome>,
}

impl Run {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one region's ping; the task that brings `remaining` to zero
    /// delivers the outcome.
    fn record(&self, index: usize, ping: u32) {
        let outcome = {
            let mut state = self.lock();
            if let Some(region) = state.regions.get_mut(index) {
                region.ping = ping;
            }
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining > 0 || state.aborted {
                return;
            }
            state.tasks.clear();
            outcome_of(state.regions.clone(), &self.config)
        };
        if self.done.send(outcome).is_err() {
            debug!("region selector dropped before pinging completed");
        }
    }

    fn spawn_all(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.aborted {
            return;
        }
        state.remaining = state.regions.len();
        let targets: Vec<(usize, String)> = state
            .regions
            .iter()
            .enumerate()
            .map(|(i, r)| (i, r.address.clone()))
            .collect();
        for (index, address) in targets {
            let run = Arc::clone(self);
            state.tasks.push(tokio::spawn(async move {
                let ping = ping_region(run.pinger.as_ref(), &address, &run.config).await;
                run.record(index, ping);
            }));
        }
    }

    /// Re-pings the previous best region and accepts it if it is still
    /// within the limit; otherwise pings every region.
    async fn sticky(self: Arc<Self>, index: usize, previous_ping: u32) {
        let address = self.lock().regions.get(index).map(|r| r.address.clone());
        let Some(address) = address else {
            self.spawn_all();
            return;
        };
        let ping = ping_region(self.pinger.as_ref(), &address, &self.config).await;
        let limit = f64::from(self.config.reping_limit_ms)
            .max(f64::from(previous_ping) * self.config.similarity_factor);
        if f64::from(ping) <= limit {
            debug!(ping, limit, "previous best region still qualifies");
            self.lock().remaining = 1;
            self.record(index, ping);
        } else {
            debug!(ping, limit, "previous best region too slow, pinging all regions");
            self.spawn_all();
        }
    }
}

fn outcome_of(regions: Vec<Region>, config: &RegionPingConfig) -> PingOutcome {
    let best = select_best(&regions, config.similarity_factor).cloned();
    let summary = RegionSummary::new(best.as_ref(), &regions, config.max_ping_ms);
    PingOutcome {
        regions,
        best,
        summary,
    }
}

/// Owns the region list and the current pinging run.
pub struct RegionSelector {
    pinger: Arc<dyn Pinger>,
    config: RegionPingConfig,
    regions: Vec<Region>,
    best: Option<Region>,
    run: Option<Arc<Run>>,
    done_tx: mpsc::UnboundedSender<PingOutcome>,
    done_rx: mpsc::UnboundedReceiver<PingOutcome>,
}

impl fmt::Debug for RegionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionSelector")
            .field("regions", &self.regions)
            .field("best", &self.best)
            .field("pinging", &self.is_pinging())
            .finish()
    }
}

impl RegionSelector {
    pub fn new(pinger: Arc<dyn Pinger>, config: RegionPingConfig) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            pinger,
            config,
            regions: Vec::new(),
            best: None,
            run: None,
            done_tx,
            done_rx,
        }
    }

    pub fn set_config(&mut self, config: RegionPingConfig) {
        self.config = config;
    }

    /// Snapshot of the region list.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Replaces the region list, dropping the cached best region.
    pub fn set_regions(&mut self, regions: Vec<Region>) {
        self.regions = regions;
        self.best = None;
    }

    /// Best region of the current list, cached until the list changes.
    pub fn best_region(&mut self) -> Option<&Region> {
        if self.best.is_none() {
            self.best = select_best(&self.regions, self.config.similarity_factor).cloned();
        }
        self.best.as_ref()
    }

    pub fn is_pinging(&self) -> bool {
        self.run.is_some()
    }

    /// Starts pinging `regions`. Returns `false` if a run is already in
    /// progress or the list is empty. Must be called inside a tokio runtime.
    pub fn ping_minimum_of_regions(&mut self, regions: Vec<Region>, previous_summary: Option<&str>) -> bool {
        if self.run.is_some() {
            warn!("region pinging already in progress");
            return false;
        }
        if regions.is_empty() {
            return false;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("region pinging needs a tokio runtime");
            return false;
        }

        let sticky = previous_summary
            .and_then(|s| s.parse::<RegionSummary>().ok())
            .and_then(|summary| self.sticky_candidate(&summary, &regions));
        self.set_regions(regions.clone());

        let run = Arc::new(Run {
            state: Arc::new(StdMutex::new(RunState {
                remaining: regions.len(),
                regions,
                aborted: false,
                tasks: Vec::new(),
            })),
            pinger: Arc::clone(&self.pinger),
            config: self.config.clone(),
            done: self.done_tx.clone(),
        });

        match sticky {
            Some((index, previous_ping)) => {
                info!(index, previous_ping, "re-pinging previous best region");
                let task = tokio::spawn(Arc::clone(&run).sticky(index, previous_ping));
                run.lock().tasks.push(task);
            }
            None => {
                info!(count = run.lock().regions.len(), "pinging all regions");
                run.spawn_all();
            }
        }
        self.run = Some(run);
        true
    }

    fn sticky_candidate(&self, summary: &RegionSummary, regions: &[Region]) -> Option<(usize, u32)> {
        let (code, ping) = summary.best.as_ref()?;
        if summary.available_codes != available_codes(regions) || *ping >= self.config.max_ping_ms {
            return None;
        }
        let index = regions.iter().position(|r| &r.code == code)?;
        Some((index, *ping))
    }

    /// Stops the current run. Its outcome is never delivered.
    pub fn abort(&mut self) {
        if let Some(run) = self.run.take() {
            let mut state = run.lock();
            state.aborted = true;
            for task in state.tasks.drain(..) {
                task.abort();
            }
        }
        while self.done_rx.try_recv().is_ok() {}
    }

    /// Takes the outcome of the finished run, if any, and adopts its
    /// regions and best region.
    pub fn poll_completed(&mut self) -> Option<PingOutcome> {
        let outcome = self.done_rx.try_recv().ok()?;
        self.run = None;
        self.regions = outcome.regions.clone();
        self.best = outcome.best.clone();
        Some(outcome)
    }
}

impl Drop for RegionSelector {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn region(code: &str, ping: u32) -> Region {
        let mut r = Region::new(code, format!("{code}.example:27001"));
        r.ping = ping;
        r
    }

    struct TablePinger {
        rtt: HashMap<String, u64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Pinger for TablePinger {
        async fn ping(&self, target: &str, _timeout: Duration) -> Result<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.rtt.get(target) {
                Some(ms) => Ok(Duration::from_millis(*ms)),
                None => Err(RealtimeError::Transport("unreachable".into())),
            }
        }
    }

    fn table(entries: &[(&str, u64)]) -> Arc<TablePinger> {
        Arc::new(TablePinger {
            rtt: entries.iter().map(|(h, ms)| ((*h).to_string(), *ms)).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    async fn wait_outcome(selector: &mut RegionSelector) -> PingOutcome {
        for _ in 0..1000 {
            if let Some(outcome) = selector.poll_completed() {
                return outcome;
            }
            tokio::task::yield_now().await;
        }
        panic!("pinging never completed");
    }

    #[test]
    fn region_code_and_cluster() {
        let r = Region::new("EU/Prod", "eu.example:27001");
        assert_eq!(r.code, "eu");
        assert_eq!(r.cluster.as_deref(), Some("prod"));
        assert!(!r.is_measured());
    }

    #[test]
    fn ping_targets() {
        assert_eq!(ping_target("eu.example:27001", false), "eu.example");
        assert_eq!(ping_target("wss://eu.example:443", false), "eu.example");
        assert_eq!(ping_target("wss://eu.example:443", true), "wss://eu.example");
        assert_eq!(ping_target("10.0.0.1", false), "10.0.0.1");
    }

    #[test]
    fn weighted_ping_drops_worst() {
        assert_eq!(weighted_ping(&[100, 120, 90, 500, 95]), 99);
        assert_eq!(weighted_ping(&[42]), 42);
        assert_eq!(weighted_ping(&[]), PING_UNMEASURED);
    }

    #[test]
    fn best_region_within_cutoff_is_alphabetical() {
        let regions = vec![region("c", 120), region("b", 55), region("a", 50)];
        assert_eq!(select_best(&regions, 1.2).unwrap().code, "a");

        let regions = vec![region("us", 52), region("eu", 60), region("asia", 200)];
        assert_eq!(select_best(&regions, 1.2).unwrap().code, "eu");
        assert!(select_best(&[], 1.2).is_none());
    }

    #[test]
    fn summary_format_and_parse() {
        let regions = vec![region("us", 40), region("eu", 30)];
        let summary = RegionSummary::new(regions.get(1), &regions, 800);
        assert_eq!(summary.to_string(), "eu;30;eu,us");
        assert_eq!("eu;30;eu,us".parse::<RegionSummary>().unwrap(), summary);

        let slow = vec![region("eu", 800)];
        let summary = RegionSummary::new(slow.first(), &slow, 800);
        assert_eq!(summary.to_string(), "eu");
        assert!("a;b;c;d".parse::<RegionSummary>().is_err());
    }

    #[tokio::test]
    async fn pings_all_regions_and_picks_best() {
        let pinger = table(&[("a.example", 50), ("b.example", 55), ("c.example", 120)]);
        let mut selector = RegionSelector::new(pinger.clone(), RegionPingConfig::default());
        let regions = vec![region("c", PING_UNMEASURED), region("a", PING_UNMEASURED), region("b", PING_UNMEASURED)];

        assert!(selector.ping_minimum_of_regions(regions, None));
        assert!(selector.is_pinging());
        let outcome = wait_outcome(&mut selector).await;

        assert_eq!(outcome.best.unwrap().code, "a");
        assert_eq!(outcome.summary.to_string(), "a;50;a,b,c");
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 15);
        assert!(!selector.is_pinging());
        assert_eq!(selector.best_region().unwrap().code, "a");
    }

    #[tokio::test]
    async fn unreachable_region_counts_as_max_ping() {
        let pinger = table(&[("a.example", 70)]);
        let mut selector = RegionSelector::new(pinger, RegionPingConfig::default());
        selector.ping_minimum_of_regions(vec![region("a", PING_UNMEASURED), region("b", PING_UNMEASURED)], None);
        let outcome = wait_outcome(&mut selector).await;
        let b = outcome.regions.iter().find(|r| r.code == "b").unwrap();
        assert_eq!(b.ping, 800);
    }

    #[tokio::test]
    async fn sticky_region_is_kept_when_still_fast() {
        let pinger = table(&[("a.example", 50), ("b.example", 20)]);
        let mut selector = RegionSelector::new(pinger.clone(), RegionPingConfig::default());
        let regions = vec![region("a", PING_UNMEASURED), region("b", PING_UNMEASURED)];

        selector.ping_minimum_of_regions(regions, Some("a;45;a,b"));
        let outcome = wait_outcome(&mut selector).await;

        assert_eq!(outcome.best.unwrap().code, "a");
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn sticky_region_too_slow_pings_everything() {
        let pinger = table(&[("a.example", 300), ("b.example", 20)]);
        let mut selector = RegionSelector::new(pinger.clone(), RegionPingConfig::default());
        let regions = vec![region("a", PING_UNMEASURED), region("b", PING_UNMEASURED)];

        selector.ping_minimum_of_regions(regions, Some("a;45;a,b"));
        let outcome = wait_outcome(&mut selector).await;

        assert_eq!(outcome.best.unwrap().code, "b");
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn changed_region_list_ignores_summary() {
        let pinger = table(&[("a.example", 50), ("b.example", 60)]);
        let mut selector = RegionSelector::new(pinger.clone(), RegionPingConfig::default());
        selector.ping_minimum_of_regions(
            vec![region("a", PING_UNMEASURED), region("b", PING_UNMEASURED)],
            Some("a;45;a,b,c"),
        );
        wait_outcome(&mut selector).await;
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn abort_suppresses_outcome() {
        let pinger = table(&[("a.example", 50)]);
        let mut selector = RegionSelector::new(pinger, RegionPingConfig::default());
        selector.ping_minimum_of_regions(vec![region("a", PING_UNMEASURED)], None);
        selector.abort();
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert!(selector.poll_completed().is_none());
        assert!(!selector.is_pinging());
    }

    #[tokio::test]
    async fn second_run_is_refused_while_pinging() {
        let pinger = table(&[("a.example", 50)]);
        let mut selector = RegionSelector::new(pinger, RegionPingConfig::default());
        assert!(selector.ping_minimum_of_regions(vec![region("a", PING_UNMEASURED)], None));
        assert!(!selector.ping_minimum_of_regions(vec![region("a", PING_UNMEASURED)], None));
    }
}
