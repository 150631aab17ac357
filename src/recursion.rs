//! Cross-datacenter recursion.
//!
//! Names the local directory does not own are forwarded to a resolver in the
//! datacenter named by the query; PTR misses are fanned out to every known
//! datacenter. The `datacenter -> [resolver]` map is rebuilt on an interval
//! and swapped in whole.
//!
//! Recursion is best effort: every failure becomes an empty NOERROR answer.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Record, RecordType};
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::backend::ResolverSource;
use crate::config::RecursionConfig;
use crate::error::BinderError;
use crate::interfaces::InterfaceAddrs;
use crate::metrics::{self, RecursionOutcome, RecursionPath};
use crate::name::datacenter_label;
use crate::resolver::{Answer, RecursionRequest};
use crate::upstream::Upstream;

/// Resolver addresses per remote datacenter.
pub type ResolverMap = BTreeMap<String, Vec<IpAddr>>;

/// The recursion agent.
pub struct Recursion {
    config: RecursionConfig,
    zone: String,
    datacenter: String,
    resolvers: RwLock<Arc<ResolverMap>>,
    source: Arc<dyn ResolverSource>,
    upstream: Arc<dyn Upstream>,
    interfaces: InterfaceAddrs,
    forward_limit: Semaphore,
    reverse_limit: Semaphore,
    ready: watch::Sender<bool>,
}

impl std::fmt::Debug for Recursion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recursion")
            .field("zone", &self.zone)
            .field("datacenter", &self.datacenter)
            .field("region", &self.config.region_name)
            .field("datacenters", &self.resolvers.read().len())
            .finish()
    }
}

impl Recursion {
    /// Create an agent for `datacenter` inside `zone`.
    ///
    /// The resolver map starts empty; [`Recursion::run`] fills it.
    pub fn new(
        config: RecursionConfig,
        zone: &str,
        datacenter: &str,
        source: Arc<dyn ResolverSource>,
        upstream: Arc<dyn Upstream>,
        interfaces: InterfaceAddrs,
    ) -> Self {
        let forward_limit = Semaphore::new(config.forward_concurrency.max(1));
        let reverse_limit = Semaphore::new(config.reverse_concurrency.max(1));
        Self {
            zone: zone.trim_matches('.').to_ascii_lowercase(),
            datacenter: datacenter.trim_matches('.').to_ascii_lowercase(),
            resolvers: RwLock::new(Arc::new(ResolverMap::new())),
            source,
            upstream,
            interfaces,
            forward_limit,
            reverse_limit,
            ready: watch::channel(false).0,
            config,
        }
    }

    /// The current resolver map.
    pub fn resolvers(&self) -> Arc<ResolverMap> {
        self.resolvers.read().clone()
    }

    /// True once the first refresh attempt has finished.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the first refresh attempt has finished.
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Rebuild the resolver map from the source.
    ///
    /// On error the previous map stays in place.
    pub async fn refresh(&self) -> Result<usize, BinderError> {
        let deadline = self.config.backend.timeout();
        let listing =
            tokio::time::timeout(deadline, self.source.list_resolvers(&self.config.region_name));
        let entries = match listing.await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                metrics::record_resolver_refresh(false, 0, 0);
                return Err(e);
            }
            Err(_) => {
                metrics::record_resolver_refresh(false, 0, 0);
                return Err(BinderError::Timeout(deadline));
            }
        };

        let mut map = ResolverMap::new();
        for entry in entries {
            let dc = entry.datacenter.to_ascii_lowercase();
            if dc == self.datacenter {
                continue;
            }
            let ips = map.entry(dc).or_default();
            if !ips.contains(&entry.ip) {
                ips.push(entry.ip);
            }
        }

        let total = map.values().map(Vec::len).sum();
        metrics::record_resolver_refresh(true, map.len(), total);
        debug!(datacenters = map.len(), resolvers = total, "resolver map refreshed");
        *self.resolvers.write() = Arc::new(map);
        Ok(total)
    }

    /// Keep the resolver map fresh until shutdown.
    ///
    /// The first refresh is retried every `retry_interval` until it succeeds.
    /// Readiness is signalled after the first attempt regardless of outcome.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(region = %self.config.region_name, datacenter = %self.datacenter, "starting recursion");
        loop {
            let result = self.refresh().await;
            self.ready.send_replace(true);
            match result {
                Ok(total) => {
                    info!(resolvers = total, "recursion initialised");
                    break;
                }
                Err(e) => warn!(
                    error = %e,
                    retry_in = ?self.config.retry_interval(),
                    "unable to list resolvers, recursion unavailable"
                ),
            }
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => return,
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }

        let period = self.config.refresh_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    debug!("recursion refresh shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "resolver refresh failed, keeping previous map");
                    }
                }
            }
        }
    }

    /// Upstream servers eligible for `request`, local addresses excluded.
    pub fn candidates(&self, request: &RecursionRequest) -> Vec<SocketAddr> {
        let map = self.resolvers();
        let ips: Vec<IpAddr> = match request.path {
            RecursionPath::Forward => {
                let name = request.name.to_ascii();
                let name = name.trim_end_matches('.').to_ascii_lowercase();
                match datacenter_label(&name, &self.zone) {
                    Some(dc) => map.get(dc).cloned().unwrap_or_default(),
                    None => Vec::new(),
                }
            }
            RecursionPath::Reverse => {
                let unique: BTreeSet<IpAddr> = map.values().flatten().copied().collect();
                unique.into_iter().collect()
            }
        };

        ips.into_iter()
            .filter(|ip| {
                let local = self.interfaces.contains(ip);
                if local {
                    trace!(%ip, "skipping resolver bound to a local interface");
                }
                !local
            })
            .map(|ip| SocketAddr::new(ip, self.config.upstream_port))
            .collect()
    }

    /// Answer `request` from a remote datacenter.
    pub async fn resolve(&self, request: &RecursionRequest) -> Answer {
        let candidates = self.candidates(request);
        if candidates.is_empty() {
            debug!(name = %request.name, path = ?request.path, "no recursion candidates");
            metrics::record_recursion(request.path, RecursionOutcome::NoCandidates);
            return Answer::code(ResponseCode::NoError);
        }

        let deadline = self.config.timeout();
        let result = tokio::time::timeout(deadline, self.exchange(request, candidates)).await;
        let records = match result {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                debug!(name = %request.name, error = %e, "recursion failed");
                metrics::record_recursion(request.path, RecursionOutcome::Error);
                return Answer::code(ResponseCode::NoError);
            }
            Err(_) => {
                debug!(name = %request.name, timeout = ?deadline, "recursion timed out");
                metrics::record_recursion(request.path, RecursionOutcome::Timeout);
                return Answer::code(ResponseCode::NoError);
            }
        };

        let mut answer = Answer::code(ResponseCode::NoError);
        answer.answers = translate(records);
        let outcome = if answer.answers.is_empty() {
            RecursionOutcome::Empty
        } else {
            RecursionOutcome::Answered
        };
        metrics::record_recursion(request.path, outcome);
        answer
    }

    async fn exchange(
        &self,
        request: &RecursionRequest,
        candidates: Vec<SocketAddr>,
    ) -> Result<Vec<Record>, BinderError> {
        match request.path {
            RecursionPath::Forward => {
                let _permit = self
                    .forward_limit
                    .acquire()
                    .await
                    .map_err(|e| BinderError::Backend(e.to_string()))?;
                let server = candidates
                    .choose(&mut rand::rng())
                    .copied()
                    .ok_or_else(|| BinderError::Backend("no candidate".into()))?;
                trace!(%server, name = %request.name, "forwarding query");
                self.upstream
                    .query(server, &request.name, request.qtype)
                    .await
            }
            RecursionPath::Reverse => {
                let _permit = self
                    .reverse_limit
                    .acquire()
                    .await
                    .map_err(|e| BinderError::Backend(e.to_string()))?;
                self.fan_out(request, candidates).await
            }
        }
    }

    /// Ask every candidate, `reverse_fanout` at a time, until one answers.
    async fn fan_out(
        &self,
        request: &RecursionRequest,
        candidates: Vec<SocketAddr>,
    ) -> Result<Vec<Record>, BinderError> {
        let upstream = &self.upstream;
        let mut pending = stream::iter(candidates)
            .map(|server| async move {
                let result = upstream.query(server, &request.name, request.qtype).await;
                (server, result)
            })
            .buffer_unordered(self.config.reverse_fanout.max(1));

        let mut errors = 0;
        while let Some((server, result)) = pending.next().await {
            match result {
                Ok(records) if !records.is_empty() => {
                    trace!(%server, name = %request.name, "reverse lookup answered");
                    return Ok(records);
                }
                Ok(_) => {}
                Err(e) => {
                    errors += 1;
                    debug!(%server, error = %e, errors, "reverse lookup upstream error");
                    if errors >= self.config.reverse_error_threshold.max(1) {
                        return Err(e);
                    }
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Resolves once shutdown is requested, without holding the channel's lock.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Keep the records that have a local representation.
fn translate(records: Vec<Record>) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| match record.record_type() {
            RecordType::A
            | RecordType::AAAA
            | RecordType::PTR
            | RecordType::CNAME
            | RecordType::SRV
            | RecordType::TXT => true,
            other => {
                warn!(name = %record.name(), record_type = %other, "dropping unsupported upstream record");
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResolverEntry;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::{A, MX, PTR};
    use hickory_proto::rr::{Name, RData};
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeSource {
        entries: Vec<ResolverEntry>,
        failures: AtomicUsize,
        silent: bool,
    }

    impl FakeSource {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                entries: entries
                    .iter()
                    .map(|(dc, ip)| ResolverEntry {
                        datacenter: dc.to_string(),
                        ip: ip.parse().unwrap(),
                    })
                    .collect(),
                failures: AtomicUsize::new(0),
                silent: false,
            }
        }

        fn silent(mut self) -> Self {
            self.silent = true;
            self
        }

        fn failing(mut self, times: usize) -> Self {
            self.failures = AtomicUsize::new(times);
            self
        }
    }

    #[async_trait]
    impl ResolverSource for FakeSource {
        async fn list_resolvers(&self, region: &str) -> Result<Vec<ResolverEntry>, BinderError> {
            assert_eq!(region, "us");
            if self.silent {
                std::future::pending::<()>().await;
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BinderError::Backend("ufds down".into()));
            }
            Ok(self.entries.clone())
        }
    }

    enum Reply {
        Records(Vec<Record>),
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct FakeUpstream {
        replies: Mutex<BTreeMap<IpAddr, Reply>>,
        asked: Mutex<Vec<SocketAddr>>,
    }

    impl FakeUpstream {
        fn reply(self, ip: &str, reply: Reply) -> Self {
            self.replies.lock().insert(ip.parse().unwrap(), reply);
            self
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn query(
            &self,
            server: SocketAddr,
            _name: &Name,
            _rtype: RecordType,
        ) -> Result<Vec<Record>, BinderError> {
            self.asked.lock().push(server);
            let reply = match self.replies.lock().get(&server.ip()) {
                Some(Reply::Records(records)) => Some(Ok(records.clone())),
                Some(Reply::Fail) => Some(Err(BinderError::Backend("refused".into()))),
                Some(Reply::Hang) => None,
                None => Some(Ok(Vec::new())),
            };
            match reply {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn agent(
        source: Arc<FakeSource>,
        upstream: Arc<FakeUpstream>,
        local: &[&str],
    ) -> Arc<Recursion> {
        let backend = crate::config::BackendConfig::new("ufds.coal.joyent.us");
        Arc::new(Recursion::new(
            RecursionConfig::new("us", backend),
            "joyent.us",
            "coal",
            source,
            upstream,
            InterfaceAddrs::fixed(local.iter().map(|ip| ip.parse().unwrap())),
        ))
    }

    fn forward(name: &str) -> RecursionRequest {
        RecursionRequest {
            name: Name::from_ascii(name).unwrap(),
            qtype: RecordType::A,
            path: RecursionPath::Forward,
        }
    }

    fn reverse(name: &str) -> RecursionRequest {
        RecursionRequest {
            name: Name::from_ascii(name).unwrap(),
            qtype: RecordType::PTR,
            path: RecursionPath::Reverse,
        }
    }

    fn a(name: &str, ip: Ipv4Addr) -> Record {
        Record::from_rdata(Name::from_ascii(name).unwrap(), 60, RData::A(A(ip)))
    }

    #[tokio::test]
    async fn test_refresh_groups_and_excludes_local_datacenter() {
        let source = Arc::new(FakeSource::new(&[
            ("us-west-1", "10.1.0.1"),
            ("us-west-1", "10.1.0.1"),
            ("us-west-1", "10.1.0.2"),
            ("US-EAST-2", "10.2.0.1"),
            ("coal", "10.9.0.1"),
        ]));
        let recursion = agent(source, Arc::new(FakeUpstream::default()), &[]);
        assert_eq!(recursion.refresh().await.unwrap(), 3);

        let map = recursion.resolvers();
        assert_eq!(map.len(), 2);
        assert_eq!(map["us-west-1"].len(), 2);
        assert_eq!(map["us-east-2"], vec!["10.2.0.1".parse::<IpAddr>().unwrap()]);
        assert!(!map.contains_key("coal"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_map() {
        let source = Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1")]));
        let recursion = agent(source.clone(), Arc::new(FakeUpstream::default()), &[]);
        recursion.refresh().await.unwrap();

        source.failures.store(1, Ordering::SeqCst);
        assert!(recursion.refresh().await.is_err());
        assert_eq!(recursion.resolvers().len(), 1);
    }

    #[tokio::test]
    async fn test_local_interface_candidates_yield_empty_answer() {
        let upstream = Arc::new(FakeUpstream::default());
        let recursion = agent(
            Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1")])),
            upstream.clone(),
            &["10.1.0.1"],
        );
        recursion.refresh().await.unwrap();

        let request = forward("moray.us-west-1.joyent.us.");
        assert!(recursion.candidates(&request).is_empty());
        let answer = recursion.resolve(&request).await;
        assert_eq!(answer.code, ResponseCode::NoError);
        assert!(answer.answers.is_empty());
        assert!(!answer.authoritative);
        assert!(upstream.asked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forward_uses_named_datacenter() {
        let addr = Ipv4Addr::new(10, 1, 5, 5);
        let upstream = Arc::new(
            FakeUpstream::default()
                .reply(
                    "10.1.0.1",
                    Reply::Records(vec![
                        a("moray.us-west-1.joyent.us.", addr),
                        Record::from_rdata(
                            Name::from_ascii("moray.us-west-1.joyent.us.").unwrap(),
                            60,
                            RData::MX(MX::new(10, Name::from_ascii("mx.joyent.us.").unwrap())),
                        ),
                    ]),
                )
                .reply("10.2.0.1", Reply::Fail),
        );
        let recursion = agent(
            Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1"), ("us-east-2", "10.2.0.1")])),
            upstream.clone(),
            &[],
        );
        recursion.refresh().await.unwrap();

        let answer = recursion.resolve(&forward("moray.us-west-1.joyent.us.")).await;
        assert_eq!(answer.code, ResponseCode::NoError);
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].data(), &RData::A(A(addr)));
        assert_eq!(
            *upstream.asked.lock(),
            vec!["10.1.0.1:53".parse::<SocketAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_unknown_datacenter_has_no_candidates() {
        let upstream = Arc::new(FakeUpstream::default());
        let recursion = agent(
            Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1")])),
            upstream.clone(),
            &[],
        );
        recursion.refresh().await.unwrap();

        for name in ["moray.eu-ams-1.joyent.us.", "www.example.com.", "coal.joyent.us."] {
            let answer = recursion.resolve(&forward(name)).await;
            assert!(answer.answers.is_empty(), "{name}");
        }
        assert!(upstream.asked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reverse_fans_out_to_every_datacenter() {
        let target = Name::from_ascii("web.us-east-2.joyent.us.").unwrap();
        let upstream = Arc::new(
            FakeUpstream::default()
                .reply("10.1.0.1", Reply::Fail)
                .reply(
                    "10.2.0.1",
                    Reply::Records(vec![Record::from_rdata(
                        Name::from_ascii("5.0.2.10.in-addr.arpa.").unwrap(),
                        30,
                        RData::PTR(PTR(target.clone())),
                    )]),
                ),
        );
        let recursion = agent(
            Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1"), ("us-east-2", "10.2.0.1")])),
            upstream,
            &[],
        );
        recursion.refresh().await.unwrap();

        let answer = recursion.resolve(&reverse("5.0.2.10.in-addr.arpa.")).await;
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].data(), &RData::PTR(PTR(target)));
    }

    #[tokio::test]
    async fn test_reverse_gives_up_after_error_threshold() {
        let upstream = Arc::new(
            FakeUpstream::default()
                .reply("10.1.0.1", Reply::Fail)
                .reply("10.1.0.2", Reply::Fail)
                .reply("10.1.0.3", Reply::Fail),
        );
        let recursion = agent(
            Arc::new(FakeSource::new(&[
                ("us-west-1", "10.1.0.1"),
                ("us-west-1", "10.1.0.2"),
                ("us-west-1", "10.1.0.3"),
            ])),
            upstream,
            &[],
        );
        recursion.refresh().await.unwrap();

        let answer = recursion.resolve(&reverse("1.2.3.4.in-addr.arpa.")).await;
        assert_eq!(answer.code, ResponseCode::NoError);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_empty_answer() {
        let upstream = Arc::new(FakeUpstream::default().reply("10.1.0.1", Reply::Hang));
        let recursion = agent(
            Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1")])),
            upstream,
            &[],
        );
        recursion.refresh().await.unwrap();

        let answer = recursion.resolve(&forward("moray.us-west-1.joyent.us.")).await;
        assert_eq!(answer.code, ResponseCode::NoError);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_first_attempt_and_retry() {
        let source = Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1")]).failing(2));
        let recursion = agent(source, Arc::new(FakeUpstream::default()), &[]);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(recursion.clone().run(shutdown));

        tokio::time::timeout(Duration::from_secs(1), recursion.wait_ready())
            .await
            .unwrap();
        assert!(recursion.is_ready());
        assert!(recursion.resolvers().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(recursion.resolvers().len(), 1);

        stop.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reverse_asks_shared_resolver_once() {
        let recursion = agent(
            Arc::new(FakeSource::new(&[
                ("us-west-1", "10.1.0.1"),
                ("us-east-2", "10.1.0.1"),
                ("us-east-2", "10.2.0.1"),
            ])),
            Arc::new(FakeUpstream::default()),
            &[],
        );
        recursion.refresh().await.unwrap();

        let mut candidates = recursion.candidates(&reverse("5.0.2.10.in-addr.arpa."));
        candidates.sort();
        assert_eq!(
            candidates,
            vec![
                "10.1.0.1:53".parse::<SocketAddr>().unwrap(),
                "10.2.0.1:53".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_source_times_out_and_still_signals_ready() {
        let recursion = agent(
            Arc::new(FakeSource::new(&[("us-west-1", "10.1.0.1")]).silent()),
            Arc::new(FakeUpstream::default()),
            &[],
        );
        assert!(matches!(
            recursion.refresh().await,
            Err(BinderError::Timeout(d)) if d == Duration::from_secs(5)
        ));

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(recursion.clone().run(shutdown));
        tokio::time::timeout(Duration::from_secs(10), recursion.wait_ready())
            .await
            .unwrap();
        assert!(recursion.resolvers().is_empty());

        stop.send_replace(true);
        task.await.unwrap();
    }
}
