//! Resolution engine: maps a query onto the tree cache.
//!
//! ```text
//! _http._tcp.bar.foo.com SRV
//!   → strip the SRV prefix (_http, _tcp) → bar.foo.com
//!   → check the zone suffix and doubled suffixes
//!   → lookup bar.foo.com in the tree
//!   → service record: one SRV per (member, port), glue A per member
//! ```
//!
//! Resolution is synchronous and never touches the network. A miss that
//! should be forwarded is returned as [`Outcome::Recurse`] for the caller to
//! hand to the recursion agent.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, PTR, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::ProtoError;
use rand::seq::SliceRandom;
use tracing::{debug, error, trace};

use crate::hints::RootHints;
use crate::metrics::RecursionPath;
use crate::name::{has_suffix, is_valid_name, parse_reverse_v4, parse_srv_name, strip_suffix};
use crate::record::{self, HostRecord, Record as DirectoryRecord, RecordKind, ServiceRecord};
use crate::tree::{TreeCache, TreeNode};

/// SRV priority for every member.
pub const SRV_PRIORITY: u16 = 0;
/// SRV weight for every member.
pub const SRV_WEIGHT: u16 = 10;

/// A finished response, minus the header bits the handler owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Response code.
    pub code: ResponseCode,
    /// Answer section.
    pub answers: Vec<Record>,
    /// Authority section.
    pub authorities: Vec<Record>,
    /// Additional section.
    pub additionals: Vec<Record>,
    /// Whether to set the AA bit.
    pub authoritative: bool,
}

impl Answer {
    /// An empty response with `code`.
    pub fn code(code: ResponseCode) -> Self {
        Self {
            code,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            authoritative: false,
        }
    }

    /// An empty authoritative response with `code` (NODATA, NXDOMAIN).
    pub fn authoritative(code: ResponseCode) -> Self {
        Self {
            authoritative: true,
            ..Self::code(code)
        }
    }

    /// A referral to the root servers.
    pub fn referral(hints: &RootHints) -> Self {
        Self {
            authorities: hints.authorities().to_vec(),
            additionals: hints.additionals().to_vec(),
            ..Self::code(ResponseCode::NoError)
        }
    }
}

/// A query the engine could not answer locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecursionRequest {
    /// Name as queried.
    pub name: Name,
    /// Type as queried.
    pub qtype: RecordType,
    /// Which recursion path applies.
    pub path: RecursionPath,
}

/// Result of local resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Send this response.
    Respond(Answer),
    /// Hand the query to the recursion agent.
    Recurse(RecursionRequest),
}

/// Per-request state carried through resolution and into the query log.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Message id, for log correlation.
    pub id: u16,
    /// Name as queried.
    pub qname: Name,
    /// Type as queried.
    pub qtype: RecordType,
    /// `(service, protocol)` if the name had an SRV prefix.
    pub srv: Option<(String, String)>,
    /// Name with the zone suffix removed.
    pub stripped: Option<String>,
    started: Instant,
    last: Instant,
    timers: Vec<(&'static str, Duration)>,
}

impl QueryContext {
    /// Start timing a new query.
    pub fn new(id: u16, qname: Name, qtype: RecordType) -> Self {
        let now = Instant::now();
        Self {
            id,
            qname,
            qtype,
            srv: None,
            stripped: None,
            started: now,
            last: now,
            timers: Vec::new(),
        }
    }

    /// The queried name without its trailing dot, case preserved.
    pub fn name(&self) -> String {
        self.qname.to_ascii().trim_end_matches('.').to_string()
    }

    /// Record time spent since the previous checkpoint under `label`.
    pub fn stamp(&mut self, label: &'static str) {
        let now = Instant::now();
        self.timers.push((label, now - self.last));
        self.last = now;
    }

    /// Checkpoints recorded so far.
    pub fn timers(&self) -> &[(&'static str, Duration)] {
        &self.timers
    }

    /// Time since the query was received.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The resolution engine.
#[derive(Debug, Clone)]
pub struct Resolver {
    cache: TreeCache,
    zone: Option<String>,
    datacenter: Option<String>,
    hints: Arc<RootHints>,
    recursion: bool,
}

impl Resolver {
    /// Create an engine over `cache`.
    ///
    /// `zone` enables suffix checking and root referrals; `recursion` makes
    /// misses come back as [`Outcome::Recurse`] instead of REFUSED.
    pub fn new(
        cache: TreeCache,
        zone: Option<String>,
        datacenter: Option<String>,
        hints: Arc<RootHints>,
        recursion: bool,
    ) -> Self {
        let normalize = |s: String| s.trim_matches('.').to_ascii_lowercase();
        Self {
            cache,
            zone: zone.map(normalize).filter(|z| !z.is_empty()),
            datacenter: datacenter.map(normalize).filter(|d| !d.is_empty()),
            hints,
            recursion,
        }
    }

    /// The tree this engine reads.
    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    /// Resolve an A, SRV or ANY query.
    pub fn resolve(&self, ctx: &mut QueryContext) -> Outcome {
        let raw = ctx.name();
        if raw.is_empty() {
            debug!(id = ctx.id, "request for an empty name: this client is probably misbehaving");
            return Outcome::Respond(Answer::code(ResponseCode::FormErr));
        }
        let name = raw.to_ascii_lowercase();
        if !is_valid_name(&name) {
            debug!(id = ctx.id, name = %raw, "request for an invalid name: this client is probably misbehaving");
            return Outcome::Respond(Answer::code(ResponseCode::FormErr));
        }

        let mut domain = name.as_str();
        let srv = parse_srv_name(&name);
        if ctx.qtype == RecordType::SRV || (ctx.qtype == RecordType::ANY && srv.is_some()) {
            let Some(srv) = srv else {
                debug!(id = ctx.id, name = %name, "not a valid SRV lookup name");
                return Outcome::Respond(Answer::code(ResponseCode::NoError));
            };
            ctx.srv = Some((srv.service.to_string(), srv.protocol.to_string()));
            domain = srv.rest;
        }

        if let Some(zone) = &self.zone {
            let Some(stripped) = strip_suffix(domain, zone) else {
                trace!(id = ctx.id, name = %domain, "not within dns domain suffix");
                return Outcome::Respond(Answer::referral(&self.hints));
            };
            if self.is_doubled_suffix(stripped, zone) {
                trace!(id = ctx.id, name = %domain, "doubled-up dns domain suffix");
                return Outcome::Respond(Answer::referral(&self.hints));
            }
            ctx.stripped = Some(stripped.to_string());
        }
        ctx.stamp("parse");

        if !self.cache.is_ready() {
            error!(id = ctx.id, name = %domain, "directory not ready");
            return Outcome::Respond(Answer::code(ResponseCode::ServFail));
        }

        let node = self.cache.lookup(domain);
        ctx.stamp("lookup");
        let Some(node) = node else {
            trace!(id = ctx.id, name = %domain, "node not found in tree");
            if self.recursion {
                trace!(id = ctx.id, "handing off to recursion");
                return Outcome::Recurse(RecursionRequest {
                    name: ctx.qname.clone(),
                    qtype: ctx.qtype,
                    path: RecursionPath::Forward,
                });
            }
            // Not NXDOMAIN: clients that list us before public resolvers must
            // fall through to the next nameserver.
            return Outcome::Respond(Answer::code(ResponseCode::Refused));
        };

        let answer = self.dispatch(ctx, domain, &node);
        ctx.stamp("build_response");
        Outcome::Respond(answer)
    }

    /// Resolve a PTR query.
    ///
    /// With recursion on, every PTR query goes to the reverse path unless a
    /// ready tree holds the address. Without it, only the local reverse index
    /// is consulted.
    pub fn resolve_reverse(&self, ctx: &mut QueryContext) -> Outcome {
        let name = ctx.name().to_ascii_lowercase();
        let addr = parse_reverse_v4(&name);
        ctx.stamp("parse");

        if self.recursion {
            if let Some(answer) = addr.and_then(|addr| self.local_reverse(ctx, addr)) {
                return Outcome::Respond(answer);
            }
            trace!(id = ctx.id, name = %name, "handing reverse lookup to recursion");
            return Outcome::Recurse(RecursionRequest {
                name: ctx.qname.clone(),
                qtype: ctx.qtype,
                path: RecursionPath::Reverse,
            });
        }

        let Some(addr) = addr else {
            debug!(id = ctx.id, name = %name, "invalid reverse lookup name");
            return Outcome::Respond(Answer::code(ResponseCode::Refused));
        };
        if !self.cache.is_ready() {
            error!(id = ctx.id, name = %name, "directory not ready");
            return Outcome::Respond(Answer::code(ResponseCode::ServFail));
        }
        match self.local_reverse(ctx, addr) {
            Some(answer) => Outcome::Respond(answer),
            None => Outcome::Respond(Answer::code(ResponseCode::Refused)),
        }
    }

    /// PTR answers for `addr` from a ready tree, or `None` on a miss.
    fn local_reverse(&self, ctx: &mut QueryContext, addr: Ipv4Addr) -> Option<Answer> {
        if !self.cache.is_ready() {
            return None;
        }
        let hits = self.cache.reverse_lookup(addr);
        ctx.stamp("lookup");
        if hits.is_empty() {
            trace!(id = ctx.id, %addr, "address not registered locally");
            return None;
        }

        let mut answer = Answer::authoritative(ResponseCode::NoError);
        for hit in hits {
            let ttl = hit.data.as_ref().map_or(record::DEFAULT_TTL, |r| r.ttl());
            match fqdn(&hit.domain) {
                Ok(target) => answer.answers.push(Record::from_rdata(
                    ctx.qname.clone(),
                    ttl,
                    RData::PTR(PTR(target)),
                )),
                Err(e) => error!(id = ctx.id, domain = %hit.domain, error = %e, "unrepresentable PTR target"),
            }
        }
        ctx.stamp("build_response");
        Some(answer)
    }

    fn is_doubled_suffix(&self, stripped: &str, zone: &str) -> bool {
        if has_suffix(stripped, zone) {
            return true;
        }
        match &self.datacenter {
            Some(dc) => has_suffix(stripped, &format!("{zone}.{dc}")),
            None => false,
        }
    }

    fn dispatch(&self, ctx: &QueryContext, domain: &str, node: &TreeNode) -> Answer {
        let record = match node.data.as_deref() {
            None => {
                error!(id = ctx.id, name = %domain, "no record at node");
                return Answer::code(ResponseCode::ServFail);
            }
            Some(DirectoryRecord::Invalid {
                reason, payload, ..
            }) => {
                error!(id = ctx.id, name = %domain, reason = %reason, record = %payload, "invalid directory record");
                return Answer::code(ResponseCode::ServFail);
            }
            Some(DirectoryRecord::Unknown { type_name }) => {
                error!(id = ctx.id, name = %domain, record_type = %type_name, "record type in directory is unknown");
                return Answer::code(ResponseCode::ServFail);
            }
            Some(record) => record,
        };
        let ttl = record.ttl();

        if ctx.srv.is_some() && record.kind() != Some(RecordKind::Service) {
            // Known name without SRV data.
            return Answer::authoritative(ResponseCode::NoError);
        }

        let built = match record {
            DirectoryRecord::Host(HostRecord {
                address: Some(addr),
                ..
            }) => a_answer(domain, *addr, ttl),
            DirectoryRecord::Host(HostRecord { address: None, .. }) => {
                Ok(Answer::authoritative(ResponseCode::NoError))
            }
            DirectoryRecord::Database(db) => a_answer(domain, db.address, ttl),
            DirectoryRecord::Service(svc) => return self.service_answer(ctx, domain, node, svc, ttl),
            DirectoryRecord::Unknown { .. } | DirectoryRecord::Invalid { .. } => {
                Ok(Answer::code(ResponseCode::ServFail))
            }
        };

        built.unwrap_or_else(|e| {
            error!(id = ctx.id, name = %domain, error = %e, "unrepresentable answer");
            Answer::code(ResponseCode::ServFail)
        })
    }

    fn service_answer(
        &self,
        ctx: &QueryContext,
        domain: &str,
        node: &TreeNode,
        svc: &ServiceRecord,
        ttl: u32,
    ) -> Answer {
        if let Some((service, protocol)) = &ctx.srv {
            if !svc.matches(service, protocol) {
                debug!(
                    id = ctx.id,
                    name = %domain,
                    requested = %format!("{service}.{protocol}"),
                    "service/protocol not registered at name"
                );
                return Answer::authoritative(ResponseCode::NXDomain);
            }
        }

        let mut members = Vec::new();
        for child in self.cache.children(node) {
            match child.data.as_deref() {
                Some(DirectoryRecord::Host(host)) if host.kind.is_member() => {
                    members.push((child.clone(), host.clone()));
                }
                Some(DirectoryRecord::Invalid {
                    type_name: Some(tag),
                    payload,
                    ..
                }) if RecordKind::from_tag(tag).is_some_and(|k| k.is_member()) => {
                    // A partial member list must never look complete.
                    error!(id = ctx.id, name = %domain, member = %child.name, record = %payload, "bad member record");
                    return Answer::code(ResponseCode::ServFail);
                }
                _ => {}
            }
        }
        members.shuffle(&mut rand::rng());

        match self.build_members(ctx, domain, svc, ttl, &members) {
            Ok(answer) => answer,
            Err(e) => {
                error!(id = ctx.id, name = %domain, error = %e, "unrepresentable answer");
                Answer::code(ResponseCode::ServFail)
            }
        }
    }

    fn build_members(
        &self,
        ctx: &QueryContext,
        domain: &str,
        svc: &ServiceRecord,
        ttl: u32,
        members: &[(Arc<TreeNode>, HostRecord)],
    ) -> Result<Answer, ProtoError> {
        let mut answer = Answer::authoritative(ResponseCode::NoError);
        let owner = fqdn(domain)?;

        for (member, host) in members {
            let Some(addr) = host.address else {
                continue;
            };
            let rttl = host.ttl.unwrap_or(ttl);

            if ctx.srv.is_some() {
                let target = fqdn(&format!("{}.{}", member.name, domain))?;
                let ports: Vec<u16> = if host.ports.is_empty() {
                    svc.port.into_iter().collect()
                } else {
                    host.ports.clone()
                };
                for port in ports {
                    answer.answers.push(Record::from_rdata(
                        ctx.qname.clone(),
                        ttl,
                        RData::SRV(SRV::new(SRV_PRIORITY, SRV_WEIGHT, port, target.clone())),
                    ));
                }
                answer
                    .additionals
                    .push(Record::from_rdata(target, rttl, RData::A(A(addr))));
            } else {
                // A records here stand for both membership and address.
                answer.answers.push(Record::from_rdata(
                    owner.clone(),
                    ttl.min(rttl),
                    RData::A(A(addr)),
                ));
            }
        }
        Ok(answer)
    }
}

fn fqdn(domain: &str) -> Result<Name, ProtoError> {
    let mut name = Name::from_ascii(domain)?;
    name.set_fqdn(true);
    Ok(name)
}

fn a_answer(domain: &str, addr: Ipv4Addr, ttl: u32) -> Result<Answer, ProtoError> {
    let mut answer = Answer::authoritative(ResponseCode::NoError);
    answer
        .answers
        .push(Record::from_rdata(fqdn(domain)?, ttl, RData::A(A(addr))));
    Ok(answer)
}
