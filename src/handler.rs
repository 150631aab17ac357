//! hickory request handler.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Header, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::recursion::Recursion;
use crate::resolver::{Answer, Outcome, QueryContext, Resolver};

/// Queries slower than this are logged at warn.
const SLOW_QUERY: Duration = Duration::from_secs(1);

/// Routes each query to the resolution engine, and to recursion on a miss.
#[derive(Debug, Clone)]
pub struct BinderHandler {
    resolver: Resolver,
    recursion: Option<Arc<Recursion>>,
}

impl BinderHandler {
    /// Create a handler.
    pub fn new(resolver: Resolver, recursion: Option<Arc<Recursion>>) -> Self {
        Self {
            resolver,
            recursion,
        }
    }

    /// The resolution engine.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Produce the answer for one question.
    pub async fn answer(&self, ctx: &mut QueryContext) -> Answer {
        let outcome = match ctx.qtype {
            RecordType::A | RecordType::SRV | RecordType::ANY => self.resolver.resolve(ctx),
            RecordType::PTR => self.resolver.resolve_reverse(ctx),
            other => {
                debug!(id = ctx.id, name = %ctx.qname, qtype = %other, "unsupported query type");
                return Answer::code(ResponseCode::NotImp);
            }
        };

        match outcome {
            Outcome::Respond(answer) => answer,
            Outcome::Recurse(request) => match &self.recursion {
                Some(recursion) => {
                    let answer = recursion.resolve(&request).await;
                    ctx.stamp("recursion");
                    answer
                }
                None => Answer::code(ResponseCode::Refused),
            },
        }
    }
}

#[async_trait]
impl RequestHandler for BinderHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(false);

        let info = match request.request_info() {
            Ok(info) => info,
            Err(e) => {
                debug!(id = request.id(), src = %request.src(), error = %e, "malformed request");
                header.set_response_code(ResponseCode::FormErr);
                let response =
                    MessageResponseBuilder::from_message_request(request).build_no_records(header);
                return match response_handle.send_response(response).await {
                    Ok(info) => info,
                    Err(e) => {
                        error!(error = %e, "failed to send response");
                        ResponseInfo::from(header)
                    }
                };
            }
        };

        let qtype = info.query.query_type();
        let mut ctx = QueryContext::new(request.id(), Name::from(info.query.name().clone()), qtype);
        let answer = self.answer(&mut ctx).await;

        header.set_authoritative(answer.authoritative);
        header.set_response_code(answer.code);
        log_query(&ctx, &answer, request.src());
        metrics::record_query(&qtype.to_string(), answer.code, ctx.elapsed());
        metrics::record_answers_returned(answer.answers.len());

        let response = MessageResponseBuilder::from_message_request(request).build(
            header,
            answer.answers.iter(),
            answer.authorities.iter(),
            std::iter::empty::<&Record>(),
            answer.additionals.iter(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!(id = ctx.id, name = %ctx.qname, error = %e, "failed to send response");
                ResponseInfo::from(header)
            }
        }
    }
}

fn log_query(ctx: &QueryContext, answer: &Answer, src: SocketAddr) {
    let latency = ctx.elapsed();
    let mut timers = String::new();
    for (label, spent) in ctx.timers() {
        let _ = write!(timers, "{}={}us ", label, spent.as_micros());
    }
    let timers = timers.trim_end();

    if latency > SLOW_QUERY {
        warn!(
            id = ctx.id,
            %src,
            name = %ctx.qname,
            qtype = %ctx.qtype,
            rcode = ?answer.code,
            answers = answer.answers.len(),
            latency_ms = latency.as_millis() as u64,
            timers,
            "slow DNS query"
        );
    } else {
        info!(
            id = ctx.id,
            %src,
            name = %ctx.qname,
            qtype = %ctx.qtype,
            rcode = ?answer.code,
            answers = answer.answers.len(),
            latency_ms = latency.as_millis() as u64,
            timers,
            "DNS query"
        );
    }
}
