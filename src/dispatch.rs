//! Query dispatch: bytes in, optional reply bytes out.
//!
//! Both transports feed raw packets through [`Dispatcher::handle`], which
//! parses the query, picks the first matching rule from the current
//! ruleset snapshot, and runs that rule's strategy. Everything that can
//! go wrong on the hot path is fail-silent: malformed packets, parse
//! failures, and upstream errors all produce no reply, never a crash of
//! the listener loop. The client is left to time out.

use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::{debug, error, info, trace, warn};

use crate::rules::{LogLevel, Rule, RuleSet, Strategy};
use crate::upstream::Upstream;

/// TTL stamped on synthesized answer records.
const ANSWER_TTL: u32 = 300;

/// Shared per-query decision engine.
///
/// Safe to call concurrently from the UDP and TCP listener tasks: each
/// query matches against one atomic ruleset snapshot, so a concurrent
/// admin mutation never changes the set mid-scan.
pub struct Dispatcher {
    rules: Arc<ArcSwap<RuleSet>>,
    upstream: Arc<dyn Upstream>,
}

impl Dispatcher {
    pub fn new(rules: Arc<ArcSwap<RuleSet>>, upstream: Arc<dyn Upstream>) -> Self {
        Self { rules, upstream }
    }

    /// Handles one raw DNS packet (no TCP length prefix).
    ///
    /// Returns the serialized reply, or `None` when the query is
    /// blocked, malformed, or its forward failed.
    pub async fn handle(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_bytes(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, len = raw.len(), "dropping unparseable packet");
                return None;
            }
        };
        let qname = normalize_name(request.queries().first()?.name());

        let rule = self.rules.load().find_rule(&qname);
        let reply = self.execute(&rule, &request, &qname).await?;

        match reply.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(domain = %qname, error = %e, "failed to encode reply");
                None
            }
        }
    }

    async fn execute(&self, rule: &Rule, request: &Message, qname: &str) -> Option<Message> {
        match rule.strategy() {
            Strategy::Block => {
                log_rule(rule.min_log_level(), "blocked query", qname);
                None
            }
            Strategy::Respond => {
                // The answer address is guaranteed by rule construction.
                let answer = rule.answer()?;
                let name = request.queries().first()?.name().clone();
                let record = Record::from_rdata(name, ANSWER_TTL, RData::A(A(answer)));
                log_rule(rule.min_log_level(), "responded to query", qname);
                Some(build_reply(request, vec![record]))
            }
            Strategy::Forward => {
                let name = request.queries().first()?.name().clone();
                match self.upstream.lookup_a(&name).await {
                    Ok(addresses) => {
                        let answers = addresses
                            .into_iter()
                            .map(|ip| Record::from_rdata(name.clone(), ANSWER_TTL, RData::A(A(ip))))
                            .collect();
                        log_rule(rule.min_log_level(), "forwarded query", qname);
                        Some(build_reply(request, answers))
                    }
                    Err(e) => {
                        // Fail-silent: the client gets no packet at all.
                        warn!(domain = %qname, error = %e, "forward failed, dropping query");
                        None
                    }
                }
            }
        }
    }
}

/// Builds a reply correlated to `request`: same id, question echoed,
/// recursion flags set, NoError.
fn build_reply(request: &Message, answers: Vec<Record>) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(ResponseCode::NoError);
    if let Some(question) = request.queries().first() {
        reply.add_query(question.clone());
    }
    for answer in answers {
        reply.add_answer(answer);
    }
    reply
}

/// Lowercased query name without the trailing root dot, the form rule
/// patterns are written against.
fn normalize_name(name: &Name) -> String {
    let mut qname = name.to_utf8().to_ascii_lowercase();
    if qname.ends_with('.') && qname.len() > 1 {
        qname.pop();
    }
    qname
}

// `event!` wants a const level, so the rule's configured level is
// dispatched by hand.
fn log_rule(level: LogLevel, action: &str, domain: &str) {
    match level {
        LogLevel::Trace => trace!(domain, "{action}"),
        LogLevel::Debug => debug!(domain, "{action}"),
        LogLevel::Info => info!(domain, "{action}"),
        LogLevel::Warn => warn!(domain, "{action}"),
        LogLevel::Error => error!(domain, "{action}"),
    }
}
