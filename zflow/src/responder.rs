//! Responder side of the protocol.
//!
//! A [`Responder`] accepts flows opened by initiators, validates them,
//! and turns them into [`Work`] for an application handler. Replies go
//! back credit-paced when the initiator asked for a streamed response.
//! Like the initiator engine it does no I/O.

use std::collections::HashMap;
use std::mem;

use tokio::time::Instant;
use zflow_proto::{Format, Header, Message, MessageType, Value, decode, encode};

use crate::flow::FlowId;
use crate::pump::Pump;
use crate::router::Address;
use crate::sequence::{Direction, SequenceValidator};
use crate::{Config, CreditLedger, Error, FlowError, Result};

/// A request as handed to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct IncomingRequest {
    /// Request method.
    pub method: String,
    /// Request target.
    pub uri: String,
    /// Header lines in the order received.
    pub headers: Vec<Header>,
    /// Complete request body.
    pub body: Vec<u8>,
}

impl IncomingRequest {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The application's answer to an [`IncomingRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Reply {
    /// Status code.
    pub code: u16,
    /// Reason phrase.
    pub reason: String,
    /// Header lines.
    pub headers: Vec<Header>,
    /// Response body.
    pub body: Vec<u8>,
}

impl Reply {
    /// A reply with no headers or body.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// Appends a header line.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Something the application must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Work {
    /// A request is complete; answer it with [`Responder::respond`].
    Request {
        /// Flow to answer on.
        id: FlowId,
        /// The request.
        request: IncomingRequest,
    },
    /// Data arrived on a duplex stream.
    StreamData {
        /// Stream it arrived on.
        id: FlowId,
        /// Target the stream was opened for.
        uri: String,
        /// Received bytes.
        body: Vec<u8>,
    },
}

/// Effects of one responder operation.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct ServeStep {
    /// Encoded messages and the addresses they go to, in order.
    pub outbound: Vec<(Address, Vec<u8>)>,
    /// Work for the application.
    pub work: Vec<Work>,
}

impl ServeStep {
    /// Whether the operation produced nothing.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.work.is_empty()
    }
}

/// Why a session ends early.
#[derive(Debug)]
enum Fault {
    /// Send `type=error` with this condition.
    Error(String),
    /// Send `type=cancel`.
    Cancel,
    /// End silently; the peer already has.
    Drop,
}

impl Fault {
    fn error(condition: &str) -> Self {
        Self::Error(condition.to_owned())
    }
}

/// Progress of a request session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Upload body still arriving.
    Collecting,
    /// Handed to the application.
    Handling,
    /// Reply being streamed.
    Responding,
}

#[derive(Debug)]
enum Kind {
    Request {
        request: IncomingRequest,
        phase: Phase,
        stream: bool,
        max_size: Option<u64>,
    },
    Duplex {
        uri: String,
    },
}

/// One flow being served.
#[derive(Debug)]
struct Session {
    address: Address,
    /// Replies use the flavor the peer opened with.
    format: Format,
    user_data: Option<Value>,
    kind: Kind,
    seq: SequenceValidator,
    credits: CreditLedger,
    pump: Pump,
    /// Response head waiting to ride on the first body chunk.
    pending_head: Option<Message>,
    last_activity: Instant,
    done: bool,
}

impl Session {
    fn emit(
        &mut self,
        id: &FlowId,
        from: &str,
        mut msg: Message,
        now: Instant,
    ) -> std::result::Result<(Address, Vec<u8>), zflow_proto::EncodeError> {
        msg.id = id.to_string();
        msg.from = Some(from.to_owned());
        msg.seq = Some(self.seq.next_outbound());
        msg.user_data.clone_from(&self.user_data);
        let payload = encode(&msg, self.format)?;
        self.last_activity = now;
        tracing::debug!(flow = %id, seq = ?msg.seq, kind = ?msg.kind, len = payload.len(), "send");
        Ok((self.address.clone(), payload))
    }

    const fn awaiting_reply(&self) -> bool {
        matches!(
            self.kind,
            Kind::Request {
                phase: Phase::Handling,
                ..
            }
        )
    }

    fn on_message(
        &mut self,
        id: &FlowId,
        msg: Message,
        work: &mut Vec<Work>,
    ) -> std::result::Result<Vec<Message>, Fault> {
        if let Err(err) = self.seq.observe(Direction::Inbound, msg.seq) {
            tracing::warn!(flow = %id, %err, "cancelling flow");
            return Err(Fault::Cancel);
        }
        match msg.kind {
            Some(MessageType::Error | MessageType::Cancel) => {
                tracing::debug!(flow = %id, condition = msg.condition.as_deref(), "peer ended flow");
                Err(Fault::Drop)
            }
            Some(MessageType::KeepAlive) => Ok(Vec::new()),
            Some(MessageType::Credit) => {
                self.credits.grant(msg.credits.unwrap_or(0));
                self.pump_out()
            }
            Some(MessageType::Close) => match self.kind {
                Kind::Duplex { .. } => {
                    self.done = true;
                    Ok(vec![Message::typed("", MessageType::Close)])
                }
                Kind::Request { .. } => Err(Fault::error("bad-request")),
            },
            None => self.on_data(id, msg, work),
        }
    }

    fn on_data(
        &mut self,
        id: &FlowId,
        msg: Message,
        work: &mut Vec<Work>,
    ) -> std::result::Result<Vec<Message>, Fault> {
        if let Some(n) = msg.credits {
            self.credits.grant(n);
        }
        let mut out = Vec::new();
        match &mut self.kind {
            Kind::Duplex { uri } => {
                if let Some(body) = msg.body.filter(|b| !b.is_empty()) {
                    let grant = self.credits.observe_received(body.len() as u64);
                    work.push(Work::StreamData {
                        id: id.clone(),
                        uri: uri.clone(),
                        body,
                    });
                    if let Some(n) = grant {
                        out.push(credit(n));
                    }
                }
            }
            Kind::Request { request, phase, .. } => {
                // `more` only means something alongside a body
                if let Some(body) = msg.body {
                    if *phase != Phase::Collecting {
                        tracing::warn!(flow = %id, "body after end of body");
                        return Err(Fault::error("bad-request"));
                    }
                    let grant = self.credits.observe_received(body.len() as u64);
                    request.body.extend_from_slice(&body);
                    if msg.more {
                        if let Some(n) = grant {
                            out.push(credit(n));
                        }
                    } else {
                        *phase = Phase::Handling;
                        work.push(Work::Request {
                            id: id.clone(),
                            request: mem::take(request),
                        });
                    }
                }
            }
        }
        out.extend(self.pump_out()?);
        Ok(out)
    }

    fn respond(&mut self, reply: Reply) -> std::result::Result<Vec<Message>, Fault> {
        let Kind::Request {
            phase,
            stream,
            max_size,
            ..
        } = &mut self.kind
        else {
            return Err(Fault::error("undefined-condition"));
        };
        if max_size.is_some_and(|max| reply.body.len() as u64 > max) {
            return Err(Fault::error("max-size-exceeded"));
        }
        *phase = Phase::Responding;
        let stream = *stream;

        let head = Message {
            code: Some(reply.code),
            reason: (!reply.reason.is_empty()).then_some(reply.reason),
            headers: (!reply.headers.is_empty()).then_some(reply.headers),
            ..Message::default()
        };
        if !stream {
            self.done = true;
            return Ok(vec![Message {
                body: Some(reply.body),
                ..head
            }]);
        }

        self.pending_head = Some(Message { more: true, ..head });
        self.pump.push(reply.body);
        let mut out = self.pump_out()?;
        // no credits yet: the head goes alone
        if let Some(head) = self.pending_head.take() {
            out.insert(0, head);
        }
        Ok(out)
    }

    fn pump_out(&mut self) -> std::result::Result<Vec<Message>, Fault> {
        let chunks = self.pump.drain(&mut self.credits).map_err(|err| {
            tracing::error!(%err, "pump overdrew credits");
            Fault::error("undefined-condition")
        })?;
        let mut out = Vec::with_capacity(chunks.len());
        for (body, more) in chunks {
            let mut msg = self.pending_head.take().unwrap_or_default();
            msg.body = Some(body);
            msg.more = more;
            if !more && matches!(self.kind, Kind::Request { .. }) {
                self.done = true;
            }
            out.push(msg);
        }
        Ok(out)
    }
}

fn credit(n: u64) -> Message {
    Message {
        credits: Some(n),
        ..Message::typed("", MessageType::Credit)
    }
}

/// Serving side of the protocol for any number of concurrent flows.
#[derive(Debug)]
pub struct Responder {
    config: Config,
    sessions: HashMap<FlowId, Session>,
}

impl Responder {
    /// Creates a responder with no sessions.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether `id` names a live session.
    pub fn contains(&self, id: &FlowId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Processes one received payload.
    ///
    /// `sender` is the transport's address for the peer, if it has one;
    /// otherwise the message's `from` hint is used.
    pub fn handle_inbound(&mut self, sender: Option<&str>, payload: &[u8], now: Instant) -> ServeStep {
        let mut step = ServeStep::default();
        let (format, msg) = match decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(%err, len = payload.len(), "dropping malformed message");
                return step;
            }
        };
        let address = sender.or(msg.from.as_deref()).map(str::to_owned);
        let id = FlowId::from(msg.id.as_str());

        if let Some(mut session) = self.sessions.remove(&id) {
            if msg.is_open() {
                tracing::warn!(flow = %id, "id already in use, open ignored");
                self.sessions.insert(id, session);
                return step;
            }
            tracing::debug!(flow = %id, seq = ?msg.seq, kind = ?msg.kind, "recv");
            session.last_activity = now;
            let result = session.on_message(&id, msg, &mut step.work);
            self.settle(id, session, result, now, &mut step);
        } else if msg.is_open() {
            match address {
                Some(address) => self.open(id, format, address, msg, now, &mut step),
                None => tracing::warn!(flow = %id, "open without a reply address dropped"),
            }
        } else if msg.kind.is_some_and(MessageType::is_terminal) {
            tracing::debug!(flow = %id, "end of unknown flow ignored");
        } else if let Some(address) = address {
            tracing::debug!(flow = %id, %address, "cancelling unknown flow");
            let cancel = Message {
                from: Some(self.config.client_id.clone()),
                ..Message::typed(msg.id, MessageType::Cancel)
            };
            match encode(&cancel, format) {
                Ok(payload) => step.outbound.push((address, payload)),
                Err(err) => tracing::warn!(%err, "cannot encode cancel"),
            }
        }
        step
    }

    /// Answers a request handed out as [`Work::Request`].
    pub fn respond(&mut self, id: &FlowId, reply: Reply, now: Instant) -> Result<ServeStep> {
        let Some(mut session) = self.take_if(id, Session::awaiting_reply)? else {
            return Err(Error::flow(
                id,
                FlowError::Protocol("no request is waiting for a reply".into()),
            ));
        };
        let mut step = ServeStep::default();
        let result = session.respond(reply);
        self.settle(id.clone(), session, result, now, &mut step);
        Ok(step)
    }

    /// Sends data on a duplex stream, as far as credits allow.
    pub fn send_stream(&mut self, id: &FlowId, body: Vec<u8>, now: Instant) -> Result<ServeStep> {
        let Some(mut session) = self.take_if(id, |s| matches!(s.kind, Kind::Duplex { .. }))? else {
            return Err(Error::flow(id, FlowError::Protocol("not a duplex stream".into())));
        };
        let mut step = ServeStep::default();
        session.pump.push(body);
        let result = session.pump_out();
        self.settle(id.clone(), session, result, now, &mut step);
        Ok(step)
    }

    /// Fails a session with `condition`.
    pub fn fail(&mut self, id: &FlowId, condition: &str, now: Instant) -> Result<ServeStep> {
        let session = self
            .sessions
            .remove(id)
            .ok_or_else(|| Error::UnknownFlow(id.clone()))?;
        let mut step = ServeStep::default();
        self.settle(id.clone(), session, Err(Fault::error(condition)), now, &mut step);
        Ok(step)
    }

    /// Fails sessions idle for longer than the session timeout.
    pub fn tick(&mut self, now: Instant) -> ServeStep {
        let mut step = ServeStep::default();
        let timeout = self.config.session_timeout();
        let expired: Vec<FlowId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                tracing::info!(flow = %id, "session timed out");
                self.settle(id, session, Err(Fault::error("connection-timeout")), now, &mut step);
            }
        }
        step
    }

    /// Removes the session if `pred` holds. Errors if there is no such session.
    fn take_if(&mut self, id: &FlowId, pred: impl Fn(&Session) -> bool) -> Result<Option<Session>> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::UnknownFlow(id.clone()))?;
        if !pred(session) {
            return Ok(None);
        }
        Ok(self.sessions.remove(id))
    }

    fn open(
        &mut self,
        id: FlowId,
        format: Format,
        address: Address,
        msg: Message,
        now: Instant,
        step: &mut ServeStep,
    ) {
        let ideal = self.config.ideal_credits;
        let mut credits = CreditLedger::new(0, self.config.grant_on_receive);
        credits.grant(msg.credits.unwrap_or(0));
        let mut seq = SequenceValidator::new();
        seq.accept_open();
        let mut session = Session {
            address,
            format,
            user_data: msg.user_data.clone(),
            kind: Kind::Duplex { uri: String::new() },
            seq,
            credits,
            pump: Pump::default(),
            pending_head: None,
            last_activity: now,
            done: false,
        };

        if let Err(reason) = validate(&msg) {
            tracing::warn!(flow = %id, reason, "bad request");
            self.settle(id, session, Err(Fault::error("bad-request")), now, step);
            return;
        }

        let uri = msg.uri.unwrap_or_default();
        let reply = match msg.method {
            None => {
                tracing::info!(flow = %id, %uri, "stream opened");
                session.kind = Kind::Duplex { uri };
                session.credits.offer(ideal);
                Message {
                    credits: Some(ideal),
                    ..Message::default()
                }
            }
            Some(method) => {
                tracing::info!(flow = %id, %method, %uri, "request opened");
                let request = IncomingRequest {
                    method,
                    uri,
                    headers: msg.headers.unwrap_or_default(),
                    body: msg.body.unwrap_or_default(),
                };
                if msg.more {
                    session.kind = Kind::Request {
                        request,
                        phase: Phase::Collecting,
                        stream: msg.stream,
                        max_size: msg.max_size,
                    };
                    session.credits.offer(ideal);
                    // clear to send
                    Message {
                        credits: Some(ideal),
                        more: true,
                        ..Message::default()
                    }
                } else {
                    step.work.push(Work::Request {
                        id: id.clone(),
                        request,
                    });
                    session.kind = Kind::Request {
                        request: IncomingRequest::default(),
                        phase: Phase::Handling,
                        stream: msg.stream,
                        max_size: msg.max_size,
                    };
                    self.sessions.insert(id, session);
                    return;
                }
            }
        };
        self.settle(id, session, Ok(vec![reply]), now, step);
    }

    /// Transmits a session's output and either keeps or retires it.
    fn settle(
        &mut self,
        id: FlowId,
        mut session: Session,
        result: std::result::Result<Vec<Message>, Fault>,
        now: Instant,
        step: &mut ServeStep,
    ) {
        let from = &self.config.client_id;
        let fault = match result {
            Ok(messages) => {
                let mut fault = None;
                for msg in messages {
                    match session.emit(&id, from, msg, now) {
                        Ok(out) => step.outbound.push(out),
                        Err(err) => {
                            tracing::warn!(flow = %id, %err, "cannot encode reply");
                            fault = Some(Fault::error("undefined-condition"));
                            break;
                        }
                    }
                }
                fault
            }
            Err(fault) => Some(fault),
        };

        let last = match fault {
            None if !session.done => {
                self.sessions.insert(id, session);
                return;
            }
            None | Some(Fault::Drop) => None,
            Some(Fault::Cancel) => Some(Message::typed("", MessageType::Cancel)),
            Some(Fault::Error(condition)) => {
                tracing::info!(flow = %id, %condition, "flow failed");
                Some(Message {
                    condition: Some(condition),
                    ..Message::typed("", MessageType::Error)
                })
            }
        };
        if let Some(msg) = last {
            match session.emit(&id, from, msg, now) {
                Ok(out) => step.outbound.push(out),
                Err(err) => tracing::warn!(flow = %id, %err, "cannot encode final message"),
            }
        }
        tracing::debug!(flow = %id, "session retired");
    }
}

/// Checks an open message, returning what is wrong with it.
fn validate(msg: &Message) -> std::result::Result<(), &'static str> {
    if msg.id.is_empty() {
        return Err("missing id");
    }
    if msg.method.is_some() && msg.uri.is_none() {
        return Err("request without uri");
    }
    let duplex = msg.method.is_none();
    if msg.seq.is_some_and(|s| s != 0) {
        return Err("open must carry seq 0");
    }
    if (msg.stream || duplex) && (msg.from.is_none() || msg.seq.is_none()) {
        return Err("streamed open needs from and seq");
    }
    if msg.more {
        if !msg.stream {
            return Err("more on a non-stream open");
        }
        if !matches!(msg.method.as_deref(), Some("POST" | "PUT")) {
            return Err("more on a method without a body");
        }
        if !msg
            .headers
            .iter()
            .flatten()
            .any(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        {
            return Err("more without Content-Length");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn responder() -> Responder {
        Responder::new(Config::with_client_id("worker"))
    }

    fn open(id: &str) -> Message {
        Message {
            from: Some("client".into()),
            seq: Some(0),
            credits: Some(200_000),
            method: Some("GET".into()),
            uri: Some("http://example.com/".into()),
            ..Message::new(id)
        }
    }

    fn follow(id: &str, seq: u64) -> Message {
        Message {
            from: Some("client".into()),
            seq: Some(seq),
            ..Message::new(id)
        }
    }

    fn wire(msg: &Message) -> Vec<u8> {
        encode(msg, Format::Tnetstring).unwrap()
    }

    fn sent(step: &ServeStep) -> Vec<Message> {
        step.outbound
            .iter()
            .map(|(address, payload)| {
                assert_eq!(address, "client");
                decode(payload).unwrap().1
            })
            .collect()
    }

    fn condition(step: &ServeStep) -> Option<String> {
        sent(step).pop().and_then(|m| m.condition)
    }

    #[test]
    fn rejects_malformed_opens() {
        let mut cases = Vec::new();

        let mut m = open("a");
        m.uri = None;
        cases.push(m);

        let mut m = open("b");
        m.seq = Some(1);
        cases.push(m);

        let mut m = open("c");
        m.stream = true;
        m.more = true;
        m.headers = Some(vec![("Content-Length".into(), "5".into())]);
        cases.push(m);

        let mut m = open("d");
        m.method = Some("POST".into());
        m.stream = true;
        m.more = true;
        cases.push(m);

        let mut m = open("e");
        m.method = Some("POST".into());
        m.more = true;
        m.headers = Some(vec![("content-length".into(), "5".into())]);
        cases.push(m);

        for msg in cases {
            let mut r = responder();
            let step = r.handle_inbound(None, &wire(&msg), Instant::now());
            assert_eq!(condition(&step).as_deref(), Some("bad-request"), "{msg:?}");
            assert!(step.work.is_empty());
            assert!(r.is_empty());
        }
    }

    #[test]
    fn single_response_echoes_user_data() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("r1");
        msg.user_data = Some(Value::str("cookie"));
        let step = r.handle_inbound(None, &wire(&msg), now);
        assert!(step.outbound.is_empty());
        let [Work::Request { id, request }] = &step.work[..] else {
            panic!("expected one request, got {:?}", step.work);
        };
        assert_eq!(request.method, "GET");

        let step = r
            .respond(id, Reply::new(200, "OK").body("hello"), now)
            .unwrap();
        let out = sent(&step);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, Some(200));
        assert_eq!(out[0].seq, Some(0));
        assert_eq!(out[0].from.as_deref(), Some("worker"));
        assert_eq!(out[0].body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(out[0].user_data, Some(Value::str("cookie")));
        assert!(!out[0].more);
        assert!(r.is_empty());
    }

    #[test]
    fn upload_collects_body_with_grants() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("up");
        msg.method = Some("POST".into());
        msg.stream = true;
        msg.more = true;
        msg.headers = Some(vec![("Content-Length".into(), "6".into())]);
        let step = r.handle_inbound(None, &wire(&msg), now);
        let cts = &sent(&step)[0];
        assert_eq!(cts.kind, None);
        assert_eq!(cts.credits, Some(200_000));
        assert!(cts.more);

        let mut chunk = follow("up", 1);
        chunk.body = Some(b"abc".to_vec());
        chunk.more = true;
        let step = r.handle_inbound(None, &wire(&chunk), now);
        let grant = &sent(&step)[0];
        assert_eq!(grant.kind, Some(MessageType::Credit));
        assert_eq!(grant.credits, Some(3));

        let mut last = follow("up", 2);
        last.body = Some(b"def".to_vec());
        let step = r.handle_inbound(None, &wire(&last), now);
        assert!(step.outbound.is_empty());
        let [Work::Request { request, .. }] = &step.work[..] else {
            panic!("expected the request");
        };
        assert_eq!(request.body, b"abcdef");
        assert_eq!(request.header("content-length"), Some("6"));

        let mut extra = follow("up", 3);
        extra.body = Some(b"x".to_vec());
        let step = r.handle_inbound(None, &wire(&extra), now);
        assert_eq!(condition(&step).as_deref(), Some("bad-request"));
        assert!(r.is_empty());
    }

    #[test]
    fn streamed_response_waits_for_credits() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("s");
        msg.stream = true;
        msg.credits = Some(4);
        let step = r.handle_inbound(None, &wire(&msg), now);
        assert_eq!(step.work.len(), 1);

        let id = FlowId::from("s");
        let step = r
            .respond(&id, Reply::new(200, "OK").body("0123456789"), now)
            .unwrap();
        let out = sent(&step);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, Some(200));
        assert_eq!(out[0].body.as_deref(), Some(&b"0123"[..]));
        assert!(out[0].more);

        let mut grant = follow("s", 1);
        grant.kind = Some(MessageType::Credit);
        grant.credits = Some(4);
        let out = sent(&r.handle_inbound(None, &wire(&grant), now));
        assert_eq!(out[0].code, None);
        assert_eq!(out[0].body.as_deref(), Some(&b"4567"[..]));
        assert!(r.contains(&id));

        grant.seq = Some(2);
        let out = sent(&r.handle_inbound(None, &wire(&grant), now));
        assert_eq!(out[0].body.as_deref(), Some(&b"89"[..]));
        assert!(!out[0].more);
        assert_eq!(out[0].seq, Some(2));
        assert!(r.is_empty());
    }

    #[test]
    fn streamed_head_goes_alone_without_credits() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("h");
        msg.stream = true;
        msg.credits = None;
        r.handle_inbound(None, &wire(&msg), now);
        let step = r
            .respond(&FlowId::from("h"), Reply::new(200, "OK").body("abc"), now)
            .unwrap();
        let out = sent(&step);
        assert_eq!(out[0].code, Some(200));
        assert_eq!(out[0].body, None);
        assert!(out[0].more);
    }

    #[test]
    fn max_size_exceeded() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("m");
        msg.max_size = Some(3);
        r.handle_inbound(None, &wire(&msg), now);
        let step = r
            .respond(&FlowId::from("m"), Reply::new(200, "OK").body("toolong"), now)
            .unwrap();
        assert_eq!(condition(&step).as_deref(), Some("max-size-exceeded"));
        assert!(r.is_empty());
    }

    #[test]
    fn duplex_echo_and_close() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("ws");
        msg.method = None;
        msg.uri = Some("ws://echo/".into());
        let out = sent(&r.handle_inbound(None, &wire(&msg), now));
        assert_eq!(out[0].kind, None);
        assert_eq!(out[0].credits, Some(200_000));

        let mut data = follow("ws", 1);
        data.body = Some(b"hello world".to_vec());
        let step = r.handle_inbound(None, &wire(&data), now);
        assert_eq!(sent(&step)[0].credits, Some(11));
        let [Work::StreamData { id, uri, body }] = &step.work[..] else {
            panic!("expected stream data");
        };
        assert_eq!(uri, "ws://echo/");

        let out = sent(&r.send_stream(id, body.clone(), now).unwrap());
        assert_eq!(out[0].body.as_deref(), Some(&b"hello world"[..]));
        assert!(!out[0].more);

        let mut close = follow("ws", 2);
        close.kind = Some(MessageType::Close);
        let out = sent(&r.handle_inbound(None, &wire(&close), now));
        assert_eq!(out[0].kind, Some(MessageType::Close));
        assert_eq!(out[0].seq, Some(3));
        assert!(r.is_empty());
    }

    #[test]
    fn keep_alive_refreshes_without_echo() {
        let mut r = responder();
        let start = Instant::now();
        let mut msg = open("k");
        msg.method = None;
        r.handle_inbound(None, &wire(&msg), start);

        let mut ka = follow("k", 1);
        ka.kind = Some(MessageType::KeepAlive);
        let later = start + Duration::from_secs(500);
        assert!(r.handle_inbound(None, &wire(&ka), later).is_empty());
        assert!(r.tick(start + Duration::from_secs(700)).is_empty());

        let step = r.tick(later + Duration::from_secs(600));
        assert_eq!(condition(&step).as_deref(), Some("connection-timeout"));
        assert!(r.is_empty());
    }

    #[test]
    fn sequence_violation_cancels() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("q");
        msg.method = None;
        r.handle_inbound(None, &wire(&msg), now);
        let out = sent(&r.handle_inbound(None, &wire(&follow("q", 3)), now));
        assert_eq!(out[0].kind, Some(MessageType::Cancel));
        assert!(r.is_empty());
    }

    #[test]
    fn unknown_and_duplicate_flows() {
        let mut r = responder();
        let now = Instant::now();
        let out = sent(&r.handle_inbound(None, &wire(&follow("ghost", 4)), now));
        assert_eq!(out[0].kind, Some(MessageType::Cancel));
        assert_eq!(out[0].id, "ghost");

        let mut cancel = follow("ghost", 5);
        cancel.kind = Some(MessageType::Cancel);
        assert!(r.handle_inbound(None, &wire(&cancel), now).is_empty());
        let bogus = br#"J{"id":"ghost","from":"client","seq":6,"type":"bogus"}"#;
        assert!(r.handle_inbound(None, bogus, now).is_empty());

        assert_eq!(r.handle_inbound(None, &wire(&open("dup")), now).work.len(), 1);
        assert!(r.handle_inbound(None, &wire(&open("dup")), now).is_empty());
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn answers_in_peer_format() {
        let mut r = responder();
        let now = Instant::now();
        let payload = encode(&open("j"), Format::Json).unwrap();
        r.handle_inbound(None, &payload, now);
        let step = r
            .respond(&FlowId::from("j"), Reply::new(404, "Not Found"), now)
            .unwrap();
        assert_eq!(step.outbound[0].1[0], b'J');
    }

    #[test]
    fn respond_twice_is_rejected() {
        let mut r = responder();
        let now = Instant::now();
        let mut msg = open("t");
        msg.stream = true;
        msg.credits = Some(0);
        r.handle_inbound(None, &wire(&msg), now);
        let id = FlowId::from("t");
        r.respond(&id, Reply::new(200, "OK").body("x"), now).unwrap();
        assert!(matches!(
            r.respond(&id, Reply::new(200, "OK"), now),
            Err(Error::Flow { .. })
        ));
        assert!(matches!(
            r.respond(&FlowId::from("nope"), Reply::new(200, "OK"), now),
            Err(Error::UnknownFlow(_))
        ));
    }
}
