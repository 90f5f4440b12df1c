//! Initiator engine: the live-flow table and its routing.
//!
//! The engine is sans-IO. Every operation returns a [`Step`] listing the
//! payloads to transmit and the events to deliver; the caller owns the
//! transport and the clock.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use zflow_proto::{Header, Message, decode, encode};

use crate::flow::{Flow, FlowEvent, FlowId, FlowShape, FlowState, Output};
use crate::router::{Address, ReplyRouter};
use crate::{Config, CreditLedger, Error, FlowError, Result};

/// A payload to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Outbound {
    /// A flow-open message, for whichever server instance picks it up.
    ToServer(Vec<u8>),
    /// A follow-up message for the peer that homes the flow.
    ToAddress {
        /// Learned reply address.
        address: Address,
        /// Encoded message.
        payload: Vec<u8>,
    },
}

/// Effects of one engine operation.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct Step {
    /// Payloads to transmit, in order.
    pub outbound: Vec<Outbound>,
    /// Events for flow owners, in order.
    pub events: Vec<(FlowId, FlowEvent)>,
}

impl Step {
    /// Whether the operation produced nothing.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}

/// Parameters of a request or upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Request {
    /// Request method.
    pub method: String,
    /// Request target.
    pub uri: String,
    /// Header lines, sent in order.
    pub headers: Vec<Header>,
    /// Request body.
    pub body: Vec<u8>,
    /// Ask for a credit-paced, streamed response.
    pub stream: bool,
    /// Largest response body to accept.
    pub max_size: Option<u64>,
}

impl Request {
    /// A request with no headers or body.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// A `GET` request.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
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

    /// Requests a streamed response.
    #[must_use]
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Caps the response body size.
    #[must_use]
    pub fn max_size(mut self, limit: u64) -> Self {
        self.max_size = Some(limit);
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// A live flow and when it last sent something.
#[derive(Debug)]
struct Slot {
    flow: Flow,
    last_sent: Instant,
}

/// Initiator side of the protocol for any number of concurrent flows.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    flows: HashMap<FlowId, Slot>,
    router: ReplyRouter,
}

impl Engine {
    /// Creates an engine with no live flows.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            flows: HashMap::new(),
            router: ReplyRouter::new(),
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Opens a request/response flow. The body, if any, travels in the open message.
    pub fn open_request(&mut self, req: Request, now: Instant) -> Result<(FlowId, Step)> {
        let msg = Message {
            method: Some(req.method),
            uri: Some(req.uri),
            headers: (!req.headers.is_empty()).then_some(req.headers),
            body: (!req.body.is_empty()).then_some(req.body),
            stream: req.stream,
            max_size: req.max_size,
            ..Message::default()
        };
        self.open(FlowShape::Request, msg, None, now)
    }

    /// Opens an upload. The body is streamed once the peer grants credits.
    ///
    /// A `Content-Length` header is added unless one is present.
    pub fn open_upload(&mut self, mut req: Request, now: Instant) -> Result<(FlowId, Step)> {
        if !req.has_header("Content-Length") {
            req.headers
                .push(("Content-Length".into(), req.body.len().to_string()));
        }
        let msg = Message {
            method: Some(req.method),
            uri: Some(req.uri),
            headers: Some(req.headers),
            stream: true,
            more: true,
            max_size: req.max_size,
            ..Message::default()
        };
        self.open(FlowShape::Upload, msg, Some(req.body), now)
    }

    /// Opens a duplex byte stream.
    pub fn open_stream(&mut self, uri: &str, now: Instant) -> Result<(FlowId, Step)> {
        let msg = Message {
            uri: Some(uri.to_owned()),
            ..Message::default()
        };
        self.open(FlowShape::Duplex, msg, None, now)
    }

    fn open(
        &mut self,
        shape: FlowShape,
        msg: Message,
        upload: Option<Vec<u8>>,
        now: Instant,
    ) -> Result<(FlowId, Step)> {
        let id = FlowId::generate();
        let mut flow = Flow::new(
            id.clone(),
            shape,
            self.config.initial_credits,
            self.config.grant_on_receive,
        );
        let mut msg = flow.open(msg);
        msg.from = Some(self.config.client_id.clone());
        msg.credits = Some(self.config.initial_credits);
        let payload = encode(&msg, self.config.format)?;
        if let Some(body) = upload {
            flow.queue(body);
        }

        tracing::info!(flow = %id, ?shape, uri = msg.uri.as_deref().unwrap_or(""), "flow opened");
        self.flows.insert(id.clone(), Slot { flow, last_sent: now });
        let step = Step {
            outbound: vec![Outbound::ToServer(payload)],
            events: Vec::new(),
        };
        Ok((id, step))
    }

    /// Processes one received payload.
    ///
    /// `sender` is the transport's notion of who sent it, when the
    /// transport has one; otherwise the message's `from` hint is used as
    /// the reply address. Malformed payloads and messages for unknown
    /// flows are dropped. Failures of a single flow are reported as
    /// events on that flow and never affect other flows.
    pub fn handle_inbound(&mut self, sender: Option<&str>, payload: &[u8], now: Instant) -> Step {
        let mut step = Step::default();
        let msg = match decode(payload) {
            Ok((_, msg)) => msg,
            Err(err) => {
                tracing::warn!(%err, len = payload.len(), "dropping malformed message");
                return step;
            }
        };
        let id = FlowId::from(msg.id.as_str());
        let Some(slot) = self.flows.get_mut(&id) else {
            tracing::debug!(flow = %id, "message for unknown flow ignored");
            return step;
        };
        tracing::debug!(flow = %id, seq = ?msg.seq, kind = ?msg.kind, "recv");

        if let Some(address) = sender.or(msg.from.as_deref()) {
            self.router.record_address(&id, address);
        }
        let outputs = match slot.flow.on_message(msg) {
            Ok(outputs) => outputs,
            Err(err) => {
                tracing::warn!(flow = %id, %err, "aborting flow");
                slot.flow.abort(err)
            }
        };
        self.apply(&id, outputs, now, &mut step);
        self.reap(&id);
        step
    }

    /// Sends data on a duplex stream, as far as credits allow.
    ///
    /// Data sent before the stream is connected is held until it is.
    pub fn send_data(&mut self, id: &FlowId, body: Vec<u8>, now: Instant) -> Result<Step> {
        let outputs = self
            .flow_mut(id)?
            .send(body)
            .map_err(|e| Error::flow(id, e))?;
        Ok(self.finish(id, outputs, now))
    }

    /// Starts the close handshake of a duplex stream.
    pub fn close(&mut self, id: &FlowId, now: Instant) -> Result<Step> {
        let outputs = self.flow_mut(id)?.close().map_err(|e| Error::flow(id, e))?;
        Ok(self.finish(id, outputs, now))
    }

    /// Abandons a flow and tells the peer.
    ///
    /// If the peer has not replied yet there is nowhere to send the
    /// `cancel`; the flow is dropped locally and any late replies are
    /// ignored as unknown.
    pub fn cancel(&mut self, id: &FlowId, now: Instant) -> Result<Step> {
        if !self.flows.contains_key(id) {
            return Err(Error::UnknownFlow(id.clone()));
        }
        if self.router.address_for(id).is_none() {
            tracing::warn!(flow = %id, "cancelled before the peer replied, nothing sent");
            self.flows.remove(id);
            return Ok(Step::default());
        }
        let outputs = self.flow_mut(id)?.cancel();
        Ok(self.finish(id, outputs, now))
    }

    /// Sends keep-alives on established flows idle for a full interval.
    pub fn tick(&mut self, now: Instant) -> Step {
        let mut step = Step::default();
        let Some(interval) = self.config.keep_alive_interval() else {
            return step;
        };
        let idle: Vec<FlowId> = self
            .flows
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_sent) >= interval)
            .map(|(id, _)| id.clone())
            .collect();
        for id in idle {
            if let Some(slot) = self.flows.get_mut(&id) {
                let outputs = slot.flow.keep_alive();
                self.apply(&id, outputs, now, &mut step);
            }
        }
        step
    }

    /// State of a live flow.
    pub fn state(&self, id: &FlowId) -> Option<FlowState> {
        self.flows.get(id).map(|s| s.flow.state())
    }

    /// Shape of a live flow.
    pub fn shape(&self, id: &FlowId) -> Option<FlowShape> {
        self.flows.get(id).map(|s| s.flow.shape())
    }

    /// Credit balance of a live flow.
    pub fn credits(&self, id: &FlowId) -> Option<CreditLedger> {
        self.flows.get(id).map(|s| *s.flow.credits())
    }

    /// Reply address learned for a live flow.
    pub fn reply_address(&self, id: &FlowId) -> Option<&str> {
        self.router.address_for(id)
    }

    /// Number of live flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flow is live.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn flow_mut(&mut self, id: &FlowId) -> Result<&mut Flow> {
        self.flows
            .get_mut(id)
            .map(|s| &mut s.flow)
            .ok_or_else(|| Error::UnknownFlow(id.clone()))
    }

    fn finish(&mut self, id: &FlowId, outputs: Vec<Output>, now: Instant) -> Step {
        let mut step = Step::default();
        self.apply(id, outputs, now, &mut step);
        self.reap(id);
        step
    }

    /// Turns flow outputs into a step, failing the flow if a message
    /// cannot be addressed or encoded.
    fn apply(&mut self, id: &FlowId, outputs: Vec<Output>, now: Instant, step: &mut Step) {
        let mut pending: VecDeque<Output> = outputs.into();
        while let Some(output) = pending.pop_front() {
            let msg = match output {
                Output::Event(event) => {
                    step.events.push((id.clone(), event));
                    continue;
                }
                Output::Send(msg) => msg,
            };
            let seq = msg.seq;
            let sent = self.transmit(id, msg);
            let Some(slot) = self.flows.get_mut(id) else {
                continue;
            };
            match sent {
                Ok(out) => {
                    step.outbound.push(out);
                    slot.last_sent = now;
                }
                Err(err) if slot.flow.state().is_terminal() => {
                    tracing::warn!(flow = %id, %err, "final message not sent");
                }
                Err(err) => {
                    tracing::warn!(flow = %id, %err, "aborting flow");
                    // the unsent messages must not leave a gap before the cancel
                    if let Some(seq) = seq {
                        slot.flow.unsend(seq);
                    }
                    pending.retain(|o| matches!(o, Output::Event(_)));
                    pending.extend(slot.flow.abort(err));
                }
            }
        }
    }

    fn transmit(&self, id: &FlowId, mut msg: Message) -> std::result::Result<Outbound, FlowError> {
        let address = self
            .router
            .address_for(id)
            .ok_or(FlowError::NoReplyAddress)?;
        msg.from = Some(self.config.client_id.clone());
        let payload = encode(&msg, self.config.format).map_err(FlowError::Encode)?;
        tracing::debug!(flow = %id, seq = ?msg.seq, kind = ?msg.kind, len = payload.len(), "send");
        Ok(Outbound::ToAddress {
            address: address.to_owned(),
            payload,
        })
    }

    /// Removes a flow once it has terminated.
    fn reap(&mut self, id: &FlowId) {
        let done = self
            .flows
            .get(id)
            .is_some_and(|s| s.flow.state().is_terminal());
        if done {
            if let Some(slot) = self.flows.remove(id) {
                tracing::info!(flow = %id, state = ?slot.flow.state(), "flow finished");
            }
            self.router.forget(id);
        }
    }
}
