//! Initiator-side flow lifecycle.
//!
//! One state machine serves every flow shape; the shape only decides
//! which transitions are reachable. The machine does no I/O: each input
//! returns the messages to transmit and the events to report, in order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use zflow_proto::{Header, Message, MessageType};

use crate::pump::Pump;
use crate::sequence::{Direction, SequenceValidator};
use crate::{CreditLedger, FlowError};

/// Opaque flow identifier, chosen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(String);

impl FlowId {
    /// Generates an id unique to this process run.
    pub fn generate() -> Self {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};
        use std::time::UNIX_EPOCH;

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let mut h = RandomState::new().build_hasher();
        h.write_u64(u64::from(std::process::id()));
        h.write_u128(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
        );
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        h.write_u64(n);
        Self(format!("{:016x}-{n}", h.finish()))
    }

    /// The id as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for FlowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FlowId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// What kind of exchange a flow carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FlowShape {
    /// One request, one (possibly streamed) response.
    Request,
    /// A request whose body is streamed to the peer under credit control.
    Upload,
    /// A full-duplex byte stream, ended by a close handshake.
    Duplex,
}

/// Lifecycle state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FlowState {
    /// Open message sent, awaiting the peer's first reply.
    Opening,
    /// Data may move in both directions.
    Open,
    /// Local `close` sent or pending; awaiting the peer's `close`.
    Closing,
    /// Finished normally, by close handshake, or by cancellation.
    Closed,
    /// Failed.
    Errored,
}

impl FlowState {
    /// Whether the flow is finished and may be discarded.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResponseHead {
    /// Status code.
    pub code: u16,
    /// Reason phrase; empty when the peer sent none.
    pub reason: String,
    /// Header lines in the order received.
    pub headers: Vec<Header>,
}

/// Something a flow reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FlowEvent {
    /// The response head arrived.
    Response(ResponseHead),
    /// A duplex stream was accepted by the peer.
    Connected,
    /// A body segment arrived.
    Data {
        /// Segment bytes.
        body: Vec<u8>,
        /// The peer has more to send.
        more: bool,
    },
    /// The response is complete.
    Finished,
    /// The close handshake completed.
    Closed,
    /// The peer cancelled the flow.
    Cancelled,
    /// The flow failed.
    Failed(FlowError),
}

impl FlowEvent {
    /// Whether no further events follow this one.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Closed | Self::Cancelled | Self::Failed(_)
        )
    }
}

/// One effect of feeding a flow an input.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Output {
    /// Transmit to the peer. `id` and `seq` are already assigned.
    Send(Message),
    /// Report to the owner.
    Event(FlowEvent),
}

/// State of one initiated flow.
#[derive(Debug)]
pub(crate) struct Flow {
    id: FlowId,
    shape: FlowShape,
    state: FlowState,
    seq: SequenceValidator,
    credits: CreditLedger,
    /// Unsent body bytes.
    pump: Pump,
    /// Response head already reported.
    head_seen: bool,
    /// `close` goes out once the pump is empty.
    close_pending: bool,
}

impl Flow {
    /// A flow in `Opening` that offered `initial_credits` with its open message.
    pub(crate) fn new(
        id: FlowId,
        shape: FlowShape,
        initial_credits: u64,
        grant_on_receive: bool,
    ) -> Self {
        Self {
            id,
            shape,
            state: FlowState::Opening,
            seq: SequenceValidator::new(),
            credits: CreditLedger::new(initial_credits, grant_on_receive),
            pump: Pump::default(),
            head_seen: false,
            close_pending: false,
        }
    }

    pub(crate) const fn id(&self) -> &FlowId {
        &self.id
    }

    pub(crate) const fn shape(&self) -> FlowShape {
        self.shape
    }

    pub(crate) const fn state(&self) -> FlowState {
        self.state
    }

    pub(crate) const fn credits(&self) -> &CreditLedger {
        &self.credits
    }

    /// Queues body bytes to go out as soon as credits allow.
    pub(crate) fn queue(&mut self, body: Vec<u8>) {
        self.pump.push(body);
    }

    /// Stamps the open message with this flow's id and first `seq`.
    pub(crate) fn open(&mut self, mut msg: Message) -> Message {
        msg.id = self.id.to_string();
        msg.seq = Some(self.seq.next_outbound());
        msg
    }

    /// Feeds one inbound message.
    ///
    /// An `Err` means the peer broke the protocol; the caller should
    /// [`abort`](Self::abort) the flow.
    pub(crate) fn on_message(&mut self, msg: Message) -> Result<Vec<Output>, FlowError> {
        if self.state.is_terminal() {
            return Err(FlowError::Closed);
        }
        self.seq.observe(Direction::Inbound, msg.seq)?;

        let mut out = Vec::new();
        match msg.kind {
            Some(MessageType::Error) => {
                self.state = FlowState::Errored;
                let condition = msg.condition.unwrap_or_default();
                out.push(Output::Event(FlowEvent::Failed(FlowError::Peer { condition })));
            }
            Some(MessageType::Cancel) => {
                self.state = FlowState::Closed;
                out.push(Output::Event(FlowEvent::Cancelled));
            }
            Some(kind) if self.state == FlowState::Opening => {
                return Err(FlowError::Protocol(format!(
                    "`{}` before the first reply",
                    kind.as_str()
                )));
            }
            Some(MessageType::Credit) => {
                self.credits.grant(msg.credits.unwrap_or(0));
                self.run_pump(&mut out)?;
            }
            Some(MessageType::KeepAlive) => {
                self.emit(Message::typed("", MessageType::KeepAlive), &mut out);
            }
            Some(MessageType::Close) => {
                if self.shape != FlowShape::Duplex {
                    return Err(FlowError::Protocol("`close` on a request flow".into()));
                }
                if self.state == FlowState::Open {
                    self.emit(Message::typed("", MessageType::Close), &mut out);
                }
                self.state = FlowState::Closed;
                out.push(Output::Event(FlowEvent::Closed));
            }
            None => self.on_data(msg, &mut out)?,
        }
        Ok(out)
    }

    fn on_data(&mut self, msg: Message, out: &mut Vec<Output>) -> Result<(), FlowError> {
        if self.state == FlowState::Opening {
            self.state = FlowState::Open;
            if self.shape == FlowShape::Duplex {
                out.push(Output::Event(FlowEvent::Connected));
            }
        }
        if let Some(n) = msg.credits {
            self.credits.grant(n);
        }
        if !self.head_seen
            && let Some(code) = msg.code
        {
            self.head_seen = true;
            out.push(Output::Event(FlowEvent::Response(ResponseHead {
                code,
                reason: msg.reason.unwrap_or_default(),
                headers: msg.headers.unwrap_or_default(),
            })));
        }

        // Only a duplex stream outlives the peer's last segment.
        let continues = msg.more || self.shape == FlowShape::Duplex;
        if let Some(body) = msg.body.filter(|b| !b.is_empty()) {
            let grant = self.credits.observe_received(body.len() as u64);
            out.push(Output::Event(FlowEvent::Data {
                body,
                more: msg.more,
            }));
            if continues && let Some(n) = grant {
                let mut credit = Message::typed("", MessageType::Credit);
                credit.credits = Some(n);
                self.emit(credit, out);
            }
        }

        if !continues {
            self.state = FlowState::Closed;
            out.push(Output::Event(FlowEvent::Finished));
            return Ok(());
        }
        self.run_pump(out)
    }

    /// Queues data on a duplex stream.
    pub(crate) fn send(&mut self, body: Vec<u8>) -> Result<Vec<Output>, FlowError> {
        if self.shape != FlowShape::Duplex {
            return Err(FlowError::Protocol("only a duplex stream takes data after open".into()));
        }
        if !matches!(self.state, FlowState::Opening | FlowState::Open) || self.close_pending {
            return Err(FlowError::Closed);
        }
        self.pump.push(body);
        let mut out = Vec::new();
        if self.state == FlowState::Open {
            self.run_pump(&mut out)?;
        }
        Ok(out)
    }

    /// Starts the close handshake of a duplex stream.
    ///
    /// Queued data goes out first; the `close` follows once it has.
    pub(crate) fn close(&mut self) -> Result<Vec<Output>, FlowError> {
        if self.shape != FlowShape::Duplex {
            return Err(FlowError::Protocol("only a duplex stream can be closed".into()));
        }
        match self.state {
            FlowState::Open => {}
            FlowState::Opening => {
                return Err(FlowError::Protocol("stream is not connected yet".into()));
            }
            _ => return Err(FlowError::Closed),
        }
        self.state = FlowState::Closing;
        self.close_pending = true;
        let mut out = Vec::new();
        self.run_pump(&mut out)?;
        Ok(out)
    }

    /// Abandons the flow, telling the peer.
    pub(crate) fn cancel(&mut self) -> Vec<Output> {
        let mut out = Vec::new();
        if self.state.is_terminal() {
            return out;
        }
        self.emit(Message::typed("", MessageType::Cancel), &mut out);
        self.state = FlowState::Closed;
        out
    }

    /// Fails the flow after a local protocol check rejected peer input.
    ///
    /// Returns the `cancel` for the peer and the failure event.
    pub(crate) fn abort(&mut self, err: FlowError) -> Vec<Output> {
        let mut out = Vec::new();
        if !self.state.is_terminal() {
            self.emit(Message::typed("", MessageType::Cancel), &mut out);
        }
        self.state = FlowState::Errored;
        out.push(Output::Event(FlowEvent::Failed(err)));
        out
    }

    /// A keep-alive, if the flow is established.
    pub(crate) fn keep_alive(&mut self) -> Vec<Output> {
        let mut out = Vec::new();
        if matches!(self.state, FlowState::Open | FlowState::Closing) {
            self.emit(Message::typed("", MessageType::KeepAlive), &mut out);
        }
        out
    }

    /// Takes back `seq` and everything after it, for messages that were
    /// numbered but could not be sent.
    pub(crate) const fn unsend(&mut self, seq: u64) {
        self.seq.rewind_outbound(seq);
    }

    fn emit(&mut self, mut msg: Message, out: &mut Vec<Output>) {
        msg.id = self.id.to_string();
        msg.seq = Some(self.seq.next_outbound());
        out.push(Output::Send(msg));
    }

    fn run_pump(&mut self, out: &mut Vec<Output>) -> Result<(), FlowError> {
        for (body, more) in self.pump.drain(&mut self.credits)? {
            let msg = Message {
                body: Some(body),
                more,
                ..Message::default()
            };
            self.emit(msg, out);
        }
        if self.close_pending && self.pump.is_empty() {
            self.close_pending = false;
            self.emit(Message::typed("", MessageType::Close), out);
        }
        Ok(())
    }
}
