//! Async initiator over a [`Transport`].
//!
//! A [`Client`] runs one dispatch task that reads the transport and feeds
//! the [`Engine`], and one writer task that sends what the engine emits.
//! Each flow is exposed as a [`FlowHandle`] receiving its events over its
//! own channel. Dropping a handle cancels its flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::{Engine, Outbound, Request, Step};
use crate::flow::{FlowEvent, FlowId, ResponseHead};
use crate::transport::{Transport, write_queued};
use crate::{Config, Error, FlowError, Result};

/// Engine plus the channels its events go to.
#[derive(Debug)]
struct State {
    engine: Engine,
    subscribers: HashMap<FlowId, mpsc::UnboundedSender<FlowEvent>>,
    /// The transport has shut down.
    closed: bool,
}

#[derive(Debug)]
struct Shared<T> {
    transport: Arc<T>,
    /// Feeds the writer task. Only filled with `state` locked, so the wire
    /// order of each flow matches its sequence numbers.
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Flows whose handles were dropped.
    abandoned: mpsc::UnboundedSender<FlowId>,
    state: Mutex<State>,
}

impl<T: Transport> Shared<T> {
    /// Runs one engine operation and queues its effects.
    async fn run<R>(
        &self,
        op: impl FnOnce(&mut Engine, Instant) -> Result<(R, Step)>,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::TransportClosed);
        }
        let (value, step) = op(&mut state.engine, Instant::now())?;
        self.apply(&mut state, step);
        Ok(value)
    }

    fn apply(&self, state: &mut State, step: Step) {
        for out in step.outbound {
            if self.outbound.send(out).is_err() {
                tracing::debug!("writer stopped, payload dropped");
            }
        }
        for (id, event) in step.events {
            let terminal = event.is_terminal();
            if let Some(tx) = state.subscribers.get(&id) {
                // the handle may have been dropped
                let _ = tx.send(event);
            }
            if terminal {
                state.subscribers.remove(&id);
            }
        }
    }
}

/// Initiator bound to a transport.
#[derive(Debug)]
pub struct Client<T: Transport> {
    shared: Arc<Shared<T>>,
    dispatcher: JoinHandle<()>,
}

impl<T: Transport> Client<T> {
    /// Waits for the transport to become ready and starts dispatching.
    pub async fn start(transport: T, config: Config) -> Result<Self> {
        config.validate()?;
        transport.ready().await?;
        let keep_alive = config.keep_alive_interval();
        let transport = Arc::new(transport);
        let (outbound, queue) = mpsc::unbounded_channel();
        let (abandoned, dropped) = mpsc::unbounded_channel();
        // Ends once the last handle is gone, after sending its cancel.
        tokio::spawn(write_queued(Arc::clone(&transport), queue));
        let shared = Arc::new(Shared {
            transport,
            outbound,
            abandoned,
            state: Mutex::new(State {
                engine: Engine::new(config),
                subscribers: HashMap::new(),
                closed: false,
            }),
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), dropped, keep_alive));
        Ok(Self { shared, dispatcher })
    }

    /// Sends a request.
    pub async fn request(&self, req: Request) -> Result<FlowHandle<T>> {
        self.open(|engine, now| engine.open_request(req, now)).await
    }

    /// Starts an upload; the body is streamed as the peer grants credits.
    pub async fn upload(&self, req: Request) -> Result<FlowHandle<T>> {
        self.open(|engine, now| engine.open_upload(req, now)).await
    }

    /// Opens a duplex stream.
    pub async fn open_stream(&self, uri: &str) -> Result<FlowHandle<T>> {
        self.open(|engine, now| engine.open_stream(uri, now)).await
    }

    /// Number of live flows.
    pub async fn live_flows(&self) -> usize {
        self.shared.state.lock().await.engine.len()
    }

    async fn open(
        &self,
        op: impl FnOnce(&mut Engine, Instant) -> Result<(FlowId, Step)>,
    ) -> Result<FlowHandle<T>> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(Error::TransportClosed);
        }
        let (id, step) = op(&mut state.engine, Instant::now())?;
        // Subscribe before sending: the reply is dispatched under the same lock.
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(id.clone(), tx);
        self.shared.apply(&mut state, step);
        drop(state);
        Ok(FlowHandle {
            id,
            shared: Arc::clone(&self.shared),
            events: rx,
        })
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch<T: Transport>(
    shared: Arc<Shared<T>>,
    mut dropped: mpsc::UnboundedReceiver<FlowId>,
    keep_alive: Option<Duration>,
) {
    let mut ticker = keep_alive.map(|interval| {
        let mut ticker = tokio::time::interval(interval.min(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    loop {
        let tick = async {
            match ticker.as_mut() {
                Some(ticker) => ticker.tick().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            inbound = shared.transport.recv() => match inbound {
                Ok(inbound) => {
                    let mut state = shared.state.lock().await;
                    let step = state.engine.handle_inbound(
                        inbound.sender.as_deref(),
                        &inbound.payload,
                        Instant::now(),
                    );
                    shared.apply(&mut state, step);
                }
                Err(Error::TransportClosed) => {
                    tracing::info!("transport closed, dispatcher stopping");
                    let mut state = shared.state.lock().await;
                    state.closed = true;
                    state.subscribers.clear();
                    return;
                }
                Err(err) => tracing::warn!(%err, "receive failed"),
            },
            Some(id) = dropped.recv() => {
                let mut state = shared.state.lock().await;
                state.subscribers.remove(&id);
                // flows that already ended need no cancel
                if state.engine.state(&id).is_some() {
                    match state.engine.cancel(&id, Instant::now()) {
                        Ok(step) => shared.apply(&mut state, step),
                        Err(err) => tracing::debug!(flow = %id, %err, "cancel on drop failed"),
                    }
                }
            }
            now = tick => {
                let mut state = shared.state.lock().await;
                let step = state.engine.tick(now);
                shared.apply(&mut state, step);
            }
        }
    }
}

/// A complete buffered response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Response {
    /// Status and headers.
    pub head: ResponseHead,
    /// Concatenated body.
    pub body: Vec<u8>,
}

/// One flow, as seen by its owner.
///
/// Dropping a handle whose flow is still live cancels the flow.
#[derive(Debug)]
pub struct FlowHandle<T: Transport> {
    id: FlowId,
    shared: Arc<Shared<T>>,
    events: mpsc::UnboundedReceiver<FlowEvent>,
}

impl<T: Transport> FlowHandle<T> {
    /// Flow id.
    pub const fn id(&self) -> &FlowId {
        &self.id
    }

    /// Next event, or `None` once the flow has ended or the transport closed.
    pub async fn next_event(&mut self) -> Option<FlowEvent> {
        self.events.recv().await
    }

    /// Sends data on a duplex stream.
    pub async fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let data = data.into();
        self.shared
            .run(|engine, now| Ok(((), engine.send_data(&self.id, data, now)?)))
            .await
    }

    /// Starts the close handshake; wait for [`FlowEvent::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.shared
            .run(|engine, now| Ok(((), engine.close(&self.id, now)?)))
            .await
    }

    /// Abandons the flow.
    pub async fn cancel(self) -> Result<()> {
        let result = self
            .shared
            .run(|engine, now| Ok(((), engine.cancel(&self.id, now)?)))
            .await;
        self.shared.state.lock().await.subscribers.remove(&self.id);
        result
    }

    /// Collects the whole response of a request or upload.
    pub async fn into_response(mut self) -> Result<Response> {
        let mut response = Response::default();
        loop {
            match self.next_event().await {
                Some(FlowEvent::Response(head)) => response.head = head,
                Some(FlowEvent::Data { body, .. }) => response.body.extend(body),
                Some(FlowEvent::Finished) => return Ok(response),
                Some(FlowEvent::Failed(err)) => return Err(Error::flow(&self.id, err)),
                Some(FlowEvent::Cancelled) => {
                    return Err(Error::flow(&self.id, FlowError::Cancelled));
                }
                Some(event) => tracing::debug!(flow = %self.id, ?event, "ignored"),
                None => return Err(Error::TransportClosed),
            }
        }
    }
}

impl<T: Transport> Drop for FlowHandle<T> {
    fn drop(&mut self) {
        if self.shared.abandoned.send(self.id.clone()).is_err() {
            tracing::debug!(flow = %self.id, "dispatcher stopped, flow left as is");
        }
    }
}
