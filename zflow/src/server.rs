//! Async responder over a [`Transport`].
//!
//! The receive loop and handler tasks only queue payloads; a writer task
//! sends them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::Outbound;
use crate::flow::FlowId;
use crate::responder::{IncomingRequest, Reply, Responder, ServeStep, Work};
use crate::router::Address;
use crate::transport::{Transport, write_queued};
use crate::{Config, Error, Result};

/// How often idle sessions are checked for expiry.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Application logic behind a server.
pub trait Handler: Send + Sync + 'static {
    /// Produces the reply to a complete request.
    fn respond(&self, request: IncomingRequest) -> impl Future<Output = Reply> + Send;

    /// Reacts to data on a duplex stream, returning data to send back.
    fn on_stream_data(&self, uri: &str, data: &[u8]) -> Option<Vec<u8>> {
        let _ = (uri, data);
        None
    }
}

#[derive(Debug)]
struct Shared<H> {
    handler: H,
    /// Feeds the writer task. Only filled with `responder` locked.
    outbound: mpsc::UnboundedSender<Outbound>,
    responder: Mutex<Responder>,
}

impl<H: Handler> Shared<H> {
    /// Queues a step and starts its work. Must be called with the
    /// responder locked so each flow's messages leave in order.
    fn apply(self: &Arc<Self>, responder: &mut Responder, step: ServeStep) {
        let mut outbound = step.outbound;
        for work in step.work {
            match work {
                Work::Request { id, request } => {
                    let shared = Arc::clone(self);
                    tokio::spawn(async move { shared.answer(id, request).await });
                }
                Work::StreamData { id, uri, body } => {
                    let Some(reply) = self.handler.on_stream_data(&uri, &body) else {
                        continue;
                    };
                    match responder.send_stream(&id, reply, Instant::now()) {
                        Ok(step) => outbound.extend(step.outbound),
                        Err(err) => tracing::debug!(flow = %id, %err, "stream reply dropped"),
                    }
                }
            }
        }
        self.transmit(outbound);
    }

    async fn answer(self: Arc<Self>, id: FlowId, request: IncomingRequest) {
        let reply = self.handler.respond(request).await;
        let mut responder = self.responder.lock().await;
        match responder.respond(&id, reply, Instant::now()) {
            // a reply produces no further work
            Ok(step) => self.transmit(step.outbound),
            // cancelled or timed out while the handler ran
            Err(err) => tracing::debug!(flow = %id, %err, "reply dropped"),
        }
    }

    fn transmit(&self, outbound: Vec<(Address, Vec<u8>)>) {
        for (address, payload) in outbound {
            if self
                .outbound
                .send(Outbound::ToAddress { address, payload })
                .is_err()
            {
                tracing::debug!("writer stopped, payload dropped");
            }
        }
    }
}

/// Serves flows arriving on `transport` until it closes.
pub async fn serve<T: Transport, H: Handler>(transport: T, config: Config, handler: H) -> Result<()> {
    config.validate()?;
    transport.ready().await?;
    tracing::info!(id = %config.client_id, "serving");
    let transport = Arc::new(transport);
    let (outbound, queue) = mpsc::unbounded_channel();
    tokio::spawn(write_queued(Arc::clone(&transport), queue));
    let shared = Arc::new(Shared {
        handler,
        outbound,
        responder: Mutex::new(Responder::new(config)),
    });

    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            inbound = transport.recv() => {
                let inbound = match inbound {
                    Ok(inbound) => inbound,
                    Err(Error::TransportClosed) => {
                        tracing::info!("transport closed, server stopping");
                        return Ok(());
                    }
                    Err(err) => {
                        tracing::warn!(%err, "receive failed");
                        continue;
                    }
                };
                let mut responder = shared.responder.lock().await;
                let step = responder.handle_inbound(
                    inbound.sender.as_deref(),
                    &inbound.payload,
                    Instant::now(),
                );
                shared.apply(&mut responder, step);
            }
            now = sweep.tick() => {
                let mut responder = shared.responder.lock().await;
                let step = responder.tick(now);
                shared.apply(&mut responder, step);
            }
        }
    }
}
