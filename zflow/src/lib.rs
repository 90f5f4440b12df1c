//! Credit-based streaming sessions over asynchronous message transports.
//!
//! `zflow` carries one logical connection (a request, a chunked upload,
//! or a full-duplex byte stream) as a sequence of discrete messages with
//! strict per-flow ordering, credit-based backpressure, and explicit
//! termination. It needs nothing from the transport beyond "send to the
//! server", "send to this address", and "receive".
//!
//! The protocol logic lives in two sans-IO state machines: [`Engine`] for
//! initiators and [`Responder`] for servers. [`Client`] and [`serve`] run
//! them over any [`Transport`].
//!
//! # Quick start
//!
//! ```no_run
//! use zflow::transport::TcpClient;
//! use zflow::{Client, Config, Request};
//!
//! # async fn run() -> zflow::Result<()> {
//! let transport = TcpClient::connect("127.0.0.1:5550").await?;
//! let client = Client::start(transport, Config::with_client_id("getter")).await?;
//!
//! let response = client
//!     .request(Request::get("http://example.com/"))
//!     .await?
//!     .into_response()
//!     .await?;
//! println!("{} {}", response.head.code, response.head.reason);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod engine;
mod error;
mod flow;
mod ledger;
mod pump;
mod responder;
mod router;
mod sequence;
mod server;
pub mod transport;

pub use client::{Client, FlowHandle, Response};
pub use config::{Config, IDEAL_CREDITS};
pub use engine::{Engine, Outbound, Request, Step};
pub use error::{Error, FlowError, Result};
pub use flow::{FlowEvent, FlowId, FlowShape, FlowState, ResponseHead};
pub use ledger::CreditLedger;
pub use responder::{IncomingRequest, Reply, Responder, ServeStep, Work};
pub use router::{Address, ReplyRouter};
pub use sequence::{Direction, SequenceValidator};
pub use server::{Handler, serve};
pub use zflow_proto::{Format, Header, Message, MessageType};
