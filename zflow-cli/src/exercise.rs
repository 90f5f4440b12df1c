//! Initiator commands: get, post, stream, ws.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use zflow::transport::TcpClient;
use zflow::{Client, Config, FlowEvent, Request, ResponseHead};

/// Arguments for `zflow get`.
#[derive(clap::Args)]
pub struct GetArgs {
    /// Target URI.
    pub uri: String,

    /// Extra header (format: `Name: value`).
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Print the status line and headers to stderr.
    #[arg(short, long)]
    pub include: bool,

    /// Refuse responses larger than this many bytes.
    #[arg(long)]
    pub max_size: Option<u64>,
}

/// Arguments for `zflow post`.
#[derive(clap::Args)]
pub struct PostArgs {
    /// Target URI.
    pub uri: String,

    /// File to upload.
    pub file: PathBuf,

    /// Request method.
    #[arg(short = 'X', long, default_value = "POST")]
    pub method: String,

    /// Send the whole file in the opening message instead of in chunks.
    #[arg(long)]
    pub inline: bool,
}

async fn connect(addr: &str, config: Config) -> Result<Client<TcpClient>> {
    let transport = TcpClient::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;
    Ok(Client::start(transport, config).await?)
}

fn parse_header(line: &str) -> Result<(String, String)> {
    let Some((name, value)) = line.split_once(':') else {
        bail!("header must look like `Name: value`: {line}");
    };
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

fn print_head(head: &ResponseHead) {
    let status = format!("{} {}", head.code, head.reason);
    if head.code < 400 {
        eprintln!("{}", status.green());
    } else {
        eprintln!("{}", status.red());
    }
    for (name, value) in &head.headers {
        eprintln!("{}: {value}", name.bold());
    }
}

async fn write_stdout(data: &[u8]) -> Result<()> {
    let mut out = tokio::io::stdout();
    out.write_all(data).await?;
    out.flush().await?;
    Ok(())
}

pub async fn get(addr: &str, config: Config, args: GetArgs) -> Result<()> {
    let client = connect(addr, config).await?;
    let mut req = Request::get(args.uri);
    for line in &args.headers {
        let (name, value) = parse_header(line)?;
        req = req.header(name, value);
    }
    if let Some(limit) = args.max_size {
        req = req.max_size(limit);
    }
    let response = client.request(req).await?.into_response().await?;
    if args.include {
        print_head(&response.head);
    }
    write_stdout(&response.body).await
}

pub async fn post(addr: &str, config: Config, args: PostArgs) -> Result<()> {
    let body = std::fs::read(&args.file)
        .with_context(|| format!("cannot read {}", args.file.display()))?;
    let client = connect(addr, config).await?;
    let req = Request::new(args.method, args.uri).body(body);
    let flow = if args.inline {
        client.request(req).await?
    } else {
        client.upload(req).await?
    };
    let response = flow.into_response().await?;
    print_head(&response.head);
    write_stdout(&response.body).await
}

pub async fn stream(addr: &str, config: Config, uri: &str) -> Result<()> {
    let client = connect(addr, config).await?;
    let mut flow = client.request(Request::get(uri).stream(true)).await?;
    loop {
        let event = tokio::select! {
            event = flow.next_event() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            Some(FlowEvent::Response(head)) => print_head(&head),
            Some(FlowEvent::Data { body, .. }) => write_stdout(&body).await?,
            Some(FlowEvent::Finished) => return Ok(()),
            Some(FlowEvent::Failed(err)) => return Err(err.into()),
            Some(FlowEvent::Cancelled) => bail!("cancelled by peer"),
            Some(event) => tracing::debug!(?event, "ignored"),
            None => bail!("connection closed"),
        }
    }
    flow.cancel().await?;
    Ok(())
}

/// What woke the `ws` loop.
enum Input {
    Event(Option<FlowEvent>),
    Line(Option<String>),
    Interrupt,
}

pub async fn ws(addr: &str, config: Config, uri: &str, text: Option<String>) -> Result<()> {
    let client = connect(addr, config).await?;
    let mut flow = client.open_stream(uri).await?;
    match flow.next_event().await {
        Some(FlowEvent::Connected) => eprintln!("{}", "connected".green()),
        Some(FlowEvent::Failed(err)) => return Err(err.into()),
        other => bail!("stream not established: {other:?}"),
    }

    // With a single message there is nothing to read from stdin.
    let mut closing = text.is_some();
    if let Some(text) = text {
        flow.send(text).await?;
        flow.close().await?;
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            event = flow.next_event() => Input::Event(event),
            line = lines.next_line(), if !closing => Input::Line(line?),
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };
        match input {
            Input::Line(Some(line)) => flow.send(line).await?,
            Input::Line(None) => {
                flow.close().await?;
                closing = true;
            }
            Input::Interrupt => break,
            Input::Event(Some(FlowEvent::Data { body, .. })) => {
                write_stdout(&body).await?;
                write_stdout(b"\n").await?;
            }
            Input::Event(Some(FlowEvent::Closed)) => return Ok(()),
            Input::Event(Some(FlowEvent::Failed(err))) => return Err(err.into()),
            Input::Event(Some(FlowEvent::Cancelled)) => bail!("cancelled by peer"),
            Input::Event(Some(event)) => tracing::debug!(?event, "ignored"),
            Input::Event(None) => bail!("connection closed"),
        }
    }
    flow.cancel().await?;
    Ok(())
}
