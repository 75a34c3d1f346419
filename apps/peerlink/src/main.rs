use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use peerlink_core::channel::ChannelState;
use peerlink_core::telemetry::{self, LogConfig};
use peerlink_core::{
    ChannelEvent, ChannelSpec, Config, EndpointEvent, PayloadKind, ReceivedPayload, Session,
};

#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Peer session negotiation demo")]
struct Cli {
    #[arg(long, env = "PEERLINK_LOG", global = true, help = "Log filter used when RUST_LOG is unset")]
    log: Option<String>,

    #[arg(long, global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, env = "PEERLINK_CHANNEL_OPEN_TIMEOUT_MS", global = true)]
    channel_open_timeout_ms: Option<u64>,

    #[arg(long, env = "PEERLINK_MAX_FRAME_BYTES", global = true)]
    max_frame_bytes: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two in-process endpoints with pre-negotiated `msg` and `img` channels
    Loopback(LoopbackArgs),
    /// Two in-process endpoints with one channel announced in-band
    Inband(InbandArgs),
}

#[derive(Args, Debug)]
struct LoopbackArgs {
    #[arg(long, default_value = "hello")]
    text: String,

    #[arg(long, help = "Image file sent over the binary channel")]
    image: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InbandArgs {
    #[arg(long, default_value = "chat")]
    label: String,

    #[arg(long, default_value = "hello over an announced channel")]
    text: String,
}

const MSG: u16 = 1;
const IMG: u16 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(filter) = cli.log.clone() {
        config.log_filter = filter;
    }
    if let Some(ms) = cli.channel_open_timeout_ms {
        config.channel_open_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = cli.max_frame_bytes {
        config.max_frame_bytes = bytes.max(1);
    }

    telemetry::init(&LogConfig {
        filter: config.log_filter.clone(),
        file: cli.log_file.clone(),
        show_targets: true,
    })
    .context("initialise logging")?;

    match cli.command {
        Command::Loopback(args) => run_loopback(&config, args).await,
        Command::Inband(args) => run_inband(&config, args).await,
    }
}

async fn run_loopback(config: &Config, args: LoopbackArgs) -> Result<()> {
    let image = match &args.image {
        Some(path) => std::fs::read(path).with_context(|| format!("read image {}", path.display()))?,
        None => demo_image(),
    };

    let session = Session::loopback(config).context("create loopback session")?;
    session
        .open_pre_negotiated("msg", MSG, PayloadKind::Text)
        .await?;
    session
        .open_pre_negotiated("img", IMG, PayloadKind::Binary)
        .await?;
    session.start().await.context("start negotiation")?;
    session.wait_connected(None).await.context("connect")?;

    let offerer = session.offerer();
    let Some(answerer) = session.answerer() else {
        bail!("loopback session has no answerer");
    };
    for stream in [MSG, IMG] {
        for endpoint in [offerer, answerer] {
            tokio::time::timeout(
                config.channel_open_timeout,
                endpoint.wait_for_channel(stream, ChannelState::Open),
            )
            .await
            .with_context(|| format!("channel {stream} on {} never opened", endpoint.id()))??;
        }
    }

    offerer.send_text(MSG, args.text.clone()).await?;
    offerer.send_binary(IMG, image).await?;

    let text = answerer
        .router()
        .text_sink()
        .recv()
        .await
        .context("text sink closed")?;
    print_payload(&text);
    let binary = answerer
        .router()
        .binary_sink()
        .recv()
        .await
        .context("binary sink closed")?;
    print_payload(&binary);

    session.shutdown().await?;
    println!("session {:?}", session.state());
    Ok(())
}

async fn run_inband(config: &Config, args: InbandArgs) -> Result<()> {
    let session = Session::loopback(config).context("create loopback session")?;
    let mut events = session
        .take_events()
        .context("session events already taken")?;
    session.start().await.context("start negotiation")?;
    session.wait_connected(None).await.context("connect")?;

    let offerer = session.offerer();
    let Some(answerer) = session.answerer() else {
        bail!("loopback session has no answerer");
    };
    let channel = offerer
        .open_channel(ChannelSpec::in_band(args.label.clone(), PayloadKind::Text))
        .await?;

    let announced = tokio::time::timeout(config.channel_open_timeout, async {
        while let Some(tagged) = events.recv().await {
            if let EndpointEvent::Channel(ChannelEvent::Announced(remote)) = tagged.event
                && tagged.endpoint == *answerer.id()
            {
                return Some(remote);
            }
        }
        None
    })
    .await
    .context("announcement timed out")?
    .context("session ended before announcement")?;
    println!(
        "{} announced channel {:?} on stream {}",
        offerer.id(),
        announced.label,
        announced.stream
    );

    offerer
        .wait_for_channel(channel.stream, ChannelState::Open)
        .await?;
    offerer.send_text(channel.stream, args.text).await?;
    let received = answerer
        .router()
        .text_sink()
        .recv()
        .await
        .context("text sink closed")?;
    print_payload(&received);

    session.shutdown().await?;
    println!("session {:?}", session.state());
    Ok(())
}

fn print_payload(payload: &ReceivedPayload) {
    match payload.as_text() {
        Some(text) => println!(
            "received on {:?} (stream {}): {:?}",
            payload.label, payload.stream, text
        ),
        None => println!(
            "received on {:?} (stream {}): {} bytes",
            payload.label,
            payload.stream,
            payload.bytes.len()
        ),
    }
}

/// A 1x1 PNG, used when no image file is given.
fn demo_image() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
        0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0xf8,
        0xcf, 0xc0, 0xf0, 0x1f, 0x00, 0x05, 0x00, 0x01, 0xff, 0x89, 0x99, 0x3d, 0x1d, 0x00, 0x00,
        0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
    ]
}
