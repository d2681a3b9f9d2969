// ABOUTME: Example client that opens an echo channel and round-trips one message
// ABOUTME: Shows session establishment, channel start, synchronous wait-reply and close

pub(crate) use argh::FromArgs;
use beep::{Context, MimeHandling, Session, SessionRole};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpStream;

const ECHO_URI: &str = "urn:example:echo";

/// Example application sending one message over an echo channel
#[derive(FromArgs)]
struct CliArgs {
    /// the host to connect to (default: localhost)
    #[argh(option)]
    host: Option<String>,

    /// the port to use when connecting (default: 10288)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the message to send
    #[argh(option, short = 'm')]
    message: String,
}

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let host = cli_args.host.unwrap_or_else(|| "localhost".to_owned());
    let port = cli_args.port.unwrap_or(10288);

    let stream = TcpStream::connect(format!("{host}:{port}")).await?;
    let session = Session::connect(stream, SessionRole::Initiator, Arc::new(Context::new())).await?;
    println!("session established");

    let channel = session.start_channel(ECHO_URI).await.map_err(|e| {
        eprintln!("channel start failed: {e}");
        Box::<dyn Error>::from(e.to_string())
    })?;
    channel.set_mime_handling(MimeHandling::Disabled);
    println!("channel {} open under {}", channel.number(), ECHO_URI);

    let reply = channel.send_msg_wait(cli_args.message.into_bytes()).await?;
    println!("echoed: {}", String::from_utf8_lossy(&reply.payload));

    channel.close().await?;
    session.close().await?;
    println!("session closed");

    Ok(())
}
