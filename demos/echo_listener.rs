// ABOUTME: Example listener hosting an echo profile over plain TCP
// ABOUTME: Shows profile registration, session establishment and handler dispatch

use beep::{BoxFuture, Channel, Context, Frame, FrameType, MimeHandling, Profile, Session, SessionRole};
pub(crate) use argh::FromArgs;
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const ECHO_URI: &str = "urn:example:echo";

/// Example listener that echoes every message back on the same channel
#[derive(FromArgs)]
struct CliArgs {
    /// the address to listen on (default: 0.0.0.0:10288)
    #[argh(option, short = 'l')]
    listen: Option<String>,
}

/// Replies to every MSG with an RPY carrying the same payload.
struct EchoProfile;

impl Profile for EchoProfile {
    fn mime_handling(&self) -> MimeHandling {
        MimeHandling::Disabled
    }

    fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
        Box::pin(async move {
            if frame.frame_type == FrameType::Msg {
                info!(
                    channel = channel.number(),
                    msgno = frame.msgno,
                    octets = frame.payload.len(),
                    "echoing message"
                );
                if let Err(err) = channel.send_rpy(frame.msgno, frame.payload) {
                    error!(%err, "echo reply failed");
                }
            }
        })
    }
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

    let mut ctx = Context::new();
    ctx.register_profile(ECHO_URI, Arc::new(EchoProfile));
    let ctx = Arc::new(ctx);

    let addr = cli_args.listen.unwrap_or_else(|| "0.0.0.0:10288".to_owned());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    loop {
        let (stream, remote) = listener.accept().await?;
        info!(%remote, "accepted connection");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            match Session::connect(stream, SessionRole::Listener, ctx).await {
                Ok(session) => {
                    session.wait_closed().await;
                    info!(%remote, "session ended");
                }
                Err(err) => error!(%remote, %err, "session establishment failed"),
            }
        });
    }
}
