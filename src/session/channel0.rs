// ABOUTME: The management profile running on channel 0
// ABOUTME: Handles start and close requests, serverName binding and close-in-transit

//! Channel 0.
//!
//! Every session carries the management profile on channel 0. It answers
//! the peer's `<start>` and `<close>` requests; the outbound halves of
//! those exchanges live on [`Session`](crate::Session) and
//! [`Channel`](crate::Channel) and rendezvous through ordinary
//! wait-replies, so this module only ever sees MSG frames plus the odd
//! already-settled reply.

use crate::channel::{Channel, ChannelState};
use crate::frame::{Frame, FrameType};
use crate::mgmt::{Close, ReplyCode, Reply, Request, Start, ErrorReply};
use crate::profile::{BoxFuture, CloseDecision, CloseEvent, MimeHandling, Profile, StartEvent};
use crate::session::Session;
use std::sync::Arc;
use tracing::{debug, warn};

/// Label reported by `Channel::profile_uri` for channel 0. The
/// management profile has no IANA registration; the label is local.
pub(crate) const MANAGEMENT_URI: &str = "beep:channel-management";

/// Malformed management documents tolerated before the session is torn
/// down.
pub(crate) const MAX_MGMT_STRIKES: u32 = 3;

pub(crate) struct ManagementProfile;

impl Profile for ManagementProfile {
    fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
        Box::pin(handle_frame(channel, frame))
    }

    /// Management payloads carry their own MIME header block.
    fn mime_handling(&self) -> MimeHandling {
        MimeHandling::Disabled
    }
}

async fn handle_frame(channel0: Arc<Channel>, frame: Frame) {
    let Some(session) = channel0.session() else {
        return;
    };
    match frame.frame_type {
        FrameType::Msg => handle_request(&session, &channel0, frame).await,
        // A reply that no wait-reply claimed: the on-wire `<ok/>` paired
        // with a close that already completed through synthesis.
        _ => debug!(
            msgno = frame.msgno,
            frame_type = %frame.frame_type,
            "unclaimed reply on channel 0"
        ),
    }
}

async fn handle_request(session: &Arc<Session>, channel0: &Arc<Channel>, frame: Frame) {
    let msgno = frame.msgno;
    match Request::parse(&frame.payload) {
        Ok(Request::Start(start)) => handle_start(session, channel0, msgno, start),
        Ok(Request::Close(close)) => handle_close(session, channel0, msgno, close).await,
        Err(err) => {
            warn!(%err, "malformed management document");
            if session.mgmt_strike() >= MAX_MGMT_STRIKES {
                session.teardown("repeated malformed management documents");
                return;
            }
            respond_error(
                channel0,
                msgno,
                ReplyCode::SyntaxErrorInParams,
                "invalid management document",
            );
        }
    }
}

fn handle_start(session: &Arc<Session>, channel0: &Arc<Channel>, msgno: u32, start: Start) {
    let number = start.number;
    if number == 0 || number % 2 != session.role().peer_parity() {
        respond_error(
            channel0,
            msgno,
            ReplyCode::SyntaxErrorInParams,
            "invalid channel number",
        );
        return;
    }
    if session.channel(number).is_some() {
        respond_error(
            channel0,
            msgno,
            ReplyCode::TransactionFailed,
            "channel number already in use",
        );
        return;
    }

    // First requested profile present in the local registry wins.
    let Some((requested, profile)) = start
        .profiles
        .iter()
        .find_map(|p| session.registry().lookup(&p.uri).map(|h| (p, h)))
    else {
        respond_error(
            channel0,
            msgno,
            ReplyCode::TransactionFailed,
            "profile not supported",
        );
        return;
    };

    let server_name = session.bind_server_name(start.server_name.clone());
    let event = StartEvent {
        channel: number,
        uri: requested.uri.clone(),
        server_name,
        piggyback: requested.piggyback.clone(),
    };
    match profile.on_start(&event) {
        crate::profile::StartDecision::Refuse { code, diagnostic } => {
            respond_error(channel0, msgno, code, &diagnostic);
        }
        crate::profile::StartDecision::Accept { piggyback } => {
            match session.install_channel(
                number,
                requested.uri.clone(),
                Some(profile),
                ChannelState::Open,
            ) {
                Ok(_) => {
                    let reply = Reply::Accept(crate::mgmt::StartAccept {
                        uri: requested.uri.clone(),
                        piggyback,
                    });
                    if let Err(err) = channel0.send_rpy(msgno, reply.to_payload()) {
                        warn!(%err, channel = number, "failed to confirm channel start");
                    }
                }
                Err(_) => respond_error(
                    channel0,
                    msgno,
                    ReplyCode::TransactionFailed,
                    "channel number already in use",
                ),
            }
        }
    }
}

async fn handle_close(session: &Arc<Session>, channel0: &Arc<Channel>, msgno: u32, close: Close) {
    let number = close.number;

    if number == 0 {
        // Session close. Answer, drain the answer onto the wire, then
        // drop the transport.
        if let Err(err) = channel0.send_rpy(msgno, Reply::Ok.to_payload()) {
            warn!(%err, "failed to acknowledge session close");
        }
        channel0.await_replies_drained().await;
        session.teardown("session closed by peer");
        return;
    }

    let Some(channel) = session.channel(number) else {
        respond_error(
            channel0,
            msgno,
            ReplyCode::SyntaxErrorInParams,
            "no such channel",
        );
        return;
    };

    // Close-in-transit: our own close for this channel is waiting for
    // its reply. Answer the peer at once and settle our side locally;
    // the peer's on-wire reply still retires the exchange.
    if session.close_pending(number) {
        if let Err(err) = channel0.send_rpy(msgno, Reply::Ok.to_payload()) {
            warn!(%err, channel = number, "failed to answer crossing close");
        }
        session.synthesize_close_ok(number);
        session.remove_channel(number);
        return;
    }
    if channel.state() == ChannelState::Closing {
        respond_error(
            channel0,
            msgno,
            ReplyCode::TransactionFailed,
            "close already in progress",
        );
        return;
    }

    let event = CloseEvent {
        channel: number,
        code: close.code,
        msgno,
    };
    let decision = match channel.close_request_handler() {
        Some(handler) => handler(&event),
        None => match channel.profile() {
            Some(profile) => profile.on_close(&event),
            None => CloseDecision::Accept,
        },
    };
    match decision {
        CloseDecision::Refuse { code, diagnostic } => {
            respond_error(channel0, msgno, code, &diagnostic);
        }
        CloseDecision::Defer => {
            debug!(channel = number, "close decision deferred");
            channel.defer_close(msgno);
        }
        CloseDecision::Accept => session.accept_close(channel, msgno),
    }
}

pub(crate) fn respond_error(channel0: &Arc<Channel>, msgno: u32, code: ReplyCode, text: &str) {
    let reply = Reply::Error(ErrorReply {
        code,
        text: text.to_owned(),
    });
    if let Err(err) = channel0.send_err(msgno, reply.to_payload()) {
        warn!(%err, msgno, "failed to send management error reply");
    }
}
