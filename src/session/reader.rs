// ABOUTME: The per-session reader task: frame validation, routing and SEQ handling
// ABOUTME: Any protocol violation observed here tears the whole session down

//! The reader.
//!
//! One logical task per session pulls bytes from the transport, lets the
//! codec produce frames, and runs the per-frame protocol checks before
//! anything reaches application code:
//!
//! 1. the frame's channel must exist,
//! 2. its `seqno` must be exactly the next expected octet,
//! 3. its payload must fit inside the advertised receive window,
//! 4. MSG message numbers must not collide with a pending exchange, and
//!    fragment runs must stay contiguous.
//!
//! Frames that pass are reassembled per channel policy, answered with a
//! SEQ advertisement when one is due, and finally routed: a registered
//! wait-reply wins, otherwise the channel's handler path runs on the
//! worker pool. The reader itself never executes user code; it only
//! blocks in the transport read.

use crate::connection::FrameReader;
use crate::error::BeepResult;
use crate::frame::{Frame, WireFrame};
use crate::session::Session;
use crate::session::writer::WriterCmd;
use std::sync::{Arc, Weak};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Runs the reader until EOF, a transport error, a protocol violation or
/// the session being dropped.
pub(crate) async fn run_reader<R>(mut io: FrameReader<R>, session: Weak<Session>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = io.read_frame().await;
        let Some(session) = session.upgrade() else {
            return;
        };

        match result {
            Ok(Some(WireFrame::Seq(seq))) => {
                let Some(channel) = session.channel(seq.channel) else {
                    warn!(channel = seq.channel, "SEQ for unknown channel");
                    session.teardown("SEQ frame for unknown channel");
                    return;
                };
                if let Err(err) = channel.apply_seq(&seq) {
                    warn!(%err, "invalid SEQ advertisement");
                    session.teardown("invalid SEQ advertisement");
                    return;
                }
                // Whatever was parked behind the old window may move now.
                let _ = session.writer_handle().send(WriterCmd::Unstall(seq.channel));
            }
            Ok(Some(WireFrame::Data(frame))) => {
                if let Err(err) = deliver(&session, frame).await {
                    warn!(%err, "inbound frame rejected");
                    session.teardown("protocol violation on inbound frame");
                    return;
                }
            }
            Ok(None) => {
                debug!("peer closed the transport");
                session.teardown("peer closed transport");
                return;
            }
            Err(err) => {
                warn!(%err, "transport read failed");
                session.teardown("transport read failed");
                return;
            }
        }
    }
}

/// Validates, absorbs and routes one data frame.
async fn deliver(session: &Arc<Session>, frame: Frame) -> BeepResult<()> {
    let Some(channel) = session.channel(frame.channel) else {
        return Err(crate::error::BeepError::Protocol(format!(
            "frame for unknown channel {}",
            frame.channel
        )));
    };

    let ingested = channel.ingest(frame)?;
    if let Some(seq) = ingested.seq {
        let _ = session.writer_handle().send(WriterCmd::Seq(seq));
    }
    let Some(frame) = ingested.deliver else {
        return Ok(());
    };

    // Replies first try the wait-reply rendezvous for their msgno; only
    // unclaimed frames continue into the handler path.
    let frame = if frame.frame_type.is_reply() {
        match channel.route_reply(frame).await? {
            Some(frame) => frame,
            None => return Ok(()),
        }
    } else {
        frame
    };

    channel.dispatch(frame);
    Ok(())
}
