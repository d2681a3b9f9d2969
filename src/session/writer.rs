// ABOUTME: The per-session sequencer/writer task that turns send requests into frames
// ABOUTME: Handles per-channel FIFO ordering, round-robin fairness and stall parking

//! The sequencer.
//!
//! One logical task per session consumes queued send requests, chooses
//! the next frame size each channel can put on the wire, and writes the
//! frames through the buffered transport half.
//!
//! Fairness is round-robin by frame: after producing one frame for a
//! channel the channel goes to the back of the ready ring, so a bulk
//! transfer never starves its neighbours. Frames of one request are
//! never interleaved with another request on the same channel, keeping
//! the fragment run contiguous.
//!
//! A channel whose send stream has reached the remote advertisement
//! (`next_seqno == ackno + window`) is *stalled*: it leaves the ready
//! ring entirely and is re-admitted when the reader observes a SEQ for
//! it. Stalled channels therefore cost nothing and cannot starve the
//! rest of the session.

use crate::channel::{Channel, FrameSizeContext};
use crate::connection::FrameWriter;
use crate::feeder::PayloadFeeder;
use crate::frame::{Frame, FrameType, SeqFrame};
use crate::session::Session;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Sender half used by channels and the reader to feed the sequencer.
pub(crate) type WriterHandle = mpsc::UnboundedSender<WriterCmd>;

/// Commands consumed by the sequencer task.
pub(crate) enum WriterCmd {
    /// Queue a send request for its channel.
    Request(SendRequest),
    /// Write a flow-control advertisement ahead of queued data.
    Seq(SeqFrame),
    /// A SEQ for this channel arrived; re-admit its parked work.
    Unstall(u16),
    /// Flush and exit.
    Shutdown,
}

/// What kind of frame a request produces, with its identifiers.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RequestKind {
    Msg { msgno: u32 },
    Rpy { msgno: u32 },
    Err { msgno: u32 },
    Ans { msgno: u32, ansno: u32 },
    Nul { msgno: u32 },
}

impl RequestKind {
    fn frame_type(&self) -> FrameType {
        match self {
            RequestKind::Msg { .. } => FrameType::Msg,
            RequestKind::Rpy { .. } => FrameType::Rpy,
            RequestKind::Err { .. } => FrameType::Err,
            RequestKind::Ans { .. } => FrameType::Ans,
            RequestKind::Nul { .. } => FrameType::Nul,
        }
    }

    fn msgno(&self) -> u32 {
        match *self {
            RequestKind::Msg { msgno }
            | RequestKind::Rpy { msgno }
            | RequestKind::Err { msgno }
            | RequestKind::Ans { msgno, .. }
            | RequestKind::Nul { msgno } => msgno,
        }
    }

    fn ansno(&self) -> Option<u32> {
        match *self {
            RequestKind::Ans { ansno, .. } => Some(ansno),
            _ => None,
        }
    }

    fn is_reply(&self) -> bool {
        !matches!(self, RequestKind::Msg { .. })
    }
}

/// Where a request's payload octets come from.
pub(crate) enum PayloadSource {
    /// A fully buffered payload.
    Buffer { data: Bytes, pos: usize },
    /// A streaming feeder, with an optional MIME header block to emit
    /// before the first pulled octet.
    Feeder {
        feeder: Box<dyn PayloadFeeder>,
        lead: Option<Bytes>,
    },
}

impl PayloadSource {
    pub(crate) fn buffer(data: Bytes) -> PayloadSource {
        PayloadSource::Buffer { data, pos: 0 }
    }

    pub(crate) fn feeder(feeder: Box<dyn PayloadFeeder>, lead: Option<Bytes>) -> PayloadSource {
        PayloadSource::Feeder { feeder, lead }
    }

    fn release(&mut self) {
        if let PayloadSource::Feeder { feeder, .. } = self {
            feeder.release();
        }
    }
}

/// One queued outbound message, reply or streamed transfer.
pub(crate) struct SendRequest {
    pub channel: Arc<Channel>,
    pub kind: RequestKind,
    pub source: PayloadSource,
    /// Keep `more=true` on the final frame: a `send_msg_more` chunk whose
    /// message continues in a later request.
    pub hold_more: bool,
}

#[derive(Default)]
struct ChanQueue {
    reqs: VecDeque<SendRequest>,
    /// Present in the ready ring.
    queued: bool,
    /// Stalled on the remote window; off the ring until a SEQ arrives.
    parked: bool,
}

enum Build {
    /// A frame was produced; `finished` means the request is complete.
    Frame {
        frame: Frame,
        budget: usize,
        finished: bool,
    },
    /// The channel cannot send right now.
    Stalled,
}

/// Runs the sequencer until shutdown, transport failure, or the session
/// is dropped.
pub(crate) async fn run_writer<W>(
    mut io: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    session: Weak<Session>,
) where
    W: AsyncWrite + Unpin,
{
    let mut queues: HashMap<u16, ChanQueue> = HashMap::new();
    let mut ready: VecDeque<u16> = VecDeque::new();

    'main: loop {
        // Absorb every command already queued before producing the next
        // frame, so SEQ writes and unstalls never wait behind bulk data.
        loop {
            match rx.try_recv() {
                Ok(cmd) => {
                    if !handle_cmd(cmd, &mut io, &mut queues, &mut ready, &session).await {
                        break 'main;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'main,
            }
        }

        if let Some(number) = ready.pop_front() {
            let Some(queue) = queues.get_mut(&number) else {
                continue;
            };
            queue.queued = false;
            let Some(request) = queue.reqs.front_mut() else {
                continue;
            };

            match build_frame(request) {
                Build::Stalled => {
                    trace!(channel = number, "channel stalled, parking its queue");
                    queue.parked = true;
                }
                Build::Frame {
                    frame,
                    budget,
                    finished,
                } => {
                    if let Err(err) = io.write_data(&frame, budget).await {
                        warn!(%err, "frame write failed");
                        if let Some(session) = session.upgrade() {
                            session.teardown("transport write failed");
                        }
                        break 'main;
                    }
                    if finished {
                        if let Some(mut request) = queue.reqs.pop_front() {
                            request.source.release();
                            if request.kind.is_reply() {
                                request.channel.on_reply_sent();
                            }
                        }
                    }
                    if !queue.reqs.is_empty() && !queue.parked {
                        queue.queued = true;
                        ready.push_back(number);
                    }
                }
            }
        } else {
            // Idle: everything produced so far goes out to the peer now.
            if let Err(err) = io.flush().await {
                warn!(%err, "transport flush failed");
                if let Some(session) = session.upgrade() {
                    session.teardown("transport flush failed");
                }
                break 'main;
            }
            match rx.recv().await {
                Some(cmd) => {
                    if !handle_cmd(cmd, &mut io, &mut queues, &mut ready, &session).await {
                        break 'main;
                    }
                }
                None => break 'main,
            }
        }
    }

    let _ = io.flush().await;
    // Discard queued work; feeders get their release callback.
    for (_, mut queue) in queues.drain() {
        for request in queue.reqs.iter_mut() {
            request.source.release();
        }
    }
    debug!("sequencer exited");
}

/// Applies one command. Returns `false` when the task should exit.
async fn handle_cmd<W>(
    cmd: WriterCmd,
    io: &mut FrameWriter<W>,
    queues: &mut HashMap<u16, ChanQueue>,
    ready: &mut VecDeque<u16>,
    session: &Weak<Session>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    match cmd {
        WriterCmd::Request(request) => {
            let number = request.channel.number();
            let queue = queues.entry(number).or_default();
            queue.reqs.push_back(request);
            if !queue.queued && !queue.parked {
                queue.queued = true;
                ready.push_back(number);
            }
            true
        }
        WriterCmd::Seq(seq) => {
            // Advertisements jump the data queue and go out immediately;
            // a starving peer is waiting on exactly this frame.
            if let Err(err) = io.write_seq(&seq).await {
                warn!(%err, "SEQ write failed");
                if let Some(session) = session.upgrade() {
                    session.teardown("transport write failed");
                }
                return false;
            }
            if let Err(err) = io.flush().await {
                warn!(%err, "SEQ flush failed");
                if let Some(session) = session.upgrade() {
                    session.teardown("transport flush failed");
                }
                return false;
            }
            true
        }
        WriterCmd::Unstall(number) => {
            if let Some(queue) = queues.get_mut(&number) {
                queue.parked = false;
                if !queue.reqs.is_empty() && !queue.queued {
                    queue.queued = true;
                    ready.push_back(number);
                }
            }
            true
        }
        WriterCmd::Shutdown => false,
    }
}

/// Produces the next frame of `request`, or reports the channel stalled.
fn build_frame(request: &mut SendRequest) -> Build {
    let channel = &request.channel;
    let (budget, local_window, next_seqno) = channel.sizing_inputs();

    let (payload, finished) = match &mut request.source {
        PayloadSource::Buffer { data, pos } => {
            let remaining = data.len() - *pos;
            if remaining == 0 {
                // Zero-payload frames (NUL, empty messages) consume no
                // window and may go out even when stalled.
                (Bytes::new(), true)
            } else {
                if budget == 0 {
                    return Build::Stalled;
                }
                let ctx = FrameSizeContext {
                    channel: channel.number(),
                    next_seqno,
                    remaining,
                    window_budget: budget,
                    local_window,
                };
                let chunk = channel.next_frame_size(&ctx).min(remaining).min(budget);
                if chunk == 0 {
                    return Build::Stalled;
                }
                let payload = data.slice(*pos..*pos + chunk);
                *pos += chunk;
                (payload, *pos == data.len())
            }
        }
        PayloadSource::Feeder { feeder, lead } => {
            if budget == 0 {
                return Build::Stalled;
            }
            let ctx = FrameSizeContext {
                channel: channel.number(),
                next_seqno,
                remaining: budget,
                window_budget: budget,
                local_window,
            };
            let max = channel.next_frame_size(&ctx).min(budget);
            if max == 0 {
                return Build::Stalled;
            }

            let mut assembled = BytesMut::new();
            if let Some(mut header) = lead.take() {
                if header.len() > max {
                    let head = header.split_to(max);
                    *lead = Some(header);
                    return lead_only_frame(channel, request.kind, head, budget);
                }
                assembled.put_slice(&header);
            }

            let pull = max - assembled.len();
            let last = if pull > 0 {
                let chunk = feeder.next_chunk(pull);
                let last = chunk.last || chunk.data.is_empty();
                assembled.put_slice(&chunk.data);
                last
            } else {
                false
            };
            (assembled.freeze(), last)
        }
    };

    let more = if finished { request.hold_more } else { true };
    let frame = Frame {
        frame_type: request.kind.frame_type(),
        channel: channel.number(),
        msgno: request.kind.msgno(),
        more,
        seqno: channel.claim_seqno(payload.len()),
        ansno: request.kind.ansno(),
        payload,
    };
    Build::Frame {
        frame,
        budget,
        finished,
    }
}

/// Emits a mid-message frame holding part of the feeder's MIME lead.
fn lead_only_frame(channel: &Channel, kind: RequestKind, payload: Bytes, budget: usize) -> Build {
    let frame = Frame {
        frame_type: kind.frame_type(),
        channel: channel.number(),
        msgno: kind.msgno(),
        more: true,
        seqno: channel.claim_seqno(payload.len()),
        ansno: kind.ansno(),
        payload,
    };
    Build::Frame {
        frame,
        budget,
        finished: false,
    }
}
