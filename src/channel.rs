// ABOUTME: Channel state machine: message numbering, reply ordering, reassembly and windows
// ABOUTME: Implements the send API, wait-reply rendezvous and the per-channel dispatch gate

//! One BEEP channel: an independently sequenced, bidirectional message
//! stream multiplexed over a session.
//!
//! A channel owns three groups of state behind separate locks. `SendState`
//! covers outbound sequencing and the peer's advertised window,
//! `RecvState` covers inbound sequencing, reassembly and our own window
//! advertisements, and `ReplyState` tracks which messages still owe or
//! await replies. The locks are held only for short bookkeeping sections,
//! never across I/O or handler invocations.
//!
//! Lock order, where two must nest: `recv` before `replies` before
//! `send`.

use crate::error::{BeepError, BeepResult};
use crate::feeder::PayloadFeeder;
use crate::frame::{Frame, FrameType, MAX_MSGNO, MAX_PAYLOAD_SIZE, SeqFrame, seq_ge};
use crate::mgmt::ReplyCode;
use crate::profile::{CloseDecision, CloseEvent, FrameHandler, MimeHandling, Profile};
use crate::session::Session;
use crate::session::writer::{PayloadSource, RequestKind, SendRequest, WriterCmd, WriterHandle};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

/// Initial send and receive window for every channel (RFC 3081).
pub const DEFAULT_WINDOW: u32 = 4096;

/// Default ceiling on a single outbound frame's payload.
pub const DEFAULT_MAX_FRAME: usize = 4096;

/// Capacity of a wait-reply rendezvous queue.
const WAITER_QUEUE_DEPTH: usize = 32;

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created locally, start exchange not yet finished.
    Opening,
    /// Fully negotiated; messages flow.
    Open,
    /// A close is in progress in either direction.
    Closing,
    /// The close exchange finished or the session broke.
    Closed,
}

/// What `send_msg` does when the outstanding-MSG limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitMode {
    /// Return [`BeepError::OutstandingLimit`] without sending.
    #[default]
    FailFast,
    /// Wait until a reply retires an outstanding message.
    Block,
}

/// Inputs to a frame-sizing hook.
#[derive(Debug, Clone, Copy)]
pub struct FrameSizeContext {
    pub channel: u16,
    pub next_seqno: u32,
    /// Octets of the message still unsent, when known. Feeder sends
    /// report the window budget here.
    pub remaining: usize,
    /// Octets the remote window accepts right now.
    pub window_budget: usize,
    pub local_window: u32,
}

/// Hook choosing the next frame size for a channel.
pub type FrameSizeHook = Arc<dyn Fn(&FrameSizeContext) -> usize + Send + Sync>;

/// Handler deciding a peer's close request.
pub type CloseRequestHandler = Arc<dyn Fn(&CloseEvent) -> CloseDecision + Send + Sync>;

/// Handler invoked once when a channel reaches `Closed`.
pub type ClosedHandler = Arc<dyn Fn(u16) + Send + Sync>;

/// Default frame sizing: the largest frame the channel can send right
/// now, capped by both windows and [`DEFAULT_MAX_FRAME`].
fn default_frame_size(ctx: &FrameSizeContext) -> usize {
    ctx.window_budget
        .min(ctx.local_window as usize)
        .min(ctx.remaining)
        .min(DEFAULT_MAX_FRAME)
}

#[derive(Debug)]
struct SendState {
    next_seqno: u32,
    next_msgno: u32,
    /// Set while a `send_msg_more` run keeps appending to one message.
    pinned_msgno: Option<u32>,
    remote_ackno: u32,
    remote_window: u32,
    /// Next answer number per MSG being answered with an ANS series.
    next_ansno: HashMap<u32, u32>,
}

impl SendState {
    fn remote_limit(&self) -> u32 {
        self.remote_ackno.wrapping_add(self.remote_window)
    }

    fn budget(&self) -> usize {
        self.remote_limit().wrapping_sub(self.next_seqno) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragKey {
    frame_type: FrameType,
    msgno: u32,
    ansno: Option<u32>,
}

#[derive(Debug)]
struct RecvState {
    next_seqno: u32,
    consumed: u32,
    /// Window size as last advertised.
    local_window: u32,
    /// `ackno + window` of the last advertisement; the upper bound we
    /// promised to accept.
    advertised_limit: u32,
    /// `consumed` at the time of the last advertisement.
    last_ackno: u32,
    /// Pending window resize, applied under the no-retraction rule.
    desired_window: Option<u32>,
    complete: bool,
    complete_limit: usize,
    reassembly: Vec<Frame>,
    reassembly_len: usize,
    frag: Option<FragKey>,
    /// Highest ansno seen per msgno, to flag non-monotonic series.
    ans_seen: HashMap<u32, u32>,
}

impl RecvState {
    /// Decides whether a SEQ advertisement is due after consuming a
    /// frame, and updates the advertisement bookkeeping when one is.
    ///
    /// A pending shrink is never allowed to retract capacity that was
    /// already promised: the emitted window is floored at the promised
    /// remainder, so `ackno + window` never moves backwards.
    fn maybe_advert(&mut self, channel: u16) -> Option<SeqFrame> {
        let promised = self.advertised_limit.wrapping_sub(self.consumed);
        let target = self.desired_window.unwrap_or(self.local_window);
        let window = target.max(promised);
        if window == target {
            self.desired_window = None;
        }

        let since = self.consumed.wrapping_sub(self.last_ackno) as u64;
        let grown = window > self.local_window;
        if !grown && since * 2 <= self.local_window as u64 {
            return None;
        }

        self.local_window = window;
        self.last_ackno = self.consumed;
        self.advertised_limit = self.consumed.wrapping_add(window);
        Some(SeqFrame {
            channel,
            ackno: self.consumed,
            window,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Rpy,
    Err,
    Ans,
    Nul,
}

struct PendingReply {
    kind: PendingKind,
    payload: Bytes,
}

#[derive(Default)]
struct StoredReply {
    queue: VecDeque<PendingReply>,
    /// Set once a RPY, ERR or NUL is queued; nothing may follow it.
    finished: bool,
}

pub(crate) enum ReplyEvent {
    Frame(Frame),
    Broken,
}

struct ReplyState {
    /// MSG numbers received but not fully replied, in arrival order. The
    /// head is the only message whose reply may go on the wire.
    incoming: VecDeque<u32>,
    /// MSG numbers sent but not fully replied to, in wire order.
    outstanding: VecDeque<u32>,
    /// Replies issued out of turn, waiting for the head to advance.
    stored: HashMap<u32, StoredReply>,
    /// Rendezvous queues for synchronous callers, by msgno.
    waiters: HashMap<u32, mpsc::Sender<ReplyEvent>>,
    /// Msgnos answered with ANS so far; RPY/ERR may not follow ANS.
    ans_started: HashSet<u32>,
    /// Reply requests handed to the sequencer but not yet fully written.
    pending_reply_writes: usize,
    outstanding_limit: usize,
    limit_mode: LimitMode,
    /// Channel-0 msgno of a deferred close request, if any.
    pending_close_msgno: Option<u32>,
}

struct DispatchState {
    serialize: bool,
    busy: bool,
    queue: VecDeque<Frame>,
}

#[derive(Default)]
struct Handlers {
    frame: Option<Arc<dyn FrameHandler>>,
    close_request: Option<CloseRequestHandler>,
    closed: Option<ClosedHandler>,
    frame_size: Option<FrameSizeHook>,
}

#[derive(Default)]
struct MimePolicy {
    handling: MimeHandling,
    content_type: Option<String>,
    transfer_encoding: Option<String>,
}

/// The outcome of ingesting one inbound frame.
pub(crate) struct Ingest {
    /// A frame ready for delivery; `None` while a reassembly run is
    /// still accumulating fragments.
    pub deliver: Option<Frame>,
    /// A window advertisement that became due.
    pub seq: Option<SeqFrame>,
}

/// One bidirectional message stream on a session.
///
/// Channels are created by [`Session::start_channel`] on the initiating
/// side or by the management profile when accepting a peer's start
/// request; they are always handled through `Arc`.
pub struct Channel {
    number: u16,
    profile_uri: String,
    profile: Option<Arc<dyn Profile>>,
    session: Weak<Session>,
    me: Weak<Channel>,
    writer: WriterHandle,
    reply_timeout: Option<Duration>,
    state: Mutex<ChannelState>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    replies: Mutex<ReplyState>,
    dispatch: Mutex<DispatchState>,
    handlers: Mutex<Handlers>,
    mime: Mutex<MimePolicy>,
    /// Signalled whenever reply bookkeeping shrinks toward drained.
    reply_activity: Notify,
    /// Signalled whenever an outstanding message retires.
    outstanding_activity: Notify,
    broken: AtomicBool,
    closed_notified: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("number", &self.number).finish()
    }
}

impl Channel {
    pub(crate) fn new(
        number: u16,
        profile_uri: String,
        profile: Option<Arc<dyn Profile>>,
        session: &Arc<Session>,
        state: ChannelState,
    ) -> Arc<Channel> {
        let management = number == 0;
        Arc::new_cyclic(|me| Channel {
            number,
            profile_uri,
            profile,
            session: Arc::downgrade(session),
            me: me.clone(),
            writer: session.writer_handle(),
            reply_timeout: session.options().reply_timeout,
            state: Mutex::new(state),
            send: Mutex::new(SendState {
                next_seqno: 0,
                // Channel 0's msgno 0 is spoken for by the greeting
                // exchange on both sides.
                next_msgno: if management { 1 } else { 0 },
                pinned_msgno: None,
                remote_ackno: 0,
                remote_window: DEFAULT_WINDOW,
                next_ansno: HashMap::new(),
            }),
            recv: Mutex::new(RecvState {
                next_seqno: 0,
                consumed: 0,
                local_window: DEFAULT_WINDOW,
                advertised_limit: DEFAULT_WINDOW,
                last_ackno: 0,
                desired_window: None,
                complete: true,
                complete_limit: 0,
                reassembly: Vec::new(),
                reassembly_len: 0,
                frag: None,
                ans_seen: HashMap::new(),
            }),
            replies: Mutex::new(ReplyState {
                incoming: if management {
                    VecDeque::from([0])
                } else {
                    VecDeque::new()
                },
                outstanding: if management {
                    VecDeque::from([0])
                } else {
                    VecDeque::new()
                },
                stored: HashMap::new(),
                waiters: HashMap::new(),
                ans_started: HashSet::new(),
                pending_reply_writes: 0,
                outstanding_limit: 0,
                limit_mode: LimitMode::default(),
                pending_close_msgno: None,
            }),
            dispatch: Mutex::new(DispatchState {
                serialize: false,
                busy: false,
                queue: VecDeque::new(),
            }),
            handlers: Mutex::new(Handlers::default()),
            mime: Mutex::new(MimePolicy::default()),
            reply_activity: Notify::new(),
            outstanding_activity: Notify::new(),
            broken: AtomicBool::new(false),
            closed_notified: AtomicBool::new(false),
        })
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn profile_uri(&self) -> &str {
        &self.profile_uri
    }

    /// The owning session, while it is still alive.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn profile(&self) -> Option<Arc<dyn Profile>> {
        self.profile.clone()
    }

    // ---- policy setters -------------------------------------------------

    /// Serialize handler invocations: each frame handler on this channel
    /// runs only after the previous one returned.
    pub fn set_serialize(&self, on: bool) {
        self.dispatch.lock().serialize = on;
    }

    /// Deliver whole reassembled messages (`true`, the default) or every
    /// raw frame as it arrives (`false`).
    pub fn set_complete(&self, on: bool) {
        self.recv.lock().complete = on;
    }

    /// Bounds the reassembly buffer; `0` means unlimited. Exceeding the
    /// bound tears the session down.
    pub fn set_complete_limit(&self, limit: usize) {
        self.recv.lock().complete_limit = limit;
    }

    /// Caps the number of sent-but-unanswered messages. `0` removes the
    /// cap. `mode` picks between failing fast and blocking.
    pub fn set_outstanding_limit(&self, limit: usize, mode: LimitMode) {
        let mut replies = self.replies.lock();
        replies.outstanding_limit = limit;
        replies.limit_mode = mode;
    }

    /// Number of sent messages still awaiting their reply.
    pub fn outstanding_count(&self) -> usize {
        self.replies.lock().outstanding.len()
    }

    pub fn set_frame_handler(&self, handler: Arc<dyn FrameHandler>) {
        self.handlers.lock().frame = Some(handler);
    }

    pub fn set_close_request_handler(
        &self,
        handler: impl Fn(&CloseEvent) -> CloseDecision + Send + Sync + 'static,
    ) {
        self.handlers.lock().close_request = Some(Arc::new(handler));
    }

    /// Installs a handler invoked exactly once when the channel reaches
    /// `Closed`, whether by a clean close or a broken session.
    pub fn set_closed_handler(&self, handler: impl Fn(u16) + Send + Sync + 'static) {
        self.handlers.lock().closed = Some(Arc::new(handler));
    }

    pub fn set_frame_size_hook(
        &self,
        hook: impl Fn(&FrameSizeContext) -> usize + Send + Sync + 'static,
    ) {
        self.handlers.lock().frame_size = Some(Arc::new(hook));
    }

    pub fn set_mime_handling(&self, handling: MimeHandling) {
        self.mime.lock().handling = handling;
    }

    pub fn set_content_type(&self, content_type: impl Into<String>) {
        self.mime.lock().content_type = Some(content_type.into());
    }

    pub fn set_transfer_encoding(&self, encoding: impl Into<String>) {
        self.mime.lock().transfer_encoding = Some(encoding.into());
    }

    /// Requests a new receive window. Growth is advertised immediately;
    /// a shrink takes effect as already-promised capacity is consumed.
    pub fn set_window(&self, desired: u32) -> BeepResult<()> {
        if desired == 0 || desired > MAX_PAYLOAD_SIZE {
            return Err(BeepError::InvalidState(format!(
                "window {desired} out of range"
            )));
        }
        let advert = {
            let mut recv = self.recv.lock();
            recv.desired_window = Some(desired);
            if desired > recv.local_window {
                recv.maybe_advert(self.number)
            } else {
                None
            }
        };
        if let Some(seq) = advert {
            let _ = self.writer.send(WriterCmd::Seq(seq));
        }
        Ok(())
    }

    // ---- outbound API ---------------------------------------------------

    /// Sends a message, returning its message number. Blocks only when an
    /// outstanding-MSG limit is configured in [`LimitMode::Block`]; flow
    /// control never blocks this call.
    pub async fn send_msg(&self, payload: impl Into<Bytes>) -> BeepResult<u32> {
        self.send_msg_inner(payload.into(), false, false)
            .await
            .map(|(msgno, _)| msgno)
    }

    /// Sends a chunk of a message and keeps the message number pinned so
    /// the next send appends to the same logical message. The run ends
    /// with the first send that is not `_more`.
    pub async fn send_msg_more(&self, payload: impl Into<Bytes>) -> BeepResult<u32> {
        self.send_msg_inner(payload.into(), true, false)
            .await
            .map(|(msgno, _)| msgno)
    }

    /// Sends a message and waits for its reply. For an ANS series this
    /// returns the first ANS frame; use [`Channel::send_msg_with_reply`]
    /// to consume the whole series.
    pub async fn send_msg_wait(&self, payload: impl Into<Bytes>) -> BeepResult<Frame> {
        let mut wait = self.send_msg_with_reply(payload).await?;
        wait.recv().await
    }

    /// Sends a message and returns the wait-reply rendezvous for it.
    pub async fn send_msg_with_reply(&self, payload: impl Into<Bytes>) -> BeepResult<WaitReply> {
        let (_, wait) = self.send_msg_inner(payload.into(), false, true).await?;
        wait.ok_or_else(|| BeepError::InvalidState("wait-reply unavailable".into()))
    }

    /// Streams a message from a feeder. The sequencer pulls chunks as the
    /// remote window allows; the frame carrying the feeder's last octets
    /// is written with `more=false`.
    pub async fn send_msg_from_feeder(
        &self,
        feeder: Box<dyn PayloadFeeder>,
    ) -> BeepResult<u32> {
        self.ensure_sendable()?;
        self.reserve_outstanding().await?;

        let prefix = self.mime_prefix();
        let mut replies = self.replies.lock();
        let msgno = {
            let mut send = self.send.lock();
            let msgno = send.next_msgno;
            send.next_msgno = (send.next_msgno + 1) & MAX_MSGNO;
            msgno
        };
        replies.outstanding.push_back(msgno);
        self.push_request(SendRequest {
            channel: self.me()?,
            kind: RequestKind::Msg { msgno },
            source: PayloadSource::feeder(feeder, prefix),
            hold_more: false,
        })?;
        Ok(msgno)
    }

    async fn send_msg_inner(
        &self,
        body: Bytes,
        hold_more: bool,
        register_wait: bool,
    ) -> BeepResult<(u32, Option<WaitReply>)> {
        self.ensure_sendable()?;
        if hold_more && body.is_empty() {
            return Err(BeepError::InvalidState(
                "empty chunk in a continued message".into(),
            ));
        }

        let continuation = self.send.lock().pinned_msgno.is_some();
        if !continuation {
            self.reserve_outstanding().await?;
        }

        let payload = if continuation {
            body
        } else {
            match self.mime_prefix() {
                Some(prefix) => {
                    let mut full = BytesMut::with_capacity(prefix.len() + body.len());
                    full.put_slice(&prefix);
                    full.put_slice(&body);
                    full.freeze()
                }
                None => body,
            }
        };

        // Allocation, outstanding bookkeeping, waiter registration and
        // sequencer hand-off happen under one lock so wire order always
        // matches `outstanding` order.
        let mut replies = self.replies.lock();
        let msgno = {
            let mut send = self.send.lock();
            match send.pinned_msgno {
                Some(pinned) => {
                    if !hold_more {
                        send.pinned_msgno = None;
                    }
                    pinned
                }
                None => {
                    let msgno = send.next_msgno;
                    send.next_msgno = (send.next_msgno + 1) & MAX_MSGNO;
                    if hold_more {
                        send.pinned_msgno = Some(msgno);
                    }
                    msgno
                }
            }
        };
        if !continuation {
            replies.outstanding.push_back(msgno);
        }
        let wait = if register_wait {
            let (tx, rx) = mpsc::channel(WAITER_QUEUE_DEPTH);
            replies.waiters.insert(msgno, tx);
            Some(WaitReply {
                msgno,
                rx,
                timeout: self.reply_timeout,
            })
        } else {
            None
        };
        self.push_request(SendRequest {
            channel: self.me()?,
            kind: RequestKind::Msg { msgno },
            source: PayloadSource::buffer(payload),
            hold_more,
        })?;
        drop(replies);

        Ok((msgno, wait))
    }

    /// Sends the positive reply for `msgno`. Replies issued before their
    /// turn are deferred and written automatically once every earlier
    /// message has been fully answered.
    pub fn send_rpy(&self, msgno: u32, payload: impl Into<Bytes>) -> BeepResult<()> {
        self.send_reply(msgno, PendingKind::Rpy, payload.into())
    }

    /// Sends the negative reply for `msgno`.
    pub fn send_err(&self, msgno: u32, payload: impl Into<Bytes>) -> BeepResult<()> {
        self.send_reply(msgno, PendingKind::Err, payload.into())
    }

    /// Sends one member of the ANS series answering `msgno`. Answer
    /// numbers are allocated in wire order.
    pub fn send_ans(&self, msgno: u32, payload: impl Into<Bytes>) -> BeepResult<()> {
        self.send_reply(msgno, PendingKind::Ans, payload.into())
    }

    /// Terminates the ANS series answering `msgno`. A NUL for a message
    /// already terminated is an error.
    pub fn send_nul(&self, msgno: u32) -> BeepResult<()> {
        self.send_reply(msgno, PendingKind::Nul, Bytes::new())
    }

    fn send_reply(&self, msgno: u32, kind: PendingKind, body: Bytes) -> BeepResult<()> {
        if self.is_broken() {
            return Err(BeepError::NotOperational);
        }
        match self.state() {
            ChannelState::Open | ChannelState::Closing => {}
            other => {
                return Err(BeepError::InvalidState(format!(
                    "cannot reply on channel {} in state {other:?}",
                    self.number
                )));
            }
        }

        let payload = match kind {
            PendingKind::Nul => body,
            _ => match self.mime_prefix() {
                Some(prefix) => {
                    let mut full = BytesMut::with_capacity(prefix.len() + body.len());
                    full.put_slice(&prefix);
                    full.put_slice(&body);
                    full.freeze()
                }
                None => body,
            },
        };

        let mut replies = self.replies.lock();
        if !replies.incoming.contains(&msgno) {
            return Err(BeepError::InvalidState(format!(
                "no reply pending for msgno {msgno} on channel {}",
                self.number
            )));
        }
        if matches!(kind, PendingKind::Rpy | PendingKind::Err)
            && replies.ans_started.contains(&msgno)
        {
            return Err(BeepError::InvalidState(format!(
                "msgno {msgno} already answered with ANS"
            )));
        }

        if replies.incoming.front() == Some(&msgno) {
            self.enqueue_reply(&mut replies, msgno, kind, payload)?;
            if kind_completes(kind) {
                replies.incoming.pop_front();
                replies.ans_started.remove(&msgno);
            } else {
                replies.ans_started.insert(msgno);
            }
            self.flush_stored(&mut replies)?;
        } else {
            let entry = replies.stored.entry(msgno).or_default();
            if entry.finished {
                return Err(BeepError::InvalidState(format!(
                    "reply for msgno {msgno} already complete"
                )));
            }
            if kind_completes(kind) {
                entry.finished = true;
            }
            entry.queue.push_back(PendingReply { kind, payload });
            if kind == PendingKind::Ans {
                replies.ans_started.insert(msgno);
            }
            debug!(
                channel = self.number,
                msgno, "reply deferred until earlier replies complete"
            );
        }
        Ok(())
    }

    /// Writes out any stored replies that the advancing head has made
    /// eligible.
    fn flush_stored(&self, replies: &mut ReplyState) -> BeepResult<()> {
        while let Some(&head) = replies.incoming.front() {
            let Some(mut entry) = replies.stored.remove(&head) else {
                break;
            };
            let mut head_consumed = false;
            while let Some(pending) = entry.queue.pop_front() {
                let completes = kind_completes(pending.kind);
                self.enqueue_reply(replies, head, pending.kind, pending.payload)?;
                if completes {
                    replies.incoming.pop_front();
                    replies.ans_started.remove(&head);
                    head_consumed = true;
                    break;
                }
            }
            if !head_consumed {
                // An ANS prefix without its NUL yet; further replies for
                // this head now take the direct path, so a drained entry
                // is dropped rather than kept around.
                if !entry.queue.is_empty() {
                    replies.stored.insert(head, entry);
                }
                break;
            }
        }
        Ok(())
    }

    fn enqueue_reply(
        &self,
        replies: &mut ReplyState,
        msgno: u32,
        kind: PendingKind,
        payload: Bytes,
    ) -> BeepResult<()> {
        let request_kind = match kind {
            PendingKind::Rpy => RequestKind::Rpy { msgno },
            PendingKind::Err => RequestKind::Err { msgno },
            PendingKind::Nul => RequestKind::Nul { msgno },
            PendingKind::Ans => {
                let mut send = self.send.lock();
                let ansno = {
                    let next = send.next_ansno.entry(msgno).or_insert(0);
                    let ansno = *next;
                    *next += 1;
                    ansno
                };
                RequestKind::Ans { msgno, ansno }
            }
        };
        if kind == PendingKind::Nul {
            self.send.lock().next_ansno.remove(&msgno);
        }
        replies.pending_reply_writes += 1;
        self.push_request(SendRequest {
            channel: self.me()?,
            kind: request_kind,
            source: PayloadSource::buffer(payload),
            hold_more: false,
        })
    }

    fn me(&self) -> BeepResult<Arc<Channel>> {
        self.me.upgrade().ok_or(BeepError::NotOperational)
    }

    /// Registers a wait-reply for `msgno` without sending anything. Used
    /// for exchanges whose MSG half is implicit, like the greeting.
    pub(crate) fn register_waiter(&self, msgno: u32) -> WaitReply {
        let (tx, rx) = mpsc::channel(WAITER_QUEUE_DEPTH);
        self.replies.lock().waiters.insert(msgno, tx);
        WaitReply {
            msgno,
            rx,
            timeout: self.reply_timeout,
        }
    }

    fn push_request(&self, request: SendRequest) -> BeepResult<()> {
        self.writer
            .send(WriterCmd::Request(request))
            .map_err(|_| BeepError::NotOperational)
    }

    fn ensure_sendable(&self) -> BeepResult<()> {
        if self.is_broken() {
            return Err(BeepError::NotOperational);
        }
        match self.state() {
            ChannelState::Open => Ok(()),
            other => Err(BeepError::InvalidState(format!(
                "cannot send on channel {} in state {other:?}",
                self.number
            ))),
        }
    }

    /// Enforces the outstanding-MSG limit, waiting in block mode.
    async fn reserve_outstanding(&self) -> BeepResult<()> {
        loop {
            let pending = self.outstanding_activity.notified();
            {
                let replies = self.replies.lock();
                if replies.outstanding_limit == 0
                    || replies.outstanding.len() < replies.outstanding_limit
                {
                    return Ok(());
                }
                if replies.limit_mode == LimitMode::FailFast {
                    return Err(BeepError::OutstandingLimit);
                }
            }
            if self.is_broken() {
                return Err(BeepError::NotOperational);
            }
            pending.await;
        }
    }

    fn must_session(&self) -> BeepResult<Arc<Session>> {
        self.session.upgrade().ok_or(BeepError::NotOperational)
    }

    /// Builds the MIME header block for an outbound message under the
    /// channel → profile → session precedence, or `None` when automatic
    /// handling is disabled.
    fn mime_prefix(&self) -> Option<Bytes> {
        let mime = self.mime.lock();
        let mut handling = mime.handling;
        if handling == MimeHandling::Inherit {
            if let Some(profile) = &self.profile {
                handling = profile.mime_handling();
            }
        }
        if handling == MimeHandling::Inherit {
            if let Some(session) = self.session.upgrade() {
                handling = session.options().automatic_mime_handling;
            }
        }
        if handling == MimeHandling::Disabled {
            return None;
        }

        let content_type = mime
            .content_type
            .clone()
            .or_else(|| self.profile.as_ref().and_then(|p| p.content_type().map(String::from)));
        let encoding = mime
            .transfer_encoding
            .clone()
            .or_else(|| self.profile.as_ref().and_then(|p| p.transfer_encoding().map(String::from)));

        let mut prefix = BytesMut::new();
        if let Some(ct) = content_type {
            prefix.put_slice(b"Content-Type: ");
            prefix.put_slice(ct.as_bytes());
            prefix.put_slice(b"\r\n");
        }
        if let Some(te) = encoding {
            prefix.put_slice(b"Content-Transfer-Encoding: ");
            prefix.put_slice(te.as_bytes());
            prefix.put_slice(b"\r\n");
        }
        prefix.put_slice(b"\r\n");
        Some(prefix.freeze())
    }

    // ---- close protocol -------------------------------------------------

    /// Closes the channel cooperatively: blocks new messages, waits for
    /// every outstanding reply, then runs the channel-0 close exchange.
    /// A peer refusal leaves the channel open and is returned as
    /// [`BeepError::Refused`].
    pub async fn close(self: &Arc<Self>) -> BeepResult<()> {
        self.close_with(ReplyCode::Success).await
    }

    /// [`Channel::close`] with an explicit reply code in the `<close>`.
    pub async fn close_with(self: &Arc<Self>, code: ReplyCode) -> BeepResult<()> {
        let session = self.must_session()?;
        if self.number == 0 {
            return Err(BeepError::InvalidState(
                "channel 0 is closed by Session::close".into(),
            ));
        }
        {
            let mut state = self.state.lock();
            match *state {
                ChannelState::Open => *state = ChannelState::Closing,
                other => {
                    return Err(BeepError::InvalidState(format!(
                        "cannot close channel {} in state {other:?}",
                        self.number
                    )));
                }
            }
        }

        self.await_outstanding_drained().await;
        if self.is_broken() {
            return Err(BeepError::NotOperational);
        }

        match session.request_close(self.number, code).await {
            Ok(()) => {
                session.remove_channel(self.number);
                Ok(())
            }
            Err(err) => {
                // An application-denied close leaves the channel open.
                if !self.is_broken() && !err.is_fatal() {
                    *self.state.lock() = ChannelState::Open;
                }
                Err(err)
            }
        }
    }

    /// Resolves a close request that a close-request handler deferred.
    pub fn notify_close(self: &Arc<Self>, accept: bool) -> BeepResult<()> {
        let msgno = self
            .replies
            .lock()
            .pending_close_msgno
            .take()
            .ok_or_else(|| BeepError::InvalidState("no deferred close pending".into()))?;
        let session = self.must_session()?;
        if accept {
            session.accept_close(self.clone(), msgno);
            Ok(())
        } else {
            session.refuse_close(msgno, ReplyCode::StillWorking, "still working")
        }
    }

    pub(crate) fn defer_close(&self, msgno: u32) {
        self.replies.lock().pending_close_msgno = Some(msgno);
    }

    pub(crate) fn close_request_handler(&self) -> Option<CloseRequestHandler> {
        self.handlers.lock().close_request.clone()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Marks the channel closed and fires the closed-notification
    /// handler exactly once.
    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ChannelState::Closed;
        self.fire_closed();
    }

    fn fire_closed(&self) {
        if self.closed_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handlers.lock().closed.clone();
        if let Some(handler) = handler {
            handler(self.number);
        }
    }

    /// Waits until every message this side sent has been fully replied
    /// to. Returns immediately on a broken session.
    pub(crate) async fn await_outstanding_drained(&self) {
        loop {
            let pending = self.outstanding_activity.notified();
            if self.replies.lock().outstanding.is_empty() || self.is_broken() {
                return;
            }
            pending.await;
        }
    }

    /// Waits until every reply this side owes has been fully written.
    pub(crate) async fn await_replies_drained(&self) {
        loop {
            let pending = self.reply_activity.notified();
            {
                let replies = self.replies.lock();
                if replies.incoming.is_empty()
                    && replies.stored.is_empty()
                    && replies.pending_reply_writes == 0
                {
                    return;
                }
            }
            if self.is_broken() {
                return;
            }
            pending.await;
        }
    }

    // ---- sequencer-side hooks -------------------------------------------

    /// Snapshot of (window budget, local window, next seqno) for frame
    /// sizing.
    pub(crate) fn sizing_inputs(&self) -> (usize, u32, u32) {
        let local_window = self.recv.lock().local_window;
        let send = self.send.lock();
        (send.budget(), local_window, send.next_seqno)
    }

    /// Chooses the next frame size via the channel hook, the session
    /// hook, or the default policy.
    pub(crate) fn next_frame_size(&self, ctx: &FrameSizeContext) -> usize {
        if let Some(hook) = self.handlers.lock().frame_size.clone() {
            return hook(ctx);
        }
        if let Some(session) = self.session.upgrade() {
            if let Some(hook) = session.frame_size_hook() {
                return hook(ctx);
            }
        }
        default_frame_size(ctx)
    }

    /// Claims `size` payload octets of the send stream, returning the
    /// frame's seqno.
    pub(crate) fn claim_seqno(&self, size: usize) -> u32 {
        let mut send = self.send.lock();
        let seqno = send.next_seqno;
        send.next_seqno = seqno.wrapping_add(size as u32);
        seqno
    }

    /// Called by the sequencer when the final frame of a reply request
    /// has been written, waking close logic and deferred-close drains.
    pub(crate) fn on_reply_sent(&self) {
        let mut replies = self.replies.lock();
        replies.pending_reply_writes = replies.pending_reply_writes.saturating_sub(1);
        drop(replies);
        self.reply_activity.notify_waiters();
    }

    /// Applies a peer SEQ advertisement. Window retraction is a protocol
    /// error.
    pub(crate) fn apply_seq(&self, seq: &SeqFrame) -> BeepResult<()> {
        let mut send = self.send.lock();
        let old_limit = send.remote_limit();
        let new_limit = seq.ackno.wrapping_add(seq.window);
        if !seq_ge(new_limit, old_limit) {
            return Err(BeepError::Protocol(format!(
                "SEQ on channel {} shrinks window: limit {old_limit} -> {new_limit}",
                self.number
            )));
        }
        if !seq_ge(send.next_seqno, seq.ackno) {
            return Err(BeepError::Protocol(format!(
                "SEQ on channel {} acknowledges unsent data",
                self.number
            )));
        }
        send.remote_ackno = seq.ackno;
        send.remote_window = seq.window;
        Ok(())
    }

    // ---- reader-side hooks ----------------------------------------------

    /// Validates and absorbs one inbound data frame: sequence accounting,
    /// fragment discipline, reassembly and window advertisement.
    pub(crate) fn ingest(&self, frame: Frame) -> BeepResult<Ingest> {
        let mut recv = self.recv.lock();

        if frame.seqno != recv.next_seqno {
            return Err(BeepError::Protocol(format!(
                "channel {}: seqno {} but expected {}",
                self.number, frame.seqno, recv.next_seqno
            )));
        }
        let size = frame.payload.len() as u32;
        let end = frame.seqno.wrapping_add(size);
        if !seq_ge(recv.advertised_limit, end) {
            return Err(BeepError::Protocol(format!(
                "channel {}: frame overruns advertised window",
                self.number
            )));
        }

        let key = FragKey {
            frame_type: frame.frame_type,
            msgno: frame.msgno,
            ansno: frame.ansno,
        };
        match recv.frag {
            Some(expected) if expected != key => {
                return Err(BeepError::Protocol(format!(
                    "channel {}: fragment of msgno {} interrupted by {} msgno {}",
                    self.number, expected.msgno, frame.frame_type, frame.msgno
                )));
            }
            Some(_) => {}
            None => {
                if frame.frame_type == FrameType::Msg {
                    let mut replies = self.replies.lock();
                    if replies.incoming.contains(&frame.msgno) {
                        return Err(BeepError::Protocol(format!(
                            "channel {}: msgno {} is already awaiting a reply",
                            self.number, frame.msgno
                        )));
                    }
                    replies.incoming.push_back(frame.msgno);
                }
                if frame.frame_type == FrameType::Ans {
                    if let Some(ansno) = frame.ansno {
                        match recv.ans_seen.get(&frame.msgno) {
                            Some(&last) if ansno <= last => warn!(
                                channel = self.number,
                                msgno = frame.msgno,
                                ansno,
                                "answer number not monotonically increasing"
                            ),
                            _ => {}
                        }
                        recv.ans_seen.insert(frame.msgno, ansno);
                    }
                }
                if frame.frame_type == FrameType::Nul {
                    recv.ans_seen.remove(&frame.msgno);
                }
            }
        }
        recv.frag = if frame.more { Some(key) } else { None };

        recv.next_seqno = end;
        recv.consumed = end;

        let deliver = if recv.complete {
            self.reassemble(&mut recv, frame)?
        } else {
            Some(frame)
        };
        let seq = recv.maybe_advert(self.number);
        Ok(Ingest { deliver, seq })
    }

    fn reassemble(&self, recv: &mut RecvState, frame: Frame) -> BeepResult<Option<Frame>> {
        if frame.more {
            recv.reassembly_len += frame.payload.len();
            if recv.complete_limit > 0 && recv.reassembly_len > recv.complete_limit {
                return Err(BeepError::Protocol(format!(
                    "channel {}: reassembly buffer exceeds limit of {} octets",
                    self.number, recv.complete_limit
                )));
            }
            recv.reassembly.push(frame);
            return Ok(None);
        }
        if recv.reassembly.is_empty() {
            return Ok(Some(frame));
        }

        let total = recv.reassembly_len + frame.payload.len();
        if recv.complete_limit > 0 && total > recv.complete_limit {
            return Err(BeepError::Protocol(format!(
                "channel {}: reassembly buffer exceeds limit of {} octets",
                self.number, recv.complete_limit
            )));
        }
        let mut payload = BytesMut::with_capacity(total);
        for fragment in &recv.reassembly {
            payload.put_slice(&fragment.payload);
        }
        payload.put_slice(&frame.payload);

        let first = &recv.reassembly[0];
        let virtual_frame = Frame {
            frame_type: first.frame_type,
            channel: first.channel,
            msgno: first.msgno,
            more: false,
            seqno: first.seqno,
            ansno: first.ansno,
            payload: payload.freeze(),
        };
        recv.reassembly.clear();
        recv.reassembly_len = 0;
        Ok(Some(virtual_frame))
    }

    /// Routes a deliverable reply frame: validates it against the
    /// outstanding head, retires the exchange when final, and hands the
    /// frame to a registered waiter. Returns the frame back when no
    /// waiter claimed it.
    pub(crate) async fn route_reply(&self, frame: Frame) -> BeepResult<Option<Frame>> {
        let (waiter, finishes) = {
            let mut replies = self.replies.lock();
            match replies.outstanding.front() {
                Some(&head) if head == frame.msgno => {}
                _ => {
                    return Err(BeepError::Protocol(format!(
                        "channel {}: {} for msgno {} out of reply order",
                        self.number, frame.frame_type, frame.msgno
                    )));
                }
            }
            let finishes = frame.frame_type.completes_exchange() && !frame.more;
            if finishes {
                replies.outstanding.pop_front();
            }
            let waiter = if finishes {
                replies.waiters.remove(&frame.msgno)
            } else {
                replies.waiters.get(&frame.msgno).cloned()
            };
            (waiter, finishes)
        };

        if finishes {
            self.outstanding_activity.notify_waiters();
        }
        match waiter {
            Some(tx) => {
                if tx.send(ReplyEvent::Frame(frame)).await.is_err() {
                    debug!(channel = self.number, "waiter dropped before reply");
                }
                Ok(None)
            }
            None => Ok(Some(frame)),
        }
    }

    /// Delivers a locally synthesized reply to the waiter for `msgno`
    /// without touching sequence state. Used by the close-in-transit
    /// rule; the peer's on-wire reply still retires the exchange.
    pub(crate) fn inject_reply(&self, msgno: u32, frame: Frame) {
        let waiter = self.replies.lock().waiters.remove(&msgno);
        if let Some(tx) = waiter {
            let _ = tx.try_send(ReplyEvent::Frame(frame));
        }
    }

    /// Dispatches a deliverable frame to the channel's handler path,
    /// honoring serialize mode.
    pub(crate) fn dispatch(self: &Arc<Self>, frame: Frame) {
        let run_now = {
            let mut gate = self.dispatch.lock();
            if !gate.serialize {
                true
            } else if gate.busy {
                gate.queue.push_back(frame.clone());
                false
            } else {
                gate.busy = true;
                true
            }
        };
        if run_now {
            let channel = self.clone();
            tokio::spawn(async move {
                let mut next = Some(frame);
                while let Some(frame) = next.take() {
                    channel.run_handler(frame).await;
                    let mut gate = channel.dispatch.lock();
                    if gate.serialize {
                        match gate.queue.pop_front() {
                            Some(queued) => next = Some(queued),
                            None => gate.busy = false,
                        }
                    }
                }
            });
        }
    }

    async fn run_handler(self: &Arc<Self>, frame: Frame) {
        let handler = self.handlers.lock().frame.clone();
        match handler {
            Some(handler) => handler.on_frame(self.clone(), frame).await,
            None => match &self.profile {
                Some(profile) => profile.on_frame(self.clone(), frame).await,
                None => warn!(
                    channel = self.number,
                    msgno = frame.msgno,
                    "no handler for frame, dropping"
                ),
            },
        }
    }

    /// Broken-pipe fan-out for this channel: release every waiter with
    /// the sentinel, drop deferred replies, and fire the closed handler.
    pub(crate) fn notify_broken(&self) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut replies = self.replies.lock();
            for (_, waiter) in replies.waiters.drain() {
                let _ = waiter.try_send(ReplyEvent::Broken);
            }
            replies.stored.clear();
            replies.incoming.clear();
            replies.outstanding.clear();
            replies.pending_reply_writes = 0;
        }
        *self.state.lock() = ChannelState::Closed;
        self.reply_activity.notify_waiters();
        self.outstanding_activity.notify_waiters();
        self.fire_closed();
    }
}

fn kind_completes(kind: PendingKind) -> bool {
    matches!(kind, PendingKind::Rpy | PendingKind::Err | PendingKind::Nul)
}

/// Rendezvous for a synchronous caller awaiting the reply to one message.
///
/// For an ANS series, `recv` yields each ANS frame and finally the NUL
/// terminator; for plain exchanges it yields the single RPY or ERR.
pub struct WaitReply {
    msgno: u32,
    rx: mpsc::Receiver<ReplyEvent>,
    timeout: Option<Duration>,
}

impl WaitReply {
    pub fn msgno(&self) -> u32 {
        self.msgno
    }

    /// Waits for the next reply frame, the session reply timeout, or the
    /// broken-pipe sentinel.
    pub async fn recv(&mut self) -> BeepResult<Frame> {
        let event = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.rx.recv())
                .await
                .map_err(|_| BeepError::Timeout)?,
            None => self.rx.recv().await,
        };
        match event {
            Some(ReplyEvent::Frame(frame)) => Ok(frame),
            Some(ReplyEvent::Broken) | None => Err(BeepError::NotOperational),
        }
    }
}
