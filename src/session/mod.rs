// ABOUTME: Session management: channel table, number allocation, greeting and teardown
// ABOUTME: Also defines the explicit Context value carrying the profile registry and options

//! Sessions.
//!
//! A [`Session`] is one BEEP conversation over one transport. It owns the
//! channel table, the channel-number allocator, and the two tasks that
//! move frames: the reader ([`reader`]) and the sequencer ([`writer`]).
//! Everything a session needs from its environment arrives through an
//! explicit [`Context`] value; there is no hidden global state.
//!
//! ```text
//! outbound: application -> Channel -> sequencer -> codec -> transport
//! inbound:  transport -> reader -> codec -> Channel -> handler/waiter
//! ```

pub(crate) mod channel0;
pub(crate) mod reader;
pub(crate) mod writer;

use crate::channel::{Channel, ChannelState, FrameSizeHook};
use crate::error::{BeepError, BeepResult};
use crate::frame::{Frame, FrameType};
use crate::mgmt::{Close, Greeting, GreetingProfile, Reply, ReplyCode, Request, Start, StartProfile};
use crate::mgmt;
use crate::profile::{MimeHandling, Profile, ProfileRegistry};
use channel0::{MANAGEMENT_URI, ManagementProfile};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use writer::{WriterCmd, WriterHandle};

/// Which end of the transport this session is.
///
/// The role decides channel-number parity: initiators start odd-numbered
/// channels, listeners even-numbered ones, so the two sides can never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Listener,
}

impl SessionRole {
    fn first_channel(&self) -> u16 {
        match self {
            SessionRole::Initiator => 1,
            SessionRole::Listener => 2,
        }
    }

    /// Parity (`number % 2`) the peer's start requests must carry.
    pub(crate) fn peer_parity(&self) -> u16 {
        match self {
            SessionRole::Initiator => 0,
            SessionRole::Listener => 1,
        }
    }
}

/// Recognized engine options, with their defaults.
///
/// The socket limits and the listener backlog are advisory values for
/// the code that accepts connections; the engine itself only stores
/// them.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Advisory soft cap on file descriptors.
    pub soft_sock_limit: u32,
    /// Advisory hard cap on file descriptors.
    pub hard_sock_limit: u32,
    /// Accept-queue depth for listener bootstrap code.
    pub listener_backlog: u32,
    /// Reject local channel starts for profiles the peer's greeting did
    /// not advertise, saving the round trip.
    pub enforce_profiles_supported: bool,
    /// Session-level automatic-MIME default; `Inherit` means enabled.
    pub automatic_mime_handling: MimeHandling,
    /// Skip joining the session's tasks on close.
    pub skip_thread_pool_wait: bool,
    /// Timeout applied to every synchronous wait; `None` waits forever.
    pub reply_timeout: Option<Duration>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions {
            soft_sock_limit: 4096,
            hard_sock_limit: 4096,
            listener_backlog: 5,
            enforce_profiles_supported: false,
            automatic_mime_handling: MimeHandling::Enabled,
            skip_thread_pool_wait: false,
            reply_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ContextOptions {
    pub fn with_sock_limits(mut self, soft: u32, hard: u32) -> Self {
        self.soft_sock_limit = soft;
        self.hard_sock_limit = hard;
        self
    }

    pub fn with_listener_backlog(mut self, backlog: u32) -> Self {
        self.listener_backlog = backlog;
        self
    }

    pub fn with_enforce_profiles_supported(mut self, enforce: bool) -> Self {
        self.enforce_profiles_supported = enforce;
        self
    }

    pub fn with_automatic_mime_handling(mut self, handling: MimeHandling) -> Self {
        self.automatic_mime_handling = handling;
        self
    }

    pub fn with_skip_thread_pool_wait(mut self, skip: bool) -> Self {
        self.skip_thread_pool_wait = skip;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

/// Process-level state shared by sessions: the profile registry and the
/// recognized options.
///
/// A context is built once, wrapped in an `Arc`, and handed to every
/// [`Session::connect`]. It is immutable from then on, so sessions read
/// it without locks.
#[derive(Default)]
pub struct Context {
    registry: ProfileRegistry,
    options: ContextOptions,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    pub fn with_options(options: ContextOptions) -> Context {
        Context {
            registry: ProfileRegistry::new(),
            options,
        }
    }

    /// Registers a profile for the URIs advertised in our greeting and
    /// accepted from peer start requests.
    pub fn register_profile(&mut self, uri: impl Into<String>, profile: Arc<dyn Profile>) {
        self.registry.register(uri, profile);
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub(crate) fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }
}

/// One BEEP session over one transport.
pub struct Session {
    ctx: Arc<Context>,
    role: SessionRole,
    channels: Mutex<HashMap<u16, Arc<Channel>>>,
    next_channel: Mutex<u16>,
    writer: WriterHandle,
    peer_greeting: Mutex<Option<Greeting>>,
    server_name: Mutex<Option<String>>,
    /// Channels with a locally initiated close in flight, keyed to the
    /// channel-0 msgno awaiting `<ok/>`.
    closing: Mutex<HashMap<u16, u32>>,
    frame_size: Mutex<Option<FrameSizeHook>>,
    broken_handlers: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
    broken: AtomicBool,
    broken_notify: tokio::sync::Notify,
    mgmt_strikes: AtomicU32,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Establishes a session over `stream`: spawns the reader and
    /// sequencer tasks, sends our greeting and waits for the peer's.
    pub async fn connect<S>(
        stream: S,
        role: SessionRole,
        ctx: Arc<Context>,
    ) -> BeepResult<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Session {
            next_channel: Mutex::new(role.first_channel()),
            ctx,
            role,
            channels: Mutex::new(HashMap::new()),
            writer: writer_tx,
            peer_greeting: Mutex::new(None),
            server_name: Mutex::new(None),
            closing: Mutex::new(HashMap::new()),
            frame_size: Mutex::new(None),
            broken_handlers: Mutex::new(Vec::new()),
            broken: AtomicBool::new(false),
            broken_notify: tokio::sync::Notify::new(),
            mgmt_strikes: AtomicU32::new(0),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        });

        let writer_task = tokio::spawn(writer::run_writer(
            crate::connection::FrameWriter::new(write_half),
            writer_rx,
            Arc::downgrade(&session),
        ));
        *session.writer_task.lock() = Some(writer_task);

        let channel0 = session.install_channel(
            0,
            MANAGEMENT_URI.to_owned(),
            Some(Arc::new(ManagementProfile)),
            ChannelState::Open,
        )?;

        // Both sides open with RPY 0: our greeting goes out and the
        // peer's arrives through an ordinary wait-reply.
        let mut greeting_wait = channel0.register_waiter(0);
        let greeting = Reply::Greeting(session.local_greeting());
        channel0.send_rpy(0, greeting.to_payload())?;

        let reader_task = tokio::spawn(reader::run_reader(
            crate::connection::FrameReader::new(read_half),
            Arc::downgrade(&session),
        ));
        *session.reader_task.lock() = Some(reader_task);

        let frame = match greeting_wait.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                session.teardown("greeting exchange failed");
                return Err(err);
            }
        };
        match Reply::parse(&frame.payload) {
            Ok(Reply::Greeting(peer)) => {
                debug!(profiles = peer.profiles.len(), "peer greeting received");
                *session.peer_greeting.lock() = Some(peer);
            }
            Ok(Reply::Error(refusal)) => {
                session.teardown("peer refused the session");
                return Err(BeepError::Refused {
                    code: refusal.code,
                    diagnostic: refusal.text,
                });
            }
            Ok(_) => {
                session.teardown("unexpected greeting document");
                return Err(BeepError::Protocol("unexpected greeting document".into()));
            }
            Err(err) => {
                session.teardown("unparseable greeting");
                return Err(err.into());
            }
        }

        Ok(session)
    }

    fn local_greeting(&self) -> Greeting {
        Greeting {
            profiles: self
                .ctx
                .registry()
                .uris()
                .into_iter()
                .map(|uri| GreetingProfile {
                    uri,
                    encoding: Default::default(),
                })
                .collect(),
            features: None,
            localize: None,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn options(&self) -> &ContextOptions {
        self.ctx.options()
    }

    /// The profile set the peer's greeting advertised, once the session
    /// is established.
    pub fn peer_greeting(&self) -> Option<Greeting> {
        self.peer_greeting.lock().clone()
    }

    /// The serverName this session is bound to, if any start carried
    /// one.
    pub fn server_name(&self) -> Option<String> {
        self.server_name.lock().clone()
    }

    pub fn channel(&self, number: u16) -> Option<Arc<Channel>> {
        self.channels.lock().get(&number).cloned()
    }

    /// Numbers of the channels currently present, including channel 0.
    pub fn channel_numbers(&self) -> Vec<u16> {
        let mut numbers: Vec<u16> = self.channels.lock().keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn is_operational(&self) -> bool {
        !self.broken.load(Ordering::Acquire)
    }

    /// Resolves once the session has been closed or torn down.
    pub async fn wait_closed(&self) {
        loop {
            let pending = self.broken_notify.notified();
            if !self.is_operational() {
                return;
            }
            pending.await;
        }
    }

    /// Installs a session-wide frame-size hook consulted when a channel
    /// has none of its own.
    pub fn set_frame_size_hook(
        &self,
        hook: impl Fn(&crate::channel::FrameSizeContext) -> usize + Send + Sync + 'static,
    ) {
        *self.frame_size.lock() = Some(Arc::new(hook));
    }

    /// Registers a callback run once if the session breaks.
    pub fn add_broken_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.broken_handlers.lock().push(Arc::new(handler));
    }

    /// Starts a channel for `uri`, returning it once the peer accepted.
    pub async fn start_channel(self: &Arc<Self>, uri: &str) -> BeepResult<Arc<Channel>> {
        self.start_channel_with(uri, None, None)
            .await
            .map(|(channel, _)| channel)
    }

    /// Starts a channel with optional serverName and piggybacked profile
    /// content; returns the channel and any piggyback the peer's accept
    /// carried back.
    pub async fn start_channel_with(
        self: &Arc<Self>,
        uri: &str,
        server_name: Option<&str>,
        piggyback: Option<&str>,
    ) -> BeepResult<(Arc<Channel>, Option<String>)> {
        if !self.is_operational() {
            return Err(BeepError::NotOperational);
        }
        if self.options().enforce_profiles_supported {
            let advertised = self
                .peer_greeting
                .lock()
                .as_ref()
                .map(|greeting| greeting.profiles.iter().any(|p| p.uri == uri))
                .unwrap_or(false);
            if !advertised {
                return Err(BeepError::Refused {
                    code: ReplyCode::TransactionFailed,
                    diagnostic: format!("peer did not advertise profile {uri}"),
                });
            }
        }

        let number = self.allocate_channel_number()?;
        // Install before the request goes out: the peer may use the new
        // channel the moment its accept is on the wire, possibly before
        // our waiter task has run.
        let channel = self.install_channel(
            number,
            uri.to_owned(),
            self.ctx.registry().lookup(uri),
            ChannelState::Opening,
        )?;

        let request = Request::Start(Start {
            number,
            server_name: server_name.map(str::to_owned),
            profiles: vec![StartProfile {
                uri: uri.to_owned(),
                encoding: Default::default(),
                piggyback: piggyback.map(str::to_owned),
            }],
        });
        let channel0 = self.channel(0).ok_or(BeepError::NotOperational)?;

        let outcome: BeepResult<Option<String>> = async {
            let frame = channel0.send_msg_wait(request.to_payload()).await?;
            match Reply::parse(&frame.payload)? {
                Reply::Accept(accept) => {
                    if accept.uri != uri {
                        warn!(
                            requested = uri,
                            accepted = %accept.uri,
                            "peer accepted a different profile"
                        );
                    }
                    Ok(accept.piggyback)
                }
                Reply::Error(refusal) => Err(BeepError::Refused {
                    code: refusal.code,
                    diagnostic: refusal.text,
                }),
                _ => Err(BeepError::Protocol("unexpected start reply".into())),
            }
        }
        .await;

        match outcome {
            Ok(piggyback_reply) => {
                channel.set_state(ChannelState::Open);
                Ok((channel, piggyback_reply))
            }
            Err(err) => {
                self.remove_channel(number);
                Err(err)
            }
        }
    }

    /// Closes the session: closes every open channel, runs the channel-0
    /// close exchange, then drops the transport.
    pub async fn close(self: &Arc<Self>) -> BeepResult<()> {
        if !self.is_operational() {
            return Err(BeepError::NotOperational);
        }

        let channels: Vec<Arc<Channel>> = {
            self.channels
                .lock()
                .values()
                .filter(|c| c.number() != 0)
                .cloned()
                .collect()
        };
        for channel in channels {
            if channel.state() == ChannelState::Open {
                if let Err(err) = channel.close().await {
                    warn!(channel = channel.number(), %err, "channel close failed during session close");
                }
            }
        }

        let outcome = self.request_close(0, ReplyCode::Success).await;
        match outcome {
            Ok(()) => {}
            // The peer may drop the transport right after its <ok/>; a
            // broken rendezvous at this point still means closed.
            Err(BeepError::NotOperational) => {}
            Err(err) => return Err(err),
        }
        self.teardown("session closed");

        if !self.options().skip_thread_pool_wait {
            let reader = self.reader_task.lock().take();
            if let Some(handle) = reader {
                let _ = handle.await;
            }
            let writer = self.writer_task.lock().take();
            if let Some(handle) = writer {
                let _ = handle.await;
            }
        }
        Ok(())
    }

    // ---- crate-internal plumbing ---------------------------------------

    pub(crate) fn writer_handle(&self) -> WriterHandle {
        self.writer.clone()
    }

    pub(crate) fn registry(&self) -> &ProfileRegistry {
        self.ctx.registry()
    }

    pub(crate) fn frame_size_hook(&self) -> Option<FrameSizeHook> {
        self.frame_size.lock().clone()
    }

    /// Counts a malformed management document, returning the running
    /// total.
    pub(crate) fn mgmt_strike(&self) -> u32 {
        self.mgmt_strikes.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Applies the serverName binding policy: the first requested name
    /// binds the session; later conflicting requests are coerced to the
    /// bound value with a warning.
    pub(crate) fn bind_server_name(&self, requested: Option<String>) -> Option<String> {
        let mut bound = self.server_name.lock();
        match (bound.as_ref(), requested) {
            (None, Some(name)) => {
                *bound = Some(name.clone());
                Some(name)
            }
            (Some(existing), Some(name)) => {
                if *existing != name {
                    warn!(
                        bound = %existing,
                        requested = %name,
                        "serverName conflicts with bound value, coercing"
                    );
                }
                Some(existing.clone())
            }
            (Some(existing), None) => Some(existing.clone()),
            (None, None) => None,
        }
    }

    pub(crate) fn install_channel(
        self: &Arc<Self>,
        number: u16,
        uri: String,
        profile: Option<Arc<dyn Profile>>,
        state: ChannelState,
    ) -> BeepResult<Arc<Channel>> {
        let channel = Channel::new(number, uri, profile, self, state);
        let mut channels = self.channels.lock();
        if channels.contains_key(&number) {
            return Err(BeepError::InvalidState(format!(
                "channel {number} already exists"
            )));
        }
        channels.insert(number, channel.clone());
        Ok(channel)
    }

    /// Removes a channel from the table, firing its closed notification.
    /// Safe to call twice; the second call is a no-op.
    pub(crate) fn remove_channel(&self, number: u16) {
        let removed = self.channels.lock().remove(&number);
        if let Some(channel) = removed {
            channel.mark_closed();
        }
    }

    fn allocate_channel_number(&self) -> BeepResult<u16> {
        let mut next = self.next_channel.lock();
        let channels = self.channels.lock();
        loop {
            let candidate = *next;
            if candidate as u32 + 2 > u16::MAX as u32 {
                return Err(BeepError::InvalidState("channel numbers exhausted".into()));
            }
            *next += 2;
            if !channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Runs the outbound half of the close exchange for `number` on
    /// channel 0.
    pub(crate) async fn request_close(&self, number: u16, code: ReplyCode) -> BeepResult<()> {
        let channel0 = self.channel(0).ok_or(BeepError::NotOperational)?;
        let payload = Request::Close(Close { number, code }).to_payload();
        let mut wait = channel0.send_msg_with_reply(payload).await?;
        self.closing.lock().insert(number, wait.msgno());

        let outcome = async {
            let frame = wait.recv().await?;
            match Reply::parse(&frame.payload)? {
                Reply::Ok => Ok(()),
                Reply::Error(refusal) => Err(BeepError::Refused {
                    code: refusal.code,
                    diagnostic: refusal.text,
                }),
                _ => Err(BeepError::Protocol("unexpected close reply".into())),
            }
        }
        .await;

        self.closing.lock().remove(&number);
        outcome
    }

    /// True when this side's own close for `number` is awaiting its
    /// reply.
    pub(crate) fn close_pending(&self, number: u16) -> bool {
        self.closing.lock().contains_key(&number)
    }

    /// Settles a crossing close locally by handing the wait-reply for
    /// our own close an `<ok/>`.
    pub(crate) fn synthesize_close_ok(&self, number: u16) {
        let msgno = match self.closing.lock().get(&number) {
            Some(&msgno) => msgno,
            None => return,
        };
        let Some(channel0) = self.channel(0) else {
            return;
        };
        let frame = Frame {
            frame_type: FrameType::Rpy,
            channel: 0,
            msgno,
            more: false,
            seqno: 0,
            ansno: None,
            payload: Reply::Ok.to_payload(),
        };
        channel0.inject_reply(msgno, frame);
    }

    /// Accepts a peer's close request for `channel`: drains the replies
    /// this side still owes, answers `<ok/>`, and removes the channel.
    pub(crate) fn accept_close(self: &Arc<Self>, channel: Arc<Channel>, msgno: u32) {
        let session = self.clone();
        tokio::spawn(async move {
            channel.set_state(ChannelState::Closing);
            channel.await_replies_drained().await;
            if !session.is_operational() {
                return;
            }
            if let Some(channel0) = session.channel(0) {
                if let Err(err) = channel0.send_rpy(msgno, Reply::Ok.to_payload()) {
                    warn!(%err, channel = channel.number(), "failed to confirm close");
                    return;
                }
            }
            session.remove_channel(channel.number());
        });
    }

    /// Refuses a peer's close request with an error reply.
    pub(crate) fn refuse_close(
        &self,
        msgno: u32,
        code: ReplyCode,
        diagnostic: &str,
    ) -> BeepResult<()> {
        let channel0 = self.channel(0).ok_or(BeepError::NotOperational)?;
        let reply = Reply::Error(mgmt::ErrorReply {
            code,
            text: diagnostic.to_owned(),
        });
        channel0.send_err(msgno, reply.to_payload())
    }

    /// Broken-pipe fan-out: flags the session, notifies every channel
    /// exactly once, releases every waiter with the sentinel and stops
    /// both tasks. Idempotent.
    pub(crate) fn teardown(&self, reason: &str) {
        if self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "tearing down session");

        let _ = self.writer.send(WriterCmd::Shutdown);

        let channels: Vec<Arc<Channel>> = {
            let mut table = self.channels.lock();
            table.drain().map(|(_, channel)| channel).collect()
        };
        for channel in &channels {
            channel.notify_broken();
        }

        let handlers: Vec<Arc<dyn Fn() + Send + Sync>> =
            self.broken_handlers.lock().iter().cloned().collect();
        for handler in handlers {
            handler();
        }
        self.broken_notify.notify_waiters();

        // A reader blocked in the transport read has nothing left to
        // wake it; cancel it outright.
        if let Some(handle) = &*self.reader_task.lock() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Tasks hold only weak references; make sure neither lingers
        // blocked on a dead session.
        if let Some(handle) = self.reader_task.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.get_mut().take() {
            handle.abort();
        }
    }
}
