// ABOUTME: Profile trait and registry for BEEP capability dispatch
// ABOUTME: Defines the handler seams a profile implements plus per-channel handler plumbing

//! Profiles and handlers.
//!
//! A profile is a named capability (URI) that gives meaning to the
//! messages exchanged over a channel. The engine only knows the seams: a
//! start decision, a close decision, a frame handler and the MIME
//! defaults used by automatic-MIME handling. Everything else belongs to
//! the application.
//!
//! Handlers return boxed futures so they stay object-safe while still
//! being able to call back into the async channel API. They run on the
//! runtime's worker pool, never on the session's reader task.

use crate::channel::Channel;
use crate::frame::Frame;
use crate::mgmt::ReplyCode;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

/// Boxed future type used by the handler seams.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Tri-state automatic-MIME policy. Resolution order is channel, then
/// profile, then session options; `Inherit` at every level means enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MimeHandling {
    Enabled,
    Disabled,
    #[default]
    Inherit,
}

/// A peer's request to start a channel under this profile.
#[derive(Debug, Clone)]
pub struct StartEvent {
    pub channel: u16,
    pub uri: String,
    pub server_name: Option<String>,
    /// Profile content piggybacked inside the `<profile>` element.
    pub piggyback: Option<String>,
}

/// The profile's verdict on a start request.
#[derive(Debug, Clone)]
pub enum StartDecision {
    /// Accept the channel, optionally piggybacking content in the reply.
    Accept { piggyback: Option<String> },
    /// Refuse the channel with a reply code and diagnostic.
    Refuse { code: ReplyCode, diagnostic: String },
}

impl StartDecision {
    pub fn accept() -> StartDecision {
        StartDecision::Accept { piggyback: None }
    }

    pub fn refuse(code: ReplyCode, diagnostic: impl Into<String>) -> StartDecision {
        StartDecision::Refuse {
            code,
            diagnostic: diagnostic.into(),
        }
    }
}

/// A peer's request to close a channel.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    pub channel: u16,
    pub code: ReplyCode,
    /// Channel-0 message number carrying the request; needed to resolve a
    /// deferred decision later via [`Channel::notify_close`].
    pub msgno: u32,
}

/// The verdict on a close request.
#[derive(Debug, Clone)]
pub enum CloseDecision {
    /// Accept; the engine drains owed replies and then answers `<ok/>`.
    Accept,
    /// Refuse with a code and diagnostic; the channel stays open.
    Refuse { code: ReplyCode, diagnostic: String },
    /// Decide later. The engine parks the request until
    /// [`Channel::notify_close`] is called.
    Defer,
}

/// The capability set a profile provides to the engine.
///
/// Every method has a default: starts and closes are accepted, frames are
/// dropped with a warning, and MIME policy is inherited. A minimal
/// profile therefore only overrides `on_frame`.
pub trait Profile: Send + Sync + 'static {
    /// Called when a peer asks to start a channel under this profile.
    fn on_start(&self, _event: &StartEvent) -> StartDecision {
        StartDecision::accept()
    }

    /// Called when a peer asks to close a channel running this profile.
    fn on_close(&self, _event: &CloseEvent) -> CloseDecision {
        CloseDecision::Accept
    }

    /// Called for every frame delivered to a channel running this profile
    /// that no wait-reply and no per-channel handler claimed.
    fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
        warn!(
            channel = channel.number(),
            msgno = frame.msgno,
            frame_type = %frame.frame_type,
            "no handler for frame, dropping"
        );
        Box::pin(std::future::ready(()))
    }

    /// Default `Content-Type` for messages sent on this profile's
    /// channels when automatic-MIME handling is enabled.
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// Default `Content-Transfer-Encoding` counterpart.
    fn transfer_encoding(&self) -> Option<&str> {
        None
    }

    /// The profile-level automatic-MIME policy.
    fn mime_handling(&self) -> MimeHandling {
        MimeHandling::Inherit
    }
}

/// Per-channel frame handler installed with
/// [`Channel::set_frame_handler`]; takes precedence over the profile's
/// `on_frame`.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()>;
}

struct FnFrameHandler<F>(F);

impl<F, Fut> FrameHandler for FnFrameHandler<F>
where
    F: Fn(Arc<Channel>, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
        Box::pin((self.0)(channel, frame))
    }
}

/// Wraps an async closure as a [`FrameHandler`].
pub fn frame_handler<F, Fut>(f: F) -> Arc<dyn FrameHandler>
where
    F: Fn(Arc<Channel>, Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnFrameHandler(f))
}

/// URI-keyed profile table. Registration happens while building the
/// [`crate::Context`]; sessions only ever see the finished table, so
/// lookups are lock-free.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<dyn Profile>>,
}

impl ProfileRegistry {
    pub fn new() -> ProfileRegistry {
        ProfileRegistry::default()
    }

    /// Registers `profile` under `uri`, replacing any earlier entry.
    pub fn register(&mut self, uri: impl Into<String>, profile: Arc<dyn Profile>) {
        self.profiles.insert(uri.into(), profile);
    }

    pub fn lookup(&self, uri: &str) -> Option<Arc<dyn Profile>> {
        self.profiles.get(uri).cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.profiles.contains_key(uri)
    }

    /// Registered URIs in deterministic order, for the greeting.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.profiles.keys().cloned().collect();
        uris.sort();
        uris
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
