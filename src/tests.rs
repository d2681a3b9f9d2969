//! Integration tests for the session layer: greeting, channel start and
//! close, reply ordering, flow control and broken-pipe fan-out, all over
//! in-memory duplex transports.

use crate::channel::{ChannelState, LimitMode};
use crate::connection::{FrameReader, FrameWriter};
use crate::error::BeepError;
use crate::frame::{Frame, FrameType, WireFrame};
use crate::mgmt::{Greeting, Reply, ReplyCode, Request, StartAccept};
use crate::profile::{BoxFuture, MimeHandling, Profile};
use crate::session::{Context, ContextOptions, Session, SessionRole};
use crate::channel::Channel;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

/// Connects two real sessions over an in-memory pipe.
async fn session_pair(
    initiator_ctx: Arc<Context>,
    listener_ctx: Arc<Context>,
) -> (Arc<Session>, Arc<Session>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (initiator, listener) = tokio::join!(
        Session::connect(a, SessionRole::Initiator, initiator_ctx),
        Session::connect(b, SessionRole::Listener, listener_ctx),
    );
    (initiator.expect("initiator"), listener.expect("listener"))
}

/// Polls `condition` until it holds or the test deadline passes.
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        tokio::task::yield_now().await;
    }
    panic!("condition never held: {what}");
}

/// A scripted wire-level peer used where the tests must observe exact
/// frames rather than engine behaviour on both ends.
struct WirePeer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    seqno_out: HashMap<u16, u32>,
}

impl WirePeer {
    fn new(stream: DuplexStream) -> WirePeer {
        let (read_half, write_half) = tokio::io::split(stream);
        WirePeer {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            seqno_out: HashMap::new(),
        }
    }

    /// Sends our greeting and consumes the session's.
    async fn handshake(&mut self) {
        self.send_data(FrameType::Rpy, 0, 0, false, None, Reply::Greeting(Greeting::default()).to_payload())
            .await;
        let greeting = self.next_data().await;
        assert_eq!(greeting.frame_type, FrameType::Rpy);
        assert_eq!(greeting.channel, 0);
        assert_eq!(greeting.msgno, 0);
        assert!(matches!(
            Reply::parse(&greeting.payload),
            Ok(Reply::Greeting(_))
        ));
    }

    /// Next data frame, skipping SEQ advertisements.
    async fn next_data(&mut self) -> Frame {
        loop {
            match self
                .reader
                .read_frame()
                .await
                .expect("peer read")
                .expect("peer stream open")
            {
                WireFrame::Data(frame) => return frame,
                WireFrame::Seq(_) => continue,
            }
        }
    }

    async fn send_data(
        &mut self,
        frame_type: FrameType,
        channel: u16,
        msgno: u32,
        more: bool,
        ansno: Option<u32>,
        payload: Bytes,
    ) {
        let seqno = *self.seqno_out.entry(channel).or_insert(0);
        self.seqno_out
            .insert(channel, seqno.wrapping_add(payload.len() as u32));
        let frame = Frame {
            frame_type,
            channel,
            msgno,
            more,
            seqno,
            ansno,
            payload,
        };
        self.writer.write_data(&frame, usize::MAX).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send_seq(&mut self, channel: u16, ackno: u32, window: u32) {
        self.writer
            .write_seq(&crate::frame::SeqFrame {
                channel,
                ackno,
                window,
            })
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Accepts the session's next `<start>` on channel 0.
    async fn accept_start(&mut self, expected_number: u16) {
        let start = self.next_data().await;
        assert_eq!(start.frame_type, FrameType::Msg);
        assert_eq!(start.channel, 0);
        let uri = match Request::parse(&start.payload).expect("start request") {
            Request::Start(s) => {
                assert_eq!(s.number, expected_number);
                s.profiles[0].uri.clone()
            }
            other => panic!("expected start, got {other:?}"),
        };
        self.send_data(
            FrameType::Rpy,
            0,
            start.msgno,
            false,
            None,
            Reply::Accept(StartAccept {
                uri,
                piggyback: None,
            })
            .to_payload(),
        )
        .await;
    }
}

// ---- test profiles -----------------------------------------------------

/// Echoes every MSG payload back as RPY. Disables automatic MIME so the
/// tests see exact payloads.
struct EchoProfile;

impl Profile for EchoProfile {
    fn mime_handling(&self) -> MimeHandling {
        MimeHandling::Disabled
    }

    fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
        Box::pin(async move {
            if frame.frame_type == FrameType::Msg {
                channel
                    .send_rpy(frame.msgno, frame.payload)
                    .expect("echo reply");
            }
        })
    }
}

/// Swallows every message without replying.
struct SinkProfile;

impl Profile for SinkProfile {
    fn mime_handling(&self) -> MimeHandling {
        MimeHandling::Disabled
    }

    fn on_frame(&self, _channel: Arc<Channel>, _frame: Frame) -> BoxFuture<()> {
        Box::pin(std::future::ready(()))
    }
}

fn echo_context() -> Arc<Context> {
    let mut ctx = Context::new();
    ctx.register_profile("urn:test:echo", Arc::new(EchoProfile));
    Arc::new(ctx)
}

#[cfg(test)]
mod establishment {
    use super::*;

    #[tokio::test]
    async fn greeting_exchange_records_peer_profiles() {
        let (initiator, listener) = session_pair(Arc::new(Context::new()), echo_context()).await;

        let peer = initiator.peer_greeting().expect("peer greeting");
        assert_eq!(peer.profiles.len(), 1);
        assert_eq!(peer.profiles[0].uri, "urn:test:echo");

        let peer = listener.peer_greeting().expect("peer greeting");
        assert!(peer.profiles.is_empty());

        assert!(initiator.is_operational());
        assert!(listener.is_operational());
    }

    #[tokio::test]
    async fn open_echo_close() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;

        let channel = initiator.start_channel("urn:test:echo").await.expect("start");
        assert_eq!(channel.number(), 1);
        assert_eq!(channel.state(), ChannelState::Open);
        eventually("listener sees channel 1", || listener.channel(1).is_some()).await;

        let reply = channel.send_msg_wait("hello").await.expect("echo");
        assert_eq!(reply.frame_type, FrameType::Rpy);
        assert_eq!(reply.payload.as_ref(), b"hello");

        channel.close().await.expect("close");
        assert!(initiator.channel(1).is_none());
        assert_eq!(channel.state(), ChannelState::Closed);
        eventually("listener removed channel 1", || {
            listener.channel(1).is_none()
        })
        .await;

        assert!(initiator.is_operational());
        assert!(listener.is_operational());

        initiator.close().await.expect("session close");
        assert!(!initiator.is_operational());
        eventually("listener torn down", || !listener.is_operational()).await;
    }

    #[tokio::test]
    async fn start_refused_when_profile_unknown() {
        let (initiator, listener) = session_pair(echo_context(), Arc::new(Context::new())).await;

        let err = initiator
            .start_channel("urn:test:echo")
            .await
            .expect_err("must be refused");
        match err {
            BeepError::Refused { code, diagnostic } => {
                assert_eq!(code, ReplyCode::TransactionFailed);
                assert_eq!(diagnostic, "profile not supported");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // The session survives a refused start and the channel was never
        // created on either side.
        assert!(initiator.is_operational());
        assert!(initiator.channel(1).is_none());
        assert!(listener.channel(1).is_none());
    }

    #[tokio::test]
    async fn enforce_profiles_supported_rejects_locally() {
        let options = ContextOptions::default().with_enforce_profiles_supported(true);
        let (initiator, _listener) = session_pair(
            Arc::new(Context::with_options(options)),
            Arc::new(Context::new()),
        )
        .await;

        let err = initiator
            .start_channel("urn:test:echo")
            .await
            .expect_err("peer never advertised the profile");
        assert!(matches!(err, BeepError::Refused { .. }));
        // Rejected before any round trip: no channel number was burned.
        assert!(initiator.channel(1).is_none());
    }

    #[tokio::test]
    async fn server_name_binds_once_and_coerces() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;

        let (first, _) = initiator
            .start_channel_with("urn:test:echo", Some("a.example"), None)
            .await
            .expect("first start");
        assert_eq!(listener.server_name().as_deref(), Some("a.example"));

        let (second, _) = initiator
            .start_channel_with("urn:test:echo", Some("b.example"), None)
            .await
            .expect("second start");
        // The later conflicting request is coerced to the bound value.
        assert_eq!(listener.server_name().as_deref(), Some("a.example"));

        assert_ne!(first.number(), second.number());
    }
}

#[cfg(test)]
mod replies {
    use super::*;

    /// Replies out of order on purpose: when the second message arrives
    /// it answers that one first, then the first.
    struct GateProfile;

    impl Profile for GateProfile {
        fn mime_handling(&self) -> MimeHandling {
            MimeHandling::Disabled
        }

        fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
            Box::pin(async move {
                if frame.frame_type == FrameType::Msg && frame.msgno == 1 {
                    channel.send_rpy(1, "one").expect("deferred reply");
                    channel.send_rpy(0, "zero").expect("head reply");
                }
            })
        }
    }

    #[tokio::test]
    async fn out_of_order_replies_are_written_in_msg_order() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:gate", Arc::new(GateProfile));

        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (listener, _) = tokio::join!(
            Session::connect(stream, SessionRole::Listener, Arc::new(ctx)),
            peer.handshake(),
        );
        let listener = listener.expect("listener");

        let start = Request::Start(crate::mgmt::Start {
            number: 1,
            server_name: None,
            profiles: vec![crate::mgmt::StartProfile {
                uri: "urn:test:gate".into(),
                encoding: Default::default(),
                piggyback: None,
            }],
        });
        peer.send_data(FrameType::Msg, 0, 1, false, None, start.to_payload())
            .await;
        let accept = peer.next_data().await;
        assert_eq!(accept.frame_type, FrameType::Rpy);
        assert!(matches!(
            Reply::parse(&accept.payload),
            Ok(Reply::Accept(_))
        ));

        peer.send_data(FrameType::Msg, 1, 0, false, None, Bytes::from_static(b"m0"))
            .await;
        peer.send_data(FrameType::Msg, 1, 1, false, None, Bytes::from_static(b"m1"))
            .await;

        // Even though the handler produced RPY(1) first, the wire shows
        // RPY(0) then RPY(1).
        let first = peer.next_data().await;
        assert_eq!(first.frame_type, FrameType::Rpy);
        assert_eq!(first.channel, 1);
        assert_eq!(first.msgno, 0);
        assert_eq!(first.payload.as_ref(), b"zero");

        let second = peer.next_data().await;
        assert_eq!(second.msgno, 1);
        assert_eq!(second.payload.as_ref(), b"one");

        assert!(listener.is_operational());
    }

    /// Answers each MSG with a three-member ANS series and a NUL.
    struct ManyProfile;

    impl Profile for ManyProfile {
        fn mime_handling(&self) -> MimeHandling {
            MimeHandling::Disabled
        }

        fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
            Box::pin(async move {
                if frame.frame_type == FrameType::Msg {
                    for i in 0..3u8 {
                        channel
                            .send_ans(frame.msgno, vec![b'a' + i])
                            .expect("ans");
                    }
                    channel.send_nul(frame.msgno).expect("nul");
                }
            })
        }
    }

    #[tokio::test]
    async fn ans_series_terminated_by_nul() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:many", Arc::new(ManyProfile));
        let (initiator, _listener) = session_pair(echo_context(), Arc::new(ctx)).await;

        let channel = initiator.start_channel("urn:test:many").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);

        let mut wait = channel
            .send_msg_with_reply("question")
            .await
            .expect("send");

        for expected in 0..3u32 {
            let answer = wait.recv().await.expect("ans frame");
            assert_eq!(answer.frame_type, FrameType::Ans);
            assert_eq!(answer.ansno, Some(expected));
            assert_eq!(answer.payload.as_ref(), &[b'a' + expected as u8]);
        }
        let terminator = wait.recv().await.expect("nul frame");
        assert_eq!(terminator.frame_type, FrameType::Nul);
        assert!(terminator.payload.is_empty());

        // The NUL retires the exchange.
        eventually("outstanding drained", || channel.outstanding_count() == 0).await;
    }

    #[tokio::test]
    async fn zero_payload_message_roundtrips() {
        let (initiator, _listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        let reply = channel.send_msg_wait("").await.expect("empty echo");
        assert_eq!(reply.frame_type, FrameType::Rpy);
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn reply_to_unknown_msgno_is_rejected() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let _channel = initiator.start_channel("urn:test:echo").await.expect("start");

        eventually("listener sees channel", || listener.channel(1).is_some()).await;
        let listener_channel = listener.channel(1).expect("channel");
        let err = listener_channel
            .send_rpy(7, "nothing pending")
            .expect_err("no such exchange");
        assert!(matches!(err, BeepError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_limit_fail_fast() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:sink", Arc::new(SinkProfile));
        let (initiator, _listener) = session_pair(echo_context(), Arc::new(ctx)).await;

        let channel = initiator.start_channel("urn:test:sink").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);
        channel.set_outstanding_limit(1, LimitMode::FailFast);

        channel.send_msg("first").await.expect("first fits");
        let err = channel.send_msg("second").await.expect_err("limit hit");
        assert!(matches!(err, BeepError::OutstandingLimit));
    }

    /// Echoes with a fixed delay, for exercising block-mode limits.
    struct SlowEchoProfile;

    impl Profile for SlowEchoProfile {
        fn mime_handling(&self) -> MimeHandling {
            MimeHandling::Disabled
        }

        fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
            Box::pin(async move {
                if frame.frame_type == FrameType::Msg {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    channel.send_rpy(frame.msgno, frame.payload).expect("reply");
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_limit_blocks_until_reply() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:slow", Arc::new(SlowEchoProfile));
        let (initiator, _listener) = session_pair(echo_context(), Arc::new(ctx)).await;

        let channel = initiator.start_channel("urn:test:slow").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);
        channel.set_outstanding_limit(1, LimitMode::Block);

        let started = tokio::time::Instant::now();
        channel.send_msg("first").await.expect("first");
        // The second send unblocks precisely when the first reply lands.
        channel.send_msg("second").await.expect("second");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}

#[cfg(test)]
mod flow_control {
    use super::*;

    #[tokio::test]
    async fn fragmentation_follows_the_remote_window() {
        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (initiator, _) = tokio::join!(
            Session::connect(stream, SessionRole::Initiator, Arc::new(Context::new())),
            peer.handshake(),
        );
        let initiator = initiator.expect("initiator");

        let (start_result, _) = tokio::join!(initiator.start_channel("urn:test:data"), async {
            peer.accept_start(1).await;
        });
        let channel = start_result.expect("channel");
        channel.set_mime_handling(MimeHandling::Disabled);

        channel
            .send_msg(Bytes::from(vec![0x42u8; 10_000]))
            .await
            .expect("queued");

        // The initial 4096 window admits exactly one full frame.
        let first = peer.next_data().await;
        assert_eq!(first.frame_type, FrameType::Msg);
        assert_eq!(first.channel, 1);
        assert_eq!(first.seqno, 0);
        assert_eq!(first.payload.len(), 4096);
        assert!(first.more);

        peer.send_seq(1, 4096, 4096).await;
        let second = peer.next_data().await;
        assert_eq!(second.seqno, 4096);
        assert_eq!(second.payload.len(), 4096);
        assert!(second.more);

        peer.send_seq(1, 8192, 4096).await;
        let third = peer.next_data().await;
        assert_eq!(third.seqno, 8192);
        assert_eq!(third.payload.len(), 1808);
        assert!(!third.more);
    }

    #[tokio::test]
    async fn window_shrink_tears_the_session_down() {
        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (initiator, _) = tokio::join!(
            Session::connect(stream, SessionRole::Initiator, Arc::new(Context::new())),
            peer.handshake(),
        );
        let initiator = initiator.expect("initiator");

        // A growing advertisement is fine.
        peer.send_seq(0, 10, 5000).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(initiator.is_operational());

        // This one implies upper bound 2020 < 5010: retraction.
        peer.send_seq(0, 20, 2000).await;
        eventually("session torn down on shrink", || {
            !initiator.is_operational()
        })
        .await;
    }

    #[tokio::test]
    async fn large_transfer_through_feeder_and_reassembly() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        // 40000 octets crosses the 4096 window many times over; SEQ
        // advertisements from the real peer keep it moving.
        let body: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let reply = channel
            .send_msg_wait(Bytes::from(body.clone()))
            .await
            .expect("echoed");
        assert_eq!(reply.payload.len(), body.len());
        assert_eq!(reply.payload.as_ref(), &body[..]);

        assert!(listener.is_operational());
    }

    #[tokio::test]
    async fn feeder_streams_a_message() {
        let (initiator, _listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);

        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 17) as u8).collect();
        let mut wait = channel.send_msg_with_reply("").await.expect("probe");
        // Drain the probe first so the feeder's reply is unambiguous.
        wait.recv().await.expect("probe echo");

        let feeder = Box::new(crate::feeder::BytesFeeder::new(Bytes::from(body.clone())));
        channel.send_msg_from_feeder(feeder).await.expect("queued");

        eventually("feeder transfer completes", || {
            channel.outstanding_count() == 0
        })
        .await;
    }

    #[tokio::test]
    async fn complete_limit_overflow_tears_down() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);
        // Force tiny fragments so the peer has to reassemble.
        channel.set_frame_size_hook(|_| 4);

        let listener_channel = listener.channel(1).expect("listener channel");
        listener_channel.set_complete_limit(8);

        channel
            .send_msg(Bytes::from(vec![7u8; 64]))
            .await
            .expect("queued");

        eventually("listener torn down by reassembly limit", || {
            !listener.is_operational()
        })
        .await;
    }
}

#[cfg(test)]
mod closing {
    use super::*;

    #[tokio::test]
    async fn close_in_transit_resolves_on_both_sides() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        eventually("listener sees channel", || listener.channel(1).is_some()).await;
        let listener_channel = listener.channel(1).expect("listener channel");

        let (a, b) = tokio::join!(channel.close(), listener_channel.close());
        a.expect("initiator close");
        b.expect("listener close");

        assert!(initiator.channel(1).is_none());
        assert!(listener.channel(1).is_none());
        assert!(initiator.is_operational());
        assert!(listener.is_operational());
    }

    #[tokio::test]
    async fn refused_close_keeps_the_channel_open() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        eventually("listener sees channel", || listener.channel(1).is_some()).await;
        listener
            .channel(1)
            .expect("listener channel")
            .set_close_request_handler(|_| crate::profile::CloseDecision::Refuse {
                code: ReplyCode::StillWorking,
                diagnostic: "still working".into(),
            });

        let err = channel.close().await.expect_err("refused");
        match err {
            BeepError::Refused { code, diagnostic } => {
                assert_eq!(code, ReplyCode::StillWorking);
                assert_eq!(diagnostic, "still working");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Both sides still have the channel and it still works.
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(listener.channel(1).is_some());
        let reply = channel.send_msg_wait("ping").await.expect("echo");
        assert_eq!(reply.payload.as_ref(), b"ping");
    }

    #[tokio::test]
    async fn deferred_close_completes_via_notify() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        eventually("listener sees channel", || listener.channel(1).is_some()).await;
        let listener_channel = listener.channel(1).expect("listener channel");
        listener_channel.set_close_request_handler(|_| crate::profile::CloseDecision::Defer);

        let close_task = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.close().await })
        };

        // The close request is parked on the listener until the
        // application decides.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!close_task.is_finished());

        listener_channel.notify_close(true).expect("resolve close");
        close_task
            .await
            .expect("join")
            .expect("close succeeds after notify");
        eventually("listener removed channel", || listener.channel(1).is_none()).await;
    }

    #[tokio::test]
    async fn closed_handler_fires_exactly_once() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            channel.set_closed_handler(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        channel.close().await.expect("close");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Session teardown afterwards must not fire it again.
        initiator.close().await.expect("session close");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(listener);
    }
}

#[cfg(test)]
mod dispatch {
    use super::*;

    /// Tracks concurrent handler invocations.
    struct ConcurrencyProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
        seen: AtomicUsize,
    }

    struct ProbeProfile(Arc<ConcurrencyProbe>);

    impl Profile for ProbeProfile {
        fn mime_handling(&self) -> MimeHandling {
            MimeHandling::Disabled
        }

        fn on_frame(&self, _channel: Arc<Channel>, _frame: Frame) -> BoxFuture<()> {
            let probe = self.0.clone();
            Box::pin(async move {
                let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
                probe.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                probe.current.fetch_sub(1, Ordering::SeqCst);
                probe.seen.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serialize_runs_handlers_one_at_a_time() {
        let probe = Arc::new(ConcurrencyProbe {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        });
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:probe", Arc::new(ProbeProfile(probe.clone())));
        let (initiator, listener) = session_pair(echo_context(), Arc::new(ctx)).await;

        let channel = initiator.start_channel("urn:test:probe").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);

        eventually("listener sees channel", || listener.channel(1).is_some()).await;
        listener.channel(1).expect("channel").set_serialize(true);

        for i in 0..5u8 {
            channel.send_msg(vec![i]).await.expect("send");
        }

        eventually("all handlers ran", || {
            probe.seen.load(Ordering::SeqCst) == 5
        })
        .await;
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_channel_handler_takes_precedence() {
        let (initiator, listener) = session_pair(echo_context(), echo_context()).await;
        let channel = initiator.start_channel("urn:test:echo").await.expect("start");

        eventually("listener sees channel", || listener.channel(1).is_some()).await;
        let listener_channel = listener.channel(1).expect("channel");
        listener_channel.set_frame_handler(crate::profile::frame_handler(
            |channel: Arc<Channel>, frame: Frame| async move {
                if frame.frame_type == FrameType::Msg {
                    channel.send_rpy(frame.msgno, "override").expect("reply");
                }
            },
        ));

        let reply = channel.send_msg_wait("anything").await.expect("reply");
        assert_eq!(reply.payload.as_ref(), b"override");
    }

    #[tokio::test]
    async fn automatic_mime_prefixes_configured_headers() {
        struct TextProfile;
        impl Profile for TextProfile {
            fn content_type(&self) -> Option<&str> {
                Some("text/plain")
            }
            fn on_frame(&self, channel: Arc<Channel>, frame: Frame) -> BoxFuture<()> {
                Box::pin(async move {
                    if frame.frame_type == FrameType::Msg {
                        let payload = frame.payload.clone();
                        assert!(
                            payload.starts_with(b"Content-Type: text/plain\r\n\r\n"),
                            "inbound message carries the configured header"
                        );
                        channel.send_rpy(frame.msgno, "ack").expect("reply");
                    }
                })
            }
        }

        let mut initiator_ctx = Context::new();
        initiator_ctx.register_profile("urn:test:text", Arc::new(TextProfile));
        let mut listener_ctx = Context::new();
        listener_ctx.register_profile("urn:test:text", Arc::new(TextProfile));

        let (initiator, _listener) =
            session_pair(Arc::new(initiator_ctx), Arc::new(listener_ctx)).await;
        let channel = initiator.start_channel("urn:test:text").await.expect("start");

        let reply = channel.send_msg_wait("body").await.expect("reply");
        // The reply side applies the same automatic-MIME policy.
        assert!(reply.payload.starts_with(b"Content-Type: text/plain\r\n\r\n"));
    }

    #[tokio::test]
    async fn bare_mime_separator_added_when_nothing_configured() {
        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (initiator, _) = tokio::join!(
            Session::connect(stream, SessionRole::Initiator, Arc::new(Context::new())),
            peer.handshake(),
        );
        let initiator = initiator.expect("initiator");

        let (start_result, _) = tokio::join!(initiator.start_channel("urn:test:raw"), async {
            peer.accept_start(1).await;
        });
        let channel = start_result.expect("channel");

        channel.send_msg("hi").await.expect("queued");
        let frame = peer.next_data().await;
        assert_eq!(frame.payload.as_ref(), b"\r\nhi");
    }
}

#[cfg(test)]
mod failures {
    use super::*;

    #[tokio::test]
    async fn broken_pipe_releases_waiters_and_fires_handlers() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:sink", Arc::new(SinkProfile));
        let (initiator, listener) = session_pair(echo_context(), Arc::new(ctx)).await;

        let channel = initiator.start_channel("urn:test:sink").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);

        let channel_closed = Arc::new(AtomicBool::new(false));
        {
            let flag = channel_closed.clone();
            channel.set_closed_handler(move |_| {
                flag.store(true, Ordering::SeqCst);
            });
        }
        let session_broken = Arc::new(AtomicBool::new(false));
        {
            let flag = session_broken.clone();
            initiator.add_broken_handler(move || {
                flag.store(true, Ordering::SeqCst);
            });
        }

        let mut wait = channel.send_msg_with_reply("void").await.expect("sent");

        // Killing the peer session drops its transport halves; our
        // reader sees EOF and fans the failure out.
        drop(listener);
        let err = wait.recv().await.expect_err("broken pipe sentinel");
        assert!(matches!(err, BeepError::NotOperational));

        assert!(!initiator.is_operational());
        assert!(session_broken.load(Ordering::SeqCst));
        assert!(channel_closed.load(Ordering::SeqCst));
        assert_eq!(channel.state(), ChannelState::Closed);

        // Every later operation reports the same condition.
        let err = channel.send_msg("more").await.expect_err("session gone");
        assert!(matches!(err, BeepError::NotOperational));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_reply_times_out() {
        let mut sink_ctx = Context::new();
        sink_ctx.register_profile("urn:test:sink", Arc::new(SinkProfile));
        let options = ContextOptions::default()
            .with_reply_timeout(Some(Duration::from_millis(200)));
        let (initiator, _listener) = session_pair(
            Arc::new(Context::with_options(options)),
            Arc::new(sink_ctx),
        )
        .await;

        let channel = initiator.start_channel("urn:test:sink").await.expect("start");
        channel.set_mime_handling(MimeHandling::Disabled);

        let err = channel
            .send_msg_wait("never answered")
            .await
            .expect_err("must time out");
        assert!(matches!(err, BeepError::Timeout));
    }

    #[tokio::test]
    async fn duplicate_pending_msgno_is_a_protocol_error() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:sink", Arc::new(SinkProfile));

        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (listener, _) = tokio::join!(
            Session::connect(stream, SessionRole::Listener, Arc::new(ctx)),
            peer.handshake(),
        );
        let listener = listener.expect("listener");

        let start = Request::Start(crate::mgmt::Start {
            number: 1,
            server_name: None,
            profiles: vec![crate::mgmt::StartProfile {
                uri: "urn:test:sink".into(),
                encoding: Default::default(),
                piggyback: None,
            }],
        });
        peer.send_data(FrameType::Msg, 0, 1, false, None, start.to_payload())
            .await;
        peer.next_data().await; // accept

        // The sink never replies, so msgno 0 stays pending; reusing it
        // is a protocol error that kills the session.
        peer.send_data(FrameType::Msg, 1, 0, false, None, Bytes::from_static(b"a"))
            .await;
        peer.send_data(FrameType::Msg, 1, 0, false, None, Bytes::from_static(b"b"))
            .await;

        eventually("session torn down", || !listener.is_operational()).await;
    }

    #[tokio::test]
    async fn bad_seqno_is_a_protocol_error() {
        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (initiator, _) = tokio::join!(
            Session::connect(stream, SessionRole::Initiator, Arc::new(Context::new())),
            peer.handshake(),
        );
        let initiator = initiator.expect("initiator");

        // Skip ahead in the sequence space on channel 0.
        peer.seqno_out.insert(0, 999);
        peer.send_data(FrameType::Msg, 0, 1, false, None, Bytes::from_static(b"x"))
            .await;

        eventually("session torn down", || !initiator.is_operational()).await;
    }

    #[tokio::test]
    async fn malformed_management_documents_strike_out() {
        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (initiator, _) = tokio::join!(
            Session::connect(stream, SessionRole::Initiator, Arc::new(Context::new())),
            peer.handshake(),
        );
        let initiator = initiator.expect("initiator");

        for msgno in 1..=2u32 {
            peer.send_data(
                FrameType::Msg,
                0,
                msgno,
                false,
                None,
                Bytes::from_static(b"\r\nnot xml at all"),
            )
            .await;
            let reply = peer.next_data().await;
            assert_eq!(reply.frame_type, FrameType::Err);
            match Reply::parse(&reply.payload).expect("error reply") {
                Reply::Error(e) => assert_eq!(e.code, ReplyCode::SyntaxErrorInParams),
                other => panic!("expected error, got {other:?}"),
            }
            assert!(initiator.is_operational());
        }

        // The third strike tears the session down.
        peer.send_data(
            FrameType::Msg,
            0,
            3,
            false,
            None,
            Bytes::from_static(b"\r\nstill not xml"),
        )
        .await;
        eventually("session torn down", || !initiator.is_operational()).await;
    }

    #[tokio::test]
    async fn start_with_wrong_parity_is_rejected() {
        let mut ctx = Context::new();
        ctx.register_profile("urn:test:sink", Arc::new(SinkProfile));

        let (stream, side) = tokio::io::duplex(64 * 1024);
        let mut peer = WirePeer::new(side);
        let (listener, _) = tokio::join!(
            Session::connect(stream, SessionRole::Listener, Arc::new(ctx)),
            peer.handshake(),
        );
        let listener = listener.expect("listener");

        // We are the initiator side of the wire; starting an even
        // channel is the listener's prerogative, not ours.
        let start = Request::Start(crate::mgmt::Start {
            number: 2,
            server_name: None,
            profiles: vec![crate::mgmt::StartProfile {
                uri: "urn:test:sink".into(),
                encoding: Default::default(),
                piggyback: None,
            }],
        });
        peer.send_data(FrameType::Msg, 0, 1, false, None, start.to_payload())
            .await;
        let reply = peer.next_data().await;
        assert_eq!(reply.frame_type, FrameType::Err);
        match Reply::parse(&reply.payload).expect("reply") {
            Reply::Error(e) => assert_eq!(e.code, ReplyCode::SyntaxErrorInParams),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(listener.channel(2).is_none());
        assert!(listener.is_operational());
    }
}
