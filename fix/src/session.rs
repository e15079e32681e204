//! Client session state machine and reconnect supervisor.
//!
//! One session owns its transport, writer, frame parser, dispatcher and
//! timers, and runs entirely on the thread that drives it. The driver (or a
//! test) feeds it four transport events plus `poll` for due timers; the
//! session does everything else: logon handshake, heartbeat and
//! test-request liveness, gap-fill replies, disconnect recovery and timed
//! reconnects.

use meridian_common::buf;
use meridian_common::log::Logger;
use meridian_common::time::Clock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, FixConfig};
use crate::dispatcher::{Dispatch, DispatchState, Dispatcher};
use crate::message::{FixMessage, FixMessageParser};
use crate::sched::{TaskSlot, TimerQueue};
use crate::tags::{self, msg_type};
use crate::transport::Transport;
use crate::writer::FixWriter;

const READ_CHUNK: usize = 4096;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Failure text for the liveness breach; pinned by tests.
pub const NO_MESSAGE_RECEIVED: &str = "FIX no message received from server, disconnecting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    LoggedIn,
    Disconnecting,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connect requires an idle session")]
    NotIdle,
}

/// Everything the admin handlers need mutable access to. Split from
/// [`Session`] so dispatcher listeners can borrow it while the message view
/// borrows the read buffer.
pub struct SessionCore<T: Transport, C: Clock> {
    config: FixConfig,
    state: SessionState,
    transport: T,
    clock: C,
    writer: FixWriter,
    timers: TimerQueue,
    outbound_seq: u64,
    last_outbound_ns: u64,
    heartbeat_interval_ns: u64,
    address: String,
    wire_log: Option<Logger>,
    pending_failure: Option<String>,
}

impl<T: Transport, C: Clock> SessionCore<T, C> {
    /// Builds and sends one frame; header fields come from session state.
    pub fn send_message(&mut self, msg_type: &[u8], fields: impl FnOnce(&mut FixWriter)) -> bool {
        self.writer
            .start(msg_type, self.outbound_seq, self.clock.wall_nanos());
        fields(&mut self.writer);

        let Self {
            writer,
            transport,
            wire_log,
            clock,
            ..
        } = self;
        let written = writer.send(|frame| {
            if let Some(log) = wire_log {
                log.info(clock.wall_nanos()).str("out ").bytes(frame).commit();
            }
            transport.write(frame)
        });

        match written {
            Ok(_) => {
                self.outbound_seq += 1;
                self.last_outbound_ns = self.clock.mono_nanos();
                true
            }
            Err(e) => {
                self.pending_failure = Some(format!("write failed: {e}"));
                false
            }
        }
    }

    pub fn outbound_seq(&self) -> u64 {
        self.outbound_seq
    }

    pub fn config(&self) -> &FixConfig {
        &self.config
    }

    fn send_logon(&mut self) -> bool {
        let heartbeat_secs = self.config.heartbeat_interval_seconds;
        let reset = self.config.reset_seq_num;
        let username = self.config.username.clone();
        let password = self.config.password.clone();
        self.send_message(msg_type::LOGON, |w| {
            w.put_enum(tags::ENCRYPT_METHOD, b"0");
            w.put_integer(tags::HEART_BT_INT, i64::from(heartbeat_secs));
            if reset {
                w.put_ascii_character(tags::RESET_SEQ_NUM_FLAG, b'Y');
            }
            if let Some(username) = &username {
                w.put_ascii_string(tags::USERNAME, username);
            }
            if let Some(password) = &password {
                w.put_ascii_string(tags::PASSWORD, password);
            }
        })
    }

    fn on_logon(&mut self, dispatch: &mut DispatchState, msg: &FixMessage<'_>) -> bool {
        if self.state != SessionState::Handshaking && self.state != SessionState::Connecting {
            debug!(state = ?self.state, "logon outside handshake");
        }

        // A Logon ahead of our expectation means we missed messages.
        let their_seq = msg.seq_num();
        if their_seq >= 1 && their_seq as u64 >= dispatch.inbound_seq() {
            let begin = dispatch.inbound_seq();
            info!(begin, their_seq, "sequence gap at logon, requesting resend");
            self.send_message(msg_type::RESEND_REQUEST, |w| {
                w.put_integer(tags::BEGIN_SEQ_NO, begin as i64);
                w.put_integer(tags::END_SEQ_NO, 0);
            });
        }

        let negotiated = msg.as_integer(tags::HEART_BT_INT);
        let heartbeat_secs = if negotiated > 0 {
            negotiated as u64
        } else {
            u64::from(self.config.heartbeat_interval_seconds)
        };
        self.heartbeat_interval_ns = heartbeat_secs * NANOS_PER_SEC;

        let tick_secs = (heartbeat_secs / 2).max(1);
        let now = self.clock.mono_nanos();
        self.timers
            .schedule_every(TaskSlot::Heartbeat, now, tick_secs * NANOS_PER_SEC);
        self.timers.cancel(TaskSlot::ConnectTimeout);

        dispatch.mark_logon();
        self.state = SessionState::LoggedIn;
        info!(heartbeat_secs, "FIX session logged on");
        true
    }

    fn on_test_request(&mut self, msg: &FixMessage<'_>) -> bool {
        let test_req_id = msg.find(tags::TEST_REQ_ID);
        self.send_message(msg_type::HEARTBEAT, |w| {
            if let Some(id) = test_req_id {
                w.put_buffer(tags::TEST_REQ_ID, id);
            }
        })
    }

    fn on_resend_request(&mut self, msg: &FixMessage<'_>) -> bool {
        // No resend log: gap-fill over the whole requested range.
        let end_seq = msg.as_integer(tags::END_SEQ_NO);
        let new_seq_no = if end_seq > 0 {
            end_seq + 1
        } else {
            self.outbound_seq as i64 + 1
        };
        self.send_message(msg_type::SEQUENCE_RESET, |w| {
            w.put_ascii_character(tags::GAP_FILL_FLAG, b'Y');
            w.put_integer(tags::NEW_SEQ_NO, new_seq_no);
        })
    }

    fn on_sequence_reset(&mut self, dispatch: &mut DispatchState, msg: &FixMessage<'_>) -> bool {
        let new_seq = msg.as_integer(tags::NEW_SEQ_NO);
        if new_seq >= 1 {
            info!(new_seq, "inbound sequence reset");
            dispatch.set_inbound_seq(new_seq as u64);
        }
        true
    }

    fn on_logout(&mut self, msg: &FixMessage<'_>) -> bool {
        let text = msg
            .find(tags::TEXT)
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .unwrap_or_default();
        self.pending_failure = Some(format!("logout received: {text}"));
        true
    }
}

/// A client FIX session over any [`Transport`].
pub struct Session<T: Transport, C: Clock> {
    rx: Vec<u8>,
    rx_len: usize,
    parser: FixMessageParser,
    dispatcher: Dispatcher<SessionCore<T, C>>,
    core: SessionCore<T, C>,
    connected_listener: Option<Box<dyn FnMut(&mut SessionCore<T, C>)>>,
    failure_listener: Option<Box<dyn FnMut(&str)>>,
}

impl<T: Transport, C: Clock> Session<T, C> {
    pub fn new(config: FixConfig, transport: T, clock: C) -> Result<Self, SessionError> {
        config.validate()?;

        let parser = FixMessageParser::new(
            config.fix_version,
            &config.sender_comp_id,
            &config.target_comp_id,
        );
        let writer = FixWriter::new(
            config.fix_version,
            &config.sender_comp_id,
            &config.target_comp_id,
        );

        let mut dispatcher: Dispatcher<SessionCore<T, C>> = Dispatcher::new();
        dispatcher.set_listener(
            msg_type::LOGON,
            Box::new(|core, dispatch, msg| core.on_logon(dispatch, msg)),
        );
        dispatcher.set_listener(
            msg_type::HEARTBEAT,
            Box::new(|_core, _dispatch, _msg| true),
        );
        dispatcher.set_listener(
            msg_type::TEST_REQUEST,
            Box::new(|core, _dispatch, msg| core.on_test_request(msg)),
        );
        dispatcher.set_listener(
            msg_type::RESEND_REQUEST,
            Box::new(|core, _dispatch, msg| core.on_resend_request(msg)),
        );
        dispatcher.set_listener(
            msg_type::SEQUENCE_RESET,
            Box::new(|core, dispatch, msg| core.on_sequence_reset(dispatch, msg)),
        );
        dispatcher.set_listener(
            msg_type::LOGOUT,
            Box::new(|core, _dispatch, msg| core.on_logout(msg)),
        );

        let heartbeat_interval_ns = config.heartbeat_interval_ns();
        Ok(Self {
            rx: Vec::new(),
            rx_len: 0,
            parser,
            dispatcher,
            core: SessionCore {
                config,
                state: SessionState::Idle,
                transport,
                clock,
                writer,
                timers: TimerQueue::new(),
                outbound_seq: 1,
                last_outbound_ns: 0,
                heartbeat_interval_ns,
                address: String::new(),
                wire_log: None,
                pending_failure: None,
            },
            connected_listener: None,
            failure_listener: None,
        })
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    /// Listener for one application MsgType. Admin types are handled by the
    /// session itself; registering one of those replaces that handling.
    pub fn set_message_listener(
        &mut self,
        for_type: &[u8],
        mut listener: Box<dyn FnMut(&FixMessage<'_>)>,
    ) {
        self.dispatcher.set_listener(
            for_type,
            Box::new(move |_core, _dispatch, msg| {
                listener(msg);
                true
            }),
        );
    }

    /// Fires for every accepted inbound frame, before the per-type listener.
    pub fn set_all_messages_listener(&mut self, mut listener: Box<dyn FnMut(&FixMessage<'_>)>) {
        self.dispatcher.set_all_messages_listener(Box::new(
            move |_core, _dispatch, msg| {
                listener(msg);
                true
            },
        ));
    }

    pub fn set_unhandled_listener(&mut self, mut listener: Box<dyn FnMut(&FixMessage<'_>)>) {
        self.dispatcher.set_unhandled_listener(Box::new(
            move |_core, _dispatch, msg| {
                listener(msg);
                true
            },
        ));
    }

    /// Replaces the automatic Logon with a custom handshake action.
    pub fn set_connected_listener(
        &mut self,
        listener: Box<dyn FnMut(&mut SessionCore<T, C>)>,
    ) {
        self.connected_listener = Some(listener);
    }

    pub fn set_failure_listener(&mut self, listener: Box<dyn FnMut(&str)>) {
        self.failure_listener = Some(listener);
    }

    /// One line per frame, both directions.
    pub fn set_wire_log(&mut self, log: Logger) {
        self.core.wire_log = Some(log);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn connect(&mut self, address: &str) -> Result<(), SessionError> {
        if self.core.state != SessionState::Idle {
            return Err(SessionError::NotIdle);
        }
        self.core.address = address.to_string();
        self.start_connect();
        self.drain_failure();
        Ok(())
    }

    fn start_connect(&mut self) {
        let now = self.core.clock.mono_nanos();
        self.core.timers.cancel(TaskSlot::Reconnect);
        self.core
            .timers
            .schedule_in(TaskSlot::ConnectTimeout, now, self.core.config.connect_timeout_ns);
        self.core.state = SessionState::Connecting;
        info!(address = %self.core.address, "FIX connecting");
        let address = self.core.address.clone();
        if let Err(e) = self.core.transport.connect(&address) {
            self.core.pending_failure = Some(format!("connect failed: {e}"));
        }
    }

    /// Graceful shutdown: Logout when logged on, then teardown. With
    /// reconnect enabled the reconnect timer still re-arms, as it does for
    /// any other disconnect.
    pub fn close(&mut self) {
        if self.dispatcher.state().is_logged_on() {
            self.core.send_message(msg_type::LOGOUT, |_| {});
        }
        info!("FIX session closed");
        self.teardown();
    }

    // ------------------------------------------------------------------
    // Transport events (driver entry points)
    // ------------------------------------------------------------------

    pub fn transport_connected(&mut self) {
        debug!("transport connected, awaiting handshake");
    }

    pub fn transport_handshake_complete(&mut self) {
        self.core.state = SessionState::Handshaking;
        if self.core.config.reset_seq_num {
            self.core.outbound_seq = 1;
        }
        self.dispatcher.logoff(self.core.config.reset_seq_num);

        match &mut self.connected_listener {
            Some(listener) => listener(&mut self.core),
            None => {
                self.core.send_logon();
            }
        }
        self.drain_failure();
    }

    pub fn transport_readable(&mut self) {
        loop {
            if self.rx.len() - self.rx_len < READ_CHUNK {
                self.rx.resize(self.rx_len + READ_CHUNK, 0);
            }
            let n = match self.core.transport.read(&mut self.rx[self.rx_len..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    self.fail(&format!("read failed: {e}"));
                    return;
                }
            };
            self.rx_len += n;
            if !self.drain_frames() {
                return;
            }
        }
        self.drain_failure();
    }

    pub fn transport_failed(&mut self, reason: &str) {
        self.fail(reason);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Earliest timer deadline in monotonic nanos, for the driver's sleep.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.core.timers.next_deadline()
    }

    /// Runs every timer due at the current clock reading.
    pub fn poll(&mut self) {
        let now = self.core.clock.mono_nanos();
        while let Some(slot) = self.core.timers.pop_due(now) {
            match slot {
                TaskSlot::Heartbeat => self.heartbeat_tick(now),
                TaskSlot::ConnectTimeout => {
                    self.fail("FIX connect timed out, disconnecting");
                }
                TaskSlot::Reconnect => {
                    if self.core.state == SessionState::Idle {
                        info!("FIX reconnecting");
                        self.start_connect();
                    }
                }
            }
        }
        self.drain_failure();
    }

    fn heartbeat_tick(&mut self, now: u64) {
        if self.core.state != SessionState::LoggedIn {
            return;
        }
        let interval = self.core.heartbeat_interval_ns;

        if now >= self.core.last_outbound_ns + interval / 2 {
            self.core.send_message(msg_type::HEARTBEAT, |_| {});
        }

        let last_inbound = self.dispatcher.state().last_inbound_ns();
        if now >= last_inbound + 2 * interval {
            self.fail(NO_MESSAGE_RECEIVED);
            return;
        }
        if self.core.config.send_test_requests && now >= last_inbound + interval {
            self.core.send_message(msg_type::TEST_REQUEST, |w| {
                w.put_integer(tags::TEST_REQ_ID, now as i64);
            });
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    /// Parses and dispatches every whole frame in the read buffer. Returns
    /// false when the session failed and tore down.
    fn drain_frames(&mut self) -> bool {
        loop {
            let consumed = match self.parser.parse(&self.rx[..self.rx_len]) {
                Ok(0) => return true,
                Ok(n) => n,
                Err(e) => {
                    self.fail(&format!("invalid frame: {e}"));
                    return false;
                }
            };

            let now = self.core.clock.mono_nanos();
            let outcome = {
                let msg = self.parser.message(&self.rx[..self.rx_len]);
                if let Some(log) = &self.core.wire_log {
                    log.info(self.core.clock.wall_nanos())
                        .str("in ")
                        .bytes(msg.frame())
                        .commit();
                }
                self.dispatcher.on_message(&mut self.core, &msg, now)
            };

            // Leftover bytes slide to the front only after listeners ran.
            buf::compact(&mut self.rx, consumed, self.rx_len - consumed);
            self.rx_len -= consumed;

            match outcome {
                Dispatch::Rejected => {
                    self.fail("FIX message rejected, disconnecting");
                    return false;
                }
                Dispatch::Delivered | Dispatch::Unhandled => {}
            }
            if self.core.pending_failure.is_some() {
                self.drain_failure();
                return false;
            }
        }
    }

    // ------------------------------------------------------------------
    // Failure and teardown
    // ------------------------------------------------------------------

    fn drain_failure(&mut self) {
        if let Some(reason) = self.core.pending_failure.take() {
            self.fail(&reason);
        }
    }

    fn fail(&mut self, reason: &str) {
        warn!(reason, "FIX session failure");
        self.teardown();
        if let Some(listener) = &mut self.failure_listener {
            listener(reason);
        }
    }

    /// Uniform recovery: cancel liveness timers, drop the transport, clear
    /// the read buffer, optionally re-arm the reconnect timer.
    fn teardown(&mut self) {
        self.core.state = SessionState::Disconnecting;
        self.core.pending_failure = None;
        self.core.timers.cancel(TaskSlot::Heartbeat);
        self.core.timers.cancel(TaskSlot::ConnectTimeout);
        self.dispatcher.logoff(self.core.config.reset_seq_num);
        if self.core.config.reset_seq_num {
            self.core.outbound_seq = 1;
        }
        self.core.transport.close();
        self.rx_len = 0;
        self.core.state = SessionState::Idle;

        if self.core.config.reconnect_enabled {
            let now = self.core.clock.mono_nanos();
            self.core.timers.schedule_in(
                TaskSlot::Reconnect,
                now,
                self.core.config.reconnect_timeout_ns,
            );
        }
    }

    // ------------------------------------------------------------------
    // Introspection and outbound API
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.core.state
    }

    pub fn is_logged_on(&self) -> bool {
        self.dispatcher.state().is_logged_on()
    }

    pub fn inbound_seq(&self) -> u64 {
        self.dispatcher.state().inbound_seq()
    }

    pub fn outbound_seq(&self) -> u64 {
        self.core.outbound_seq
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.core.transport
    }

    pub fn clock(&self) -> &C {
        &self.core.clock
    }

    /// Sends an application message; header and trailer are supplied.
    pub fn send_message(&mut self, for_type: &[u8], fields: impl FnOnce(&mut FixWriter)) -> bool {
        let sent = self.core.send_message(for_type, fields);
        self.drain_failure();
        sent
    }
}
