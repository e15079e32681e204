//! Inbound message sequencing and routing.
//!
//! The dispatcher owns the inbound side of the session contract: MsgSeqNum
//! validation, the logon flag, and the last-inbound clock. Accepted frames
//! go to the all-messages listener first, then the per-type listener.
//! Listeners receive a caller-supplied context plus the dispatch state, so
//! the session can register its own admin handlers without borrowing
//! itself.

use tracing::warn;

use crate::message::FixMessage;
use crate::tags::{self, msg_type};

/// Inbound-side session state, mutable from listeners.
#[derive(Debug)]
pub struct DispatchState {
    logon: bool,
    inbound_seq: u64,
    last_inbound_ns: u64,
}

impl Default for DispatchState {
    fn default() -> Self {
        Self {
            logon: false,
            inbound_seq: 1,
            last_inbound_ns: 0,
        }
    }
}

impl DispatchState {
    pub fn is_logged_on(&self) -> bool {
        self.logon
    }

    pub fn mark_logon(&mut self) {
        self.logon = true;
    }

    /// Next expected inbound MsgSeqNum.
    pub fn inbound_seq(&self) -> u64 {
        self.inbound_seq
    }

    /// SequenceReset handling overrides the expectation.
    pub fn set_inbound_seq(&mut self, seq: u64) {
        self.inbound_seq = seq;
    }

    pub fn last_inbound_ns(&self) -> u64 {
        self.last_inbound_ns
    }
}

/// How a frame left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Validated and handled by a per-type listener.
    Delivered,
    /// Validated but no listener claimed it.
    Unhandled,
    /// Sequencing or logon-state violation; the session must disconnect.
    Rejected,
}

pub type Listener<Ctx> =
    Box<dyn FnMut(&mut Ctx, &mut DispatchState, &FixMessage<'_>) -> bool>;

pub struct Dispatcher<Ctx> {
    by_type: Vec<(Vec<u8>, Listener<Ctx>)>,
    all_messages: Option<Listener<Ctx>>,
    unhandled: Option<Listener<Ctx>>,
    state: DispatchState,
}

impl<Ctx> Default for Dispatcher<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx> Dispatcher<Ctx> {
    pub fn new() -> Self {
        Self {
            by_type: Vec::new(),
            all_messages: None,
            unhandled: None,
            state: DispatchState::default(),
        }
    }

    /// Registers (or replaces) the listener for one MsgType.
    pub fn set_listener(&mut self, msg_type: &[u8], listener: Listener<Ctx>) {
        match self.by_type.iter_mut().find(|(t, _)| t == msg_type) {
            Some((_, slot)) => *slot = listener,
            None => self.by_type.push((msg_type.to_vec(), listener)),
        }
    }

    /// Fires before the per-type listener on every accepted frame.
    pub fn set_all_messages_listener(&mut self, listener: Listener<Ctx>) {
        self.all_messages = Some(listener);
    }

    pub fn set_unhandled_listener(&mut self, listener: Listener<Ctx>) {
        self.unhandled = Some(listener);
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DispatchState {
        &mut self.state
    }

    /// Validates and routes one inbound frame.
    pub fn on_message(&mut self, ctx: &mut Ctx, msg: &FixMessage<'_>, now_ns: u64) -> Dispatch {
        self.state.last_inbound_ns = now_ns;

        let seq = msg.as_integer(tags::MSG_SEQ_NUM);
        if seq < 1 || (seq as u64) < self.state.inbound_seq {
            warn!(
                seq,
                expected = self.state.inbound_seq,
                "inbound MsgSeqNum missing or replayed"
            );
            return Dispatch::Rejected;
        }

        if self.state.logon {
            if seq as u64 != self.state.inbound_seq {
                warn!(
                    seq,
                    expected = self.state.inbound_seq,
                    "inbound sequence gap"
                );
                return Dispatch::Rejected;
            }
            self.state.inbound_seq += 1;
        } else {
            // Before logon only Logon[A] may arrive. A gapped Logon is
            // still delivered; the session gap-fills from it.
            if msg.msg_type() != msg_type::LOGON {
                warn!(
                    msg_type = %String::from_utf8_lossy(msg.msg_type()),
                    "message before logon"
                );
                return Dispatch::Rejected;
            }
            if seq as u64 == self.state.inbound_seq {
                self.state.inbound_seq += 1;
            }
        }

        if let Some(listener) = &mut self.all_messages {
            listener(ctx, &mut self.state, msg);
        }

        match self
            .by_type
            .iter_mut()
            .find(|(t, _)| t.as_slice() == msg.msg_type())
        {
            Some((_, listener)) => {
                if listener(ctx, &mut self.state, msg) {
                    Dispatch::Delivered
                } else {
                    Dispatch::Rejected
                }
            }
            None => {
                match &mut self.unhandled {
                    Some(listener) => {
                        listener(ctx, &mut self.state, msg);
                    }
                    None => {
                        warn!(
                            msg_type = %String::from_utf8_lossy(msg.msg_type()),
                            "unhandled message type"
                        );
                    }
                }
                Dispatch::Unhandled
            }
        }
    }

    /// Drops the logon state; optionally restarts inbound sequencing.
    pub fn logoff(&mut self, reset_inbound: bool) {
        self.state.logon = false;
        self.state.last_inbound_ns = 0;
        if reset_inbound {
            self.state.inbound_seq = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixVersion;
    use crate::message::FixMessageParser;
    use crate::writer::FixWriter;

    // Frames as the counterparty (EXCH) would send them to us (US).
    fn inbound_frame(msg_type: &[u8], seq: u64, extra: impl FnOnce(&mut FixWriter)) -> Vec<u8> {
        let mut writer = FixWriter::new(FixVersion::Fix42, "EXCH", "US");
        writer.start(msg_type, seq, 0);
        extra(&mut writer);
        writer.send(<[u8]>::to_vec)
    }

    fn dispatch(
        dispatcher: &mut Dispatcher<Vec<String>>,
        log: &mut Vec<String>,
        frame: &[u8],
        now_ns: u64,
    ) -> Dispatch {
        let mut parser = FixMessageParser::new(FixVersion::Fix42, "US", "EXCH");
        parser.parse(frame).unwrap();
        let msg = parser.message(frame);
        dispatcher.on_message(log, &msg, now_ns)
    }

    fn recording(label: &'static str) -> Listener<Vec<String>> {
        Box::new(move |log, _state, msg| {
            log.push(format!("{label}:{}", String::from_utf8_lossy(msg.msg_type())));
            true
        })
    }

    #[test]
    fn all_messages_listener_precedes_per_type() {
        let mut dispatcher: Dispatcher<Vec<String>> = Dispatcher::new();
        dispatcher.set_all_messages_listener(recording("all"));
        dispatcher.set_listener(b"A", recording("logon"));
        let mut log = Vec::new();

        let frame = inbound_frame(b"A", 1, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &frame, 5),
            Dispatch::Delivered
        );
        assert_eq!(log, ["all:A", "logon:A"]);
        assert_eq!(dispatcher.state().inbound_seq(), 2);
        assert_eq!(dispatcher.state().last_inbound_ns(), 5);
    }

    #[test]
    fn rejects_non_logon_before_logon() {
        let mut dispatcher: Dispatcher<Vec<String>> = Dispatcher::new();
        dispatcher.set_listener(b"0", recording("hb"));
        let mut log = Vec::new();

        let frame = inbound_frame(b"0", 1, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &frame, 1),
            Dispatch::Rejected
        );
        assert!(log.is_empty());
        assert_eq!(dispatcher.state().inbound_seq(), 1);
    }

    #[test]
    fn gapped_logon_is_delivered_without_increment() {
        let mut dispatcher: Dispatcher<Vec<String>> = Dispatcher::new();
        dispatcher.set_listener(b"A", recording("logon"));
        let mut log = Vec::new();

        let frame = inbound_frame(b"A", 7, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &frame, 1),
            Dispatch::Delivered
        );
        assert_eq!(log, ["logon:A"]);
        // Gap left for the session to resolve with a ResendRequest.
        assert_eq!(dispatcher.state().inbound_seq(), 1);
    }

    #[test]
    fn sequencing_after_logon() {
        let mut dispatcher: Dispatcher<Vec<String>> = Dispatcher::new();
        dispatcher.set_listener(b"A", recording("logon"));
        dispatcher.set_listener(b"0", recording("hb"));
        let mut log = Vec::new();

        let logon = inbound_frame(b"A", 1, |_| {});
        dispatch(&mut dispatcher, &mut log, &logon, 1);
        dispatcher.state_mut().mark_logon();

        let hb2 = inbound_frame(b"0", 2, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &hb2, 2),
            Dispatch::Delivered
        );

        // Replay and gap are both rejected.
        let replay = inbound_frame(b"0", 2, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &replay, 3),
            Dispatch::Rejected
        );
        let gap = inbound_frame(b"0", 9, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &gap, 4),
            Dispatch::Rejected
        );
        assert_eq!(dispatcher.state().inbound_seq(), 3);
    }

    #[test]
    fn unhandled_types_fall_through() {
        let mut dispatcher: Dispatcher<Vec<String>> = Dispatcher::new();
        dispatcher.set_listener(b"A", recording("logon"));
        let mut log = Vec::new();

        let logon = inbound_frame(b"A", 1, |_| {});
        dispatch(&mut dispatcher, &mut log, &logon, 1);
        dispatcher.state_mut().mark_logon();

        let app = inbound_frame(b"8", 2, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &app, 2),
            Dispatch::Unhandled
        );

        dispatcher.set_unhandled_listener(recording("unhandled"));
        let app = inbound_frame(b"8", 3, |_| {});
        assert_eq!(
            dispatch(&mut dispatcher, &mut log, &app, 3),
            Dispatch::Unhandled
        );
        assert_eq!(log.last().unwrap(), "unhandled:8");
    }

    #[test]
    fn logoff_resets_state() {
        let mut dispatcher: Dispatcher<Vec<String>> = Dispatcher::new();
        dispatcher.state_mut().mark_logon();
        dispatcher.state_mut().set_inbound_seq(9);

        dispatcher.logoff(false);
        assert!(!dispatcher.state().is_logged_on());
        assert_eq!(dispatcher.state().inbound_seq(), 9);
        assert_eq!(dispatcher.state().last_inbound_ns(), 0);

        dispatcher.logoff(true);
        assert_eq!(dispatcher.state().inbound_seq(), 1);
    }
}
