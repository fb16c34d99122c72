//! Channel state machine
//!
//! Each channel block runs a small table-driven state machine. Looking up
//! the current state and an event yields an action and the next state; the
//! next state is stored before the action runs, so an action may dispatch
//! further events on the same channel.
//!
//! Control and browsing channels use separate tables. They share a shape
//! and differ in the handler set bound to each action (see `actions`).

use log::debug;

use crate::error::{AvctError, AvctResult, ResultCode};
use crate::types::{ChannelKind, CommandResponse, ConnectionId};

/// State machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    Idle,
    Opening,
    Opened,
    Closing,
    Busy,
}

impl State {
    pub const ALL: [State; STATE_COUNT] = [
        State::Idle,
        State::Opening,
        State::Opened,
        State::Closing,
        State::Busy,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// State machine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Bind,
    Unbind,
    SendMessage,
    Disconnect,
    PeerConnected,
    PeerDisconnected,
    MessageReceived,
    PeerBusyChanged,
}

impl Event {
    pub const ALL: [Event; EVENT_COUNT] = [
        Event::Bind,
        Event::Unbind,
        Event::SendMessage,
        Event::Disconnect,
        Event::PeerConnected,
        Event::PeerDisconnected,
        Event::MessageReceived,
        Event::PeerBusyChanged,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Actions bound to table cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ignore,
    OpenChannel,
    UnbindNoop,
    Discard,
    BindOnConnect,
    NotifyDisconnectInd,
    DiscardInbound,
    CloseChannel,
    NotifyConnectFail,
    BindExisting,
    CheckLastUnbind,
    SendFramed,
    Deliver,
    NotifyBusy,
    BindFailNotify,
    NotifyDisconnectCfm,
}

pub const STATE_COUNT: usize = 5;
pub const EVENT_COUNT: usize = 8;

/// One table cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub action: Action,
    pub next: State,
}

const fn t(action: Action, next: State) -> Transition {
    Transition { action, next }
}

pub type StateTable = [[Transition; EVENT_COUNT]; STATE_COUNT];

use self::Action::*;
use self::State::{Busy, Closing, Idle, Opened, Opening};

// Columns: Bind, Unbind, SendMessage, Disconnect, PeerConnected,
// PeerDisconnected, MessageReceived, PeerBusyChanged
pub static CONTROL_TABLE: StateTable = [
    // Idle
    [
        t(OpenChannel, Opening),
        t(UnbindNoop, Idle),
        t(Discard, Idle),
        t(Ignore, Idle),
        t(BindOnConnect, Opened),
        t(NotifyDisconnectInd, Idle),
        t(DiscardInbound, Idle),
        t(Ignore, Idle),
    ],
    // Opening
    [
        t(Ignore, Opening),
        t(UnbindNoop, Opening),
        t(Discard, Opening),
        t(CloseChannel, Closing),
        t(BindOnConnect, Opened),
        t(NotifyConnectFail, Idle),
        t(DiscardInbound, Opening),
        t(Ignore, Opening),
    ],
    // Opened
    [
        t(BindExisting, Opened),
        t(CheckLastUnbind, Opened),
        t(SendFramed, Opened),
        t(CloseChannel, Closing),
        t(Ignore, Opened),
        t(NotifyDisconnectInd, Idle),
        t(Deliver, Opened),
        t(NotifyBusy, Busy),
    ],
    // Closing
    [
        t(BindFailNotify, Closing),
        t(Ignore, Closing),
        t(Discard, Closing),
        t(Ignore, Closing),
        t(Ignore, Closing),
        t(NotifyDisconnectCfm, Idle),
        t(DiscardInbound, Closing),
        t(Ignore, Closing),
    ],
    // Busy
    [
        t(BindExisting, Busy),
        t(CheckLastUnbind, Busy),
        t(Discard, Busy),
        t(CloseChannel, Closing),
        t(Ignore, Busy),
        t(NotifyDisconnectInd, Idle),
        t(Deliver, Busy),
        t(NotifyBusy, Busy),
    ],
];

pub static BROWSING_TABLE: StateTable = [
    // Idle
    [
        t(OpenChannel, Opening),
        t(UnbindNoop, Idle),
        t(Discard, Idle),
        t(Ignore, Idle),
        t(BindOnConnect, Opened),
        t(NotifyDisconnectInd, Idle),
        t(DiscardInbound, Idle),
        t(Ignore, Idle),
    ],
    // Opening
    [
        t(Ignore, Opening),
        t(UnbindNoop, Opening),
        t(Discard, Opening),
        t(CloseChannel, Closing),
        t(BindOnConnect, Opened),
        t(NotifyConnectFail, Idle),
        t(DiscardInbound, Opening),
        t(Ignore, Opening),
    ],
    // Opened
    [
        t(BindExisting, Opened),
        t(CheckLastUnbind, Opened),
        t(SendFramed, Opened),
        t(CloseChannel, Closing),
        t(Ignore, Opened),
        t(NotifyDisconnectInd, Idle),
        t(Deliver, Opened),
        t(NotifyBusy, Busy),
    ],
    // Closing
    [
        t(BindFailNotify, Closing),
        t(Ignore, Closing),
        t(Discard, Closing),
        t(Ignore, Closing),
        t(Ignore, Closing),
        t(NotifyDisconnectCfm, Idle),
        t(DiscardInbound, Closing),
        t(Ignore, Closing),
    ],
    // Busy
    [
        t(BindExisting, Busy),
        t(CheckLastUnbind, Busy),
        t(Discard, Busy),
        t(CloseChannel, Closing),
        t(Ignore, Busy),
        t(NotifyDisconnectInd, Idle),
        t(Deliver, Busy),
        t(NotifyBusy, Busy),
    ],
];

pub fn table(kind: ChannelKind) -> &'static StateTable {
    match kind {
        ChannelKind::Control => &CONTROL_TABLE,
        ChannelKind::Browsing => &BROWSING_TABLE,
    }
}

pub fn lookup(kind: ChannelKind, state: State, event: Event) -> Transition {
    table(kind)[state.index()][event.index()]
}

/// Outbound message carried by a SendMessage event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub connection: ConnectionId,
    pub label: u8,
    pub cr: CommandResponse,
    pub payload: Vec<u8>,
}

/// Data accompanying an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    None,
    /// Bind and Unbind
    Connection(ConnectionId),
    /// SendMessage
    Outbound(OutboundMessage),
    /// MessageReceived, one raw L2CAP payload
    Inbound(Vec<u8>),
    /// PeerConnected and PeerDisconnected, with the raw L2CAP or security status
    Result { result: ResultCode, detail: u16 },
    /// PeerBusyChanged
    Busy(bool),
}

/// Owner of the channel states the engine drives
pub trait ActionSink {
    /// Current state of the channel, None when the channel does not exist
    fn fsm_state(&self, kind: ChannelKind) -> Option<State>;

    fn set_fsm_state(&mut self, kind: ChannelKind, state: State);

    /// Run the handler bound to `action` for this channel kind
    fn perform(&mut self, kind: ChannelKind, action: Action, data: EventData) -> AvctResult<()>;
}

/// Feed one event into the state machine of the `kind` channel
pub fn dispatch<S: ActionSink + ?Sized>(
    sink: &mut S,
    kind: ChannelKind,
    event: Event,
    data: EventData,
) -> AvctResult<()> {
    let state = sink.fsm_state(kind).ok_or(AvctError::ChannelNotOpen)?;
    let transition = lookup(kind, state, event);

    debug!(
        "{} channel: {:?} + {:?} -> {:?}, {:?}",
        kind, state, event, transition.action, transition.next
    );

    sink.set_fsm_state(kind, transition.next);
    if transition.action == Action::Ignore {
        return Ok(());
    }
    sink.perform(kind, transition.action, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Records every handler call instead of running it
    #[derive(Default)]
    struct RecordingSink {
        states: HashMap<ChannelKind, State>,
        performed: Vec<(ChannelKind, Action, State)>,
    }

    impl ActionSink for RecordingSink {
        fn fsm_state(&self, kind: ChannelKind) -> Option<State> {
            self.states.get(&kind).copied()
        }

        fn set_fsm_state(&mut self, kind: ChannelKind, state: State) {
            self.states.insert(kind, state);
        }

        fn perform(&mut self, kind: ChannelKind, action: Action, _data: EventData) -> AvctResult<()> {
            // The next state is already visible to the handler
            let state = self.states[&kind];
            self.performed.push((kind, action, state));
            Ok(())
        }
    }

    fn expected(state: State, event: Event) -> (Action, State) {
        use Event as E;
        match (state, event) {
            (Idle, E::Bind) => (OpenChannel, Opening),
            (Idle, E::Unbind) => (UnbindNoop, Idle),
            (Idle, E::SendMessage) => (Discard, Idle),
            (Idle, E::Disconnect) => (Ignore, Idle),
            (Idle, E::PeerConnected) => (BindOnConnect, Opened),
            (Idle, E::PeerDisconnected) => (NotifyDisconnectInd, Idle),
            (Idle, E::MessageReceived) => (DiscardInbound, Idle),
            (Idle, E::PeerBusyChanged) => (Ignore, Idle),

            (Opening, E::Bind) => (Ignore, Opening),
            (Opening, E::Unbind) => (UnbindNoop, Opening),
            (Opening, E::SendMessage) => (Discard, Opening),
            (Opening, E::Disconnect) => (CloseChannel, Closing),
            (Opening, E::PeerConnected) => (BindOnConnect, Opened),
            (Opening, E::PeerDisconnected) => (NotifyConnectFail, Idle),
            (Opening, E::MessageReceived) => (DiscardInbound, Opening),
            (Opening, E::PeerBusyChanged) => (Ignore, Opening),

            (Opened, E::Bind) => (BindExisting, Opened),
            (Opened, E::Unbind) => (CheckLastUnbind, Opened),
            (Opened, E::SendMessage) => (SendFramed, Opened),
            (Opened, E::Disconnect) => (CloseChannel, Closing),
            (Opened, E::PeerConnected) => (Ignore, Opened),
            (Opened, E::PeerDisconnected) => (NotifyDisconnectInd, Idle),
            (Opened, E::MessageReceived) => (Deliver, Opened),
            (Opened, E::PeerBusyChanged) => (NotifyBusy, Busy),

            (Closing, E::Bind) => (BindFailNotify, Closing),
            (Closing, E::Unbind) => (Ignore, Closing),
            (Closing, E::SendMessage) => (Discard, Closing),
            (Closing, E::Disconnect) => (Ignore, Closing),
            (Closing, E::PeerConnected) => (Ignore, Closing),
            (Closing, E::PeerDisconnected) => (NotifyDisconnectCfm, Idle),
            (Closing, E::MessageReceived) => (DiscardInbound, Closing),
            (Closing, E::PeerBusyChanged) => (Ignore, Closing),

            (Busy, E::Bind) => (BindExisting, Busy),
            (Busy, E::Unbind) => (CheckLastUnbind, Busy),
            (Busy, E::SendMessage) => (Discard, Busy),
            (Busy, E::Disconnect) => (CloseChannel, Closing),
            (Busy, E::PeerConnected) => (Ignore, Busy),
            (Busy, E::PeerDisconnected) => (NotifyDisconnectInd, Idle),
            (Busy, E::MessageReceived) => (Deliver, Busy),
            (Busy, E::PeerBusyChanged) => (NotifyBusy, Busy),
        }
    }

    #[test]
    fn test_every_cell_for_both_tables() {
        for kind in [ChannelKind::Control, ChannelKind::Browsing] {
            for state in State::ALL {
                for event in Event::ALL {
                    let mut sink = RecordingSink::default();
                    sink.states.insert(kind, state);

                    dispatch(&mut sink, kind, event, EventData::None).unwrap();

                    let (action, next) = expected(state, event);
                    assert_eq!(
                        sink.states[&kind], next,
                        "{:?} {:?} + {:?}", kind, state, event
                    );
                    if action == Ignore {
                        assert!(sink.performed.is_empty(), "{:?} {:?} + {:?}", kind, state, event);
                    } else {
                        assert_eq!(sink.performed, vec![(kind, action, next)]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_dispatch_on_missing_channel() {
        let mut sink = RecordingSink::default();
        let result = dispatch(&mut sink, ChannelKind::Browsing, Event::Bind, EventData::None);
        assert_eq!(result, Err(AvctError::ChannelNotOpen));
        assert!(sink.performed.is_empty());
    }

    #[test]
    fn test_handler_status_is_returned() {
        struct FailingSink(State);

        impl ActionSink for FailingSink {
            fn fsm_state(&self, _kind: ChannelKind) -> Option<State> {
                Some(self.0)
            }

            fn set_fsm_state(&mut self, _kind: ChannelKind, state: State) {
                self.0 = state;
            }

            fn perform(&mut self, _kind: ChannelKind, _action: Action, _data: EventData) -> AvctResult<()> {
                Err(AvctError::NoResources("channel block"))
            }
        }

        let mut sink = FailingSink(State::Idle);
        let result = dispatch(&mut sink, ChannelKind::Control, Event::Bind, EventData::None);
        assert_eq!(result, Err(AvctError::NoResources("channel block")));
        assert_eq!(sink.0, State::Opening);
    }
}
