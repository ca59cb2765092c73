//! The Upper Layer protocol state machine,
//! as defined in PS3.8 section 9.2.
//!
//! The machine is pure:
//! [`StateMachine::handle`] takes one [`Event`]
//! and returns the list of [`Effect`]s to carry out,
//! leaving all I/O to the caller.
use std::fmt;

use tracing::{debug, warn};

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderASCEReason, AssociationRJSource,
    AssociationRQ, PDataValue, Pdu,
};

/// The states of the Upper Layer state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    /// Idle
    Sta1,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ PDU
    Sta2,
    /// Awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// Awaiting transport connection opening to complete
    Sta4,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta5,
    /// Association established and ready for data transfer
    Sta6,
    /// Awaiting A-RELEASE-RP PDU
    Sta7,
    /// Awaiting local A-RELEASE response primitive
    Sta8,
    /// Release collision requestor side: awaiting A-RELEASE response primitive
    Sta9,
    /// Release collision acceptor side: awaiting A-RELEASE-RP PDU
    Sta10,
    /// Release collision requestor side: awaiting A-RELEASE-RP PDU
    Sta11,
    /// Release collision acceptor side: awaiting A-RELEASE response primitive
    Sta12,
    /// Awaiting transport connection close indication
    Sta13,
}

impl State {
    pub const ALL: [State; 13] = [
        State::Sta1,
        State::Sta2,
        State::Sta3,
        State::Sta4,
        State::Sta5,
        State::Sta6,
        State::Sta7,
        State::Sta8,
        State::Sta9,
        State::Sta10,
        State::Sta11,
        State::Sta12,
        State::Sta13,
    ];

    pub fn description(self) -> &'static str {
        match self {
            State::Sta1 => "idle",
            State::Sta2 => "awaiting A-ASSOCIATE-RQ",
            State::Sta3 => "awaiting local associate response",
            State::Sta4 => "awaiting transport connect",
            State::Sta5 => "awaiting A-ASSOCIATE-AC or -RJ",
            State::Sta6 => "established",
            State::Sta7 => "awaiting A-RELEASE-RP",
            State::Sta8 => "awaiting local release response",
            State::Sta9 => "release collision, requestor awaiting local response",
            State::Sta10 => "release collision, acceptor awaiting A-RELEASE-RP",
            State::Sta11 => "release collision, requestor awaiting A-RELEASE-RP",
            State::Sta12 => "release collision, acceptor awaiting local response",
            State::Sta13 => "awaiting transport close",
        }
    }

    /// Whether the peer is connected and past the initial request,
    /// which is where most protocol violations are answered with AA-8.
    fn is_connected(self) -> bool {
        matches!(
            self,
            State::Sta3
                | State::Sta5
                | State::Sta6
                | State::Sta7
                | State::Sta8
                | State::Sta9
                | State::Sta10
                | State::Sta11
                | State::Sta12
        )
    }

    /// Whether a transport connection exists in this state.
    pub fn has_transport(self) -> bool {
        !matches!(self, State::Sta1 | State::Sta4)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.description())
    }
}

/// The kind of an [`Event`], without its payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A-ASSOCIATE request (local user)
    Evt1,
    /// Transport connect confirmation (local transport service)
    Evt2,
    /// A-ASSOCIATE-AC PDU received
    Evt3,
    /// A-ASSOCIATE-RJ PDU received
    Evt4,
    /// Transport connection indication (local transport service)
    Evt5,
    /// A-ASSOCIATE-RQ PDU received
    Evt6,
    /// A-ASSOCIATE response primitive (accept)
    Evt7,
    /// A-ASSOCIATE response primitive (reject)
    Evt8,
    /// P-DATA request primitive
    Evt9,
    /// P-DATA-TF PDU received
    Evt10,
    /// A-RELEASE request primitive
    Evt11,
    /// A-RELEASE-RQ PDU received
    Evt12,
    /// A-RELEASE-RP PDU received
    Evt13,
    /// A-RELEASE response primitive
    Evt14,
    /// A-ABORT request primitive
    Evt15,
    /// A-ABORT PDU received
    Evt16,
    /// Transport connection closed indication
    Evt17,
    /// ARTIM timer expired
    Evt18,
    /// Unrecognized or invalid PDU received
    Evt19,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::Evt1,
        EventKind::Evt2,
        EventKind::Evt3,
        EventKind::Evt4,
        EventKind::Evt5,
        EventKind::Evt6,
        EventKind::Evt7,
        EventKind::Evt8,
        EventKind::Evt9,
        EventKind::Evt10,
        EventKind::Evt11,
        EventKind::Evt12,
        EventKind::Evt13,
        EventKind::Evt14,
        EventKind::Evt15,
        EventKind::Evt16,
        EventKind::Evt17,
        EventKind::Evt18,
        EventKind::Evt19,
    ];
}

/// An input to the state machine,
/// either a local service primitive
/// or something which happened on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    AssociateRequest(AssociationRQ),
    TransportConnectConfirmed,
    AssociateAcReceived(AssociationAC),
    AssociateRjReceived(AssociationRJ),
    TransportConnectIndication,
    AssociateRqReceived(AssociationRQ),
    AssociateAccept(AssociationAC),
    AssociateReject(AssociationRJ),
    PDataRequest(Vec<PDataValue>),
    PDataReceived(Vec<PDataValue>),
    ReleaseRequest,
    ReleaseRqReceived,
    ReleaseRpReceived,
    ReleaseResponse,
    AbortRequest(AbortRQSource),
    AbortReceived(AbortRQSource),
    TransportClosed,
    TimerExpired,
    InvalidPdu,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AssociateRequest(_) => EventKind::Evt1,
            Event::TransportConnectConfirmed => EventKind::Evt2,
            Event::AssociateAcReceived(_) => EventKind::Evt3,
            Event::AssociateRjReceived(_) => EventKind::Evt4,
            Event::TransportConnectIndication => EventKind::Evt5,
            Event::AssociateRqReceived(_) => EventKind::Evt6,
            Event::AssociateAccept(_) => EventKind::Evt7,
            Event::AssociateReject(_) => EventKind::Evt8,
            Event::PDataRequest(_) => EventKind::Evt9,
            Event::PDataReceived(_) => EventKind::Evt10,
            Event::ReleaseRequest => EventKind::Evt11,
            Event::ReleaseRqReceived => EventKind::Evt12,
            Event::ReleaseRpReceived => EventKind::Evt13,
            Event::ReleaseResponse => EventKind::Evt14,
            Event::AbortRequest(_) => EventKind::Evt15,
            Event::AbortReceived(_) => EventKind::Evt16,
            Event::TransportClosed => EventKind::Evt17,
            Event::TimerExpired => EventKind::Evt18,
            Event::InvalidPdu => EventKind::Evt19,
        }
    }

    /// Map a PDU received from the peer to its event.
    pub fn from_received(pdu: Pdu) -> Self {
        match pdu {
            Pdu::AssociationRQ(rq) => Event::AssociateRqReceived(rq),
            Pdu::AssociationAC(ac) => Event::AssociateAcReceived(ac),
            Pdu::AssociationRJ(rj) => Event::AssociateRjReceived(rj),
            Pdu::PData { data } => Event::PDataReceived(data),
            Pdu::ReleaseRQ => Event::ReleaseRqReceived,
            Pdu::ReleaseRP => Event::ReleaseRpReceived,
            Pdu::AbortRQ { source } => Event::AbortReceived(source),
        }
    }
}

/// The actions of the state machine, per PS3.8 tables 9-6 to 9-9.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Ae1,
    Ae2,
    Ae3,
    Ae4,
    Ae5,
    Ae6,
    Ae7,
    Ae8,
    Dt1,
    Dt2,
    Ar1,
    Ar2,
    Ar3,
    Ar4,
    Ar5,
    Ar6,
    Ar7,
    Ar8,
    Ar9,
    Ar10,
    Aa1,
    Aa2,
    Aa3,
    Aa4,
    Aa5,
    Aa6,
    Aa7,
    Aa8,
}

/// Why an association ended without an orderly release.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// the peer sent an A-ABORT
    Peer(AbortRQSource),
    /// an event arrived which is not valid in the current state
    UnexpectedEvent { state: State, event: EventKind },
    /// the peer sent a PDU which could not be decoded
    MalformedPdu,
    /// the transport connection was closed or failed
    TransportClosed,
    /// the response timer expired
    Timeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Peer(source) => write!(f, "aborted by peer ({})", source),
            AbortReason::UnexpectedEvent { state, event } => {
                write!(f, "unexpected event {:?} in state {}", event, state)
            }
            AbortReason::MalformedPdu => f.write_str("malformed PDU received"),
            AbortReason::TransportClosed => f.write_str("transport connection closed"),
            AbortReason::Timeout => f.write_str("response timer expired"),
        }
    }
}

/// A service primitive delivered to the user of the Upper Layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Indication {
    /// A-ASSOCIATE indication: the peer requests an association
    AssociateRequest(AssociationRQ),
    /// A-ASSOCIATE confirmation (accepted)
    AssociateAccepted(AssociationAC),
    /// A-ASSOCIATE confirmation (rejected)
    AssociateRejected(AssociationRJ),
    /// P-DATA indication
    Data(Vec<PDataValue>),
    /// A-RELEASE indication
    ReleaseRequested,
    /// A-RELEASE confirmation
    ReleaseConfirmed,
    /// A-ABORT or A-P-ABORT indication
    Aborted(AbortReason),
}

/// What the owner of the state machine must do after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// open the transport connection to the peer
    Connect,
    /// send a PDU to the peer
    Send(Pdu),
    /// hand a primitive over to the service user
    Deliver(Indication),
    /// start (or restart) the response timer
    StartTimer,
    StopTimer,
    CloseTransport,
}

/// Look up the action for an event in the given state
/// (PS3.8 table 9-10).
///
/// Returns `None` when the table has no entry for the pair.
pub fn action_for(state: State, event: EventKind) -> Option<Action> {
    use Action::*;
    use EventKind::*;
    use State::*;

    let action = match (event, state) {
        (Evt1, Sta1) => Ae1,

        (Evt2, Sta4) => Ae2,

        (Evt3, Sta2) => Aa1,
        (Evt3, Sta5) => Ae3,
        (Evt3, Sta13) => Aa6,
        (Evt3, s) if s.is_connected() => Aa8,

        (Evt4, Sta2) => Aa1,
        (Evt4, Sta5) => Ae4,
        (Evt4, Sta13) => Aa6,
        (Evt4, s) if s.is_connected() => Aa8,

        (Evt5, Sta1) => Ae5,

        (Evt6, Sta2) => Ae6,
        (Evt6, Sta13) => Aa7,
        (Evt6, s) if s.is_connected() => Aa8,

        (Evt7, Sta3) => Ae7,

        (Evt8, Sta3) => Ae8,

        (Evt9, Sta6) => Dt1,
        (Evt9, Sta8) => Ar7,

        (Evt10, Sta2) => Aa1,
        (Evt10, Sta6) => Dt2,
        (Evt10, Sta7) => Ar6,
        (Evt10, Sta13) => Aa6,
        (Evt10, s) if s.is_connected() => Aa8,

        (Evt11, Sta6) => Ar1,

        (Evt12, Sta2) => Aa1,
        (Evt12, Sta6) => Ar2,
        (Evt12, Sta7) => Ar8,
        (Evt12, Sta13) => Aa6,
        (Evt12, s) if s.is_connected() => Aa8,

        (Evt13, Sta2) => Aa1,
        (Evt13, Sta7) => Ar3,
        (Evt13, Sta10) => Ar10,
        (Evt13, Sta11) => Ar3,
        (Evt13, Sta13) => Aa6,
        (Evt13, s) if s.is_connected() => Aa8,

        (Evt14, Sta8) => Ar4,
        (Evt14, Sta9) => Ar9,
        (Evt14, Sta12) => Ar4,

        (Evt15, Sta4) => Aa2,
        (Evt15, s) if s.is_connected() => Aa1,

        (Evt16, Sta2) => Aa2,
        (Evt16, Sta13) => Aa2,
        (Evt16, s) if s.is_connected() => Aa3,

        (Evt17, Sta2) => Aa5,
        (Evt17, Sta13) => Ar5,
        (Evt17, Sta4) => Aa4,
        (Evt17, s) if s.is_connected() => Aa4,

        (Evt18, Sta2) => Aa2,
        (Evt18, Sta13) => Aa2,

        (Evt19, Sta2) => Aa1,
        (Evt19, Sta13) => Aa7,
        (Evt19, s) if s.is_connected() => Aa8,

        _ => return None,
    };
    Some(action)
}

/// The Upper Layer state machine of one association.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: State,
    /// whether this side requested the association,
    /// which decides the release collision path
    requestor: bool,
    /// the association request waiting for the transport connection
    pending_request: Option<AssociationRQ>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: State::Sta1,
            requestor: false,
            pending_request: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_requestor(&self) -> bool {
        self.requestor
    }

    /// Process one event,
    /// returning the effects to carry out in order.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let kind = event.kind();
        let state = self.state;
        let (next, effects) = match action_for(state, kind) {
            Some(action) => {
                let (next, effects) = self.perform(action, event);
                debug!("{:?} in {:?}: {:?} -> {:?}", kind, state, action, next);
                (next, effects)
            }
            None => self.invalid_event(kind),
        };
        self.state = next;
        effects
    }

    /// The way out for events with no entry in the transition table:
    /// abort the association and go back to idle.
    fn invalid_event(&mut self, event: EventKind) -> (State, Vec<Effect>) {
        let state = self.state;
        let reason = match event {
            EventKind::Evt18 => AbortReason::Timeout,
            EventKind::Evt19 => AbortReason::MalformedPdu,
            _ => AbortReason::UnexpectedEvent { state, event },
        };
        warn!("{:?} is not valid in {}, aborting", event, state);

        let mut effects = vec![Effect::StopTimer];
        if state.has_transport() {
            effects.push(Effect::Send(Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(provider_reason(event)),
            }));
            effects.push(Effect::CloseTransport);
        }
        effects.push(Effect::Deliver(Indication::Aborted(reason)));
        self.pending_request = None;
        (State::Sta1, effects)
    }

    fn perform(&mut self, action: Action, event: Event) -> (State, Vec<Effect>) {
        let kind = event.kind();
        match action {
            // Issue TRANSPORT CONNECT request primitive to local transport service
            Action::Ae1 => match event {
                Event::AssociateRequest(rq) => {
                    self.requestor = true;
                    self.pending_request = Some(rq);
                    (State::Sta4, vec![Effect::Connect])
                }
                other => self.invalid_event(other.kind()),
            },
            // Send A-ASSOCIATE-RQ-PDU
            Action::Ae2 => match self.pending_request.take() {
                Some(rq) => (
                    State::Sta5,
                    vec![Effect::Send(Pdu::AssociationRQ(rq)), Effect::StartTimer],
                ),
                None => self.invalid_event(kind),
            },
            // Issue A-ASSOCIATE confirmation (accept) primitive
            Action::Ae3 => match event {
                Event::AssociateAcReceived(ac) => (
                    State::Sta6,
                    vec![
                        Effect::StopTimer,
                        Effect::Deliver(Indication::AssociateAccepted(ac)),
                    ],
                ),
                other => self.invalid_event(other.kind()),
            },
            // Issue A-ASSOCIATE confirmation (reject) primitive and close transport connection
            Action::Ae4 => match event {
                Event::AssociateRjReceived(rj) => (
                    State::Sta1,
                    vec![
                        Effect::StopTimer,
                        Effect::Deliver(Indication::AssociateRejected(rj)),
                        Effect::CloseTransport,
                    ],
                ),
                other => self.invalid_event(other.kind()),
            },
            // Issue Transport connection response primitive; start ARTIM timer
            Action::Ae5 => (State::Sta2, vec![Effect::StartTimer]),
            // Stop ARTIM timer and if A-ASSOCIATE-RQ acceptable by service-provider,
            // issue A-ASSOCIATE indication primitive,
            // otherwise issue A-ASSOCIATE-RJ-PDU and start ARTIM timer
            Action::Ae6 => match event {
                Event::AssociateRqReceived(rq) if rq.protocol_version & 0x0001 != 0 => (
                    State::Sta3,
                    vec![
                        Effect::StopTimer,
                        Effect::Deliver(Indication::AssociateRequest(rq)),
                    ],
                ),
                Event::AssociateRqReceived(rq) => {
                    warn!(
                        "Protocol version {:#06x} not supported, rejecting",
                        rq.protocol_version
                    );
                    (
                        State::Sta13,
                        vec![
                            Effect::StopTimer,
                            Effect::Send(Pdu::AssociationRJ(AssociationRJ {
                                result: AssociationRJResult::Permanent,
                                source: AssociationRJSource::ServiceProviderASCE(
                                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                                ),
                            })),
                            Effect::StartTimer,
                        ],
                    )
                }
                other => self.invalid_event(other.kind()),
            },
            // Send A-ASSOCIATE-AC PDU
            Action::Ae7 => match event {
                Event::AssociateAccept(ac) => {
                    (State::Sta6, vec![Effect::Send(Pdu::AssociationAC(ac))])
                }
                other => self.invalid_event(other.kind()),
            },
            // Send A-ASSOCIATE-RJ PDU and start ARTIM timer
            Action::Ae8 => match event {
                Event::AssociateReject(rj) => (
                    State::Sta13,
                    vec![Effect::Send(Pdu::AssociationRJ(rj)), Effect::StartTimer],
                ),
                other => self.invalid_event(other.kind()),
            },
            // Send P-DATA-TF PDU
            Action::Dt1 | Action::Ar7 => match event {
                Event::PDataRequest(data) => {
                    let next = if action == Action::Dt1 {
                        State::Sta6
                    } else {
                        State::Sta8
                    };
                    (next, vec![Effect::Send(Pdu::PData { data })])
                }
                other => self.invalid_event(other.kind()),
            },
            // Issue P-DATA indication primitive
            Action::Dt2 | Action::Ar6 => match event {
                Event::PDataReceived(data) => {
                    let next = if action == Action::Dt2 {
                        State::Sta6
                    } else {
                        State::Sta7
                    };
                    (next, vec![Effect::Deliver(Indication::Data(data))])
                }
                other => self.invalid_event(other.kind()),
            },
            // Send A-RELEASE-RQ PDU
            Action::Ar1 => (
                State::Sta7,
                vec![Effect::Send(Pdu::ReleaseRQ), Effect::StartTimer],
            ),
            // Issue A-RELEASE indication primitive
            Action::Ar2 => (
                State::Sta8,
                vec![Effect::Deliver(Indication::ReleaseRequested)],
            ),
            // Issue A-RELEASE confirmation primitive, and close transport connection
            Action::Ar3 => (
                State::Sta1,
                vec![
                    Effect::StopTimer,
                    Effect::Deliver(Indication::ReleaseConfirmed),
                    Effect::CloseTransport,
                ],
            ),
            // Issue A-RELEASE-RP PDU and start ARTIM timer
            Action::Ar4 => (
                State::Sta13,
                vec![Effect::Send(Pdu::ReleaseRP), Effect::StartTimer],
            ),
            // Stop ARTIM timer
            Action::Ar5 | Action::Aa5 => (State::Sta1, vec![Effect::StopTimer]),
            // Issue A-RELEASE indication (release collision)
            Action::Ar8 => {
                let next = if self.requestor {
                    State::Sta9
                } else {
                    State::Sta10
                };
                (next, vec![Effect::Deliver(Indication::ReleaseRequested)])
            }
            // Send A-RELEASE-RP PDU
            Action::Ar9 => (State::Sta11, vec![Effect::Send(Pdu::ReleaseRP)]),
            // Issue A-RELEASE confirmation primitive
            Action::Ar10 => (
                State::Sta12,
                vec![Effect::Deliver(Indication::ReleaseConfirmed)],
            ),
            // Send A-ABORT PDU and start (or restart if already started) ARTIM timer
            Action::Aa1 => {
                let source = match event {
                    Event::AbortRequest(source) => source,
                    _ => AbortRQSource::ServiceProvider(provider_reason(kind)),
                };
                (
                    State::Sta13,
                    vec![Effect::Send(Pdu::AbortRQ { source }), Effect::StartTimer],
                )
            }
            // Stop ARTIM timer if running. Close transport connection
            Action::Aa2 => (State::Sta1, vec![Effect::StopTimer, Effect::CloseTransport]),
            // Issue A-ABORT indication and close transport connection
            Action::Aa3 => match event {
                Event::AbortReceived(source) => (
                    State::Sta1,
                    vec![
                        Effect::StopTimer,
                        Effect::Deliver(Indication::Aborted(AbortReason::Peer(source))),
                        Effect::CloseTransport,
                    ],
                ),
                other => self.invalid_event(other.kind()),
            },
            // Issue A-P-ABORT indication primitive
            Action::Aa4 => (
                State::Sta1,
                vec![
                    Effect::StopTimer,
                    Effect::Deliver(Indication::Aborted(AbortReason::TransportClosed)),
                ],
            ),
            // Ignore PDU
            Action::Aa6 => (State::Sta13, vec![]),
            // Send A-ABORT PDU
            Action::Aa7 => (
                State::Sta13,
                vec![Effect::Send(Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(provider_reason(kind)),
                })],
            ),
            // Send A-ABORT PDU (service-provider source), issue an A-P-ABORT indication,
            // and start ARTIM timer
            Action::Aa8 => {
                let reason = if kind == EventKind::Evt19 {
                    AbortReason::MalformedPdu
                } else {
                    AbortReason::UnexpectedEvent {
                        state: self.state,
                        event: kind,
                    }
                };
                (
                    State::Sta13,
                    vec![
                        Effect::Send(Pdu::AbortRQ {
                            source: AbortRQSource::ServiceProvider(provider_reason(kind)),
                        }),
                        Effect::Deliver(Indication::Aborted(reason)),
                        Effect::StartTimer,
                    ],
                )
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state(state: State, requestor: bool) -> Self {
        StateMachine {
            state,
            requestor,
            pending_request: None,
        }
    }
}

fn provider_reason(event: EventKind) -> AbortRQServiceProviderReason {
    match event {
        EventKind::Evt19 => AbortRQServiceProviderReason::UnrecognizedPdu,
        EventKind::Evt3
        | EventKind::Evt4
        | EventKind::Evt6
        | EventKind::Evt10
        | EventKind::Evt12
        | EventKind::Evt13
        | EventKind::Evt16 => AbortRQServiceProviderReason::UnexpectedPdu,
        _ => AbortRQServiceProviderReason::ReasonNotSpecified,
    }
}
