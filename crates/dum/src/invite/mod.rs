//! Invite session, the offer/answer state machine of a call.
//!
//! [RFC3264]: https://tools.ietf.org/html/rfc3264
//! [RFC4028]: https://tools.ietf.org/html/rfc4028
//!
//! One [`InviteSession`] lives in a dialog and plays either role. The UAC
//! and UAS specific states of the initial INVITE are handled in `client`
//! and `server`, everything from `Connected` on is shared.

mod client;
mod server;

use std::time::Duration;

use ahash::AHashMap;
use rand::Rng;

use crate::{
    Error, InviteSessionHandle,
    dialog::DialogInner,
    message::{Method, Refresher, Sdp, SessionExpires, SipMessage},
    profile::Profile,
    timer::{STALE_REINVITE, T1, T2, TIMER_H, Target, TimerKind},
    usage_manager::Context,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    Connected,
    SentUpdate,
    SentUpdateGlare,
    SentReinvite,
    SentReinviteGlare,
    SentReinviteNoOffer,
    /// Offer received in the 2xx to an offerless re-INVITE.
    SentReinviteAnswered,
    SentReinviteNoOfferGlare,
    ReceivedUpdate,
    ReceivedReinvite,
    ReceivedReinviteNoOffer,
    ReceivedReinviteSentOffer,
    /// 2xx to a re-INVITE sent, waiting for the ACK.
    Answered,
    WaitingToOffer,
    WaitingToRequestOffer,
    WaitingToTerminate,
    WaitingToHangup,
    Terminated,
    UacStart,
    UacEarly,
    /// Offer received in the 2xx to an offerless INVITE.
    UacAnswered,
    UacCancelled,
    UasStart,
    UasOffer,
    UasOfferProvidedAnswer,
    UasEarlyOffer,
    UasEarlyProvidedAnswer,
    UasNoOffer,
    UasProvidedOffer,
    UasEarlyNoOffer,
    UasEarlyProvidedOffer,
    UasAccepted,
    UasAcceptedWaitingAnswer,
    UasWaitingToOffer,
    UasWaitingToRequestOffer,
    UasWaitingToHangup,
}

impl InviteState {
    fn is_uac_initial(&self) -> bool {
        matches!(
            self,
            Self::UacStart | Self::UacEarly | Self::UacAnswered | Self::UacCancelled
        )
    }

    fn is_uas_initial(&self) -> bool {
        matches!(
            self,
            Self::UasStart
                | Self::UasOffer
                | Self::UasOfferProvidedAnswer
                | Self::UasEarlyOffer
                | Self::UasEarlyProvidedAnswer
                | Self::UasNoOffer
                | Self::UasProvidedOffer
                | Self::UasEarlyNoOffer
                | Self::UasEarlyProvidedOffer
                | Self::UasAccepted
                | Self::UasAcceptedWaitingAnswer
                | Self::UasWaitingToOffer
                | Self::UasWaitingToRequestOffer
                | Self::UasWaitingToHangup
        )
    }

    /// UAS states before the final response to the initial INVITE.
    fn is_uas_early(&self) -> bool {
        matches!(
            self,
            Self::UasStart
                | Self::UasOffer
                | Self::UasOfferProvidedAnswer
                | Self::UasEarlyOffer
                | Self::UasEarlyProvidedAnswer
                | Self::UasNoOffer
                | Self::UasProvidedOffer
                | Self::UasEarlyNoOffer
                | Self::UasEarlyProvidedOffer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatedReason {
    Error,
    Timeout,
    Rejected,
    LocalBye,
    RemoteBye,
    LocalCancel,
    RemoteCancel,
}

/// Which side holds an offer that has not been answered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOffer {
    None,
    Local,
    Remote,
}

enum Event<'a> {
    Invite(Option<&'a Sdp>),
    Update(Option<&'a Sdp>),
    Ack(Option<&'a Sdp>),
    Bye,
    Cancel,
    Info,
    Message,
    Prack,
    Provisional(Option<&'a Sdp>),
    Success(Option<&'a Sdp>),
    /// 491
    Glare,
    /// 481 or 408
    Fatal,
    /// 422
    IntervalTooSmall,
    Failure,
    Other,
}

fn classify(msg: &SipMessage) -> Event<'_> {
    let sdp = msg.sdp();

    match msg.code() {
        None => match msg.method() {
            Method::Invite => Event::Invite(sdp),
            Method::Update => Event::Update(sdp),
            Method::Ack => Event::Ack(sdp),
            Method::Bye => Event::Bye,
            Method::Cancel => Event::Cancel,
            Method::Info => Event::Info,
            Method::Message => Event::Message,
            Method::Prack => Event::Prack,
            _ => Event::Other,
        },
        Some(code) if matches!(msg.cseq.method, Method::Invite | Method::Update) => match code {
            101..=199 => Event::Provisional(sdp),
            200..=299 => Event::Success(sdp),
            491 => Event::Glare,
            408 | 481 => Event::Fatal,
            422 => Event::IntervalTooSmall,
            300.. => Event::Failure,
            _ => Event::Other,
        },
        Some(_) => Event::Other,
    }
}

/// Session-Expires, Min-SE and Supported of a session refreshing request.
pub(crate) fn add_session_timer(request: &mut SipMessage, profile: &Profile, min_se: u32) {
    if profile.session_expires == 0 {
        return;
    }

    let min_se = min_se.max(profile.min_se);
    request.supported.push("timer".to_string());
    request.session_expires = Some(SessionExpires {
        interval: profile.session_expires.max(min_se),
        refresher: None,
    });

    request.min_se = Some(min_se);
}

pub(crate) fn allow(profile: &Profile) -> Vec<Method> {
    let mut allow = vec![
        Method::Invite,
        Method::Ack,
        Method::Cancel,
        Method::Bye,
        Method::Info,
        Method::Message,
    ];

    if profile.allow_update {
        allow.push(Method::Update);
    }

    allow
}

#[derive(Debug, Default)]
struct SessionTimer {
    /// Seconds, below 90 means no session timer.
    interval: u32,
    local_refresher: bool,
    min_se: u32,
    seq: u32,
}

pub struct InviteSession {
    handle: InviteSessionHandle,
    role: Role,
    state: InviteState,
    current_local_sdp: Option<Sdp>,
    current_remote_sdp: Option<Sdp>,
    proposed_local_sdp: Option<Sdp>,
    proposed_remote_sdp: Option<Sdp>,
    queued_offer: Option<Sdp>,
    /// The initial INVITE, as sent by the UAC or received by the UAS.
    invite: SipMessage,
    /// Received INVITE or UPDATE that has not been answered.
    pending_request: Option<SipMessage>,
    /// 2xx carrying an offer, acknowledged once the answer is provided.
    answered: Option<SipMessage>,
    /// Outstanding re-INVITE or UPDATE of this side.
    last_local_request: Option<SipMessage>,
    pending_nit: Option<SipMessage>,
    outstanding_nit: Option<Method>,
    /// 2xx to INVITE retransmitted until acknowledged, by CSeq.
    retransmits: AHashMap<u32, SipMessage>,
    /// ACK sent for a 2xx, by INVITE transaction id.
    acks: AHashMap<String, SipMessage>,
    timer: SessionTimer,
    stale_seq: u32,
    stale_call_seq: u32,
    peer_supports_update: bool,
}

impl InviteSession {
    pub(crate) fn new(
        handle: InviteSessionHandle,
        role: Role,
        invite: SipMessage,
        cancelled: bool,
    ) -> Self {
        let state = match role {
            Role::Uac if cancelled => InviteState::UacCancelled,
            Role::Uac => InviteState::UacStart,
            Role::Uas => InviteState::UasStart,
        };

        Self {
            proposed_local_sdp: match role {
                Role::Uac => invite.sdp().cloned(),
                Role::Uas => None,
            },
            peer_supports_update: invite.allow.contains(&Method::Update),
            current_local_sdp: None,
            current_remote_sdp: None,
            proposed_remote_sdp: None,
            queued_offer: None,
            pending_request: None,
            answered: None,
            last_local_request: None,
            pending_nit: None,
            outstanding_nit: None,
            retransmits: AHashMap::new(),
            acks: AHashMap::new(),
            timer: SessionTimer::default(),
            stale_seq: 0,
            stale_call_seq: 0,
            invite,
            handle,
            state,
            role,
        }
    }

    pub fn handle(&self) -> InviteSessionHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> InviteState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == InviteState::Terminated
    }

    pub fn local_sdp(&self) -> Option<&Sdp> {
        self.current_local_sdp.as_ref()
    }

    pub fn remote_sdp(&self) -> Option<&Sdp> {
        self.current_remote_sdp.as_ref()
    }

    pub fn pending_offer(&self) -> PendingOffer {
        use InviteState::*;

        match self.state {
            SentReinvite
            | SentReinviteGlare
            | ReceivedReinviteSentOffer
            | WaitingToOffer
            | UasProvidedOffer
            | UasEarlyProvidedOffer
            | UasAcceptedWaitingAnswer
            | UasWaitingToOffer => PendingOffer::Local,
            SentUpdate | SentUpdateGlare | UacStart | UacEarly
                if self.proposed_local_sdp.is_some() =>
            {
                PendingOffer::Local
            }
            ReceivedUpdate
            | ReceivedReinvite
            | SentReinviteAnswered
            | UacAnswered
            | UasOffer
            | UasOfferProvidedAnswer
            | UasEarlyOffer
            | UasEarlyProvidedAnswer => PendingOffer::Remote,
            _ => PendingOffer::None,
        }
    }

    fn transition(&mut self, state: InviteState) {
        log::debug!(
            "invite session transition: handle={:?}, {:?} -> {state:?}",
            self.handle,
            self.state
        );

        self.state = state;
    }

    fn target(dialog: &DialogInner) -> Target {
        Target::Dialog(dialog.id.clone())
    }

    /// Promote the negotiated descriptions and clear both proposals.
    fn commit(&mut self, local: Option<Sdp>, remote: Option<Sdp>) {
        if local.is_some() {
            self.current_local_sdp = local;
        }

        if remote.is_some() {
            self.current_remote_sdp = remote;
        }

        self.proposed_local_sdp = None;
        self.proposed_remote_sdp = None;
    }

    pub(crate) fn dispatch(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        if !msg.allow.is_empty() {
            self.peer_supports_update = msg.allow.contains(&Method::Update);
        }

        if let Some(code) = msg.code() {
            match msg.cseq.method {
                Method::Info | Method::Message => {
                    return self.dispatch_nit_response(dialog, ctx, msg);
                }
                Method::Bye | Method::Prack | Method::Cancel => return,
                Method::Invite if (200..300).contains(&code) => {
                    if let Some(ack) = msg.transaction_id().and_then(|it| self.acks.get(it)) {
                        log::debug!("invite 2xx retransmission, resend ack: handle={:?}", self.handle);

                        ctx.send(ack.clone());
                        return;
                    }
                }
                _ => (),
            }
        }

        match self.state {
            InviteState::Terminated => self.dispatch_terminated(dialog, ctx, msg),
            state if state.is_uac_initial() => self.dispatch_client(dialog, ctx, msg),
            state if state.is_uas_initial() => self.dispatch_server(dialog, ctx, msg),
            _ => self.dispatch_connected(dialog, ctx, msg),
        }
    }

    fn dispatch_terminated(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        match msg.code() {
            None if msg.method() == Method::Bye => ctx.send(dialog.make_response(msg, 200)),
            None if msg.method() != Method::Ack => ctx.send(dialog.make_response(msg, 481)),
            _ => (),
        }
    }

    fn dispatch_connected(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        use InviteState::*;

        match (self.state, classify(msg)) {
            (Connected, Event::Invite(offer)) => {
                if !self.check_session_interval(dialog, ctx, msg) {
                    return;
                }

                self.timer_from_request(ctx.profile, msg);
                self.pending_request = Some(msg.clone());

                match offer {
                    Some(sdp) => {
                        self.proposed_remote_sdp = Some(sdp.clone());
                        self.transition(ReceivedReinvite);
                        ctx.handlers.invite.on_offer(self.handle, msg, sdp);
                    }
                    None => {
                        self.transition(ReceivedReinviteNoOffer);
                        ctx.handlers.invite.on_offer_required(self.handle, msg);
                    }
                }
            }
            (Connected, Event::Update(offer)) => {
                if !self.check_session_interval(dialog, ctx, msg) {
                    return;
                }

                self.timer_from_request(ctx.profile, msg);

                match offer {
                    Some(sdp) => {
                        self.pending_request = Some(msg.clone());
                        self.proposed_remote_sdp = Some(sdp.clone());
                        self.transition(ReceivedUpdate);
                        ctx.handlers.invite.on_offer(self.handle, msg, sdp);
                    }
                    None => {
                        let mut response = dialog.make_response(msg, 200);
                        self.add_timer_to_response(&mut response, msg);
                        ctx.send(response);

                        self.start_session_timer(dialog, ctx);
                    }
                }
            }
            (
                ReceivedUpdate | ReceivedReinvite | ReceivedReinviteNoOffer,
                Event::Invite(_) | Event::Update(_),
            ) => {
                let mut response = dialog.make_response(msg, 500);
                response.retry_after = Some(rand::rng().random_range(0..10));
                ctx.send(response);
            }
            (_, Event::Invite(_) | Event::Update(_)) => {
                log::info!("invite session glare: handle={:?}, state={:?}", self.handle, self.state);

                ctx.send(dialog.make_response(msg, 491));
            }
            (_, Event::Ack(sdp)) => self.on_ack(dialog, ctx, msg, sdp),
            (ReceivedUpdate | ReceivedReinvite | ReceivedReinviteNoOffer, Event::Bye) => {
                if let Some(pending) = self.pending_request.take() {
                    ctx.send(dialog.make_response(&pending, 487));
                }

                self.dispatch_others(dialog, ctx, msg);
            }
            (_, Event::Bye | Event::Cancel | Event::Info | Event::Message | Event::Prack) => {
                self.dispatch_others(dialog, ctx, msg);
            }
            (_, Event::Provisional(_)) => (),
            (_, Event::Success(sdp)) => self.on_modify_success(dialog, ctx, msg, sdp),
            (_, Event::Glare) => self.on_glare(dialog, ctx, msg),
            (_, Event::Fatal) => self.on_fatal(dialog, ctx, msg),
            (_, Event::IntervalTooSmall) => match msg.min_se {
                Some(min_se) if self.is_last_local_request(msg) => {
                    self.timer.min_se = self.timer.min_se.max(min_se);
                    self.resend_modification(dialog, ctx);
                }
                _ => self.on_modify_failure(dialog, ctx, msg),
            },
            (_, Event::Failure) => self.on_modify_failure(dialog, ctx, msg),
            (_, Event::Other) => {
                log::debug!(
                    "invite session ignored message: handle={:?}, method={}, state={:?}",
                    self.handle,
                    msg.method(),
                    self.state
                );
            }
        }
    }

    /// BYE, CANCEL, INFO, MESSAGE and PRACK requests, in any state.
    fn dispatch_others(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        match msg.method() {
            Method::Bye => {
                ctx.send(dialog.make_response(msg, 200));
                self.terminate(dialog, ctx, TerminatedReason::RemoteBye, Some(msg));
            }
            Method::Cancel => {
                ctx.send(dialog.make_response(msg, 200));
                self.send_bye(dialog, ctx, TerminatedReason::RemoteCancel, Some(msg));
            }
            Method::Prack => {
                ctx.send(dialog.make_response(msg, 481));
                self.send_bye(dialog, ctx, TerminatedReason::Error, Some(msg));
            }
            Method::Info | Method::Message => {
                if self.pending_nit.is_some() {
                    let mut response = dialog.make_response(msg, 500);
                    response.retry_after = Some(rand::rng().random_range(0..10));
                    ctx.send(response);
                    return;
                }

                self.pending_nit = Some(msg.clone());

                if msg.method() == Method::Info {
                    ctx.handlers.invite.on_info(self.handle, msg);
                } else {
                    ctx.handlers.invite.on_message(self.handle, msg);
                }
            }
            _ => (),
        }
    }

    fn dispatch_nit_response(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        let Some(code) = msg.code().filter(|it| *it >= 200) else {
            return;
        };

        if self.outstanding_nit != Some(msg.cseq.method) {
            return;
        }

        self.outstanding_nit = None;

        match (msg.cseq.method, code) {
            (_, 408 | 481) => self.on_fatal(dialog, ctx, msg),
            (Method::Info, 200..300) => ctx.handlers.invite.on_info_success(self.handle, msg),
            (Method::Info, _) => ctx.handlers.invite.on_info_failure(self.handle, msg),
            (_, 200..300) => ctx.handlers.invite.on_message_success(self.handle, msg),
            _ => ctx.handlers.invite.on_message_failure(self.handle, msg),
        }
    }

    fn is_last_local_request(&self, response: &SipMessage) -> bool {
        self.last_local_request
            .as_ref()
            .is_some_and(|it| it.cseq == response.cseq)
    }

    fn on_modify_success(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        msg: &SipMessage,
        sdp: Option<&Sdp>,
    ) {
        use InviteState::*;

        let is_invite = msg.cseq.method == Method::Invite;
        if !self.is_last_local_request(msg) {
            log::debug!("invite session stray 2xx: handle={:?}, cseq={}", self.handle, msg.cseq.seq);

            return;
        }

        self.last_local_request = None;
        self.stale_seq += 1;
        self.timer_from_response(msg);

        match self.state {
            SentReinvite => {
                self.send_ack(dialog, ctx, msg, None);

                match sdp {
                    Some(answer) => {
                        let offer = self.proposed_local_sdp.take();
                        self.commit(offer, Some(answer.clone()));
                        self.transition(Connected);
                        self.start_session_timer(dialog, ctx);
                        ctx.handlers.invite.on_answer(self.handle, msg, answer);
                    }
                    None => {
                        self.proposed_local_sdp = None;
                        self.transition(Connected);
                        self.start_session_timer(dialog, ctx);
                        ctx.handlers.invite.on_illegal_negotiation(self.handle, msg);
                    }
                }
            }
            SentReinviteNoOffer => match sdp {
                Some(offer) => {
                    self.proposed_remote_sdp = Some(offer.clone());
                    self.answered = Some(msg.clone());
                    self.transition(SentReinviteAnswered);
                    ctx.handlers.invite.on_offer(self.handle, msg, offer);
                }
                None => {
                    self.send_ack(dialog, ctx, msg, None);
                    self.transition(Connected);
                    self.start_session_timer(dialog, ctx);
                    ctx.handlers.invite.on_illegal_negotiation(self.handle, msg);
                }
            },
            SentUpdate => {
                match (self.proposed_local_sdp.take(), sdp) {
                    (Some(offer), Some(answer)) => {
                        self.commit(Some(offer), Some(answer.clone()));
                        self.transition(Connected);
                        ctx.handlers.invite.on_answer(self.handle, msg, answer);
                    }
                    (None, None) => self.transition(Connected),
                    _ => {
                        self.transition(Connected);
                        ctx.handlers.invite.on_illegal_negotiation(self.handle, msg);
                    }
                }

                self.start_session_timer(dialog, ctx);
            }
            WaitingToTerminate => {
                if is_invite {
                    self.send_ack(dialog, ctx, msg, None);
                }

                self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            _ => {
                if is_invite {
                    self.send_ack(dialog, ctx, msg, None);
                }
            }
        }
    }

    fn on_modify_failure(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        use InviteState::*;

        if !self.is_last_local_request(msg) {
            return;
        }

        self.last_local_request = None;
        self.stale_seq += 1;

        match self.state {
            SentUpdate | SentReinvite | SentReinviteNoOffer => {
                self.proposed_local_sdp = None;
                self.transition(Connected);
                ctx.handlers.invite.on_offer_rejected(self.handle, Some(msg));
            }
            WaitingToTerminate => {
                self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            _ => (),
        }
    }

    fn on_glare(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        use InviteState::*;

        if !self.is_last_local_request(msg) {
            return;
        }

        let next = match self.state {
            SentUpdate => SentUpdateGlare,
            SentReinvite => SentReinviteGlare,
            SentReinviteNoOffer => SentReinviteNoOfferGlare,
            WaitingToTerminate => {
                return self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            _ => return,
        };

        // The owner of the Call-ID waits 2.1 to 4 seconds, the other side
        // 0 to 2 seconds, both in units of 10 ms.
        let delay = match self.role {
            Role::Uac => rand::rng().random_range(210..=400),
            Role::Uas => rand::rng().random_range(0..=200),
        };

        self.stale_seq += 1;
        self.transition(next);
        ctx.schedule(
            Duration::from_millis(delay * 10),
            Self::target(dialog),
            TimerKind::Glare,
        );
    }

    fn on_fatal(&mut self, dialog: &mut DialogInner, ctx: &mut Context, msg: &SipMessage) {
        log::warn!(
            "invite session fatal response: handle={:?}, code={:?}, method={}",
            self.handle,
            msg.code(),
            msg.cseq.method
        );

        if msg.code() == Some(408) {
            self.send_bye(dialog, ctx, TerminatedReason::Error, Some(msg));
        } else {
            self.terminate(dialog, ctx, TerminatedReason::Error, Some(msg));
        }
    }

    fn on_ack(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        msg: &SipMessage,
        sdp: Option<&Sdp>,
    ) {
        use InviteState::*;

        if self.retransmits.remove(&msg.cseq.seq).is_none() {
            log::debug!("invite session stray ack: handle={:?}, cseq={}", self.handle, msg.cseq.seq);

            return;
        }

        match self.state {
            Answered => {
                self.transition(Connected);
                ctx.handlers.invite.on_ack_received(self.handle, msg);
            }
            ReceivedReinviteSentOffer => match sdp {
                Some(answer) => {
                    let offer = self.proposed_local_sdp.take();
                    self.commit(offer, Some(answer.clone()));
                    self.transition(Connected);
                    ctx.handlers.invite.on_answer(self.handle, msg, answer);
                }
                None => {
                    self.proposed_local_sdp = None;
                    self.transition(Connected);
                    ctx.handlers.invite.on_illegal_negotiation(self.handle, msg);
                }
            },
            WaitingToOffer | WaitingToRequestOffer => {
                self.transition(Connected);
                ctx.handlers.invite.on_ack_received(self.handle, msg);
                self.send_queued(dialog, ctx);
            }
            WaitingToHangup | UasWaitingToHangup => {
                self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            UasAccepted => {
                self.transition(Connected);
                ctx.handlers.invite.on_connected(self.handle, msg);
            }
            UasAcceptedWaitingAnswer => match sdp {
                Some(answer) => {
                    let offer = self.proposed_local_sdp.take();
                    self.commit(offer, Some(answer.clone()));
                    self.transition(Connected);
                    self.start_session_timer(dialog, ctx);
                    ctx.handlers.invite.on_answer(self.handle, msg, answer);
                    ctx.handlers.invite.on_connected(self.handle, msg);
                }
                None => {
                    ctx.handlers.invite.on_illegal_negotiation(self.handle, msg);
                    self.send_bye(dialog, ctx, TerminatedReason::Error, Some(msg));
                }
            },
            UasWaitingToOffer | UasWaitingToRequestOffer => {
                self.transition(Connected);
                ctx.handlers.invite.on_connected(self.handle, msg);
                self.send_queued(dialog, ctx);
            }
            _ => ctx.handlers.invite.on_ack_received(self.handle, msg),
        }
    }

    /// Offer or offer request postponed until the previous 2xx was
    /// acknowledged.
    fn send_queued(&mut self, dialog: &mut DialogInner, ctx: &mut Context) {
        let offer = self.queued_offer.take();
        self.send_reinvite(dialog, ctx, offer);
    }

    pub(crate) fn on_timer(&mut self, dialog: &mut DialogInner, ctx: &mut Context, kind: &TimerKind) {
        use InviteState::*;

        match kind {
            TimerKind::Retransmit200 { cseq, interval } => {
                if let Some(response) = self.retransmits.get(cseq) {
                    ctx.send(response.clone());

                    let interval = (*interval * 2).min(T2);
                    ctx.schedule(
                        interval,
                        Self::target(dialog),
                        TimerKind::Retransmit200 {
                            cseq: *cseq,
                            interval,
                        },
                    );
                }
            }
            TimerKind::WaitForAck { cseq } => {
                if self.retransmits.remove(cseq).is_none() {
                    return;
                }

                match self.state {
                    WaitingToHangup | UasWaitingToHangup => {
                        self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
                    }
                    ReceivedReinviteSentOffer => {
                        self.proposed_local_sdp = None;
                        self.transition(Connected);
                        ctx.handlers.invite.on_offer_rejected(self.handle, None);
                    }
                    WaitingToOffer | WaitingToRequestOffer => {
                        self.transition(Connected);
                        self.send_queued(dialog, ctx);
                    }
                    Terminated => (),
                    _ => {
                        ctx.handlers.invite.on_ack_not_received(self.handle);
                        self.send_bye(dialog, ctx, TerminatedReason::Timeout, None);
                    }
                }
            }
            TimerKind::CanDiscardAck { tid } => {
                self.acks.remove(tid);
            }
            TimerKind::Glare => {
                let next = match self.state {
                    SentUpdateGlare => SentUpdate,
                    SentReinviteGlare => SentReinvite,
                    SentReinviteNoOfferGlare => SentReinviteNoOffer,
                    _ => return,
                };

                self.transition(next);
                self.resend_modification(dialog, ctx);
            }
            TimerKind::StaleReInvite { seq } => {
                if *seq != self.stale_seq {
                    return;
                }

                match self.state {
                    WaitingToTerminate => {
                        self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
                    }
                    SentReinvite | SentReinviteNoOffer => {
                        self.last_local_request = None;
                        self.proposed_local_sdp = None;
                        self.transition(Connected);
                        ctx.handlers.invite.on_stale_reinvite_timeout(self.handle);
                    }
                    _ => (),
                }
            }
            TimerKind::SessionExpiration { seq } => {
                if *seq == self.timer.seq && self.state != Terminated {
                    ctx.handlers.invite.on_session_expired(self.handle);
                    self.send_bye(dialog, ctx, TerminatedReason::Timeout, None);
                }
            }
            TimerKind::SessionRefresh { seq } => {
                if *seq == self.timer.seq && self.state == Connected {
                    if self.peer_supports_update && ctx.profile.allow_update {
                        self.send_update(dialog, ctx, None);
                    } else {
                        let offer = self.current_local_sdp.clone();
                        self.send_reinvite(dialog, ctx, offer);
                    }
                }
            }
            TimerKind::StaleCall { seq } => {
                if *seq == self.stale_call_seq && matches!(self.state, UacStart | UacEarly) {
                    ctx.send(crate::message::make_cancel(&self.invite));
                    self.terminate(dialog, ctx, TerminatedReason::Timeout, None);
                }
            }
            TimerKind::Cancelled => {
                if self.state == UacCancelled {
                    self.terminate(dialog, ctx, TerminatedReason::LocalCancel, None);
                }
            }
            _ => (),
        }
    }

    fn send_reinvite(&mut self, dialog: &mut DialogInner, ctx: &mut Context, offer: Option<Sdp>) {
        let mut invite = dialog.make_request(Method::Invite);
        add_session_timer(&mut invite, ctx.profile, self.timer.min_se);
        invite.allow = allow(ctx.profile);
        invite.body = offer.clone().into();

        self.transition(if offer.is_some() {
            InviteState::SentReinvite
        } else {
            InviteState::SentReinviteNoOffer
        });

        self.proposed_local_sdp = offer;
        self.stale_seq += 1;
        ctx.schedule(
            STALE_REINVITE,
            Self::target(dialog),
            TimerKind::StaleReInvite {
                seq: self.stale_seq,
            },
        );

        self.last_local_request = Some(invite.clone());
        ctx.send(invite);
    }

    fn send_update(&mut self, dialog: &mut DialogInner, ctx: &mut Context, offer: Option<Sdp>) {
        let mut update = dialog.make_request(Method::Update);
        add_session_timer(&mut update, ctx.profile, self.timer.min_se);
        update.body = offer.clone().into();

        self.transition(InviteState::SentUpdate);
        self.proposed_local_sdp = offer;
        self.last_local_request = Some(update.clone());
        ctx.send(update);
    }

    /// Send the outstanding re-INVITE or UPDATE again as a new transaction,
    /// after glare or a 422.
    fn resend_modification(&mut self, dialog: &mut DialogInner, ctx: &mut Context) {
        let Some(last) = self.last_local_request.take() else {
            return;
        };

        let method = last.method();
        let mut request = dialog.make_request(method);
        add_session_timer(&mut request, ctx.profile, self.timer.min_se);
        request.allow = last.allow;
        request.body = last.body;

        if method == Method::Invite {
            self.stale_seq += 1;
            ctx.schedule(
                STALE_REINVITE,
                Self::target(dialog),
                TimerKind::StaleReInvite {
                    seq: self.stale_seq,
                },
            );
        }

        self.last_local_request = Some(request.clone());
        ctx.send(request);
    }

    fn send_2xx(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        request: &SipMessage,
        code: u16,
        sdp: Option<Sdp>,
    ) {
        let mut response = dialog.make_response(request, code);
        response.allow = allow(ctx.profile);
        response.body = sdp.into();
        self.add_timer_to_response(&mut response, request);

        let cseq = request.cseq.seq;
        self.retransmits.insert(cseq, response.clone());

        ctx.schedule(
            T1,
            Self::target(dialog),
            TimerKind::Retransmit200 {
                interval: T1,
                cseq,
            },
        );

        ctx.schedule(TIMER_H, Self::target(dialog), TimerKind::WaitForAck { cseq });
        ctx.send(response);
    }

    fn send_ack(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        response: &SipMessage,
        sdp: Option<Sdp>,
    ) {
        let mut ack = dialog.make_ack(response.cseq.seq);
        ack.body = sdp.into();

        if let Some(tid) = response.transaction_id() {
            self.acks.insert(tid.to_string(), ack.clone());
            ctx.schedule(
                TIMER_H,
                Self::target(dialog),
                TimerKind::CanDiscardAck {
                    tid: tid.to_string(),
                },
            );
        }

        ctx.send(ack);
    }

    fn send_bye(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        reason: TerminatedReason,
        msg: Option<&SipMessage>,
    ) {
        ctx.send(dialog.make_request(Method::Bye));
        self.terminate(dialog, ctx, reason, msg);
    }

    fn terminate(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        reason: TerminatedReason,
        msg: Option<&SipMessage>,
    ) {
        if self.state == InviteState::Terminated {
            return;
        }

        self.transition(InviteState::Terminated);
        self.retransmits.clear();
        self.pending_request = None;
        self.last_local_request = None;
        self.timer.seq += 1;

        ctx.handlers.invite.on_terminated(self.handle, reason, msg);
        ctx.schedule(TIMER_H, Self::target(dialog), TimerKind::Reap);
    }

    fn timer_from_response(&mut self, response: &SipMessage) {
        match response.session_expires {
            Some(it) if it.interval >= 90 => {
                self.timer.interval = it.interval;
                self.timer.local_refresher = it.refresher != Some(Refresher::Uas);
            }
            _ => self.timer.interval = 0,
        }
    }

    fn timer_from_request(&mut self, profile: &Profile, request: &SipMessage) {
        match request.session_expires {
            Some(it) => {
                self.timer.interval = it.interval;
                self.timer.local_refresher = match it.refresher {
                    Some(Refresher::Uas) => true,
                    Some(Refresher::Uac) => false,
                    None => !request.supports("timer"),
                };
            }
            None if profile.session_expires > 0 => {
                self.timer.interval = profile.session_expires;
                self.timer.local_refresher = true;
            }
            None => self.timer.interval = 0,
        }
    }

    fn add_timer_to_response(&self, response: &mut SipMessage, request: &SipMessage) {
        if self.timer.interval < 90 {
            return;
        }

        response.session_expires = Some(SessionExpires {
            interval: self.timer.interval,
            refresher: Some(if self.timer.local_refresher {
                Refresher::Uas
            } else {
                Refresher::Uac
            }),
        });

        if request.supports("timer") {
            response.require.push("timer".to_string());
        }
    }

    /// Answer 422 to a session interval below the local minimum.
    fn check_session_interval(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        request: &SipMessage,
    ) -> bool {
        match request.session_expires {
            Some(it) if it.interval < ctx.profile.min_se => {
                let mut response = dialog.make_response(request, 422);
                response.min_se = Some(ctx.profile.min_se);
                ctx.send(response);
                false
            }
            _ => true,
        }
    }

    fn start_session_timer(&mut self, dialog: &mut DialogInner, ctx: &mut Context) {
        self.timer.seq += 1;

        let interval = self.timer.interval;
        if interval < 90 {
            return;
        }

        let seq = self.timer.seq;
        if self.timer.local_refresher {
            ctx.schedule(
                Duration::from_secs(u64::from(interval / 2)),
                Self::target(dialog),
                TimerKind::SessionRefresh { seq },
            );
        } else {
            ctx.schedule(
                Duration::from_secs(u64::from(interval - (interval / 3).min(32))),
                Self::target(dialog),
                TimerKind::SessionExpiration { seq },
            );
        }
    }

    pub(crate) fn provide_offer(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        offer: Sdp,
    ) -> Result<(), Error> {
        use InviteState::*;

        match self.state {
            Connected => self.send_reinvite(dialog, ctx, Some(offer)),
            Answered => {
                self.queued_offer = Some(offer);
                self.transition(WaitingToOffer);
            }
            UasAccepted => {
                self.queued_offer = Some(offer);
                self.transition(UasWaitingToOffer);
            }
            ReceivedReinviteNoOffer => {
                let request = self.pending_request.take().ok_or(Error::InvalidState)?;
                self.proposed_local_sdp = Some(offer.clone());
                self.send_2xx(dialog, ctx, &request, 200, Some(offer));
                self.transition(ReceivedReinviteSentOffer);
            }
            UasNoOffer => {
                self.proposed_local_sdp = Some(offer);
                self.transition(UasProvidedOffer);
            }
            UasEarlyNoOffer => {
                self.proposed_local_sdp = Some(offer);
                self.transition(UasEarlyProvidedOffer);
            }
            Terminated => return Err(Error::Terminated),
            _ => return Err(Error::InvalidState),
        }

        Ok(())
    }

    pub(crate) fn provide_answer(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        answer: Sdp,
    ) -> Result<(), Error> {
        use InviteState::*;

        match self.state {
            ReceivedReinvite => {
                let request = self.pending_request.take().ok_or(Error::InvalidState)?;
                let offer = self.proposed_remote_sdp.take();
                self.commit(Some(answer.clone()), offer);
                self.send_2xx(dialog, ctx, &request, 200, Some(answer));
                self.transition(Answered);
                self.start_session_timer(dialog, ctx);
            }
            ReceivedUpdate => {
                let request = self.pending_request.take().ok_or(Error::InvalidState)?;
                let offer = self.proposed_remote_sdp.take();
                self.commit(Some(answer.clone()), offer);

                let mut response = dialog.make_response(&request, 200);
                self.add_timer_to_response(&mut response, &request);
                response.body = Some(answer).into();
                ctx.send(response);

                self.transition(Connected);
                self.start_session_timer(dialog, ctx);
            }
            SentReinviteAnswered | UacAnswered => {
                let initial = self.state == UacAnswered;
                let response = self.answered.take().ok_or(Error::InvalidState)?;
                let offer = self.proposed_remote_sdp.take();
                self.send_ack(dialog, ctx, &response, Some(answer.clone()));
                self.commit(Some(answer), offer);
                self.transition(Connected);
                self.start_session_timer(dialog, ctx);

                if initial {
                    ctx.handlers.invite.on_connected(self.handle, &response);
                }
            }
            UasOffer => {
                self.proposed_local_sdp = Some(answer);
                self.transition(UasOfferProvidedAnswer);
            }
            UasEarlyOffer => {
                self.proposed_local_sdp = Some(answer);
                self.transition(UasEarlyProvidedAnswer);
            }
            Terminated => return Err(Error::Terminated),
            _ => return Err(Error::InvalidState),
        }

        Ok(())
    }

    pub(crate) fn request_offer(&mut self, dialog: &mut DialogInner, ctx: &mut Context) -> Result<(), Error> {
        use InviteState::*;

        match self.state {
            Connected => self.send_reinvite(dialog, ctx, None),
            Answered => self.transition(WaitingToRequestOffer),
            UasAccepted => self.transition(UasWaitingToRequestOffer),
            Terminated => return Err(Error::Terminated),
            _ => return Err(Error::InvalidState),
        }

        Ok(())
    }

    pub(crate) fn modify_session(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        offer: Sdp,
    ) -> Result<(), Error> {
        match self.state {
            InviteState::Connected if ctx.profile.allow_update => {
                self.send_update(dialog, ctx, Some(offer));
                Ok(())
            }
            InviteState::Terminated => Err(Error::Terminated),
            _ => Err(Error::InvalidState),
        }
    }

    pub(crate) fn reject(&mut self, dialog: &mut DialogInner, ctx: &mut Context, code: u16) -> Result<(), Error> {
        use InviteState::*;

        if code < 300 {
            return Err(Error::InvalidState);
        }

        match self.state {
            ReceivedReinvite | ReceivedUpdate | ReceivedReinviteNoOffer => {
                let request = self.pending_request.take().ok_or(Error::InvalidState)?;
                ctx.send(dialog.make_response(&request, code));

                self.proposed_remote_sdp = None;
                self.transition(Connected);
            }
            state if state.is_uas_early() => {
                ctx.send(dialog.make_response(&self.invite, code));
                self.terminate(dialog, ctx, TerminatedReason::Rejected, None);
            }
            Terminated => return Err(Error::Terminated),
            _ => return Err(Error::InvalidState),
        }

        Ok(())
    }

    /// Hang up from any state. UAC early states are cancelled by the dialog
    /// set, not here.
    pub(crate) fn end(&mut self, dialog: &mut DialogInner, ctx: &mut Context) -> Result<(), Error> {
        use InviteState::*;

        match self.state {
            Connected | SentUpdate | SentUpdateGlare | SentReinviteGlare | SentReinviteNoOfferGlare => {
                self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            SentReinvite | SentReinviteNoOffer => self.transition(WaitingToTerminate),
            SentReinviteAnswered | UacAnswered => {
                if let Some(response) = self.answered.take() {
                    self.send_ack(dialog, ctx, &response, None);
                }

                self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            Answered | WaitingToOffer | WaitingToRequestOffer | ReceivedReinviteSentOffer => {
                self.transition(WaitingToHangup);
            }
            UasAccepted | UasAcceptedWaitingAnswer | UasWaitingToOffer | UasWaitingToRequestOffer => {
                self.transition(UasWaitingToHangup);
            }
            ReceivedReinvite | ReceivedUpdate | ReceivedReinviteNoOffer => {
                if let Some(request) = self.pending_request.take() {
                    ctx.send(dialog.make_response(&request, 488));
                }

                self.send_bye(dialog, ctx, TerminatedReason::LocalBye, None);
            }
            state if state.is_uas_early() => {
                ctx.send(dialog.make_response(&self.invite, 480));
                self.terminate(dialog, ctx, TerminatedReason::Rejected, None);
            }
            UacStart | UacEarly => return Err(Error::InvalidState),
            UacCancelled | WaitingToTerminate | WaitingToHangup | UasWaitingToHangup | Terminated => (),
            _ => return Err(Error::InvalidState),
        }

        Ok(())
    }

    fn send_nit(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        method: Method,
        body: crate::message::Body,
    ) -> Result<(), Error> {
        use InviteState::*;

        match self.state {
            Terminated => return Err(Error::Terminated),
            UacStart | UacEarly | UacCancelled | UasStart => return Err(Error::InvalidState),
            _ => (),
        }

        if self.outstanding_nit.is_some() {
            return Err(Error::InvalidState);
        }

        let mut request = dialog.make_request(method);
        request.body = body;

        self.outstanding_nit = Some(method);
        ctx.send(request);
        Ok(())
    }

    pub(crate) fn send_info(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        body: crate::message::Body,
    ) -> Result<(), Error> {
        self.send_nit(dialog, ctx, Method::Info, body)
    }

    pub(crate) fn send_message(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        body: crate::message::Body,
    ) -> Result<(), Error> {
        self.send_nit(dialog, ctx, Method::Message, body)
    }

    /// Answer the received INFO or MESSAGE, 2xx accepts and anything else
    /// rejects.
    pub(crate) fn answer_nit(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        code: u16,
    ) -> Result<(), Error> {
        let request = self.pending_nit.take().ok_or(Error::InvalidState)?;
        ctx.send(dialog.make_response(&request, code));
        Ok(())
    }

    /// The dialog set sent a CANCEL for the initial INVITE.
    pub(crate) fn on_cancel_sent(&mut self, dialog: &mut DialogInner, ctx: &mut Context) {
        if matches!(self.state, InviteState::UacStart | InviteState::UacEarly) {
            self.transition(InviteState::UacCancelled);
            ctx.schedule(TIMER_H, Self::target(dialog), TimerKind::Cancelled);
        }
    }
}
