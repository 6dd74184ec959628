use crate::{
    ClientRegistrationHandle, ClientSubscriptionHandle, InviteSessionHandle, OutOfDialogHandle,
    ServerRegistrationHandle, ServerSubscriptionHandle,
    invite::{Role, TerminatedReason},
    message::{Sdp, SipMessage},
};

/// Callbacks of invite sessions.
///
/// Handlers run inside the manager call that caused the event and cannot
/// reach back into the manager, operations triggered by an event are
/// issued after the call returns. All methods default to doing nothing.
#[allow(unused_variables)]
pub trait InviteSessionHandler: Send + 'static {
    fn on_new_session(&mut self, handle: InviteSessionHandle, role: Role, msg: &SipMessage) {}

    fn on_provisional(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    /// Unreliable SDP in a provisional response, not negotiated.
    fn on_early_media(&mut self, handle: InviteSessionHandle, msg: &SipMessage, sdp: &Sdp) {}

    /// Final failure of the initial INVITE.
    fn on_failure(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_offer(&mut self, handle: InviteSessionHandle, msg: &SipMessage, offer: &Sdp) {}

    fn on_answer(&mut self, handle: InviteSessionHandle, msg: &SipMessage, answer: &Sdp) {}

    fn on_offer_required(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_offer_rejected(&mut self, handle: InviteSessionHandle, msg: Option<&SipMessage>) {}

    fn on_connected(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_terminated(
        &mut self,
        handle: InviteSessionHandle,
        reason: TerminatedReason,
        msg: Option<&SipMessage>,
    ) {
    }

    fn on_session_expired(&mut self, handle: InviteSessionHandle) {}

    fn on_ack_received(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_ack_not_received(&mut self, handle: InviteSessionHandle) {}

    fn on_stale_reinvite_timeout(&mut self, handle: InviteSessionHandle) {}

    fn on_illegal_negotiation(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_info(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_info_success(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_info_failure(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_message(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_message_success(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}

    fn on_message_failure(&mut self, handle: InviteSessionHandle, msg: &SipMessage) {}
}

#[allow(unused_variables)]
pub trait ClientRegistrationHandler: Send + 'static {
    /// `expires` is the interval granted by the registrar.
    fn on_success(&mut self, handle: ClientRegistrationHandle, msg: &SipMessage, expires: u32) {}

    fn on_removed(&mut self, handle: ClientRegistrationHandle, msg: &SipMessage) {}

    fn on_failure(&mut self, handle: ClientRegistrationHandle, msg: &SipMessage) {}
}

/// The handler answers through
/// [`crate::DialogUsageManager::accept_registration`] or
/// [`crate::DialogUsageManager::reject_registration`].
#[allow(unused_variables)]
pub trait ServerRegistrationHandler: Send + 'static {
    fn on_register(&mut self, handle: ServerRegistrationHandle, msg: &SipMessage) {}
}

#[allow(unused_variables)]
pub trait ClientSubscriptionHandler: Send + 'static {
    fn on_update_active(&mut self, handle: ClientSubscriptionHandle, notify: &SipMessage) {}

    fn on_update_pending(&mut self, handle: ClientSubscriptionHandle, notify: &SipMessage) {}

    fn on_terminated(&mut self, handle: ClientSubscriptionHandle, msg: Option<&SipMessage>) {}
}

#[allow(unused_variables)]
pub trait ServerSubscriptionHandler: Send + 'static {
    fn on_new_subscription(&mut self, handle: ServerSubscriptionHandle, msg: &SipMessage) {}

    fn on_refresh(&mut self, handle: ServerSubscriptionHandle, msg: &SipMessage) {}

    fn on_terminated(&mut self, handle: ServerSubscriptionHandle) {}
}

#[allow(unused_variables)]
pub trait OutOfDialogHandler: Send + 'static {
    /// OPTIONS, MESSAGE, PUBLISH or an unsolicited NOTIFY, answered with
    /// [`crate::DialogUsageManager::answer_out_of_dialog`].
    fn on_received_request(&mut self, handle: OutOfDialogHandle, msg: &SipMessage) {}

    fn on_success(&mut self, handle: OutOfDialogHandle, msg: &SipMessage) {}

    fn on_failure(&mut self, handle: OutOfDialogHandle, msg: &SipMessage) {}
}

pub(crate) struct Noop;

impl InviteSessionHandler for Noop {}
impl ClientRegistrationHandler for Noop {}
impl ServerRegistrationHandler for Noop {}
impl ClientSubscriptionHandler for Noop {}
impl ServerSubscriptionHandler for Noop {}
impl OutOfDialogHandler for Noop {}

pub(crate) struct Handlers {
    pub invite: Box<dyn InviteSessionHandler>,
    pub client_registration: Box<dyn ClientRegistrationHandler>,
    pub server_registration: Box<dyn ServerRegistrationHandler>,
    pub client_subscription: Box<dyn ClientSubscriptionHandler>,
    pub server_subscription: Box<dyn ServerSubscriptionHandler>,
    pub out_of_dialog: Box<dyn OutOfDialogHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            invite: Box::new(Noop),
            client_registration: Box::new(Noop),
            server_registration: Box::new(Noop),
            client_subscription: Box::new(Noop),
            server_subscription: Box::new(Noop),
            out_of_dialog: Box::new(Noop),
        }
    }
}
