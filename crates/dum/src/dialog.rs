use crate::{
    ClientSubscriptionHandle, Error, InviteSessionHandle, ServerSubscriptionHandle,
    invite::{InviteSession, Role},
    message::{Method, NameAddr, SipMessage, Uri, Via},
    subscription::{ClientSubscription, ServerSubscription},
    timer::TimerKind,
    usage_manager::{Context, Location},
};

/// (Call-ID, local tag), shared by every dialog forked from one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogSetId {
    pub call_id: String,
    pub local_tag: String,
}

impl DialogSetId {
    /// Set of a message this side sent, or of a response to it.
    pub fn of_local(msg: &SipMessage) -> Option<Self> {
        Some(Self {
            call_id: msg.call_id.clone(),
            local_tag: msg.from.tag.clone()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn dialog_set_id(&self) -> DialogSetId {
        DialogSetId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

pub(crate) enum RequestOrder {
    Next,
    Retransmission,
    OutOfOrder,
}

/// RFC 3261 dialog state shared by the usages of one dialog.
#[derive(Debug)]
pub struct DialogInner {
    pub(crate) id: DialogId,
    pub(crate) route_set: Vec<NameAddr>,
    /// Last CSeq used by this side.
    pub(crate) local_cseq: u32,
    /// Highest CSeq accepted from the peer.
    pub(crate) remote_cseq: u32,
    pub(crate) remote_target: Uri,
    pub(crate) local_contact: NameAddr,
    pub(crate) local: NameAddr,
    pub(crate) remote: NameAddr,
    pub(crate) confirmed: bool,
    last_remote_tid: Option<String>,
}

fn single_contact(msg: &SipMessage) -> Result<&NameAddr, Error> {
    match msg.contacts.as_slice() {
        [] => Err(Error::MissingContact),
        [contact] if contact.uri.is_sip() => Ok(contact),
        _ => Err(Error::BadContact),
    }
}

impl DialogInner {
    /// Dialog of the UAS side, built from the request that forms it.
    pub(crate) fn from_request(
        request: &SipMessage,
        local_tag: &str,
        local_contact: NameAddr,
        creator: Option<&SipMessage>,
    ) -> Result<Self, Error> {
        let remote_target = single_contact(request)?.uri.clone();
        let remote_tag = request
            .from
            .tag
            .clone()
            .ok_or(Error::MissingHeader("From tag"))?;

        Ok(Self {
            id: DialogId {
                call_id: request.call_id.clone(),
                local_tag: local_tag.to_string(),
                remote_tag,
            },
            route_set: request.record_route.clone(),
            local_cseq: creator.map(|it| it.cseq.seq).unwrap_or(1),
            remote_cseq: request.cseq.seq,
            local: request.to.clone().with_tag(local_tag),
            remote: request.from.clone(),
            confirmed: creator.is_none(),
            last_remote_tid: None,
            local_contact,
            remote_target,
        })
    }

    /// Dialog of the UAC side, built from a response to `creator`.
    pub(crate) fn from_response(
        response: &SipMessage,
        creator: &SipMessage,
        local_contact: NameAddr,
    ) -> Result<Self, Error> {
        let code = response.code().unwrap_or(0);
        let remote_target = if (101..300).contains(&code)
            && matches!(
                creator.method(),
                Method::Invite | Method::Subscribe | Method::Refer
            ) {
            single_contact(response)?.uri.clone()
        } else {
            response
                .contacts
                .first()
                .map(|it| it.uri.clone())
                .or_else(|| creator.request_uri().cloned())
                .ok_or(Error::MissingContact)?
        };

        let remote_tag = response
            .to
            .tag
            .clone()
            .ok_or(Error::MissingHeader("To tag"))?;
        let local_tag = creator
            .from
            .tag
            .clone()
            .ok_or(Error::MissingHeader("From tag"))?;

        Ok(Self {
            id: DialogId {
                call_id: creator.call_id.clone(),
                remote_tag,
                local_tag,
            },
            route_set: response.record_route.iter().rev().cloned().collect(),
            local_cseq: response.cseq.seq,
            remote_cseq: 0,
            local: creator.from.clone(),
            remote: response.to.clone(),
            confirmed: (200..300).contains(&code),
            last_remote_tid: None,
            local_contact,
            remote_target,
        })
    }

    pub fn id(&self) -> &DialogId {
        &self.id
    }

    pub fn route_set(&self) -> &[NameAddr] {
        &self.route_set
    }

    pub fn remote_target(&self) -> &Uri {
        &self.remote_target
    }

    pub fn local_cseq(&self) -> u32 {
        self.local_cseq
    }

    pub fn remote_cseq(&self) -> u32 {
        self.remote_cseq
    }

    /// A 2xx to the creator fixes the route set of an early dialog.
    pub(crate) fn confirm(&mut self, response: &SipMessage) {
        if !self.confirmed {
            self.route_set = response.record_route.iter().rev().cloned().collect();
            self.confirmed = true;
        }
    }

    pub(crate) fn target_refresh(&mut self, msg: &SipMessage) {
        if let Ok(contact) = single_contact(msg) {
            if contact.uri != self.remote_target {
                log::debug!(
                    "sip dialog target refresh: dialog={}, target={}",
                    self.id,
                    contact.uri
                );

                self.remote_target = contact.uri.clone();
            }
        }
    }

    pub(crate) fn check_request(&mut self, request: &SipMessage) -> RequestOrder {
        if matches!(request.method(), Method::Ack | Method::Cancel) {
            return RequestOrder::Next;
        }

        let seq = request.cseq.seq;
        if seq < self.remote_cseq {
            return RequestOrder::OutOfOrder;
        }

        let tid = request.transaction_id().map(ToString::to_string);
        if seq == self.remote_cseq && self.last_remote_tid.is_some() && self.last_remote_tid == tid
        {
            return RequestOrder::Retransmission;
        }

        self.remote_cseq = seq;
        self.last_remote_tid = tid;
        RequestOrder::Next
    }

    /// In-dialog request, taking the next local CSeq except for ACK and
    /// CANCEL.
    pub(crate) fn make_request(&mut self, method: Method) -> SipMessage {
        if !matches!(method, Method::Ack | Method::Cancel) {
            self.local_cseq += 1;
        }

        let mut request = SipMessage::request(
            method,
            self.remote_target.clone(),
            self.local.clone(),
            self.remote.clone(),
            &self.id.call_id,
            self.local_cseq,
        );

        request.via.push(Via::new(&self.local_contact.uri));
        request.route = self.route_set.clone();

        if matches!(
            method,
            Method::Invite | Method::Update | Method::Subscribe | Method::Notify | Method::Refer
        ) {
            request.contacts.push(self.local_contact.clone());
        }

        request
    }

    /// ACK of a 2xx, same CSeq number as the INVITE.
    pub(crate) fn make_ack(&mut self, invite_cseq: u32) -> SipMessage {
        let mut ack = self.make_request(Method::Ack);
        ack.cseq.seq = invite_cseq;
        ack
    }

    pub(crate) fn make_response(&self, request: &SipMessage, code: u16) -> SipMessage {
        let mut response = SipMessage::response(request, code);
        if response.to.tag.is_none() {
            response.to.tag = Some(self.id.local_tag.clone());
        }

        if (101..300).contains(&code)
            && matches!(
                request.method(),
                Method::Invite | Method::Update | Method::Subscribe | Method::Refer | Method::Notify
            )
        {
            response.contacts.push(self.local_contact.clone());
        }

        response
    }
}

/// A dialog and the usages it owns.
pub struct Dialog {
    pub(crate) inner: DialogInner,
    pub(crate) invite: Option<InviteSession>,
    pub(crate) client_subscriptions: Vec<ClientSubscription>,
    pub(crate) server_subscriptions: Vec<ServerSubscription>,
}

impl Dialog {
    pub(crate) fn new(inner: DialogInner) -> Self {
        Self {
            invite: None,
            client_subscriptions: Vec::new(),
            server_subscriptions: Vec::new(),
            inner,
        }
    }

    pub fn id(&self) -> &DialogId {
        &self.inner.id
    }

    pub fn inner(&self) -> &DialogInner {
        &self.inner
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.invite.as_ref().is_none_or(|it| it.is_terminated())
            && self.client_subscriptions.iter().all(|it| it.is_ended())
            && self.server_subscriptions.iter().all(|it| it.is_ended())
    }

    /// Raw ids of every usage handle pointing at this dialog.
    pub(crate) fn handles(&self) -> Vec<u64> {
        self.invite
            .iter()
            .map(|it| it.handle().0)
            .chain(self.client_subscriptions.iter().map(|it| it.handle().0))
            .chain(self.server_subscriptions.iter().map(|it| it.handle().0))
            .collect()
    }

    /// Move the dialog under a new remote tag.
    pub(crate) fn rekey(&mut self, ctx: &mut Context, remote_tag: &str) {
        self.inner.id.remote_tag = remote_tag.to_string();
        self.inner.remote.tag = Some(remote_tag.to_string());

        for handle in self.handles() {
            ctx.registry
                .relocate(handle, Location::Dialog(self.inner.id.clone()));
        }
    }

    pub(crate) fn dispatch_request(&mut self, ctx: &mut Context, request: &SipMessage) {
        let method = request.method();

        match self.inner.check_request(request) {
            RequestOrder::Next => (),
            RequestOrder::Retransmission => {
                log::debug!(
                    "sip request retransmission dropped: dialog={}, method={method}",
                    self.inner.id
                );

                return;
            }
            RequestOrder::OutOfOrder => {
                log::warn!(
                    "sip request out of order: dialog={}, cseq={}, highest={}",
                    self.inner.id,
                    request.cseq.seq,
                    self.inner.remote_cseq
                );

                ctx.send(self.inner.make_response(request, 500));
                return;
            }
        }

        if matches!(method, Method::Invite | Method::Update | Method::Subscribe) {
            self.inner.target_refresh(request);
        }

        match method {
            Method::Invite => {
                if self.invite.is_none() {
                    let handle = ctx
                        .registry
                        .register(Location::Dialog(self.inner.id.clone()));

                    self.invite = Some(InviteSession::new(
                        InviteSessionHandle(handle),
                        Role::Uas,
                        request.clone(),
                        false,
                    ));
                }

                if let Some(session) = &mut self.invite {
                    session.dispatch(&mut self.inner, ctx, request);
                }
            }
            Method::Ack | Method::Cancel => match &mut self.invite {
                Some(session) => session.dispatch(&mut self.inner, ctx, request),
                None => log::debug!("sip stray request dropped: method={method}"),
            },
            Method::Bye | Method::Update | Method::Info | Method::Message | Method::Prack => {
                match &mut self.invite {
                    Some(session) => session.dispatch(&mut self.inner, ctx, request),
                    None => ctx.send(self.inner.make_response(request, 481)),
                }
            }
            Method::Subscribe | Method::Refer => {
                let event = match method {
                    Method::Refer => "refer".to_string(),
                    _ => match &request.event {
                        Some(it) => it.clone(),
                        None => {
                            ctx.send(self.inner.make_response(request, 400));
                            return;
                        }
                    },
                };

                if method == Method::Refer && request.refer_to.is_none() {
                    ctx.send(self.inner.make_response(request, 400));
                    return;
                }

                let index = match self
                    .server_subscriptions
                    .iter()
                    .position(|it| it.event() == event && !it.is_ended() && method != Method::Refer)
                {
                    Some(index) => index,
                    None => {
                        let handle = ctx
                            .registry
                            .register(Location::Dialog(self.inner.id.clone()));

                        self.server_subscriptions.push(ServerSubscription::new(
                            ServerSubscriptionHandle(handle),
                            &event,
                        ));

                        self.server_subscriptions.len() - 1
                    }
                };

                self.server_subscriptions[index].dispatch_request(&mut self.inner, ctx, request);
            }
            Method::Notify => {
                let event = request.event.as_deref().unwrap_or_default();
                match self
                    .client_subscriptions
                    .iter_mut()
                    .find(|it| it.event() == event && !it.is_ended())
                {
                    Some(subscription) => subscription.dispatch_request(&mut self.inner, ctx, request),
                    None => ctx.send(self.inner.make_response(request, 481)),
                }
            }
            Method::Options => ctx.send(self.inner.make_response(request, 200)),
            Method::Register | Method::Publish => {
                ctx.send(self.inner.make_response(request, 405));
            }
        }
    }

    /// `creator` is the request that created the dialog set on the UAC
    /// side, `cancelled` tells whether it has been cancelled.
    pub(crate) fn dispatch_response(
        &mut self,
        ctx: &mut Context,
        response: &SipMessage,
        creator: Option<&SipMessage>,
        cancelled: bool,
    ) {
        let method = response.cseq.method;

        if response.code().is_some_and(|it| (200..300).contains(&it)) {
            if method == Method::Invite {
                self.inner.confirm(response);
            }

            if matches!(method, Method::Invite | Method::Update | Method::Subscribe) {
                self.inner.target_refresh(response);
            }
        }

        match method {
            Method::Invite
            | Method::Update
            | Method::Info
            | Method::Message
            | Method::Prack
            | Method::Bye => {
                if self.invite.is_none() && method == Method::Invite {
                    if let Some(creator) = creator.filter(|it| it.method() == Method::Invite) {
                        let handle = InviteSessionHandle(
                            ctx.registry
                                .register(Location::Dialog(self.inner.id.clone())),
                        );

                        self.invite = Some(InviteSession::new(
                            handle,
                            Role::Uac,
                            creator.clone(),
                            cancelled,
                        ));

                        ctx.handlers.invite.on_new_session(handle, Role::Uac, response);
                    }
                }

                match &mut self.invite {
                    Some(session) => session.dispatch(&mut self.inner, ctx, response),
                    None => log::debug!("sip response without invite session: method={method}"),
                }
            }
            Method::Subscribe | Method::Refer => {
                let event = match method {
                    Method::Refer => "refer".to_string(),
                    _ => creator
                        .and_then(|it| it.event.clone())
                        .unwrap_or_default(),
                };

                let index = match self
                    .client_subscriptions
                    .iter()
                    .position(|it| it.event() == event && !it.is_ended())
                {
                    Some(index) => index,
                    None if creator.is_some_and(|it| it.method() == method) => {
                        let handle = ctx
                            .registry
                            .register(Location::Dialog(self.inner.id.clone()));

                        self.client_subscriptions.push(ClientSubscription::new(
                            ClientSubscriptionHandle(handle),
                            &event,
                        ));

                        self.client_subscriptions.len() - 1
                    }
                    None => return,
                };

                self.client_subscriptions[index].dispatch_response(&mut self.inner, ctx, response);
            }
            Method::Notify => {
                if let Some(subscription) = self
                    .server_subscriptions
                    .iter_mut()
                    .find(|it| it.notify_cseq() == Some(response.cseq.seq))
                {
                    subscription.dispatch_response(&mut self.inner, ctx, response);
                }
            }
            _ => (),
        }
    }

    /// NOTIFY that arrived before any response to the SUBSCRIBE or REFER
    /// creating the dialog.
    pub(crate) fn dispatch_early_notify(
        &mut self,
        ctx: &mut Context,
        request: &SipMessage,
        creator: &SipMessage,
    ) {
        let event = match creator.method() {
            Method::Refer => "refer".to_string(),
            _ => creator.event.clone().unwrap_or_default(),
        };

        if !self.client_subscriptions.iter().any(|it| it.event() == event) {
            let handle = ctx
                .registry
                .register(Location::Dialog(self.inner.id.clone()));

            self.client_subscriptions
                .push(ClientSubscription::new(ClientSubscriptionHandle(handle), &event));
        }

        self.dispatch_request(ctx, request);
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut Context, kind: &TimerKind) {
        match kind {
            TimerKind::SubscriptionRefresh { handle, seq } => {
                if let Some(subscription) = self
                    .client_subscriptions
                    .iter_mut()
                    .find(|it| it.handle().0 == *handle)
                {
                    subscription.on_refresh_timer(&mut self.inner, ctx, *seq);
                }
            }
            _ => {
                if let Some(session) = &mut self.invite {
                    session.on_timer(&mut self.inner, ctx, kind);
                }
            }
        }
    }
}
