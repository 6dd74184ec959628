use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::AHashMap;

use crate::{
    ClientRegistrationHandle, ClientSubscriptionHandle, Error, InviteSessionHandle,
    OutOfDialogHandle, ServerRegistrationHandle, ServerSubscriptionHandle,
    auth::{ClientAuthManager, CredentialStore, ServerAuthManager, AuthOutcome, UserAuthInfo},
    dialog::{Dialog, DialogId, DialogInner, DialogSetId},
    dialog_set::DialogSet,
    handler::{
        ClientRegistrationHandler, ClientSubscriptionHandler, Handlers, InviteSessionHandler,
        OutOfDialogHandler, ServerRegistrationHandler, ServerSubscriptionHandler,
    },
    invite::{InviteSession, InviteState, PendingOffer, add_session_timer, allow},
    message::{
        Body, Method, NameAddr, Sdp, SipMessage, SubState, Uri, Via, new_call_id, new_tag,
    },
    out_of_dialog::ClientOutOfDialog,
    profile::Profile,
    registration::{ClientRegistration, response},
    subscription::{ClientSubscription, ServerSubscription},
    timer::{TIMER_H, Target, TimerKind, TimerQueue},
};

/// Where the usage behind a handle lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Location {
    Dialog(DialogId),
    DialogSet(DialogSetId),
}

/// Handle ids to usage locations.
#[derive(Default)]
pub(crate) struct Registry {
    next: u64,
    locations: AHashMap<u64, Location>,
}

impl Registry {
    pub fn register(&mut self, location: Location) -> u64 {
        self.next += 1;
        self.locations.insert(self.next, location);
        self.next
    }

    pub fn get(&self, id: u64) -> Option<&Location> {
        self.locations.get(&id)
    }

    pub fn relocate(&mut self, id: u64, location: Location) {
        if let Some(it) = self.locations.get_mut(&id) {
            *it = location;
        }
    }

    pub fn remove(&mut self, id: u64) {
        self.locations.remove(&id);
    }
}

/// Everything a usage may touch while it handles an event, borrowed from
/// the manager next to the dialog set being worked on.
pub(crate) struct Context<'a> {
    /// Time of the event, the deadline when a timer fires.
    pub now: Instant,
    pub profile: &'a Profile,
    pub handlers: &'a mut Handlers,
    pub client_auth: &'a mut ClientAuthManager,
    pub registry: &'a mut Registry,
    outbox: &'a mut VecDeque<SipMessage>,
    timers: &'a mut TimerQueue,
}

impl Context<'_> {
    /// Queue a message, requests get the credentials of their dialog set.
    pub fn send(&mut self, mut msg: SipMessage) {
        if msg.is_request() {
            self.client_auth.add_authentication(&mut msg);
        }

        log::trace!(
            "sip outgoing: method={}, code={:?}, call_id={}",
            msg.method(),
            msg.code(),
            msg.call_id
        );

        self.outbox.push_back(msg);
    }

    pub fn schedule(&mut self, after: Duration, target: Target, kind: TimerKind) {
        self.timers.schedule(self.now + after, target, kind);
    }
}

/// State shared by every dialog set.
struct Core {
    profile: Profile,
    handlers: Handlers,
    client_auth: ClientAuthManager,
    registry: Registry,
    outbox: VecDeque<SipMessage>,
    timers: TimerQueue,
}

impl Core {
    fn ctx(&mut self, now: Instant) -> Context<'_> {
        Context {
            profile: &self.profile,
            handlers: &mut self.handlers,
            client_auth: &mut self.client_auth,
            registry: &mut self.registry,
            outbox: &mut self.outbox,
            timers: &mut self.timers,
            now,
        }
    }
}

/// Entry point of the dialog layer.
///
/// The manager consumes parsed messages with [`Self::dispatch`] and timer
/// ticks with [`Self::process_timers`], and produces messages that the
/// caller drains with [`Self::take_outgoing`]. Usages are addressed with
/// typed handles, operations on a handle whose usage is gone fail with
/// [`Error::UnknownHandle`].
pub struct DialogUsageManager {
    core: Core,
    sets: AHashMap<DialogSetId, DialogSet>,
    /// (Call-ID, remote tag) of requests that created a set on this side.
    server_sets: AHashMap<(String, String), DialogSetId>,
    server_auth: Option<ServerAuthManager>,
}

impl DialogUsageManager {
    pub fn new(profile: Profile) -> Self {
        Self {
            core: Core {
                handlers: Handlers::default(),
                client_auth: ClientAuthManager::default(),
                registry: Registry::default(),
                outbox: VecDeque::new(),
                timers: TimerQueue::default(),
                profile,
            },
            sets: AHashMap::new(),
            server_sets: AHashMap::new(),
            server_auth: None,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.core.profile
    }

    pub fn set_invite_handler<T: InviteSessionHandler>(&mut self, handler: T) {
        self.core.handlers.invite = Box::new(handler);
    }

    pub fn set_client_registration_handler<T: ClientRegistrationHandler>(&mut self, handler: T) {
        self.core.handlers.client_registration = Box::new(handler);
    }

    pub fn set_server_registration_handler<T: ServerRegistrationHandler>(&mut self, handler: T) {
        self.core.handlers.server_registration = Box::new(handler);
    }

    pub fn set_client_subscription_handler<T: ClientSubscriptionHandler>(&mut self, handler: T) {
        self.core.handlers.client_subscription = Box::new(handler);
    }

    pub fn set_server_subscription_handler<T: ServerSubscriptionHandler>(&mut self, handler: T) {
        self.core.handlers.server_subscription = Box::new(handler);
    }

    pub fn set_out_of_dialog_handler<T: OutOfDialogHandler>(&mut self, handler: T) {
        self.core.handlers.out_of_dialog = Box::new(handler);
    }

    /// Credentials used to answer 401 and 407 challenges.
    pub fn set_credential_store<T: CredentialStore>(&mut self, store: T) {
        self.core.client_auth.set_store(Box::new(store));
    }

    /// Challenge received requests.
    pub fn set_server_auth(&mut self, auth: ServerAuthManager) {
        self.server_auth = Some(auth);
    }

    /// Messages produced since the last call, in order.
    pub fn take_outgoing(&mut self) -> Vec<SipMessage> {
        self.core.outbox.drain(..).collect()
    }

    /// Deadline of the next timer, the caller should call
    /// [`Self::process_timers`] at or after it.
    pub fn next_timer(&self) -> Option<Instant> {
        self.core.timers.next_deadline()
    }

    pub fn dialog_count(&self) -> usize {
        self.sets.values().map(|it| it.dialogs.len()).sum()
    }

    pub fn find_dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.sets
            .get(&id.dialog_set_id())?
            .dialogs
            .get(&id.remote_tag)
    }

    pub fn find_dialog_set(&self, id: &DialogSetId) -> Option<&DialogSet> {
        self.sets.get(id)
    }

    /// Feed a parsed message received from the transaction layer.
    pub fn dispatch(&mut self, msg: SipMessage) {
        log::trace!(
            "sip incoming: method={}, code={:?}, call_id={}",
            msg.method(),
            msg.code(),
            msg.call_id
        );

        if msg.is_response() {
            return self.dispatch_response(msg);
        }

        let request = match &mut self.server_auth {
            Some(auth) => match auth.handle(msg) {
                AuthOutcome::Pass(it) => it,
                AuthOutcome::Respond(responses) => {
                    self.core.outbox.extend(responses);
                    return;
                }
                AuthOutcome::Requested => return,
            },
            None => msg,
        };

        self.dispatch_request(request);
    }

    /// Result of a credential lookup started by the server auth manager.
    pub fn on_user_auth_info(&mut self, info: UserAuthInfo) {
        let Some(outcome) = self
            .server_auth
            .as_mut()
            .and_then(|it| it.on_user_auth_info(info))
        else {
            return;
        };

        match outcome {
            AuthOutcome::Pass(request) => self.dispatch_request(request),
            AuthOutcome::Respond(responses) => self.core.outbox.extend(responses),
            AuthOutcome::Requested => (),
        }
    }

    fn dispatch_response(&mut self, response: SipMessage) {
        let Some(id) = DialogSetId::of_local(&response) else {
            return;
        };

        match self.sets.get_mut(&id) {
            Some(set) => set.dispatch_response(&mut self.core.ctx(Instant::now()), &response),
            None => log::debug!(
                "sip stray response dropped: call_id={}, code={:?}",
                response.call_id,
                response.code()
            ),
        }
    }

    fn dispatch_request(&mut self, request: SipMessage) {
        let method = request.method();
        let now = Instant::now();

        if let Some(local_tag) = &request.to.tag {
            let id = DialogSetId {
                call_id: request.call_id.clone(),
                local_tag: local_tag.clone(),
            };

            let mut ctx = self.core.ctx(now);
            match self.sets.get_mut(&id) {
                Some(set) => set.dispatch_request(&mut ctx, &request),
                None if method == Method::Ack => {
                    log::debug!("sip stray ack dropped: call_id={}", request.call_id);
                }
                None => ctx.send(SipMessage::response(&request, 481)),
            }

            return;
        }

        let key = (
            request.call_id.clone(),
            request.from.tag.clone().unwrap_or_default(),
        );

        if let Some(set) = self
            .server_sets
            .get(&key)
            .and_then(|it| self.sets.get_mut(it))
        {
            return set.dispatch_request(&mut self.core.ctx(now), &request);
        }

        match method {
            Method::Invite
            | Method::Subscribe
            | Method::Refer
            | Method::Register
            | Method::Options
            | Method::Message
            | Method::Publish
            | Method::Notify => {
                let id = DialogSetId {
                    call_id: request.call_id.clone(),
                    local_tag: new_tag(),
                };

                let mut ctx = self.core.ctx(now);
                let mut set = DialogSet::new(id.clone(), None);
                set.dispatch_request(&mut ctx, &request);
                ctx.schedule(TIMER_H, Target::DialogSet(id.clone()), TimerKind::Reap);

                self.server_sets.insert(key, id.clone());
                self.sets.insert(id, set);
            }
            Method::Ack => log::debug!("sip stray ack dropped: call_id={}", request.call_id),
            _ => {
                let id = DialogSetId {
                    call_id: request.call_id.clone(),
                    local_tag: new_tag(),
                };

                self.core.ctx(now).send(response(&id, &request, 481));
            }
        }
    }

    /// Fire every timer due at `now`.
    pub fn process_timers(&mut self, now: Instant) {
        if let Some(auth) = &mut self.server_auth {
            self.core.outbox.extend(auth.expire(now));
        }

        while let Some((at, timeout)) = self.core.timers.pop_due(now) {
            if timeout.kind == TimerKind::Reap {
                self.reap(&timeout.target);
                continue;
            }

            let mut ctx = self.core.ctx(at);
            match &timeout.target {
                Target::Dialog(id) => {
                    if let Some(set) = self.sets.get_mut(&id.dialog_set_id()) {
                        set.on_dialog_timer(&mut ctx, &id.remote_tag, &timeout.kind);
                    }
                }
                Target::DialogSet(id) => {
                    if let Some(set) = self.sets.get_mut(id) {
                        set.on_timer(&mut ctx, &timeout.kind);
                    }
                }
            }
        }
    }

    fn reap(&mut self, target: &Target) {
        let id = match target {
            Target::Dialog(id) => id.dialog_set_id(),
            Target::DialogSet(id) => id.clone(),
        };

        let Some(set) = self.sets.get_mut(&id) else {
            return;
        };

        for handle in set.reap_dialogs() {
            self.core.registry.remove(handle);
        }

        if !set.is_finished() {
            return;
        }

        if let Some(set) = self.sets.remove(&id) {
            log::debug!("sip dialog set reaped: call_id={}, tag={}", id.call_id, id.local_tag);

            for handle in set.handles() {
                self.core.registry.remove(handle);
            }
        }

        self.server_sets.retain(|_, it| *it != id);
        self.core.client_auth.remove(&id);
    }

    /// Request outside of any dialog, from the profile identity with a new
    /// Call-ID and From tag, and the dialog set it creates.
    fn new_request(&self, method: Method, target: Uri) -> (DialogSetId, SipMessage) {
        let profile = &self.core.profile;
        let id = DialogSetId {
            call_id: new_call_id(&profile.contact.uri.host),
            local_tag: new_tag(),
        };

        let mut request = SipMessage::request(
            method,
            target.clone(),
            profile.identity.clone().with_tag(&id.local_tag),
            NameAddr::new(target),
            &id.call_id,
            1,
        );

        request.via.push(Via::new(&profile.contact.uri));
        (id, request)
    }

    fn start(&mut self, set: DialogSet) -> DialogSetId {
        let id = set.id().clone();

        if let Some(creator) = &set.creator {
            self.core.ctx(Instant::now()).send(creator.clone());
        }

        self.sets.insert(id.clone(), set);
        id
    }

    /// Send an INVITE, with `offer` or asking the callee for one. The
    /// session handle arrives with
    /// [`InviteSessionHandler::on_new_session`] once a dialog forms.
    pub fn make_invite(&mut self, target: Uri, offer: Option<Sdp>) -> DialogSetId {
        let (id, mut invite) = self.new_request(Method::Invite, target);
        invite.contacts.push(self.core.profile.contact.clone());
        add_session_timer(&mut invite, &self.core.profile, 0);
        invite.allow = allow(&self.core.profile);
        invite.body = offer.into();

        self.start(DialogSet::new(id, Some(invite)))
    }

    /// Cancel an INVITE that has no final response yet, for every fork.
    pub fn cancel_invite(&mut self, id: &DialogSetId) -> Result<(), Error> {
        let set = self.sets.get_mut(id).ok_or(Error::UnknownHandle)?;
        set.cancel(&mut self.core.ctx(Instant::now()))
    }

    /// Register the profile contact at `registrar`, `expires` defaults to
    /// the profile value.
    pub fn register(&mut self, registrar: Uri, expires: Option<u32>) -> ClientRegistrationHandle {
        let (id, mut request) = self.new_request(Method::Register, registrar);
        let profile = &self.core.profile;
        request.to = NameAddr::new(profile.identity.uri.clone());
        request.contacts.push(profile.contact.clone());
        request.expires = Some(expires.unwrap_or(profile.register_expires));

        let handle = self
            .core
            .registry
            .register(Location::DialogSet(id.clone()));

        let mut set = DialogSet::new(id, Some(request));
        set.registration = Some(ClientRegistration::new(ClientRegistrationHandle(handle)));
        self.start(set);

        ClientRegistrationHandle(handle)
    }

    /// SUBSCRIBE to `event` at `target`. The subscription handle arrives
    /// with the first NOTIFY or response that forms the dialog.
    pub fn subscribe(&mut self, target: Uri, event: &str) -> DialogSetId {
        let (id, mut request) = self.new_request(Method::Subscribe, target);
        request.contacts.push(self.core.profile.contact.clone());
        request.event = Some(event.to_string());
        request.expires = Some(self.core.profile.subscription_expires);

        self.start(DialogSet::new(id, Some(request)))
    }

    /// Send OPTIONS, MESSAGE or PUBLISH outside of a dialog.
    pub fn send_out_of_dialog(
        &mut self,
        method: Method,
        target: Uri,
        body: Body,
    ) -> Result<OutOfDialogHandle, Error> {
        if !matches!(method, Method::Options | Method::Message | Method::Publish) {
            return Err(Error::InvalidState);
        }

        let (id, mut request) = self.new_request(method, target);
        request.body = body;

        let handle = self
            .core
            .registry
            .register(Location::DialogSet(id.clone()));

        let mut set = DialogSet::new(id, Some(request));
        set.client_out_of_dialog = Some(ClientOutOfDialog::new(OutOfDialogHandle(handle)));
        self.start(set);

        Ok(OutOfDialogHandle(handle))
    }

    /// Run `f` with the dialog set a handle points into.
    fn with_set<T>(
        &mut self,
        handle: u64,
        f: impl FnOnce(&mut DialogSet, &mut Context) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let id = match self.core.registry.get(handle) {
            Some(Location::DialogSet(id)) => id.clone(),
            _ => return Err(Error::UnknownHandle),
        };

        let set = self.sets.get_mut(&id).ok_or(Error::UnknownHandle)?;
        f(set, &mut self.core.ctx(Instant::now()))
    }

    /// Run `f` with the dialog a handle points into.
    fn with_dialog<T>(
        &mut self,
        handle: u64,
        f: impl FnOnce(&mut Dialog, &mut Context) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let id = match self.core.registry.get(handle) {
            Some(Location::Dialog(id)) => id.clone(),
            _ => return Err(Error::UnknownHandle),
        };

        let dialog = self
            .sets
            .get_mut(&id.dialog_set_id())
            .and_then(|it| it.dialog_mut(&id.remote_tag))
            .ok_or(Error::UnknownHandle)?;

        f(dialog, &mut self.core.ctx(Instant::now()))
    }

    fn with_invite<T>(
        &mut self,
        handle: InviteSessionHandle,
        f: impl FnOnce(&mut InviteSession, &mut DialogInner, &mut Context) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.with_dialog(handle.0, |dialog, ctx| {
            let session = dialog
                .invite
                .as_mut()
                .filter(|it| it.handle() == handle)
                .ok_or(Error::UnknownHandle)?;

            f(session, &mut dialog.inner, ctx)
        })
    }

    fn invite(&self, handle: InviteSessionHandle) -> Result<&InviteSession, Error> {
        let Some(Location::Dialog(id)) = self.core.registry.get(handle.0) else {
            return Err(Error::UnknownHandle);
        };

        self.find_dialog(id)
            .and_then(|it| it.invite.as_ref())
            .filter(|it| it.handle() == handle)
            .ok_or(Error::UnknownHandle)
    }

    pub fn invite_state(&self, handle: InviteSessionHandle) -> Result<InviteState, Error> {
        Ok(self.invite(handle)?.state())
    }

    pub fn pending_offer(&self, handle: InviteSessionHandle) -> Result<PendingOffer, Error> {
        Ok(self.invite(handle)?.pending_offer())
    }

    pub fn local_sdp(&self, handle: InviteSessionHandle) -> Result<Option<Sdp>, Error> {
        Ok(self.invite(handle)?.local_sdp().cloned())
    }

    pub fn remote_sdp(&self, handle: InviteSessionHandle) -> Result<Option<Sdp>, Error> {
        Ok(self.invite(handle)?.remote_sdp().cloned())
    }

    pub fn dialog_id(&self, handle: InviteSessionHandle) -> Result<DialogId, Error> {
        self.invite(handle)?;

        match self.core.registry.get(handle.0) {
            Some(Location::Dialog(id)) => Ok(id.clone()),
            _ => Err(Error::UnknownHandle),
        }
    }

    pub fn provide_offer(&mut self, handle: InviteSessionHandle, offer: Sdp) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| {
            session.provide_offer(dialog, ctx, offer)
        })
    }

    pub fn provide_answer(&mut self, handle: InviteSessionHandle, answer: Sdp) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| {
            session.provide_answer(dialog, ctx, answer)
        })
    }

    /// Ask the peer for an offer with an offerless re-INVITE.
    pub fn request_offer(&mut self, handle: InviteSessionHandle) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| session.request_offer(dialog, ctx))
    }

    /// Offer a new session description with UPDATE.
    pub fn modify_session(&mut self, handle: InviteSessionHandle, offer: Sdp) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| {
            session.modify_session(dialog, ctx, offer)
        })
    }

    /// Send a provisional response to a received INVITE.
    pub fn provisional(&mut self, handle: InviteSessionHandle, code: u16) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| {
            session.provisional(dialog, ctx, code)
        })
    }

    pub fn accept(&mut self, handle: InviteSessionHandle, code: u16) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| session.accept(dialog, ctx, code))
    }

    /// Reject a received INVITE, re-INVITE or UPDATE.
    pub fn reject(&mut self, handle: InviteSessionHandle, code: u16) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| session.reject(dialog, ctx, code))
    }

    /// Hang up. Before a final response this cancels the INVITE.
    pub fn end(&mut self, handle: InviteSessionHandle) -> Result<(), Error> {
        if matches!(
            self.invite_state(handle)?,
            InviteState::UacStart | InviteState::UacEarly
        ) {
            return self.cancel(handle);
        }

        self.with_invite(handle, |session, dialog, ctx| session.end(dialog, ctx))
    }

    /// Cancel the INVITE of an early UAC session.
    pub fn cancel(&mut self, handle: InviteSessionHandle) -> Result<(), Error> {
        if !matches!(
            self.invite_state(handle)?,
            InviteState::UacStart | InviteState::UacEarly
        ) {
            return Err(Error::InvalidState);
        }

        let id = self.dialog_id(handle)?.dialog_set_id();
        self.cancel_invite(&id)
    }

    pub fn send_info(&mut self, handle: InviteSessionHandle, body: Body) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| session.send_info(dialog, ctx, body))
    }

    pub fn send_message(&mut self, handle: InviteSessionHandle, body: Body) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| {
            session.send_message(dialog, ctx, body)
        })
    }

    /// Accept the received INFO or MESSAGE with 200.
    pub fn accept_nit(&mut self, handle: InviteSessionHandle) -> Result<(), Error> {
        self.with_invite(handle, |session, dialog, ctx| {
            session.answer_nit(dialog, ctx, 200)
        })
    }

    pub fn reject_nit(&mut self, handle: InviteSessionHandle, code: u16) -> Result<(), Error> {
        if code < 300 {
            return Err(Error::InvalidState);
        }

        self.with_invite(handle, |session, dialog, ctx| {
            session.answer_nit(dialog, ctx, code)
        })
    }

    pub fn refresh_registration(&mut self, handle: ClientRegistrationHandle) -> Result<(), Error> {
        self.with_set(handle.0, |set, ctx| {
            let (Some(registration), Some(request)) = (&mut set.registration, &mut set.creator)
            else {
                return Err(Error::UnknownHandle);
            };

            registration.refresh(ctx, request)
        })
    }

    /// Unregister, [`ClientRegistrationHandler::on_removed`] follows.
    pub fn remove_registration(&mut self, handle: ClientRegistrationHandle) -> Result<(), Error> {
        self.with_set(handle.0, |set, ctx| {
            let (Some(registration), Some(request)) = (&mut set.registration, &mut set.creator)
            else {
                return Err(Error::UnknownHandle);
            };

            registration.remove(ctx, request)
        })
    }

    pub fn accept_registration(&mut self, handle: ServerRegistrationHandle) -> Result<(), Error> {
        self.with_set(handle.0, |set, ctx| {
            let id = set.id().clone();
            let registration = set
                .server_registration
                .as_mut()
                .ok_or(Error::UnknownHandle)?;

            registration.accept(&id, ctx)
        })
    }

    pub fn reject_registration(
        &mut self,
        handle: ServerRegistrationHandle,
        code: u16,
    ) -> Result<(), Error> {
        self.with_set(handle.0, |set, ctx| {
            let id = set.id().clone();
            let registration = set
                .server_registration
                .as_mut()
                .ok_or(Error::UnknownHandle)?;

            registration.reject(&id, ctx, code)
        })
    }

    /// Answer a request delivered to
    /// [`OutOfDialogHandler::on_received_request`].
    pub fn answer_out_of_dialog(
        &mut self,
        handle: OutOfDialogHandle,
        code: u16,
        body: Body,
    ) -> Result<(), Error> {
        self.with_set(handle.0, |set, ctx| {
            let id = set.id().clone();
            let usage = set
                .server_out_of_dialog
                .as_mut()
                .filter(|it| it.handle() == handle)
                .ok_or(Error::UnknownHandle)?;

            usage.answer(&id, ctx, code, body)
        })
    }

    fn with_client_subscription<T>(
        &mut self,
        handle: ClientSubscriptionHandle,
        f: impl FnOnce(&mut ClientSubscription, &mut DialogInner, &mut Context) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.with_dialog(handle.0, |dialog, ctx| {
            let subscription = dialog
                .client_subscriptions
                .iter_mut()
                .find(|it| it.handle() == handle)
                .ok_or(Error::UnknownHandle)?;

            f(subscription, &mut dialog.inner, ctx)
        })
    }

    fn with_server_subscription<T>(
        &mut self,
        handle: ServerSubscriptionHandle,
        f: impl FnOnce(&mut ServerSubscription, &mut DialogInner, &mut Context) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.with_dialog(handle.0, |dialog, ctx| {
            let subscription = dialog
                .server_subscriptions
                .iter_mut()
                .find(|it| it.handle() == handle)
                .ok_or(Error::UnknownHandle)?;

            f(subscription, &mut dialog.inner, ctx)
        })
    }

    pub fn refresh_subscription(&mut self, handle: ClientSubscriptionHandle) -> Result<(), Error> {
        self.with_client_subscription(handle, |it, dialog, ctx| it.refresh(dialog, ctx))
    }

    /// Unsubscribe, the usage ends with the terminating NOTIFY.
    pub fn end_subscription(&mut self, handle: ClientSubscriptionHandle) -> Result<(), Error> {
        self.with_client_subscription(handle, |it, dialog, ctx| it.end(dialog, ctx))
    }

    /// Answer the pending SUBSCRIBE with 200 or 202.
    pub fn accept_subscription(
        &mut self,
        handle: ServerSubscriptionHandle,
        code: u16,
    ) -> Result<(), Error> {
        self.with_server_subscription(handle, |it, dialog, ctx| it.accept(dialog, ctx, code))
    }

    pub fn reject_subscription(
        &mut self,
        handle: ServerSubscriptionHandle,
        code: u16,
    ) -> Result<(), Error> {
        self.with_server_subscription(handle, |it, dialog, ctx| it.reject(dialog, ctx, code))
    }

    pub fn send_notify(
        &mut self,
        handle: ServerSubscriptionHandle,
        state: SubState,
        body: Body,
    ) -> Result<(), Error> {
        self.with_server_subscription(handle, |it, dialog, ctx| {
            it.send_notify(dialog, ctx, state, body)
        })
    }

    /// Terminate a subscription with a final NOTIFY.
    pub fn end_server_subscription(&mut self, handle: ServerSubscriptionHandle) -> Result<(), Error> {
        self.with_server_subscription(handle, |it, dialog, ctx| it.end(dialog, ctx))
    }
}
