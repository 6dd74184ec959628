use ahash::AHashMap;

use crate::{
    Error, OutOfDialogHandle, ServerRegistrationHandle,
    dialog::{Dialog, DialogInner, DialogSetId},
    message::{Method, SessionExpires, SipMessage, make_cancel},
    out_of_dialog::{ClientOutOfDialog, ServerOutOfDialog},
    registration::{ClientRegistration, ServerRegistration, response},
    timer::{TIMER_H, Target, TimerKind},
    usage_manager::{Context, Location},
};

/// Every dialog forked from one request, keyed by remote tag, plus the
/// usages that never form a dialog.
pub struct DialogSet {
    id: DialogSetId,
    /// Request that created the set on the UAC side, resent with new
    /// credentials or a larger Min-SE.
    pub(crate) creator: Option<SipMessage>,
    pub(crate) dialogs: AHashMap<String, Dialog>,
    pub(crate) registration: Option<ClientRegistration>,
    pub(crate) server_registration: Option<ServerRegistration>,
    pub(crate) client_out_of_dialog: Option<ClientOutOfDialog>,
    pub(crate) server_out_of_dialog: Option<ServerOutOfDialog>,
    received_provisional: bool,
    /// A final response to the creator arrived.
    completed: bool,
    cancelled: bool,
}

impl DialogSet {
    pub(crate) fn new(id: DialogSetId, creator: Option<SipMessage>) -> Self {
        Self {
            dialogs: AHashMap::new(),
            registration: None,
            server_registration: None,
            client_out_of_dialog: None,
            server_out_of_dialog: None,
            received_provisional: false,
            completed: false,
            cancelled: false,
            creator,
            id,
        }
    }

    pub fn id(&self) -> &DialogSetId {
        &self.id
    }

    pub fn dialogs(&self) -> impl Iterator<Item = &Dialog> {
        self.dialogs.values()
    }

    pub fn received_provisional(&self) -> bool {
        self.received_provisional
    }

    pub(crate) fn is_finished(&self) -> bool {
        let creator_done = self.completed
            || self.creator.as_ref().is_none_or(|it| {
                !matches!(it.method(), Method::Invite | Method::Subscribe | Method::Refer)
            });

        creator_done
            && self.dialogs.is_empty()
            && self.registration.as_ref().is_none_or(|it| it.is_ended())
            && self.server_registration.as_ref().is_none_or(|it| it.is_ended())
            && self.client_out_of_dialog.as_ref().is_none_or(|it| it.is_ended())
            && self.server_out_of_dialog.as_ref().is_none_or(|it| it.is_ended())
    }

    /// Raw ids of every handle pointing into the set.
    pub(crate) fn handles(&self) -> Vec<u64> {
        self.dialogs
            .values()
            .flat_map(|it| it.handles())
            .chain(self.registration.iter().map(|it| it.handle().0))
            .chain(self.server_registration.iter().map(|it| it.handle().0))
            .chain(self.client_out_of_dialog.iter().map(|it| it.handle().0))
            .chain(self.server_out_of_dialog.iter().map(|it| it.handle().0))
            .collect()
    }

    /// Drop the finished dialogs, returning the handles they owned.
    pub(crate) fn reap_dialogs(&mut self) -> Vec<u64> {
        let finished = self
            .dialogs
            .iter()
            .filter(|(_, it)| it.is_finished())
            .map(|(tag, _)| tag.clone())
            .collect::<Vec<_>>();

        finished
            .into_iter()
            .filter_map(|tag| self.dialogs.remove(&tag))
            .flat_map(|it| {
                log::debug!("sip dialog reaped: dialog={}", it.id());

                it.handles()
            })
            .collect()
    }

    pub(crate) fn dialog_mut(&mut self, remote_tag: &str) -> Option<&mut Dialog> {
        self.dialogs.get_mut(remote_tag)
    }

    pub(crate) fn dispatch_request(&mut self, ctx: &mut Context, request: &SipMessage) {
        let method = request.method();
        let in_dialog = request.to.tag.is_some();

        match method {
            Method::Register => return self.dispatch_register(ctx, request),
            Method::Options | Method::Message | Method::Publish | Method::Notify if !in_dialog => {
                return self.dispatch_out_of_dialog(ctx, request);
            }
            Method::Cancel => {
                if self.dialogs.is_empty() {
                    ctx.send(response(&self.id, request, 481));
                }

                for dialog in self.dialogs.values_mut() {
                    dialog.dispatch_request(ctx, request);
                }

                return;
            }
            _ => (),
        }

        let Some(remote_tag) = request.from.tag.clone() else {
            if method != Method::Ack {
                ctx.send(response(&self.id, request, 400));
            }

            return;
        };

        if let Some(dialog) = self.dialogs.get_mut(&remote_tag) {
            return dialog.dispatch_request(ctx, request);
        }

        let creator = self
            .creator
            .as_ref()
            .filter(|it| matches!(it.method(), Method::Subscribe | Method::Refer));

        match (method, creator) {
            (Method::Invite | Method::Subscribe | Method::Refer, _) if !in_dialog => {
                match DialogInner::from_request(
                    request,
                    &self.id.local_tag,
                    ctx.profile.contact.clone(),
                    None,
                ) {
                    Ok(inner) => {
                        let mut dialog = Dialog::new(inner);
                        dialog.dispatch_request(ctx, request);
                        self.dialogs.insert(remote_tag, dialog);
                    }
                    Err(e) => {
                        log::warn!("sip dialog not created: method={method}, err={e}");

                        ctx.send(response(&self.id, request, 400));
                    }
                }
            }
            (Method::Notify, Some(creator)) => {
                match DialogInner::from_request(
                    request,
                    &self.id.local_tag,
                    ctx.profile.contact.clone(),
                    Some(creator),
                ) {
                    Ok(inner) => {
                        let mut dialog = Dialog::new(inner);
                        dialog.dispatch_early_notify(ctx, request, creator);
                        self.dialogs.insert(remote_tag, dialog);
                    }
                    Err(e) => {
                        log::warn!("sip notify dialog not created: err={e}");

                        ctx.send(response(&self.id, request, 400));
                    }
                }
            }
            (Method::Ack, _) => log::debug!("sip stray ack dropped: call_id={}", request.call_id),
            _ => ctx.send(response(&self.id, request, 481)),
        }
    }

    fn dispatch_register(&mut self, ctx: &mut Context, request: &SipMessage) {
        let registration = self.server_registration.get_or_insert_with(|| {
            let handle = ctx.registry.register(Location::DialogSet(self.id.clone()));
            ServerRegistration::new(ServerRegistrationHandle(handle))
        });

        registration.dispatch(&self.id, ctx, request);
    }

    fn dispatch_out_of_dialog(&mut self, ctx: &mut Context, request: &SipMessage) {
        let usage = self.server_out_of_dialog.get_or_insert_with(|| {
            let handle = ctx.registry.register(Location::DialogSet(self.id.clone()));
            ServerOutOfDialog::new(OutOfDialogHandle(handle))
        });

        usage.dispatch(&self.id, ctx, request);
    }

    pub(crate) fn dispatch_response(&mut self, ctx: &mut Context, response: &SipMessage) {
        let Some(code) = response.code() else {
            return;
        };

        let method = response.cseq.method;
        let is_creator = self
            .creator
            .as_ref()
            .is_some_and(|it| it.cseq == response.cseq);

        if let Some(creator) = self.creator.as_mut().filter(|_| is_creator) {
            if ctx.client_auth.handle(creator, response) {
                log::info!(
                    "sip request resent with credentials: method={method}, cseq={}",
                    creator.cseq.seq
                );

                ctx.send(creator.clone());
                return;
            }

            if let Some(min_se) = response.min_se.filter(|_| {
                code == 422 && method == Method::Invite && self.dialogs.is_empty()
            }) {
                let interval = creator.session_expires.map(|it| it.interval).unwrap_or(0);
                creator.min_se = Some(min_se);
                creator.session_expires = Some(SessionExpires {
                    interval: interval.max(min_se),
                    refresher: None,
                });

                creator.next_transaction();
                ctx.send(creator.clone());
                return;
            }
        }

        match method {
            Method::Register => {
                if let (Some(registration), Some(creator)) =
                    (&mut self.registration, &mut self.creator)
                {
                    registration.dispatch_response(&self.id, ctx, creator, response);
                }

                return;
            }
            Method::Options | Method::Message | Method::Publish
                if self.client_out_of_dialog.is_some() =>
            {
                if let Some(usage) = &mut self.client_out_of_dialog {
                    usage.dispatch_response(&self.id, ctx, response);
                }

                return;
            }
            _ => (),
        }

        if code == 100 {
            self.received_provisional = true;
            return;
        }

        if code >= 200 && is_creator {
            self.completed = true;
        }

        let Some(remote_tag) = response.to.tag.clone() else {
            log::debug!("sip response without to tag dropped: method={method}, code={code}");

            return;
        };

        if ctx.profile.loose_to_tag_matching && !self.dialogs.contains_key(&remote_tag) {
            self.rekey(ctx, response, &remote_tag);
        }

        if let Some(dialog) = self.dialogs.get_mut(&remote_tag) {
            return dialog.dispatch_response(ctx, response, self.creator.as_ref(), self.cancelled);
        }

        if code < 200 && response.contacts.is_empty() {
            self.received_provisional = true;
            return;
        }

        if code >= 300 && !self.dialogs.is_empty() {
            for dialog in self.dialogs.values_mut() {
                dialog.dispatch_response(ctx, response, self.creator.as_ref(), self.cancelled);
            }

            return;
        }

        let Some(creator) = self.creator.as_ref().filter(|_| is_creator) else {
            log::debug!("sip response without dialog dropped: method={method}, code={code}");

            return;
        };

        match DialogInner::from_response(response, creator, ctx.profile.contact.clone()) {
            Ok(inner) => {
                log::debug!("sip dialog created: dialog={}", inner.id());

                let mut dialog = Dialog::new(inner);
                dialog.dispatch_response(ctx, response, Some(creator), self.cancelled);
                self.dialogs.insert(remote_tag, dialog);
            }
            Err(e) => log::warn!("sip dialog not created: code={code}, err={e}"),
        }
    }

    /// Move an early dialog whose remote target matches the single Contact
    /// of `response` under the new remote tag.
    fn rekey(&mut self, ctx: &mut Context, response: &SipMessage, remote_tag: &str) {
        let [contact] = response.contacts.as_slice() else {
            return;
        };

        let Some(old) = self
            .dialogs
            .iter()
            .find(|(_, it)| !it.inner.confirmed && it.inner.remote_target == contact.uri)
            .map(|(tag, _)| tag.clone())
        else {
            return;
        };

        if let Some(mut dialog) = self.dialogs.remove(&old) {
            log::info!("sip dialog re-keyed: from={old}, to={remote_tag}");

            dialog.rekey(ctx, remote_tag);
            self.dialogs.insert(remote_tag.to_string(), dialog);
        }
    }

    /// CANCEL the creator INVITE once, for every fork.
    pub(crate) fn cancel(&mut self, ctx: &mut Context) -> Result<(), Error> {
        let creator = self
            .creator
            .as_ref()
            .filter(|it| it.method() == Method::Invite)
            .ok_or(Error::InvalidState)?;

        if self.cancelled {
            return Ok(());
        }

        if self.completed {
            return Err(Error::InvalidState);
        }

        ctx.send(make_cancel(creator));
        self.cancelled = true;

        for dialog in self.dialogs.values_mut() {
            if let Some(session) = &mut dialog.invite {
                session.on_cancel_sent(&mut dialog.inner, ctx);
            }
        }

        ctx.schedule(TIMER_H, Target::DialogSet(self.id.clone()), TimerKind::Cancelled);
        Ok(())
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut Context, kind: &TimerKind) {
        match kind {
            TimerKind::Cancelled => {
                self.completed = true;
                ctx.schedule(
                    std::time::Duration::ZERO,
                    Target::DialogSet(self.id.clone()),
                    TimerKind::Reap,
                );
            }
            TimerKind::Registration { seq } => {
                if let (Some(registration), Some(creator)) =
                    (&mut self.registration, &mut self.creator)
                {
                    registration.on_timer(ctx, creator, *seq);
                }
            }
            _ => (),
        }
    }

    pub(crate) fn on_dialog_timer(&mut self, ctx: &mut Context, remote_tag: &str, kind: &TimerKind) {
        if let Some(dialog) = self.dialogs.get_mut(remote_tag) {
            dialog.on_timer(ctx, kind);
        }
    }
}
