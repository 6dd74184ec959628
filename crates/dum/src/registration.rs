use std::time::Duration;

use crate::{
    ClientRegistrationHandle, Error, ServerRegistrationHandle,
    dialog::DialogSetId,
    message::{NameAddr, SipMessage},
    timer::{TIMER_H, Target, TimerKind},
    usage_manager::Context,
};

/// Binding of the local contact at a registrar, refreshed before it
/// expires. The REGISTER itself is the creator of the dialog set.
pub struct ClientRegistration {
    handle: ClientRegistrationHandle,
    expires: u32,
    pending: bool,
    removing: bool,
    ended: bool,
    seq: u32,
}

impl ClientRegistration {
    pub(crate) fn new(handle: ClientRegistrationHandle) -> Self {
        Self {
            pending: true,
            removing: false,
            ended: false,
            expires: 0,
            seq: 0,
            handle,
        }
    }

    pub fn handle(&self) -> ClientRegistrationHandle {
        self.handle
    }

    /// Interval granted by the last successful REGISTER.
    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn dispatch_response(
        &mut self,
        id: &DialogSetId,
        ctx: &mut Context,
        request: &mut SipMessage,
        response: &SipMessage,
    ) {
        let Some(code) = response.code().filter(|it| *it >= 200) else {
            return;
        };

        if response.cseq != request.cseq {
            return;
        }

        self.pending = false;

        match code {
            200..300 if self.removing => {
                log::info!("sip registration removed: handle={:?}", self.handle);

                self.end(id, ctx);
                ctx.handlers.client_registration.on_removed(self.handle, response);
            }
            200..300 => {
                self.expires = response
                    .contacts
                    .iter()
                    .find(|it| it.uri == ctx.profile.contact.uri)
                    .and_then(|it| it.expires)
                    .or(response.expires)
                    .or(request.expires)
                    .unwrap_or(ctx.profile.register_expires);

                log::info!(
                    "sip registration succeeded: handle={:?}, expires={}",
                    self.handle,
                    self.expires
                );

                self.seq += 1;
                ctx.schedule(
                    Duration::from_secs(u64::from(self.expires.max(1)) * 9 / 10),
                    Target::DialogSet(id.clone()),
                    TimerKind::Registration { seq: self.seq },
                );

                ctx.handlers
                    .client_registration
                    .on_success(self.handle, response, self.expires);
            }
            423 if response.min_expires.is_some() && !self.removing => {
                request.expires = response.min_expires;
                request.next_transaction();

                self.pending = true;
                ctx.send(request.clone());
            }
            _ => {
                log::warn!("sip registration failed: handle={:?}, code={code}", self.handle);

                self.end(id, ctx);
                ctx.handlers.client_registration.on_failure(self.handle, response);
            }
        }
    }

    pub(crate) fn refresh(&mut self, ctx: &mut Context, request: &mut SipMessage) -> Result<(), Error> {
        if self.ended || self.removing {
            return Err(Error::Terminated);
        }

        if self.pending {
            return Err(Error::AlreadyPending);
        }

        request.next_transaction();
        self.pending = true;
        ctx.send(request.clone());
        Ok(())
    }

    /// Unregister the contact, expires 0.
    pub(crate) fn remove(&mut self, ctx: &mut Context, request: &mut SipMessage) -> Result<(), Error> {
        if self.ended {
            return Err(Error::Terminated);
        }

        if self.pending {
            return Err(Error::AlreadyPending);
        }

        request.expires = Some(0);
        request.next_transaction();

        self.seq += 1;
        self.removing = true;
        self.pending = true;
        ctx.send(request.clone());
        Ok(())
    }

    pub(crate) fn on_timer(&mut self, ctx: &mut Context, request: &mut SipMessage, seq: u32) {
        if seq != self.seq || self.pending || self.removing || self.ended {
            return;
        }

        log::debug!("sip registration refresh: handle={:?}", self.handle);

        let _ = self.refresh(ctx, request);
    }

    fn end(&mut self, id: &DialogSetId, ctx: &mut Context) {
        self.ended = true;
        self.seq += 1;
        ctx.schedule(TIMER_H, Target::DialogSet(id.clone()), TimerKind::Reap);
    }
}

/// REGISTER received from a client, answered by the application. Each
/// answer ends the usage until the next REGISTER of the same client.
pub struct ServerRegistration {
    handle: ServerRegistrationHandle,
    pending: Option<SipMessage>,
    ended: bool,
}

impl ServerRegistration {
    pub(crate) fn new(handle: ServerRegistrationHandle) -> Self {
        Self {
            pending: None,
            ended: false,
            handle,
        }
    }

    pub fn handle(&self) -> ServerRegistrationHandle {
        self.handle
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn requested_expires(&self, ctx: &Context, request: &SipMessage) -> u32 {
        request
            .contacts
            .iter()
            .find_map(|it| it.expires)
            .or(request.expires)
            .unwrap_or(ctx.profile.register_expires)
    }

    pub(crate) fn dispatch(&mut self, id: &DialogSetId, ctx: &mut Context, request: &SipMessage) {
        if self.pending.is_some() {
            let mut response = response(id, request, 500);
            response.retry_after = Some(1);
            ctx.send(response);
            return;
        }

        let expires = self.requested_expires(ctx, request);
        if expires != 0 && expires < ctx.profile.min_register_expires {
            let mut response = response(id, request, 423);
            response.min_expires = Some(ctx.profile.min_register_expires);
            ctx.send(response);
            self.end(id, ctx);
            return;
        }

        self.ended = false;
        self.pending = Some(request.clone());
        ctx.handlers.server_registration.on_register(self.handle, request);
    }

    /// 200 listing the registered contacts with their granted expiry.
    pub(crate) fn accept(&mut self, id: &DialogSetId, ctx: &mut Context) -> Result<(), Error> {
        let request = self.pending.take().ok_or(Error::InvalidState)?;
        let expires = self.requested_expires(ctx, &request);

        let mut response = response(id, &request, 200);
        response.expires = Some(expires);
        response.contacts = request
            .contacts
            .iter()
            .map(|it| NameAddr {
                expires: Some(expires),
                ..it.clone()
            })
            .collect();

        ctx.send(response);
        self.end(id, ctx);
        Ok(())
    }

    pub(crate) fn reject(&mut self, id: &DialogSetId, ctx: &mut Context, code: u16) -> Result<(), Error> {
        if code < 300 {
            return Err(Error::InvalidState);
        }

        let request = self.pending.take().ok_or(Error::InvalidState)?;
        ctx.send(response(id, &request, code));
        self.end(id, ctx);
        Ok(())
    }

    fn end(&mut self, id: &DialogSetId, ctx: &mut Context) {
        self.ended = true;
        ctx.schedule(TIMER_H, Target::DialogSet(id.clone()), TimerKind::Reap);
    }
}

/// Response outside of a dialog, To tagged with the local tag of the set.
pub(crate) fn response(id: &DialogSetId, request: &SipMessage, code: u16) -> SipMessage {
    let mut response = SipMessage::response(request, code);
    if response.to.tag.is_none() {
        response.to.tag = Some(id.local_tag.clone());
    }

    response
}
