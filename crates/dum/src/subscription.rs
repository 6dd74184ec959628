//! Minimal RFC 6665 subscriptions: SUBSCRIBE/NOTIFY inside a dialog, and
//! the implicit subscription of a REFER.

use std::time::Duration;

use crate::{
    ClientSubscriptionHandle, Error, ServerSubscriptionHandle,
    dialog::DialogInner,
    message::{Body, Method, SipMessage, SubState, SubscriptionState},
    timer::{TIMER_H, Target, TimerKind},
    usage_manager::Context,
};

pub struct ClientSubscription {
    handle: ClientSubscriptionHandle,
    event: String,
    expires: u32,
    ended: bool,
    seq: u32,
}

impl ClientSubscription {
    pub(crate) fn new(handle: ClientSubscriptionHandle, event: &str) -> Self {
        Self {
            event: event.to_string(),
            ended: false,
            expires: 0,
            seq: 0,
            handle,
        }
    }

    pub fn handle(&self) -> ClientSubscriptionHandle {
        self.handle
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn schedule_refresh(&mut self, dialog: &DialogInner, ctx: &mut Context, expires: u32) {
        self.expires = expires;
        self.seq += 1;

        if expires == 0 {
            return;
        }

        ctx.schedule(
            Duration::from_secs(u64::from(expires) * 9 / 10),
            Target::Dialog(dialog.id.clone()),
            TimerKind::SubscriptionRefresh {
                handle: self.handle.0,
                seq: self.seq,
            },
        );
    }

    fn terminate(&mut self, dialog: &DialogInner, ctx: &mut Context, msg: Option<&SipMessage>) {
        if self.ended {
            return;
        }

        log::info!("sip subscription terminated: handle={:?}, event={}", self.handle, self.event);

        self.ended = true;
        self.seq += 1;
        ctx.handlers.client_subscription.on_terminated(self.handle, msg);
        ctx.schedule(TIMER_H, Target::Dialog(dialog.id.clone()), TimerKind::Reap);
    }

    /// Response to the SUBSCRIBE or REFER.
    pub(crate) fn dispatch_response(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        response: &SipMessage,
    ) {
        match response.code() {
            Some(200..300) => {
                if response.cseq.method == Method::Subscribe {
                    let expires = response.expires.unwrap_or(match self.expires {
                        0 => ctx.profile.subscription_expires,
                        it => it,
                    });

                    self.schedule_refresh(dialog, ctx, expires);
                }
            }
            Some(code) if code >= 300 => self.terminate(dialog, ctx, Some(response)),
            _ => (),
        }
    }

    /// NOTIFY for this subscription.
    pub(crate) fn dispatch_request(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        notify: &SipMessage,
    ) {
        ctx.send(dialog.make_response(notify, 200));

        let state = notify.subscription_state.as_ref();
        match state.map(|it| it.state) {
            Some(SubState::Active) => {
                if let Some(expires) = state.and_then(|it| it.expires) {
                    if self.expires == 0 || expires < self.expires {
                        self.schedule_refresh(dialog, ctx, expires);
                    }
                }

                ctx.handlers.client_subscription.on_update_active(self.handle, notify);
            }
            Some(SubState::Pending) => {
                ctx.handlers.client_subscription.on_update_pending(self.handle, notify);
            }
            Some(SubState::Terminated) | None => self.terminate(dialog, ctx, Some(notify)),
        }
    }

    pub(crate) fn on_refresh_timer(&mut self, dialog: &mut DialogInner, ctx: &mut Context, seq: u32) {
        if seq == self.seq && !self.ended {
            self.send_subscribe(dialog, ctx, self.expires);
        }
    }

    pub(crate) fn refresh(&mut self, dialog: &mut DialogInner, ctx: &mut Context) -> Result<(), Error> {
        if self.ended {
            return Err(Error::Terminated);
        }

        let expires = match self.expires {
            0 => ctx.profile.subscription_expires,
            it => it,
        };

        self.send_subscribe(dialog, ctx, expires);
        Ok(())
    }

    /// Unsubscribe. The usage ends with the terminating NOTIFY.
    pub(crate) fn end(&mut self, dialog: &mut DialogInner, ctx: &mut Context) -> Result<(), Error> {
        if self.ended {
            return Err(Error::Terminated);
        }

        self.seq += 1;
        self.send_subscribe(dialog, ctx, 0);
        Ok(())
    }

    fn send_subscribe(&mut self, dialog: &mut DialogInner, ctx: &mut Context, expires: u32) {
        let mut subscribe = dialog.make_request(Method::Subscribe);
        subscribe.event = Some(self.event.clone());
        subscribe.expires = Some(expires);
        ctx.send(subscribe);
    }
}

pub struct ServerSubscription {
    handle: ServerSubscriptionHandle,
    event: String,
    expires: u32,
    accepted: bool,
    pending: Option<SipMessage>,
    notify_cseq: Option<u32>,
    ended: bool,
}

impl ServerSubscription {
    pub(crate) fn new(handle: ServerSubscriptionHandle, event: &str) -> Self {
        Self {
            event: event.to_string(),
            accepted: false,
            pending: None,
            notify_cseq: None,
            ended: false,
            expires: 0,
            handle,
        }
    }

    pub fn handle(&self) -> ServerSubscriptionHandle {
        self.handle
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// CSeq of the NOTIFY waiting for a response.
    pub fn notify_cseq(&self) -> Option<u32> {
        self.notify_cseq
    }

    fn terminate(&mut self, dialog: &DialogInner, ctx: &mut Context) {
        if self.ended {
            return;
        }

        self.ended = true;
        ctx.handlers.server_subscription.on_terminated(self.handle);
        ctx.schedule(TIMER_H, Target::Dialog(dialog.id.clone()), TimerKind::Reap);
    }

    /// SUBSCRIBE or REFER for this subscription.
    pub(crate) fn dispatch_request(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        request: &SipMessage,
    ) {
        if self.pending.is_some() {
            let mut response = dialog.make_response(request, 500);
            response.retry_after = Some(1);
            ctx.send(response);
            return;
        }

        let expires = request.expires.unwrap_or(ctx.profile.subscription_expires);
        if expires == 0 {
            let mut response = dialog.make_response(request, 200);
            response.expires = Some(0);
            ctx.send(response);

            self.expires = 0;
            self.send_state(dialog, ctx, SubState::Terminated, Body::Empty);
            return;
        }

        self.expires = expires;
        self.pending = Some(request.clone());

        if self.accepted {
            ctx.handlers.server_subscription.on_refresh(self.handle, request);
        } else {
            ctx.handlers
                .server_subscription
                .on_new_subscription(self.handle, request);
        }
    }

    /// Response to a NOTIFY this side sent.
    pub(crate) fn dispatch_response(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        response: &SipMessage,
    ) {
        let Some(code) = response.code().filter(|it| *it >= 200) else {
            return;
        };

        self.notify_cseq = None;
        if code >= 300 {
            log::warn!("sip notify failed: handle={:?}, code={code}", self.handle);

            self.terminate(dialog, ctx);
        }
    }

    /// Answer the pending SUBSCRIBE with 200 or 202.
    pub(crate) fn accept(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        code: u16,
    ) -> Result<(), Error> {
        if !(200..300).contains(&code) {
            return Err(Error::InvalidState);
        }

        let request = self.pending.take().ok_or(Error::InvalidState)?;
        let mut response = dialog.make_response(&request, code);
        if request.method() == Method::Subscribe {
            response.expires = Some(self.expires);
        }

        self.accepted = true;
        ctx.send(response);
        Ok(())
    }

    pub(crate) fn reject(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        code: u16,
    ) -> Result<(), Error> {
        if code < 300 {
            return Err(Error::InvalidState);
        }

        let request = self.pending.take().ok_or(Error::InvalidState)?;
        ctx.send(dialog.make_response(&request, code));

        if !self.accepted {
            self.terminate(dialog, ctx);
        }

        Ok(())
    }

    pub(crate) fn send_notify(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        state: SubState,
        body: Body,
    ) -> Result<(), Error> {
        if self.ended {
            return Err(Error::Terminated);
        }

        if !self.accepted {
            return Err(Error::InvalidState);
        }

        self.send_state(dialog, ctx, state, body);
        Ok(())
    }

    pub(crate) fn end(&mut self, dialog: &mut DialogInner, ctx: &mut Context) -> Result<(), Error> {
        if self.ended {
            return Err(Error::Terminated);
        }

        self.send_state(dialog, ctx, SubState::Terminated, Body::Empty);
        Ok(())
    }

    fn send_state(&mut self, dialog: &mut DialogInner, ctx: &mut Context, state: SubState, body: Body) {
        let mut notify = dialog.make_request(Method::Notify);
        notify.event = Some(self.event.clone());
        notify.subscription_state = Some(SubscriptionState {
            expires: (state != SubState::Terminated).then_some(self.expires),
            reason: (state == SubState::Terminated).then(|| "noresource".to_string()),
            state,
        });

        notify.body = body;
        self.notify_cseq = Some(notify.cseq.seq);
        ctx.send(notify);

        if state == SubState::Terminated {
            self.terminate(dialog, ctx);
        }
    }
}
