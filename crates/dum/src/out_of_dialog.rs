use crate::{
    Error, OutOfDialogHandle,
    dialog::DialogSetId,
    message::{Body, SipMessage},
    registration::response,
    timer::{TIMER_H, Target, TimerKind},
    usage_manager::Context,
};

/// OPTIONS, MESSAGE or PUBLISH sent outside of a dialog.
pub struct ClientOutOfDialog {
    handle: OutOfDialogHandle,
    ended: bool,
}

impl ClientOutOfDialog {
    pub(crate) fn new(handle: OutOfDialogHandle) -> Self {
        Self {
            ended: false,
            handle,
        }
    }

    pub fn handle(&self) -> OutOfDialogHandle {
        self.handle
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn dispatch_response(&mut self, id: &DialogSetId, ctx: &mut Context, response: &SipMessage) {
        let Some(code) = response.code().filter(|it| *it >= 200) else {
            return;
        };

        if self.ended {
            return;
        }

        if code < 300 {
            ctx.handlers.out_of_dialog.on_success(self.handle, response);
        } else {
            ctx.handlers.out_of_dialog.on_failure(self.handle, response);
        }

        self.ended = true;
        ctx.schedule(TIMER_H, Target::DialogSet(id.clone()), TimerKind::Reap);
    }
}

/// Request received outside of a dialog, waiting for the application's
/// answer.
pub struct ServerOutOfDialog {
    handle: OutOfDialogHandle,
    pending: Option<SipMessage>,
}

impl ServerOutOfDialog {
    pub(crate) fn new(handle: OutOfDialogHandle) -> Self {
        Self {
            pending: None,
            handle,
        }
    }

    pub fn handle(&self) -> OutOfDialogHandle {
        self.handle
    }

    pub fn is_ended(&self) -> bool {
        self.pending.is_none()
    }

    pub(crate) fn dispatch(&mut self, id: &DialogSetId, ctx: &mut Context, request: &SipMessage) {
        if self.pending.is_some() {
            let mut response = response(id, request, 500);
            response.retry_after = Some(1);
            ctx.send(response);
            return;
        }

        self.pending = Some(request.clone());
        ctx.handlers.out_of_dialog.on_received_request(self.handle, request);
    }

    pub(crate) fn answer(
        &mut self,
        id: &DialogSetId,
        ctx: &mut Context,
        code: u16,
        body: Body,
    ) -> Result<(), Error> {
        if code < 200 {
            return Err(Error::InvalidState);
        }

        let request = self.pending.take().ok_or(Error::InvalidState)?;
        let mut response = response(id, &request, code);
        response.body = body;
        ctx.send(response);
        ctx.schedule(TIMER_H, Target::DialogSet(id.clone()), TimerKind::Reap);
        Ok(())
    }
}
