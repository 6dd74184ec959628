use super::{Event, InviteSession, InviteState, TerminatedReason, classify};
use crate::{
    dialog::DialogInner,
    message::SipMessage,
    timer::{STALE_CALL, TimerKind},
    usage_manager::Context,
};

impl InviteSession {
    /// Responses and requests before the initial INVITE of this side was
    /// acknowledged.
    pub(super) fn dispatch_client(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        msg: &SipMessage,
    ) {
        use InviteState::*;

        match (self.state, classify(msg)) {
            (UacStart | UacEarly, Event::Provisional(sdp)) => {
                self.transition(UacEarly);
                self.stale_call_seq += 1;
                ctx.schedule(
                    STALE_CALL,
                    Self::target(dialog),
                    TimerKind::StaleCall {
                        seq: self.stale_call_seq,
                    },
                );

                ctx.handlers.invite.on_provisional(self.handle, msg);

                if let Some(sdp) = sdp {
                    ctx.handlers.invite.on_early_media(self.handle, msg, sdp);
                }
            }
            (UacStart | UacEarly, Event::Success(sdp)) => {
                self.stale_call_seq += 1;
                self.timer_from_response(msg);

                match (self.proposed_local_sdp.take(), sdp) {
                    (Some(offer), Some(answer)) => {
                        self.send_ack(dialog, ctx, msg, None);
                        self.commit(Some(offer), Some(answer.clone()));
                        self.transition(Connected);
                        self.start_session_timer(dialog, ctx);

                        ctx.handlers.invite.on_answer(self.handle, msg, answer);
                        ctx.handlers.invite.on_connected(self.handle, msg);
                    }
                    (None, Some(offer)) => {
                        self.proposed_remote_sdp = Some(offer.clone());
                        self.answered = Some(msg.clone());
                        self.transition(UacAnswered);

                        ctx.handlers.invite.on_offer(self.handle, msg, offer);
                    }
                    (_, None) => {
                        self.send_ack(dialog, ctx, msg, None);
                        ctx.handlers.invite.on_illegal_negotiation(self.handle, msg);
                        self.send_bye(dialog, ctx, TerminatedReason::Error, Some(msg));
                    }
                }
            }
            (
                UacStart | UacEarly,
                Event::Failure | Event::Fatal | Event::Glare | Event::IntervalTooSmall,
            ) => {
                self.stale_call_seq += 1;
                ctx.handlers.invite.on_failure(self.handle, msg);

                let reason = match msg.code() {
                    Some(408) => TerminatedReason::Timeout,
                    _ => TerminatedReason::Rejected,
                };

                self.terminate(dialog, ctx, reason, Some(msg));
            }
            (UacCancelled, Event::Success(_)) => {
                self.send_ack(dialog, ctx, msg, None);
                self.send_bye(dialog, ctx, TerminatedReason::LocalCancel, Some(msg));
            }
            (
                UacCancelled,
                Event::Failure | Event::Fatal | Event::Glare | Event::IntervalTooSmall,
            ) => {
                self.terminate(dialog, ctx, TerminatedReason::LocalCancel, Some(msg));
            }
            (_, Event::Bye) => {
                ctx.send(dialog.make_response(msg, 200));
                self.terminate(dialog, ctx, TerminatedReason::RemoteBye, Some(msg));
            }
            (_, Event::Info | Event::Message | Event::Prack) => {
                self.dispatch_others(dialog, ctx, msg);
            }
            (_, Event::Invite(_) | Event::Update(_) | Event::Cancel) => {
                ctx.send(dialog.make_response(msg, 481));
            }
            _ => log::debug!(
                "uac invite session ignored message: handle={:?}, state={:?}, code={:?}",
                self.handle,
                self.state,
                msg.code()
            ),
        }
    }
}
