use rand::Rng;

use super::{Event, InviteSession, InviteState, Role, TerminatedReason, classify};
use crate::{Error, dialog::DialogInner, message::SipMessage, usage_manager::Context};

impl InviteSession {
    /// Requests before the 2xx to the received INVITE was acknowledged.
    pub(super) fn dispatch_server(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        msg: &SipMessage,
    ) {
        use InviteState::*;

        match (self.state, classify(msg)) {
            (UasStart, Event::Invite(offer)) => {
                if !self.check_session_interval(dialog, ctx, msg) {
                    self.terminate(dialog, ctx, TerminatedReason::Rejected, Some(msg));
                    return;
                }

                self.timer_from_request(ctx.profile, msg);
                ctx.handlers.invite.on_new_session(self.handle, Role::Uas, msg);

                match offer {
                    Some(sdp) => {
                        self.proposed_remote_sdp = Some(sdp.clone());
                        self.transition(UasOffer);
                        ctx.handlers.invite.on_offer(self.handle, msg, sdp);
                    }
                    None => {
                        self.transition(UasNoOffer);
                        ctx.handlers.invite.on_offer_required(self.handle, msg);
                    }
                }
            }
            (_, Event::Invite(_) | Event::Update(_)) => {
                let mut response = dialog.make_response(msg, 500);
                response.retry_after = Some(rand::rng().random_range(0..10));
                ctx.send(response);
            }
            (_, Event::Ack(sdp)) => self.on_ack(dialog, ctx, msg, sdp),
            (state, Event::Cancel) if state.is_uas_early() => {
                ctx.send(dialog.make_response(msg, 200));
                ctx.send(dialog.make_response(&self.invite, 487));
                self.terminate(dialog, ctx, TerminatedReason::RemoteCancel, Some(msg));
            }
            (_, Event::Cancel) => ctx.send(dialog.make_response(msg, 200)),
            (state, Event::Bye) => {
                if state.is_uas_early() {
                    ctx.send(dialog.make_response(&self.invite, 487));
                }

                ctx.send(dialog.make_response(msg, 200));
                self.terminate(dialog, ctx, TerminatedReason::RemoteBye, Some(msg));
            }
            (_, Event::Info | Event::Message | Event::Prack) => {
                self.dispatch_others(dialog, ctx, msg);
            }
            _ => log::debug!(
                "uas invite session ignored message: handle={:?}, state={:?}, method={}",
                self.handle,
                self.state,
                msg.method()
            ),
        }
    }

    /// Send a 1xx to the received INVITE, a 183 carries the proposed
    /// answer or offer.
    pub(crate) fn provisional(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        code: u16,
    ) -> Result<(), Error> {
        use InviteState::*;

        if !(101..200).contains(&code) {
            return Err(Error::InvalidState);
        }

        let next = match self.state {
            UasOffer | UasEarlyOffer => UasEarlyOffer,
            UasOfferProvidedAnswer | UasEarlyProvidedAnswer => UasEarlyProvidedAnswer,
            UasNoOffer | UasEarlyNoOffer => UasEarlyNoOffer,
            UasProvidedOffer | UasEarlyProvidedOffer => UasEarlyProvidedOffer,
            Terminated => return Err(Error::Terminated),
            _ => return Err(Error::InvalidState),
        };

        let mut response = dialog.make_response(&self.invite, code);
        if code == 183 {
            response.body = self.proposed_local_sdp.clone().into();
        }

        ctx.send(response);
        self.transition(next);
        Ok(())
    }

    /// Send the 2xx to the received INVITE. An answer or an offer must have
    /// been provided first.
    pub(crate) fn accept(
        &mut self,
        dialog: &mut DialogInner,
        ctx: &mut Context,
        code: u16,
    ) -> Result<(), Error> {
        use InviteState::*;

        if !(200..300).contains(&code) {
            return Err(Error::InvalidState);
        }

        let invite = self.invite.clone();
        match self.state {
            UasOfferProvidedAnswer | UasEarlyProvidedAnswer => {
                let answer = self.proposed_local_sdp.take();
                let offer = self.proposed_remote_sdp.take();
                self.commit(answer.clone(), offer);
                self.send_2xx(dialog, ctx, &invite, code, answer);
                self.transition(UasAccepted);
                self.start_session_timer(dialog, ctx);
            }
            UasProvidedOffer | UasEarlyProvidedOffer => {
                let offer = self.proposed_local_sdp.clone();
                self.send_2xx(dialog, ctx, &invite, code, offer);
                self.transition(UasAcceptedWaitingAnswer);
            }
            Terminated => return Err(Error::Terminated),
            _ => return Err(Error::InvalidState),
        }

        dialog.confirmed = true;
        Ok(())
    }
}
