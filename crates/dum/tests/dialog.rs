use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use bytes::Bytes;
use parking_lot::Mutex;
use sipturn_dum::{
    Body, ClientSubscriptionHandle, DialogUsageManager, Error, InviteSessionHandle, InviteState,
    Method, OutOfDialogHandle, PendingOffer, Profile, Role, Sdp, ServerSubscriptionHandle,
    SipMessage, TerminatedReason,
    handler::{
        ClientSubscriptionHandler, InviteSessionHandler, OutOfDialogHandler,
        ServerSubscriptionHandler,
    },
    message::{NameAddr, Refresher, SessionExpires, SubState, Uri, new_branch},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    NewSession(InviteSessionHandle, Role),
    Provisional(u16),
    EarlyMedia,
    Offer(Sdp),
    Answer(Sdp),
    Connected,
    Failure(u16),
    Terminated(TerminatedReason),
    Info(u32),
    AckNotReceived,
    SessionExpired,
    StaleReinvite,
    SubscriptionActive(ClientSubscriptionHandle),
    SubscriptionTerminated(ClientSubscriptionHandle),
    NewSubscription(ServerSubscriptionHandle),
    ServerSubscriptionTerminated(ServerSubscriptionHandle),
    Request(OutOfDialogHandle, Method),
    Success(OutOfDialogHandle),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }

    fn session(&self) -> Result<InviteSessionHandle> {
        self.0
            .lock()
            .iter()
            .find_map(|it| match it {
                Event::NewSession(handle, _) => Some(*handle),
                _ => None,
            })
            .ok_or_else(|| anyhow!("no session"))
    }
}

impl InviteSessionHandler for Recorder {
    fn on_new_session(&mut self, handle: InviteSessionHandle, role: Role, _: &SipMessage) {
        self.push(Event::NewSession(handle, role));
    }

    fn on_provisional(&mut self, _: InviteSessionHandle, msg: &SipMessage) {
        self.push(Event::Provisional(msg.code().unwrap_or_default()));
    }

    fn on_early_media(&mut self, _: InviteSessionHandle, _: &SipMessage, _: &Sdp) {
        self.push(Event::EarlyMedia);
    }

    fn on_failure(&mut self, _: InviteSessionHandle, msg: &SipMessage) {
        self.push(Event::Failure(msg.code().unwrap_or_default()));
    }

    fn on_offer(&mut self, _: InviteSessionHandle, _: &SipMessage, offer: &Sdp) {
        self.push(Event::Offer(offer.clone()));
    }

    fn on_answer(&mut self, _: InviteSessionHandle, _: &SipMessage, answer: &Sdp) {
        self.push(Event::Answer(answer.clone()));
    }

    fn on_connected(&mut self, _: InviteSessionHandle, _: &SipMessage) {
        self.push(Event::Connected);
    }

    fn on_terminated(
        &mut self,
        _: InviteSessionHandle,
        reason: TerminatedReason,
        _: Option<&SipMessage>,
    ) {
        self.push(Event::Terminated(reason));
    }

    fn on_info(&mut self, _: InviteSessionHandle, msg: &SipMessage) {
        self.push(Event::Info(msg.cseq.seq));
    }

    fn on_ack_not_received(&mut self, _: InviteSessionHandle) {
        self.push(Event::AckNotReceived);
    }

    fn on_session_expired(&mut self, _: InviteSessionHandle) {
        self.push(Event::SessionExpired);
    }

    fn on_stale_reinvite_timeout(&mut self, _: InviteSessionHandle) {
        self.push(Event::StaleReinvite);
    }
}

impl ClientSubscriptionHandler for Recorder {
    fn on_update_active(&mut self, handle: ClientSubscriptionHandle, _: &SipMessage) {
        self.push(Event::SubscriptionActive(handle));
    }

    fn on_terminated(&mut self, handle: ClientSubscriptionHandle, _: Option<&SipMessage>) {
        self.push(Event::SubscriptionTerminated(handle));
    }
}

impl ServerSubscriptionHandler for Recorder {
    fn on_new_subscription(&mut self, handle: ServerSubscriptionHandle, _: &SipMessage) {
        self.push(Event::NewSubscription(handle));
    }

    fn on_terminated(&mut self, handle: ServerSubscriptionHandle) {
        self.push(Event::ServerSubscriptionTerminated(handle));
    }
}

impl OutOfDialogHandler for Recorder {
    fn on_received_request(&mut self, handle: OutOfDialogHandle, msg: &SipMessage) {
        self.push(Event::Request(handle, msg.method()));
    }

    fn on_success(&mut self, handle: OutOfDialogHandle, _: &SipMessage) {
        self.push(Event::Success(handle));
    }
}

fn uri(user: &str) -> Uri {
    Uri::sip(Some(user), "example.com")
}

fn profile(user: &str) -> Profile {
    Profile {
        identity: NameAddr::new(uri(user)),
        contact: NameAddr::new(Uri::sip(Some(user), "192.0.2.1").with_port(5060)),
        ..Default::default()
    }
}

fn agent(user: &str) -> (DialogUsageManager, Recorder) {
    agent_with(profile(user))
}

fn agent_with(profile: Profile) -> (DialogUsageManager, Recorder) {
    let recorder = Recorder::default();
    let mut dum = DialogUsageManager::new(profile);

    dum.set_invite_handler(recorder.clone());
    dum.set_client_subscription_handler(recorder.clone());
    dum.set_server_subscription_handler(recorder.clone());
    dum.set_out_of_dialog_handler(recorder.clone());
    (dum, recorder)
}

fn sdp(text: &'static str) -> Sdp {
    Bytes::from_static(text.as_bytes())
}

/// Exchange messages between two managers until both are quiet.
fn pump(a: &mut DialogUsageManager, b: &mut DialogUsageManager) {
    loop {
        let from_a = a.take_outgoing();
        let from_b = b.take_outgoing();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }

        for msg in from_a {
            b.dispatch(msg);
        }

        for msg in from_b {
            a.dispatch(msg);
        }
    }
}

/// Response of a hand driven peer with its own To tag and Contact.
fn respond(invite: &SipMessage, code: u16, tag: &str, body: Option<Sdp>) -> SipMessage {
    let mut response = SipMessage::response(invite, code);
    response.to.tag = Some(tag.to_string());
    response.contacts.push(NameAddr::new(Uri::sip(Some(tag), "198.51.100.1")));
    response.body = body.into();
    response
}

fn only(messages: Vec<SipMessage>) -> Result<SipMessage> {
    match <[SipMessage; 1]>::try_from(messages) {
        Ok([it]) => Ok(it),
        Err(it) => Err(anyhow!("expected one message, got {}", it.len())),
    }
}

struct Call {
    alice: DialogUsageManager,
    alice_events: Recorder,
    alice_session: InviteSessionHandle,
    bob: DialogUsageManager,
    bob_events: Recorder,
    bob_session: InviteSessionHandle,
}

fn connected_call() -> Result<Call> {
    connected_call_with(profile("alice"), profile("bob"))
}

fn connected_call_with(alice: Profile, bob: Profile) -> Result<Call> {
    let (mut alice, alice_events) = agent_with(alice);
    let (mut bob, bob_events) = agent_with(bob);

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    pump(&mut alice, &mut bob);

    let bob_session = bob_events.session()?;
    assert_eq!(bob.pending_offer(bob_session)?, PendingOffer::Remote);

    bob.provide_answer(bob_session, sdp("answer"))?;
    bob.provisional(bob_session, 180)?;
    bob.accept(bob_session, 200)?;
    pump(&mut alice, &mut bob);

    let alice_session = alice_events.session()?;
    assert_eq!(alice.invite_state(alice_session)?, InviteState::Connected);
    assert_eq!(bob.invite_state(bob_session)?, InviteState::Connected);

    alice_events.take();
    bob_events.take();

    Ok(Call {
        alice,
        alice_events,
        alice_session,
        bob,
        bob_events,
        bob_session,
    })
}

#[test]
fn invite_accepted_and_hung_up() -> Result<()> {
    let mut call = connected_call()?;

    assert_eq!(
        call.alice.local_sdp(call.alice_session)?,
        Some(sdp("offer"))
    );
    assert_eq!(
        call.alice.remote_sdp(call.alice_session)?,
        Some(sdp("answer"))
    );
    assert_eq!(call.bob.local_sdp(call.bob_session)?, Some(sdp("answer")));
    assert_eq!(call.alice.pending_offer(call.alice_session)?, PendingOffer::None);

    call.alice.end(call.alice_session)?;
    pump(&mut call.alice, &mut call.bob);

    assert_eq!(
        call.alice_events.take(),
        vec![Event::Terminated(TerminatedReason::LocalBye)]
    );
    assert_eq!(
        call.bob_events.take(),
        vec![Event::Terminated(TerminatedReason::RemoteBye)]
    );

    assert_eq!(
        call.alice.end(call.alice_session),
        Ok(()),
        "ending a terminated session is a no-op"
    );
    assert!(call.alice.take_outgoing().is_empty());
    Ok(())
}

#[test]
fn uac_states_and_cseq_of_ack_and_bye() -> Result<()> {
    let (mut alice, events) = agent("alice");

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    let invite = only(alice.take_outgoing())?;
    assert_eq!(invite.method(), Method::Invite);

    let mut trying = SipMessage::response(&invite, 100);
    trying.to.tag = None;
    alice.dispatch(trying);
    assert_eq!(alice.dialog_count(), 0);

    alice.dispatch(respond(&invite, 180, "t1", None));
    let session = events.session()?;
    assert_eq!(alice.invite_state(session)?, InviteState::UacEarly);

    alice.dispatch(respond(&invite, 200, "t1", Some(sdp("answer"))));
    assert_eq!(alice.invite_state(session)?, InviteState::Connected);

    let ack = only(alice.take_outgoing())?;
    assert_eq!(ack.method(), Method::Ack);
    assert_eq!(ack.cseq.seq, invite.cseq.seq);
    assert_eq!(ack.to.tag.as_deref(), Some("t1"));
    assert_eq!(ack.request_uri(), Some(&Uri::sip(Some("t1"), "198.51.100.1")));

    alice.end(session)?;
    let bye = only(alice.take_outgoing())?;
    assert_eq!(bye.method(), Method::Bye);
    assert_eq!(bye.cseq.seq, invite.cseq.seq + 1);

    assert_eq!(
        events.take(),
        vec![
            Event::NewSession(session, Role::Uac),
            Event::Provisional(180),
            Event::Answer(sdp("answer")),
            Event::Connected,
            Event::Terminated(TerminatedReason::LocalBye),
        ]
    );

    Ok(())
}

#[test]
fn forked_responses_create_distinct_dialogs() -> Result<()> {
    let (mut alice, _events) = agent("alice");

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    let invite = only(alice.take_outgoing())?;

    alice.dispatch(respond(&invite, 180, "t1", None));
    alice.dispatch(respond(&invite, 180, "t2", None));
    alice.dispatch(respond(&invite, 183, "t1", Some(sdp("early"))));
    assert_eq!(alice.dialog_count(), 2);

    let set = alice
        .find_dialog_set(&sipturn_dum::DialogSetId::of_local(&invite).ok_or(anyhow!("no tag"))?)
        .ok_or(anyhow!("no dialog set"))?;

    let mut ids = set.dialogs().map(|it| it.id().clone()).collect::<Vec<_>>();
    ids.sort_by(|a, b| a.remote_tag.cmp(&b.remote_tag));

    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0].call_id, ids[1].call_id);
    assert_eq!(ids[0].local_tag, ids[1].local_tag);
    assert_eq!(ids[0].remote_tag, "t1");
    assert_eq!(ids[1].remote_tag, "t2");

    for id in &ids {
        assert_eq!(alice.find_dialog(id).map(|it| it.id()), Some(id));
    }

    Ok(())
}

#[test]
fn out_of_order_cseq_is_rejected() -> Result<()> {
    let mut call = connected_call()?;

    call.alice.send_info(
        call.alice_session,
        Body::Other {
            content_type: "application/dtmf-relay".to_string(),
            data: Bytes::from_static(b"Signal=1"),
        },
    )?;

    let info = only(call.alice.take_outgoing())?;
    let mut late = info.clone();
    late.cseq.seq -= 1;
    late.via[0].branch = new_branch();

    call.bob.dispatch(info.clone());
    assert_eq!(call.bob_events.take(), vec![Event::Info(info.cseq.seq)]);

    call.bob.accept_nit(call.bob_session)?;
    assert_eq!(only(call.bob.take_outgoing())?.code(), Some(200));

    call.bob.dispatch(info);
    assert!(call.bob.take_outgoing().is_empty(), "retransmission is dropped");

    call.bob.dispatch(late);
    assert_eq!(only(call.bob.take_outgoing())?.code(), Some(500));
    assert!(call.bob_events.take().is_empty());
    assert_eq!(call.bob.invite_state(call.bob_session)?, InviteState::Connected);
    Ok(())
}

#[test]
fn one_offer_at_a_time() -> Result<()> {
    let mut call = connected_call()?;

    call.alice.provide_offer(call.alice_session, sdp("offer2"))?;
    assert_eq!(call.alice.pending_offer(call.alice_session)?, PendingOffer::Local);

    let reinvite = only(call.alice.take_outgoing())?;
    assert_eq!(reinvite.method(), Method::Invite);

    assert_eq!(
        call.alice.provide_offer(call.alice_session, sdp("offer3")),
        Err(Error::InvalidState)
    );
    assert_eq!(
        call.alice.provide_answer(call.alice_session, sdp("answer3")),
        Err(Error::InvalidState)
    );
    assert!(call.alice.take_outgoing().is_empty());

    call.bob.dispatch(reinvite);
    assert_eq!(call.bob.pending_offer(call.bob_session)?, PendingOffer::Remote);
    assert_eq!(
        call.bob.provide_offer(call.bob_session, sdp("offer4")),
        Err(Error::InvalidState)
    );
    assert!(call.bob.take_outgoing().is_empty());

    call.bob.provide_answer(call.bob_session, sdp("answer2"))?;
    pump(&mut call.alice, &mut call.bob);

    assert_eq!(call.alice.invite_state(call.alice_session)?, InviteState::Connected);
    assert_eq!(call.bob.invite_state(call.bob_session)?, InviteState::Connected);
    assert_eq!(call.alice.local_sdp(call.alice_session)?, Some(sdp("offer2")));
    assert_eq!(call.alice.remote_sdp(call.alice_session)?, Some(sdp("answer2")));
    assert_eq!(call.bob.remote_sdp(call.bob_session)?, Some(sdp("offer2")));
    Ok(())
}

#[test]
fn crossing_reinvites_are_answered_with_491() -> Result<()> {
    let mut call = connected_call()?;

    call.alice.provide_offer(call.alice_session, sdp("from alice"))?;
    call.bob.provide_offer(call.bob_session, sdp("from bob"))?;

    let from_alice = only(call.alice.take_outgoing())?;
    let from_bob = only(call.bob.take_outgoing())?;

    call.alice.dispatch(from_bob);
    let glare = only(call.alice.take_outgoing())?;
    assert_eq!(glare.code(), Some(491));
    assert_eq!(call.alice.invite_state(call.alice_session)?, InviteState::SentReinvite);
    assert!(call.alice_events.take().is_empty());

    call.bob.dispatch(from_alice);
    let other = only(call.bob.take_outgoing())?;
    assert_eq!(other.code(), Some(491));

    call.bob.dispatch(glare);
    call.alice.dispatch(other);

    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::SentReinviteGlare
    );
    assert_eq!(
        call.bob.invite_state(call.bob_session)?,
        InviteState::SentReinviteGlare
    );

    // Both sides retry after their random back-off, within four seconds.
    let later = Instant::now() + Duration::from_secs(5);
    call.alice.process_timers(later);
    let retry = only(call.alice.take_outgoing())?;
    assert_eq!(retry.method(), Method::Invite);
    assert_eq!(retry.sdp(), Some(&sdp("from alice")));
    Ok(())
}

#[test]
fn unacknowledged_2xx_is_retransmitted_then_hung_up() -> Result<()> {
    let (mut alice, _) = agent("alice");
    let (mut bob, bob_events) = agent("bob");

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    bob.dispatch(only(alice.take_outgoing())?);

    let session = bob_events.session()?;
    bob.provide_answer(session, sdp("answer"))?;
    bob.accept(session, 200)?;

    let ok = only(bob.take_outgoing())?;
    assert_eq!(ok.code(), Some(200));
    let start = Instant::now();
    bob_events.take();

    // The interval doubles from 500ms and stays at 4s.
    for at in [600, 1600, 3600, 7600, 11600, 15600] {
        bob.process_timers(start + Duration::from_millis(at));

        let resent = only(bob.take_outgoing())?;
        assert_eq!(resent.code(), Some(200), "resend at {at}ms");
        assert_eq!(resent.cseq, ok.cseq);
    }

    assert_eq!(bob.invite_state(session)?, InviteState::UasAccepted);

    bob.process_timers(start + Duration::from_millis(32100));
    let sent = bob.take_outgoing();
    assert_eq!(sent.len(), 5);
    assert!(sent[..4].iter().all(|it| it.code() == Some(200)));
    assert_eq!(sent[4].method(), Method::Bye);

    assert_eq!(
        bob_events.take(),
        vec![
            Event::AckNotReceived,
            Event::Terminated(TerminatedReason::Timeout)
        ]
    );
    assert_eq!(bob.invite_state(session)?, InviteState::Terminated);
    Ok(())
}

#[test]
fn stale_reinvite_returns_to_connected() -> Result<()> {
    let mut call = connected_call()?;
    let start = Instant::now();

    call.alice.provide_offer(call.alice_session, sdp("offer2"))?;
    let reinvite = only(call.alice.take_outgoing())?;
    assert_eq!(reinvite.method(), Method::Invite);

    call.alice.process_timers(start + Duration::from_secs(31));
    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::SentReinvite
    );

    call.alice.process_timers(start + Duration::from_secs(33));
    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::Connected
    );
    assert_eq!(call.alice_events.take(), vec![Event::StaleReinvite]);
    assert!(call.alice.take_outgoing().is_empty());
    assert_eq!(call.alice.local_sdp(call.alice_session)?, Some(sdp("offer")));

    call.alice.provide_offer(call.alice_session, sdp("offer3"))?;
    let retry = only(call.alice.take_outgoing())?;
    assert_eq!(retry.sdp(), Some(&sdp("offer3")));
    assert!(retry.cseq.seq > reinvite.cseq.seq);
    Ok(())
}

#[test]
fn stale_reinvite_after_end_sends_bye() -> Result<()> {
    let mut call = connected_call()?;
    let start = Instant::now();

    call.alice.provide_offer(call.alice_session, sdp("offer2"))?;
    call.alice.take_outgoing();

    call.alice.end(call.alice_session)?;
    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::WaitingToTerminate
    );
    assert!(call.alice.take_outgoing().is_empty());

    call.alice.process_timers(start + Duration::from_secs(33));
    assert_eq!(only(call.alice.take_outgoing())?.method(), Method::Bye);
    assert_eq!(
        call.alice_events.take(),
        vec![Event::Terminated(TerminatedReason::LocalBye)]
    );
    Ok(())
}

#[test]
fn session_timer_is_negotiated() -> Result<()> {
    let (mut alice, _) = agent("alice");
    let (mut bob, bob_events) = agent("bob");

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    let invite = only(alice.take_outgoing())?;
    assert_eq!(invite.session_expires.map(|it| it.interval), Some(1800));
    assert!(invite.supports("timer"));
    bob.dispatch(invite);

    let session = bob_events.session()?;
    bob.provide_answer(session, sdp("answer"))?;
    bob.accept(session, 200)?;

    let ok = only(bob.take_outgoing())?;
    assert_eq!(
        ok.session_expires,
        Some(SessionExpires {
            interval: 1800,
            refresher: Some(Refresher::Uac),
        })
    );
    assert!(ok.require.iter().any(|it| it == "timer"));
    Ok(())
}

#[test]
fn refresher_sends_update_at_half_interval() -> Result<()> {
    let mut call = connected_call()?;
    let start = Instant::now();

    call.alice.process_timers(start + Duration::from_secs(899));
    assert!(call.alice.take_outgoing().is_empty());

    call.alice.process_timers(start + Duration::from_secs(901));
    let update = only(call.alice.take_outgoing())?;
    assert_eq!(update.method(), Method::Update);
    assert_eq!(update.session_expires.map(|it| it.interval), Some(1800));
    assert_eq!(update.sdp(), None);
    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::SentUpdate
    );

    call.bob.dispatch(update);
    let ok = only(call.bob.take_outgoing())?;
    assert_eq!(ok.code(), Some(200));
    assert!(ok.session_expires.is_some());

    call.alice.dispatch(ok);
    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::Connected
    );
    assert!(call.alice_events.take().is_empty());
    assert!(call.bob_events.take().is_empty());
    Ok(())
}

#[test]
fn refresher_without_update_sends_reinvite() -> Result<()> {
    let alice = Profile {
        allow_update: false,
        ..profile("alice")
    };

    let mut call = connected_call_with(alice, profile("bob"))?;
    let start = Instant::now();

    call.alice.process_timers(start + Duration::from_secs(901));
    let reinvite = only(call.alice.take_outgoing())?;
    assert_eq!(reinvite.method(), Method::Invite);
    assert_eq!(reinvite.sdp(), Some(&sdp("offer")));
    assert_eq!(reinvite.session_expires.map(|it| it.interval), Some(1800));
    assert_eq!(
        call.alice.invite_state(call.alice_session)?,
        InviteState::SentReinvite
    );
    Ok(())
}

#[test]
fn expired_session_is_hung_up() -> Result<()> {
    let mut call = connected_call()?;
    let start = Instant::now();

    // The refresh from alice never arrives.
    call.bob.process_timers(start + Duration::from_secs(1700));
    assert!(call.bob.take_outgoing().is_empty());
    assert_eq!(call.bob.invite_state(call.bob_session)?, InviteState::Connected);

    call.bob.process_timers(start + Duration::from_secs(1769));
    assert_eq!(only(call.bob.take_outgoing())?.method(), Method::Bye);
    assert_eq!(
        call.bob_events.take(),
        vec![
            Event::SessionExpired,
            Event::Terminated(TerminatedReason::Timeout)
        ]
    );
    Ok(())
}

#[test]
fn cancel_before_answer() -> Result<()> {
    let (mut alice, alice_events) = agent("alice");
    let (mut bob, bob_events) = agent("bob");

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    pump(&mut alice, &mut bob);

    let bob_session = bob_events.session()?;
    bob.provisional(bob_session, 180)?;
    pump(&mut alice, &mut bob);

    let alice_session = alice_events.session()?;
    assert_eq!(alice.invite_state(alice_session)?, InviteState::UacEarly);

    alice.end(alice_session)?;
    assert_eq!(alice.invite_state(alice_session)?, InviteState::UacCancelled);

    let cancel = alice.take_outgoing();
    assert_eq!(cancel.len(), 1);
    assert_eq!(cancel[0].method(), Method::Cancel);

    for msg in cancel {
        bob.dispatch(msg);
    }

    let answers = bob.take_outgoing();
    assert_eq!(
        answers.iter().map(|it| (it.cseq.method, it.code())).collect::<Vec<_>>(),
        vec![(Method::Cancel, Some(200)), (Method::Invite, Some(487))]
    );

    for msg in answers {
        alice.dispatch(msg);
    }

    assert!(
        alice_events
            .take()
            .contains(&Event::Terminated(TerminatedReason::LocalCancel))
    );
    assert!(
        bob_events
            .take()
            .contains(&Event::Terminated(TerminatedReason::RemoteCancel))
    );

    Ok(())
}

#[test]
fn rejected_invite() -> Result<()> {
    let (mut alice, alice_events) = agent("alice");
    let (mut bob, bob_events) = agent("bob");

    alice.make_invite(uri("bob"), Some(sdp("offer")));
    pump(&mut alice, &mut bob);

    let bob_session = bob_events.session()?;
    assert_eq!(bob.accept(bob_session, 200), Err(Error::InvalidState));
    bob.reject(bob_session, 486)?;
    pump(&mut alice, &mut bob);

    let events = alice_events.take();
    assert!(events.contains(&Event::Failure(486)));
    assert!(events.contains(&Event::Terminated(TerminatedReason::Rejected)));
    Ok(())
}

#[test]
fn terminated_sessions_are_reaped() -> Result<()> {
    let mut call = connected_call()?;

    call.alice.end(call.alice_session)?;
    pump(&mut call.alice, &mut call.bob);
    assert_eq!(call.alice.dialog_count(), 1);

    let later = Instant::now() + Duration::from_secs(40);
    call.alice.process_timers(later);
    call.bob.process_timers(later);

    assert_eq!(call.alice.dialog_count(), 0);
    assert_eq!(call.bob.dialog_count(), 0);
    assert_eq!(
        call.alice.invite_state(call.alice_session),
        Err(Error::UnknownHandle)
    );
    assert_eq!(call.bob.end(call.bob_session), Err(Error::UnknownHandle));
    Ok(())
}

#[test]
fn request_to_unknown_dialog_gets_481() -> Result<()> {
    let (mut bob, _) = agent("bob");

    let mut bye = SipMessage::request(
        Method::Bye,
        uri("bob"),
        NameAddr::new(uri("alice")).with_tag("a1"),
        NameAddr::new(uri("bob")).with_tag("b1"),
        "unknown@example.com",
        2,
    );
    bye.via.push(sipturn_dum::message::Via::new(&uri("alice")));

    let mut ack = bye.clone();
    ack.start = sipturn_dum::message::StartLine::Request {
        method: Method::Ack,
        uri: uri("bob"),
    };

    bob.dispatch(bye);
    assert_eq!(only(bob.take_outgoing())?.code(), Some(481));

    bob.dispatch(ack);
    assert!(bob.take_outgoing().is_empty());
    Ok(())
}

#[test]
fn subscription_lifecycle() -> Result<()> {
    let (mut alice, alice_events) = agent("alice");
    let (mut bob, bob_events) = agent("bob");

    alice.subscribe(uri("bob"), "presence");
    pump(&mut alice, &mut bob);

    let Some(Event::NewSubscription(server)) = bob_events.take().pop() else {
        return Err(anyhow!("no subscription"));
    };

    bob.accept_subscription(server, 202)?;
    bob.send_notify(server, SubState::Active, Body::Empty)?;
    pump(&mut alice, &mut bob);

    let Some(Event::SubscriptionActive(client)) = alice_events.take().pop() else {
        return Err(anyhow!("no notify"));
    };

    alice.end_subscription(client)?;
    pump(&mut alice, &mut bob);

    assert_eq!(alice_events.take(), vec![Event::SubscriptionTerminated(client)]);
    assert_eq!(bob_events.take(), vec![Event::ServerSubscriptionTerminated(server)]);
    assert_eq!(alice.refresh_subscription(client), Err(Error::Terminated));
    Ok(())
}

#[test]
fn options_outside_of_dialog() -> Result<()> {
    let (mut alice, alice_events) = agent("alice");
    let (mut bob, bob_events) = agent("bob");

    assert_eq!(
        alice.send_out_of_dialog(Method::Bye, uri("bob"), Body::Empty),
        Err(Error::InvalidState)
    );

    let handle = alice.send_out_of_dialog(Method::Options, uri("bob"), Body::Empty)?;
    pump(&mut alice, &mut bob);

    let Some(Event::Request(server, Method::Options)) = bob_events.take().pop() else {
        return Err(anyhow!("no options"));
    };

    bob.answer_out_of_dialog(server, 200, Body::Empty)?;
    pump(&mut alice, &mut bob);

    assert_eq!(alice_events.take(), vec![Event::Success(handle)]);
    assert_eq!(
        bob.answer_out_of_dialog(server, 200, Body::Empty),
        Err(Error::InvalidState)
    );

    Ok(())
}
