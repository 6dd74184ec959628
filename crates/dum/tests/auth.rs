use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use sipturn_dum::{
    ClientRegistrationHandle, DialogUsageManager, Error, Method, Profile, ServerRegistrationHandle,
    SipMessage,
    auth::{
        AuthLookup, Credential, ServerAuthConfig, ServerAuthManager, UserAuthInfo, UserAuthStore,
        digest,
    },
    handler::{ClientRegistrationHandler, ServerRegistrationHandler},
    message::{NameAddr, Uri},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Registered(ClientRegistrationHandle, u32),
    Removed(ClientRegistrationHandle),
    Failed(ClientRegistrationHandle, u16),
    Register(ServerRegistrationHandle),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl ClientRegistrationHandler for Recorder {
    fn on_success(&mut self, handle: ClientRegistrationHandle, _: &SipMessage, expires: u32) {
        self.0.lock().push(Event::Registered(handle, expires));
    }

    fn on_removed(&mut self, handle: ClientRegistrationHandle, _: &SipMessage) {
        self.0.lock().push(Event::Removed(handle));
    }

    fn on_failure(&mut self, handle: ClientRegistrationHandle, msg: &SipMessage) {
        self.0
            .lock()
            .push(Event::Failed(handle, msg.code().unwrap_or_default()));
    }
}

impl ServerRegistrationHandler for Recorder {
    fn on_register(&mut self, handle: ServerRegistrationHandle, _: &SipMessage) {
        self.0.lock().push(Event::Register(handle));
    }
}

/// Lookups the test answers by hand.
#[derive(Clone, Default)]
struct Lookups(Arc<Mutex<Vec<(String, String, String)>>>);

impl Lookups {
    fn answer(&self, password: Option<&str>) -> Result<UserAuthInfo> {
        let (user, realm, tid) = self.0.lock().pop().ok_or_else(|| anyhow!("no lookup"))?;

        Ok(UserAuthInfo {
            result: match password {
                Some(password) => AuthLookup::Found {
                    a1: digest::a1(&user, &realm, password),
                },
                None => AuthLookup::NotFound,
            },
            user,
            realm,
            tid,
        })
    }
}

impl UserAuthStore for Lookups {
    fn request_credential(&mut self, user: &str, realm: &str, tid: &str) {
        self.0
            .lock()
            .push((user.to_string(), realm.to_string(), tid.to_string()));
    }
}

struct Setup {
    alice: DialogUsageManager,
    alice_events: Recorder,
    registrar: DialogUsageManager,
    registrar_events: Recorder,
    lookups: Lookups,
}

fn setup(password: &str) -> Setup {
    let alice_events = Recorder::default();
    let mut alice = DialogUsageManager::new(Profile {
        identity: NameAddr::new(Uri::sip(Some("alice"), "example.com")),
        contact: NameAddr::new(Uri::sip(Some("alice"), "192.0.2.1")),
        ..Default::default()
    });

    alice.set_client_registration_handler(alice_events.clone());
    alice.set_credential_store(vec![Credential {
        user: "alice".to_string(),
        password: password.to_string(),
        realm: "example.com".to_string(),
    }]);

    let lookups = Lookups::default();
    let registrar_events = Recorder::default();
    let mut registrar = DialogUsageManager::new(Profile {
        identity: NameAddr::new(Uri::sip(None, "example.com")),
        contact: NameAddr::new(Uri::sip(None, "198.51.100.1")),
        ..Default::default()
    });

    registrar.set_server_registration_handler(registrar_events.clone());
    registrar.set_server_auth(ServerAuthManager::new(
        ServerAuthConfig {
            realm: Some("example.com".to_string()),
            ..Default::default()
        },
        Box::new(lookups.clone()),
    ));

    Setup {
        alice,
        alice_events,
        registrar,
        registrar_events,
        lookups,
    }
}

fn deliver(from: &mut DialogUsageManager, to: &mut DialogUsageManager) -> Vec<SipMessage> {
    let messages = from.take_outgoing();
    for msg in messages.iter().cloned() {
        to.dispatch(msg);
    }

    messages
}

#[test]
fn register_through_digest_challenge() -> Result<()> {
    let Setup {
        mut alice,
        alice_events,
        mut registrar,
        registrar_events,
        lookups,
    } = setup("secret");

    let handle = alice.register(Uri::sip(None, "example.com"), Some(600));

    let register = deliver(&mut alice, &mut registrar);
    assert!(register[0].authorization.is_empty());

    let challenge = deliver(&mut registrar, &mut alice);
    assert_eq!(challenge[0].code(), Some(401));
    assert_eq!(challenge[0].www_authenticate.len(), 1);

    let signed = deliver(&mut alice, &mut registrar);
    assert_eq!(signed[0].method(), Method::Register);
    assert_eq!(signed[0].cseq.seq, register[0].cseq.seq + 1);
    assert_eq!(signed[0].authorization.len(), 1);
    assert!(registrar.take_outgoing().is_empty(), "waiting for the lookup");

    registrar.on_user_auth_info(lookups.answer(Some("secret"))?);
    let Some(Event::Register(server)) = registrar_events.take().pop() else {
        return Err(anyhow!("register not delivered"));
    };

    registrar.accept_registration(server)?;
    let ok = deliver(&mut registrar, &mut alice);
    assert_eq!(ok[0].code(), Some(200));
    assert_eq!(ok[0].contacts[0].expires, Some(600));
    assert_eq!(alice_events.take(), vec![Event::Registered(handle, 600)]);

    assert_eq!(
        registrar.accept_registration(server),
        Err(Error::InvalidState)
    );

    // Refreshed at nine tenths of the interval, with the cached credentials.
    alice.process_timers(Instant::now() + Duration::from_secs(541));
    let refresh = alice.take_outgoing();
    assert_eq!(refresh.len(), 1);
    assert_eq!(refresh[0].cseq.seq, signed[0].cseq.seq + 1);
    assert_eq!(refresh[0].authorization.len(), 1);
    Ok(())
}

#[test]
fn wrong_password_is_forbidden() -> Result<()> {
    let Setup {
        mut alice,
        alice_events,
        mut registrar,
        registrar_events,
        lookups,
    } = setup("guess");

    let handle = alice.register(Uri::sip(None, "example.com"), None);
    deliver(&mut alice, &mut registrar);
    deliver(&mut registrar, &mut alice);
    deliver(&mut alice, &mut registrar);

    registrar.on_user_auth_info(lookups.answer(Some("secret"))?);
    assert!(registrar_events.take().is_empty());

    let forbidden = deliver(&mut registrar, &mut alice);
    assert_eq!(forbidden.len(), 1);
    assert_eq!(forbidden[0].code(), Some(403));
    assert_eq!(alice_events.take(), vec![Event::Failed(handle, 403)]);
    assert_eq!(alice.refresh_registration(handle), Err(Error::Terminated));
    Ok(())
}

#[test]
fn unknown_user_is_not_found() -> Result<()> {
    let Setup {
        mut alice,
        mut registrar,
        lookups,
        ..
    } = setup("secret");

    alice.register(Uri::sip(None, "example.com"), None);
    deliver(&mut alice, &mut registrar);
    deliver(&mut registrar, &mut alice);
    deliver(&mut alice, &mut registrar);

    registrar.on_user_auth_info(lookups.answer(None)?);
    let response = registrar.take_outgoing();
    assert_eq!(response.len(), 1);
    assert_eq!(response[0].code(), Some(404));
    Ok(())
}

#[test]
fn unanswered_lookup_gets_503() -> Result<()> {
    let Setup {
        mut alice,
        alice_events,
        mut registrar,
        registrar_events,
        lookups,
    } = setup("secret");

    let handle = alice.register(Uri::sip(None, "example.com"), None);
    deliver(&mut alice, &mut registrar);
    deliver(&mut registrar, &mut alice);
    deliver(&mut alice, &mut registrar);

    let start = Instant::now();
    registrar.process_timers(start + Duration::from_secs(10));
    assert!(registrar.take_outgoing().is_empty());

    registrar.process_timers(start + Duration::from_secs(33));
    let unavailable = deliver(&mut registrar, &mut alice);
    assert_eq!(unavailable.len(), 1);
    assert_eq!(unavailable[0].code(), Some(503));
    assert_eq!(alice_events.take(), vec![Event::Failed(handle, 503)]);

    // a late answer finds nothing pending
    registrar.on_user_auth_info(lookups.answer(Some("secret"))?);
    assert!(registrar.take_outgoing().is_empty());
    assert!(registrar_events.take().is_empty());
    Ok(())
}

#[test]
fn second_challenge_is_not_answered() -> Result<()> {
    let Setup {
        mut alice,
        alice_events,
        mut registrar,
        ..
    } = setup("secret");

    let handle = alice.register(Uri::sip(None, "example.com"), None);
    deliver(&mut alice, &mut registrar);

    let challenge = deliver(&mut registrar, &mut alice);
    let signed = alice.take_outgoing();
    assert_eq!(signed.len(), 1);

    // Same nonce again: the password was not accepted.
    let mut again = SipMessage::response(&signed[0], 401);
    again.to.tag = challenge[0].to.tag.clone();
    again.www_authenticate = challenge[0].www_authenticate.clone();
    alice.dispatch(again);

    assert!(alice.take_outgoing().is_empty(), "one retry with credentials, not two");
    assert_eq!(alice_events.take(), vec![Event::Failed(handle, 401)]);
    Ok(())
}

#[test]
fn registration_removed() -> Result<()> {
    let (mut alice, events) = {
        let events = Recorder::default();
        let mut alice = DialogUsageManager::new(Profile::default());
        alice.set_client_registration_handler(events.clone());
        (alice, events)
    };

    let handle = alice.register(Uri::sip(None, "example.com"), Some(120));
    let register = alice.take_outgoing().pop().ok_or(anyhow!("no register"))?;

    let mut ok = SipMessage::response(&register, 200);
    ok.to.tag = Some("r1".to_string());
    ok.expires = Some(120);
    alice.dispatch(ok);
    assert_eq!(events.take(), vec![Event::Registered(handle, 120)]);

    alice.remove_registration(handle)?;
    assert_eq!(alice.remove_registration(handle), Err(Error::AlreadyPending));

    let remove = alice.take_outgoing().pop().ok_or(anyhow!("no unregister"))?;
    assert_eq!(remove.expires, Some(0));

    let mut ok = SipMessage::response(&remove, 200);
    ok.to.tag = Some("r1".to_string());
    alice.dispatch(ok);
    assert_eq!(events.take(), vec![Event::Removed(handle)]);

    alice.process_timers(Instant::now() + Duration::from_secs(40));
    assert_eq!(
        alice.refresh_registration(handle),
        Err(Error::UnknownHandle)
    );
    Ok(())
}
