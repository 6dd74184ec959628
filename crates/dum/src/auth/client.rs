use ahash::AHashMap;

use super::digest;
use crate::{
    dialog::DialogSetId,
    message::{Challenge, Credentials, Method, SipMessage, new_cnonce},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
    pub realm: String,
}

/// Source of the credentials answering a challenge.
pub trait CredentialStore: Send + 'static {
    fn credential(&self, realm: &str) -> Option<Credential>;
}

impl CredentialStore for Vec<Credential> {
    fn credential(&self, realm: &str) -> Option<Credential> {
        self.iter().find(|it| it.realm == realm).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Invalid,
    /// Challenge answered, outcome unknown.
    Current,
    /// Second attempt after a new nonce, the last one allowed.
    TryOnce,
    /// Credentials were accepted, reused on later requests.
    Cached,
    Failed,
}

struct RealmState {
    state: AuthState,
    challenge: Challenge,
    proxy: bool,
    credential: Option<Credential>,
    nonce_count: u32,
    cnonce: String,
    last_tid: Option<String>,
}

impl RealmState {
    fn new(challenge: Challenge, proxy: bool, credential: Option<Credential>) -> Self {
        let mut this = Self {
            state: AuthState::Invalid,
            cnonce: new_cnonce(),
            nonce_count: 0,
            last_tid: None,
            credential,
            challenge,
            proxy,
        };

        this.state = if this.credential.is_some() && this.is_supported() {
            AuthState::Current
        } else {
            AuthState::Failed
        };

        this
    }

    fn is_supported(&self) -> bool {
        let md5 = self
            .challenge
            .algorithm
            .as_deref()
            .is_none_or(|it| it.eq_ignore_ascii_case("MD5"));

        let qop = self
            .challenge
            .qop
            .as_deref()
            .is_none_or(|it| it.split(',').any(|it| it.trim().eq_ignore_ascii_case("auth")));

        md5 && qop
    }

    fn rechallenge(&mut self, challenge: Challenge) {
        let next = match self.state {
            AuthState::Current if challenge.stale => AuthState::Current,
            AuthState::Current if challenge.nonce != self.challenge.nonce => AuthState::TryOnce,
            AuthState::Cached => AuthState::Current,
            _ => AuthState::Failed,
        };

        log::debug!(
            "sip auth rechallenge: realm={:?}, {:?} -> {next:?}",
            challenge.realm,
            self.state
        );

        if next != AuthState::Failed {
            self.challenge = challenge;
            self.cnonce = new_cnonce();
            self.nonce_count = 0;
            self.last_tid = None;
        }

        self.state = if next != AuthState::Failed && self.is_supported() {
            next
        } else {
            AuthState::Failed
        };
    }

    fn credentials(&mut self, request: &SipMessage) -> Option<Credentials> {
        let credential = self.credential.as_ref()?;

        let tid = request.transaction_id().map(ToString::to_string);
        if tid.is_none() || tid != self.last_tid {
            self.nonce_count += 1;
            self.last_tid = tid;
        }

        let method = request.method();
        let uri = request.request_uri().map(ToString::to_string).unwrap_or_default();
        let realm = self.challenge.realm.clone().unwrap_or_default();
        let a1 = digest::a1(&credential.user, &realm, &credential.password);

        let qop = self.challenge.qop.is_some();
        let nonce_count = digest::nonce_count(self.nonce_count);
        let response = digest::response(
            &a1,
            method.as_str(),
            &uri,
            &self.challenge.nonce,
            qop.then_some((nonce_count.as_str(), self.cnonce.as_str())),
        );

        Some(Credentials {
            username: credential.user.clone(),
            nonce: self.challenge.nonce.clone(),
            algorithm: self.challenge.algorithm.clone(),
            opaque: self.challenge.opaque.clone(),
            cnonce: qop.then(|| self.cnonce.clone()),
            nonce_count: qop.then_some(nonce_count),
            qop: qop.then(|| "auth".to_string()),
            response,
            realm,
            uri,
        })
    }
}

#[derive(Default)]
struct DialogSetAuth {
    realms: AHashMap<String, RealmState>,
}

/// Answers 401 and 407 challenges and signs the requests of every dialog
/// set that was challenged before.
#[derive(Default)]
pub struct ClientAuthManager {
    store: Option<Box<dyn CredentialStore>>,
    sets: AHashMap<DialogSetId, DialogSetAuth>,
}

impl ClientAuthManager {
    pub fn set_store(&mut self, store: Box<dyn CredentialStore>) {
        self.store = Some(store);
    }

    /// Feed a response to `request`. Returns true when `request` was turned
    /// into its next transaction and should be sent again.
    pub fn handle(&mut self, request: &mut SipMessage, response: &SipMessage) -> bool {
        let Some(code) = response.code() else {
            return false;
        };

        if !(101..500).contains(&code) {
            return false;
        }

        let Some(id) = DialogSetId::of_local(request) else {
            return false;
        };

        if code != 401 && code != 407 {
            if let Some(set) = self.sets.get_mut(&id) {
                for realm in set.realms.values_mut() {
                    if matches!(realm.state, AuthState::Current | AuthState::TryOnce) {
                        realm.state = AuthState::Cached;
                    }
                }
            }

            return false;
        }

        let challenges = response
            .www_authenticate
            .iter()
            .map(|it| (it, false))
            .chain(response.proxy_authenticate.iter().map(|it| (it, true)))
            .collect::<Vec<_>>();

        if challenges.is_empty() {
            return false;
        }

        let set = self.sets.entry(id).or_default();
        for (challenge, proxy) in challenges {
            let Some(realm) = challenge.realm.clone() else {
                log::warn!("sip auth challenge without realm: code={code}");

                return false;
            };

            match set.realms.get_mut(&realm) {
                Some(state) => state.rechallenge(challenge.clone()),
                None => {
                    let credential = self.store.as_ref().and_then(|store| {
                        store
                            .credential(&realm)
                            .or_else(|| store.credential(&request.from.uri.host))
                    });

                    if credential.is_none() {
                        log::warn!("sip auth no credential: realm={realm}");
                    }

                    set.realms
                        .insert(realm, RealmState::new(challenge.clone(), proxy, credential));
                }
            }
        }

        if set.realms.values().any(|it| it.state == AuthState::Failed) {
            return false;
        }

        request.next_transaction();
        true
    }

    /// Put the Authorization and Proxy-Authorization headers of the dialog
    /// set on an outgoing request. Recomputed on every call, the nonce count
    /// only advances with a new transaction.
    pub fn add_authentication(&mut self, request: &mut SipMessage) {
        if matches!(request.method(), Method::Ack | Method::Cancel) {
            return;
        }

        let Some(set) = DialogSetId::of_local(request).and_then(|it| self.sets.get_mut(&it))
        else {
            return;
        };

        if set.realms.values().any(|it| it.state == AuthState::Failed) {
            return;
        }

        request.authorization.clear();
        request.proxy_authorization.clear();

        for realm in set.realms.values_mut() {
            if let Some(credentials) = realm.credentials(request) {
                if realm.proxy {
                    request.proxy_authorization.push(credentials);
                } else {
                    request.authorization.push(credentials);
                }
            }
        }
    }

    /// State of a realm in a dialog set, if it was ever challenged.
    pub fn state(&self, id: &DialogSetId, realm: &str) -> Option<AuthState> {
        self.sets.get(id)?.realms.get(realm).map(|it| it.state)
    }

    pub(crate) fn remove(&mut self, id: &DialogSetId) {
        self.sets.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NameAddr, Uri, Via, new_call_id};

    fn request() -> SipMessage {
        let uri = Uri::sip(Some("bob"), "example.com");
        let mut request = SipMessage::request(
            Method::Register,
            Uri::sip(None, "example.com"),
            NameAddr::new(Uri::sip(Some("alice"), "example.com")).with_tag("a1"),
            NameAddr::new(uri.clone()),
            &new_call_id("example.com"),
            1,
        );

        request.via.push(Via::new(&uri));
        request
    }

    fn challenge(request: &SipMessage, nonce: &str, stale: bool) -> SipMessage {
        let mut response = SipMessage::response(request, 401);
        response.www_authenticate.push(Challenge {
            realm: Some("example.com".to_string()),
            nonce: nonce.to_string(),
            qop: Some("auth".to_string()),
            stale,
            ..Default::default()
        });

        response
    }

    fn manager() -> ClientAuthManager {
        let mut manager = ClientAuthManager::default();
        manager.set_store(Box::new(vec![Credential {
            user: "alice".to_string(),
            password: "secret".to_string(),
            realm: "example.com".to_string(),
        }]));

        manager
    }

    #[test]
    fn answers_a_challenge_once() {
        let mut manager = manager();
        let mut request = request();

        let response = challenge(&request, "n1", false);
        assert!(manager.handle(&mut request, &response));
        assert_eq!(request.cseq.seq, 2);

        manager.add_authentication(&mut request);
        assert_eq!(request.authorization.len(), 1);
        assert_eq!(request.authorization[0].nonce_count.as_deref(), Some("00000001"));

        // signing the same transaction again keeps the nonce count
        manager.add_authentication(&mut request);
        assert_eq!(request.authorization.len(), 1);
        assert_eq!(request.authorization[0].nonce_count.as_deref(), Some("00000001"));

        let response = challenge(&request, "n1", false);
        assert!(!manager.handle(&mut request, &response));

        let id = DialogSetId::of_local(&request).unwrap();
        assert_eq!(manager.state(&id, "example.com"), Some(AuthState::Failed));
    }

    #[test]
    fn stale_nonce_allows_retry() {
        let mut manager = manager();
        let mut request = request();

        let response = challenge(&request, "n1", false);
        assert!(manager.handle(&mut request, &response));
        let response = challenge(&request, "n2", true);
        assert!(manager.handle(&mut request, &response));

        let id = DialogSetId::of_local(&request).unwrap();
        assert_eq!(manager.state(&id, "example.com"), Some(AuthState::Current));

        let ok = SipMessage::response(&request, 200);
        assert!(!manager.handle(&mut request, &ok));
        assert_eq!(manager.state(&id, "example.com"), Some(AuthState::Cached));
    }

    #[test]
    fn unsupported_algorithm_fails() {
        let mut manager = manager();
        let mut request = request();

        let mut response = challenge(&request, "n1", false);
        response.www_authenticate[0].algorithm = Some("SHA-256".to_string());

        assert!(!manager.handle(&mut request, &response));
        assert_eq!(request.cseq.seq, 1);

        manager.add_authentication(&mut request);
        assert!(request.authorization.is_empty());
    }
}
