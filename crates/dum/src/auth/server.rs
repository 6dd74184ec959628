use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;

use super::digest;
use crate::{
    message::{Challenge, Credentials, Method, NameAddr, SipMessage, new_cnonce, new_tag},
    timer::TIMER_H,
};

#[derive(Debug, Clone)]
pub struct ServerAuthConfig {
    /// Static realm, otherwise derived per request.
    pub realm: Option<String>,
    /// Domains this side is responsible for.
    pub domains: Vec<String>,
    /// Challenge with 407 and Proxy-Authorization.
    pub proxy_mode: bool,
    pub nonce_lifetime: Duration,
    /// Key of the nonce hash.
    pub secret: String,
}

impl Default for ServerAuthConfig {
    fn default() -> Self {
        Self {
            realm: None,
            domains: Vec::new(),
            proxy_mode: false,
            nonce_lifetime: Duration::from_secs(300),
            secret: new_cnonce(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthLookup {
    /// Hex MD5 of `user:realm:password`.
    Found { a1: String },
    NotFound,
    Error,
}

/// Result of a credential lookup, keyed by the transaction that asked.
#[derive(Debug, Clone)]
pub struct UserAuthInfo {
    pub tid: String,
    pub user: String,
    pub realm: String,
    pub result: AuthLookup,
}

/// User database behind the server side authentication.
#[allow(unused_variables)]
pub trait UserAuthStore: Send + 'static {
    /// Start a lookup. The answer is fed back through
    /// [`crate::DialogUsageManager::on_user_auth_info`], possibly later.
    fn request_credential(&mut self, user: &str, realm: &str, tid: &str);

    fn requires_challenge(&self, request: &SipMessage) -> bool {
        true
    }

    /// Whether an authenticated user may send as `from`.
    fn authorized_for(&self, user: &str, realm: &str, from: &NameAddr) -> bool {
        from.uri.user.as_deref() == Some(user)
    }
}

#[derive(Debug)]
pub enum AuthOutcome {
    /// Authenticated or not subject to authentication.
    Pass(SipMessage),
    /// Answered here, the request goes no further.
    Respond(Vec<SipMessage>),
    /// Waiting for the user store.
    Requested,
}

enum NonceCheck {
    Valid,
    Stale,
    Forged,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_secs())
        .unwrap_or(0)
}

/// Request waiting for the user store, and when it started waiting.
struct Pending {
    request: SipMessage,
    since: Instant,
}

pub struct ServerAuthManager {
    config: ServerAuthConfig,
    store: Box<dyn UserAuthStore>,
    pending: AHashMap<String, Pending>,
}

impl ServerAuthManager {
    pub fn new(config: ServerAuthConfig, store: Box<dyn UserAuthStore>) -> Self {
        Self {
            pending: AHashMap::new(),
            config,
            store,
        }
    }

    pub fn handle(&mut self, request: SipMessage) -> AuthOutcome {
        match request.method() {
            Method::Ack => return AuthOutcome::Pass(request),
            Method::Cancel => {
                let invite = request
                    .transaction_id()
                    .filter(|it| {
                        self.pending
                            .get(*it)
                            .is_some_and(|it| it.request.method() == Method::Invite)
                    })
                    .map(ToString::to_string)
                    .and_then(|it| self.pending.remove(&it))
                    .map(|it| it.request);

                return match invite {
                    Some(invite) => AuthOutcome::Respond(vec![
                        Self::response(&invite, 487),
                        Self::response(&request, 200),
                    ]),
                    None => AuthOutcome::Pass(request),
                };
            }
            _ => (),
        }

        let realm = self.realm_for(&request);
        let Some(credentials) = self.credentials(&request, &realm) else {
            return if self.store.requires_challenge(&request) {
                AuthOutcome::Respond(vec![self.challenge(&request, &realm, false)])
            } else {
                AuthOutcome::Pass(request)
            };
        };

        let Some(tid) = request.transaction_id().map(ToString::to_string) else {
            return AuthOutcome::Respond(vec![Self::response(&request, 400)]);
        };

        let user = credentials.username.clone();

        log::debug!("sip auth lookup: user={user}, realm={realm}, tid={tid}");

        self.pending.insert(
            tid.clone(),
            Pending {
                since: Instant::now(),
                request,
            },
        );

        self.store.request_credential(&user, &realm, &tid);
        AuthOutcome::Requested
    }

    /// Give up on lookups the store left unanswered for longer than a
    /// transaction lives, with a 503 for each request.
    pub fn expire(&mut self, now: Instant) -> Vec<SipMessage> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, it)| it.since + TIMER_H <= now)
            .map(|(tid, _)| tid.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|tid| self.pending.remove(&tid))
            .map(|it| {
                log::warn!(
                    "sip auth lookup timed out: method={}, call_id={}",
                    it.request.method(),
                    it.request.call_id
                );

                Self::response(&it.request, 503)
            })
            .collect()
    }

    /// Finish the authentication of a pending request. `None` when the
    /// transaction is not pending anymore.
    pub fn on_user_auth_info(&mut self, info: UserAuthInfo) -> Option<AuthOutcome> {
        let request = self.pending.remove(&info.tid)?.request;

        let a1 = match info.result {
            AuthLookup::Found { a1 } if !a1.is_empty() => a1,
            AuthLookup::Found { .. } | AuthLookup::NotFound => {
                log::info!("sip auth unknown user: user={}, realm={}", info.user, info.realm);

                return Some(AuthOutcome::Respond(vec![Self::response(&request, 404)]));
            }
            AuthLookup::Error => {
                return Some(AuthOutcome::Respond(vec![Self::response(&request, 503)]));
            }
        };

        let Some(credentials) = self.credentials(&request, &info.realm) else {
            return Some(AuthOutcome::Respond(vec![Self::response(&request, 403)]));
        };

        let nonce = self.check_nonce(&credentials.nonce);
        let expected = digest::response(
            &a1,
            request.method().as_str(),
            &credentials.uri,
            &credentials.nonce,
            match (&credentials.qop, &credentials.nonce_count, &credentials.cnonce) {
                (Some(_), Some(nc), Some(cnonce)) => Some((nc.as_str(), cnonce.as_str())),
                _ => None,
            },
        );

        if matches!(nonce, NonceCheck::Forged) || !expected.eq_ignore_ascii_case(&credentials.response)
        {
            log::warn!("sip auth bad digest: user={}, realm={}", info.user, info.realm);

            return Some(AuthOutcome::Respond(vec![Self::response(&request, 403)]));
        }

        if matches!(nonce, NonceCheck::Stale) {
            return Some(AuthOutcome::Respond(vec![
                self.challenge(&request, &info.realm, true),
            ]));
        }

        if !self
            .store
            .authorized_for(&credentials.username, &info.realm, &request.from)
        {
            log::warn!(
                "sip auth not authorized: user={}, from={}",
                credentials.username,
                request.from.uri
            );

            return Some(AuthOutcome::Respond(vec![Self::response(&request, 403)]));
        }

        Some(AuthOutcome::Pass(request))
    }

    fn credentials<'a>(&self, request: &'a SipMessage, realm: &str) -> Option<&'a Credentials> {
        let credentials = if self.config.proxy_mode {
            &request.proxy_authorization
        } else {
            &request.authorization
        };

        credentials.iter().find(|it| it.realm == realm)
    }

    fn realm_for(&self, request: &SipMessage) -> String {
        if let Some(realm) = &self.config.realm {
            return realm.clone();
        }

        let from = &request.from.uri.host;
        if self.config.domains.iter().any(|it| it == from) {
            return from.clone();
        }

        request
            .request_uri()
            .map(|it| it.host.clone())
            .unwrap_or_else(|| from.clone())
    }

    fn make_nonce(&self, timestamp: u64) -> String {
        let timestamp = timestamp.to_string();
        format!(
            "{timestamp}:{}",
            digest::md5_hex(&[&timestamp, &self.config.secret])
        )
    }

    fn check_nonce(&self, nonce: &str) -> NonceCheck {
        let Some(timestamp) = nonce
            .split_once(':')
            .and_then(|(it, _)| it.parse::<u64>().ok())
        else {
            return NonceCheck::Forged;
        };

        if self.make_nonce(timestamp) != nonce {
            return NonceCheck::Forged;
        }

        if timestamp + self.config.nonce_lifetime.as_secs() < unix_now() {
            NonceCheck::Stale
        } else {
            NonceCheck::Valid
        }
    }

    fn challenge(&self, request: &SipMessage, realm: &str, stale: bool) -> SipMessage {
        let challenge = Challenge {
            realm: Some(realm.to_string()),
            nonce: self.make_nonce(unix_now()),
            algorithm: Some("MD5".to_string()),
            qop: Some("auth".to_string()),
            opaque: None,
            stale,
        };

        if self.config.proxy_mode {
            let mut response = Self::response(request, 407);
            response.proxy_authenticate.push(challenge);
            response
        } else {
            let mut response = Self::response(request, 401);
            response.www_authenticate.push(challenge);
            response
        }
    }

    fn response(request: &SipMessage, code: u16) -> SipMessage {
        let mut response = SipMessage::response(request, code);
        if response.to.tag.is_none() {
            response.to.tag = Some(new_tag());
        }

        response
    }
}
