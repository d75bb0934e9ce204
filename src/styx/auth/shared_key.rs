//! Shared-key challenge/response handlers.
//!
//! Both variants follow the same four-message shape:
//!
//! ```text
//! client                                   server
//!   Hello { protocol, user, client_nonce } ->
//!                 <- Challenge { server, server_nonce, server_proof? }
//!   Proof { client_proof }                 ->
//!                 <- Verdict { accepted, reason }
//! ```
//!
//! - `p9sk1` is mutual: the server proves knowledge of the user's key in
//!   its challenge and the client checks it before answering.
//! - `p9sk2` is one-way: only the client proves anything.
//!
//! Proofs are HMAC-SHA256 tags over a length-prefixed transcript of the
//! protocol name, a direction label, both nonces and the user name. These
//! handlers exercise the negotiation state machine; they are not wire
//! compatible with Plan 9's ticket-based protocols.

use std::sync::Arc;

use async_trait::async_trait;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, warn};

use crate::styx::blob::Blob;
use crate::styx::channel::{Channel, FramedLink, PeerLink};
use crate::styx::config::Attributes;
use crate::styx::error::AuthError;
use crate::styx::identity::{Credential, Identity};
use crate::styx::mode::{ProcessingMode, Role};
use crate::styx::wire::{MAX_FRAME_LEN, Message, MessageBuffer, Outbox};

use super::lifecycle::{ExchangeKind, HandlerCore, Settle};
use super::keystore::{KeyLookup, KeyStore, SecretKey};
use super::traits::AuthProtocolHandler;

/// Length of each side's nonce.
pub(crate) const NONCE_LEN: usize = 16;

/// Name a server announces when no identity is bound to it.
pub const DEFAULT_SERVER_NAME: &str = "styx";

/// Blob size used while the handler owns the channel. Fits any message.
const TAKEOVER_BLOB_CAPACITY: usize = MAX_FRAME_LEN;

const SERVER_LABEL: &str = "server";
const CLIENT_LABEL: &str = "client";
const SESSION_LABEL: &str = "session";

/// Which shared-key protocol a [`SharedKeyHandler`] speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedKeyVariant {
    /// Mutual authentication
    P9sk1,
    /// Client-only authentication
    P9sk2,
}

impl SharedKeyVariant {
    pub fn name(self) -> &'static str {
        match self {
            SharedKeyVariant::P9sk1 => "p9sk1",
            SharedKeyVariant::P9sk2 => "p9sk2",
        }
    }

    pub fn is_mutual(self) -> bool {
        matches!(self, SharedKeyVariant::P9sk1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    AwaitChallenge,
    AwaitVerdict,
    AwaitHello,
    AwaitProof,
    Done,
}

/// Handler for the shared-key protocol family.
pub struct SharedKeyHandler {
    core: HandlerCore,
    variant: SharedKeyVariant,
    keys: Arc<dyn KeyStore>,
    /// Key supplied through attributes; bypasses the store.
    own_key: Option<SecretKey>,
    server_name: String,
    rng: SystemRandom,
    inbox: MessageBuffer,
    outbox: Outbox,
    after_send: Option<Settle>,
    /// Message whose handling was postponed by a WAIT.
    deferred: Option<Message>,
    /// Takeover resumes by consuming rather than producing.
    direct_consuming: bool,
    step: Step,
    key: Option<SecretKey>,
    user: Option<String>,
    client_nonce: Vec<u8>,
    server_nonce: Vec<u8>,
    peer_name: Option<String>,
}

impl SharedKeyHandler {
    pub fn new(variant: SharedKeyVariant, keys: Arc<dyn KeyStore>) -> Self {
        Self {
            core: HandlerCore::new(variant.name()),
            variant,
            keys,
            own_key: None,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            rng: SystemRandom::new(),
            inbox: MessageBuffer::new(),
            outbox: Outbox::new(),
            after_send: None,
            deferred: None,
            direct_consuming: false,
            step: Step::Start,
            key: None,
            user: None,
            client_nonce: Vec::new(),
            server_nonce: Vec::new(),
            peer_name: None,
        }
    }

    pub fn p9sk1(keys: Arc<dyn KeyStore>) -> Self {
        Self::new(SharedKeyVariant::P9sk1, keys)
    }

    pub fn p9sk2(keys: Arc<dyn KeyStore>) -> Self {
        Self::new(SharedKeyVariant::P9sk2, keys)
    }

    pub fn variant(&self) -> SharedKeyVariant {
        self.variant
    }

    /// Parse declarative attributes into an identity and role.
    ///
    /// Recognised attributes: `user` (required), `role`, `key` (hex),
    /// `proto` (must name this handler when present).
    fn configure(&mut self, attributes: &Attributes) -> Result<(Identity, Role), AuthError> {
        if let Some(proto) = attributes.get("proto")
            && proto != self.variant.name()
        {
            return Err(AuthError::invalid_attribute(
                "proto",
                format!("expected {}, got {}", self.variant.name(), proto),
            ));
        }

        let user = attributes.required("user")?;

        let role = match attributes.get("role") {
            Some(raw) => raw
                .parse::<Role>()
                .map_err(|e| AuthError::invalid_attribute("role", e))?,
            None => Role::Client,
        };

        if let Some(key) = attributes.get("key") {
            self.own_key = Some(SecretKey::from_hex(key)?);
        }

        Ok((Identity::new(user, self.variant.name()), role))
    }

    fn resolve_key(&self, user: &str) -> KeyLookup {
        match &self.own_key {
            Some(key) => KeyLookup::Found(key.clone()),
            None => self.keys.lookup(user),
        }
    }

    fn fresh_nonce(&self) -> Result<Vec<u8>, AuthError> {
        let mut nonce = vec![0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| AuthError::Io(std::io::Error::other("system randomness unavailable")))?;
        Ok(nonce)
    }

    fn transcript(&self, label: &str, first: &[u8], second: &[u8], user: &str) -> Vec<u8> {
        let mut msg = Vec::new();
        for part in [
            self.variant.name().as_bytes(),
            label.as_bytes(),
            first,
            second,
            user.as_bytes(),
        ] {
            msg.extend_from_slice(&(part.len() as u16).to_be_bytes());
            msg.extend_from_slice(part);
        }
        msg
    }

    fn queue(&mut self, message: Message, settle: Settle) -> Result<ProcessingMode, AuthError> {
        debug!("{} queued {}", self.variant.name(), message.name());
        self.outbox.queue(&message)?;
        self.after_send = Some(settle);
        Ok(ProcessingMode::PendingData)
    }

    /// Tell the peer we are giving up, then fail once the verdict is out.
    fn reject(&mut self, reason: impl Into<String>) -> Result<ProcessingMode, AuthError> {
        let reason = reason.into();
        warn!("{} rejecting peer: {}", self.variant.name(), reason);
        self.step = Step::Done;
        self.queue(
            Message::Verdict {
                accepted: false,
                reason: reason.clone(),
            },
            Settle::Fail(reason),
        )
    }

    fn produce(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError> {
        if self.outbox.is_empty() && self.after_send.is_none() {
            let Some(role) = self.core.role() else {
                return Ok(ProcessingMode::NoIdentity);
            };
            match (role, self.step) {
                (Role::Client, Step::Start) => {
                    let Some(user) = self.user.clone() else {
                        return Ok(ProcessingMode::NoIdentity);
                    };
                    self.client_nonce = self.fresh_nonce()?;
                    self.step = Step::AwaitChallenge;
                    self.queue(
                        Message::Hello {
                            protocol: self.variant.name().to_string(),
                            user,
                            nonce: self.client_nonce.clone(),
                        },
                        Settle::Await,
                    )?;
                }
                (Role::Server, Step::Start) => {
                    self.step = Step::AwaitHello;
                    return Ok(ProcessingMode::NeedData);
                }
                _ => return Ok(ProcessingMode::NeedData),
            }
        }

        if !self.outbox.fill(blob) {
            return Ok(ProcessingMode::Continue);
        }
        let settle = self.after_send.take().unwrap_or(Settle::Await);
        Ok(self.core.apply(settle))
    }

    fn consume(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError> {
        self.inbox.absorb(blob);
        let message = match self.deferred.take() {
            Some(message) => message,
            None => match self.inbox.next_message()? {
                Some(message) => message,
                None => return Ok(ProcessingMode::NeedData),
            },
        };
        debug!("{} received {}", self.variant.name(), message.name());

        let mode = match self.core.role() {
            Some(Role::Client) => self.on_client_message(message)?,
            Some(Role::Server) => self.on_server_message(message)?,
            None => ProcessingMode::NoIdentity,
        };

        if mode == ProcessingMode::NeedData && !self.inbox.is_empty() {
            return Ok(ProcessingMode::Continue);
        }
        Ok(mode)
    }

    fn on_client_message(&mut self, message: Message) -> Result<ProcessingMode, AuthError> {
        match (self.step, message) {
            (
                Step::AwaitChallenge,
                Message::Challenge {
                    server,
                    nonce,
                    proof,
                },
            ) => {
                check_nonce(&nonce)?;
                let (Some(key), Some(user)) = (self.key.clone(), self.user.clone()) else {
                    return Ok(ProcessingMode::NoIdentity);
                };
                let signing_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());

                match (self.variant.is_mutual(), proof) {
                    (true, Some(proof)) => {
                        let expected =
                            self.transcript(SERVER_LABEL, &self.client_nonce, &nonce, &user);
                        if hmac::verify(&signing_key, &expected, &proof).is_err() {
                            return self.reject("server failed to prove knowledge of the shared key");
                        }
                    }
                    (true, None) => return self.reject("server sent no proof"),
                    (false, Some(_)) => {
                        return Err(AuthError::malformed(format!(
                            "unexpected server proof for {}",
                            self.variant.name()
                        )));
                    }
                    (false, None) => {}
                }

                let transcript = self.transcript(CLIENT_LABEL, &nonce, &self.client_nonce, &user);
                let client_proof = hmac::sign(&signing_key, &transcript).as_ref().to_vec();
                self.server_nonce = nonce;
                self.peer_name = Some(server);
                self.step = Step::AwaitVerdict;
                self.queue(
                    Message::Proof {
                        proof: client_proof,
                    },
                    Settle::Await,
                )
            }
            (Step::AwaitVerdict, Message::Verdict { accepted: true, .. }) => {
                let (Some(key), Some(user)) = (self.key.clone(), self.user.clone()) else {
                    return Ok(ProcessingMode::NoIdentity);
                };
                let peer = self
                    .peer_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
                let session_key = self.session_key(&key, &user);
                self.step = Step::Done;
                Ok(self.core.succeed(Credential::new(
                    peer,
                    self.variant.name(),
                    session_key,
                )))
            }
            (
                Step::AwaitChallenge | Step::AwaitVerdict,
                Message::Verdict {
                    accepted: false,
                    reason,
                },
            ) => {
                self.step = Step::Done;
                Ok(self
                    .core
                    .fail(format!("server rejected authentication: {}", reason)))
            }
            (step, other) => Err(AuthError::malformed(format!(
                "unexpected {} while client is in {:?}",
                other.name(),
                step
            ))),
        }
    }

    fn on_server_message(&mut self, message: Message) -> Result<ProcessingMode, AuthError> {
        match (self.step, message) {
            (
                Step::AwaitHello,
                Message::Hello {
                    protocol,
                    user,
                    nonce,
                },
            ) => {
                check_nonce(&nonce)?;
                if protocol != self.variant.name() {
                    return self.reject(format!(
                        "client requested protocol {}, this server speaks {}",
                        protocol,
                        self.variant.name()
                    ));
                }
                if user.is_empty() {
                    return self.reject("empty user name");
                }

                let key = match self.resolve_key(&user) {
                    KeyLookup::Found(key) => key,
                    KeyLookup::Missing => return self.reject(format!("no key for user {}", user)),
                    KeyLookup::Locked { retry_after } => {
                        debug!(
                            "{} key for {} is locked, asking for {}s wait",
                            self.variant.name(),
                            user,
                            retry_after
                        );
                        self.deferred = Some(Message::Hello {
                            protocol,
                            user,
                            nonce,
                        });
                        return Ok(ProcessingMode::Wait {
                            seconds: retry_after,
                        });
                    }
                };

                let server_nonce = self.fresh_nonce()?;
                let proof = if self.variant.is_mutual() {
                    let signing_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
                    let transcript = self.transcript(SERVER_LABEL, &nonce, &server_nonce, &user);
                    Some(hmac::sign(&signing_key, &transcript).as_ref().to_vec())
                } else {
                    None
                };

                self.key = Some(key);
                self.user = Some(user);
                self.client_nonce = nonce;
                self.server_nonce = server_nonce.clone();
                self.step = Step::AwaitProof;
                self.queue(
                    Message::Challenge {
                        server: self.server_name.clone(),
                        nonce: server_nonce,
                        proof,
                    },
                    Settle::Await,
                )
            }
            (Step::AwaitProof, Message::Proof { proof }) => {
                let (Some(key), Some(user)) = (self.key.clone(), self.user.clone()) else {
                    return Ok(ProcessingMode::NoIdentity);
                };
                let signing_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
                let expected =
                    self.transcript(CLIENT_LABEL, &self.server_nonce, &self.client_nonce, &user);
                if hmac::verify(&signing_key, &expected, &proof).is_err() {
                    return self.reject("client failed to prove knowledge of the shared key");
                }

                let session_key = self.session_key(&key, &user);
                if self.core.identity().is_none() {
                    self.core
                        .adopt_peer_identity(Identity::new(user.clone(), self.variant.name()));
                }
                self.step = Step::Done;
                let credential = Credential::new(user, self.variant.name(), session_key);
                self.queue(
                    Message::Verdict {
                        accepted: true,
                        reason: String::new(),
                    },
                    Settle::Succeed(credential),
                )
            }
            (
                Step::AwaitHello | Step::AwaitProof,
                Message::Verdict {
                    accepted: false,
                    reason,
                },
            ) => {
                self.step = Step::Done;
                Ok(self.core.fail(format!("client aborted: {}", reason)))
            }
            (step, other) => Err(AuthError::malformed(format!(
                "unexpected {} while server is in {:?}",
                other.name(),
                step
            ))),
        }
    }

    fn session_key(&self, key: &SecretKey, user: &str) -> Vec<u8> {
        let signing_key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
        let transcript =
            self.transcript(SESSION_LABEL, &self.client_nonce, &self.server_nonce, user);
        hmac::sign(&signing_key, &transcript).as_ref().to_vec()
    }

    /// Run the exchange over a channel this handler owns.
    ///
    /// Returns early with `Wait` so the driver can pause; the next call
    /// resumes with the operation that asked to wait.
    async fn exchange_directly(
        &mut self,
        channel: &mut dyn Channel,
    ) -> Result<ProcessingMode, AuthError> {
        let mut link = FramedLink::new(channel);
        let mut blob = Blob::with_capacity(TAKEOVER_BLOB_CAPACITY);

        loop {
            let mode = if self.direct_consuming {
                self.consume(&mut blob)?
            } else {
                blob.clear();
                let mode = self.produce(&mut blob)?;
                if !blob.is_empty() {
                    link.send(blob.as_slice()).await?;
                }
                mode
            };

            match mode {
                ProcessingMode::NeedData => {
                    let frame = link.recv(blob.capacity()).await?;
                    blob.clear();
                    blob.write(&frame);
                    self.direct_consuming = true;
                }
                ProcessingMode::PendingData => self.direct_consuming = false,
                ProcessingMode::Continue => {}
                ProcessingMode::Wait { seconds } => {
                    debug!("{} handing a {}s wait to the driver", self.variant.name(), seconds);
                    return Ok(mode);
                }
                ProcessingMode::NoMoreData => {
                    return Ok(if self.core.credential().is_some() {
                        ProcessingMode::Success
                    } else {
                        self.core.fail("exchange ended without an outcome")
                    });
                }
                other => return Ok(other),
            }
        }
    }
}

fn check_nonce(nonce: &[u8]) -> Result<(), AuthError> {
    if nonce.len() != NONCE_LEN {
        return Err(AuthError::malformed(format!(
            "nonce of {} bytes, expected {}",
            nonce.len(),
            NONCE_LEN
        )));
    }
    Ok(())
}

#[async_trait]
impl AuthProtocolHandler for SharedKeyHandler {
    fn protocol_name(&self) -> &str {
        self.core.protocol()
    }

    fn init(&mut self, identity: Option<Identity>, role: Role) -> bool {
        if let Some(id) = &identity
            && id.auth_protocol() != self.variant.name()
        {
            return self.core.reject_init(format!(
                "identity {} is not scoped to {}",
                id,
                self.variant.name()
            ));
        }

        match role {
            Role::Client => {
                let Some(identity) = identity else {
                    return self.core.reject_init("client role requires an identity");
                };
                let key = match self.resolve_key(identity.name()) {
                    KeyLookup::Found(key) => key,
                    KeyLookup::Missing => {
                        return self
                            .core
                            .reject_init(format!("no key for user {}", identity.name()));
                    }
                    KeyLookup::Locked { retry_after } => {
                        return self.core.reject_init(format!(
                            "key for user {} is locked, retry in {}s",
                            identity.name(),
                            retry_after
                        ));
                    }
                };
                self.key = Some(key);
                self.user = Some(identity.name().to_string());
                self.core.bind(Some(identity), role);
            }
            Role::Server => {
                if let Some(id) = &identity {
                    self.server_name = id.name().to_string();
                }
                self.core.bind(identity, role);
            }
        }
        true
    }

    fn init_from_config(&mut self, attributes: &Attributes) -> bool {
        match self.configure(attributes) {
            Ok((identity, role)) => self.init(Some(identity), role),
            Err(e) => {
                warn!(
                    "{} declarative initialization rejected: {}",
                    self.variant.name(),
                    e
                );
                self.core.reject_init(e.to_string())
            }
        }
    }

    fn identity(&self) -> Option<&Identity> {
        self.core.identity()
    }

    fn peer_credential(&self) -> Option<&Credential> {
        self.core.credential()
    }

    fn info(&self) -> Option<&str> {
        self.core.info()
    }

    fn role(&self) -> Option<Role> {
        self.core.role()
    }

    async fn process(&mut self, channel: &mut dyn Channel) -> Result<ProcessingMode, AuthError> {
        if let Some(mode) = self.core.enter(ExchangeKind::Takeover)? {
            return Ok(mode);
        }
        let result = self.exchange_directly(channel).await;
        self.core.settle(result)
    }

    fn get_data_for_peer(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError> {
        if let Some(mode) = self.core.enter(ExchangeKind::Blob)? {
            return Ok(mode);
        }
        let result = self.produce(blob);
        self.core.settle(result)
    }

    fn handle_peer_data(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError> {
        if let Some(mode) = self.core.enter(ExchangeKind::Blob)? {
            return Ok(mode);
        }
        let result = self.consume(blob);
        self.core.settle(result)
    }
}
