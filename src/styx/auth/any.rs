//! Any-protocol envelope (`p9any`).
//!
//! The server offers a list of protocols, the client picks one, and both
//! sides delegate to the chosen protocol. The envelope only works through
//! blob exchange; [`process`](AuthProtocolHandler::process) answers
//! NOT_SUPPORTED.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::styx::blob::Blob;
use crate::styx::channel::Channel;
use crate::styx::config::Attributes;
use crate::styx::error::AuthError;
use crate::styx::identity::{Credential, Identity};
use crate::styx::mode::{ProcessingMode, Role};
use crate::styx::wire::{Message, MessageBuffer, Outbox};

use super::lifecycle::{ExchangeKind, HandlerCore, Settle};
use super::traits::AuthProtocolHandler;

/// Registry name of the envelope.
pub const ANY_PROTOCOL: &str = "p9any";

/// Handler for the `p9any` envelope.
pub struct AnyProtocolHandler {
    core: HandlerCore,
    /// Offered (server) or preferred, in order (client).
    protocols: Vec<String>,
    inbox: MessageBuffer,
    outbox: Outbox,
    after_send: Option<Settle>,
    started: bool,
}

impl AnyProtocolHandler {
    pub fn new<I, S>(protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            core: HandlerCore::new(ANY_PROTOCOL),
            protocols: normalize(protocols),
            inbox: MessageBuffer::new(),
            outbox: Outbox::new(),
            after_send: None,
            started: false,
        }
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    fn configure(&mut self, attributes: &Attributes) -> Result<(Identity, Role), AuthError> {
        if let Some(proto) = attributes.get("proto")
            && proto != ANY_PROTOCOL
        {
            return Err(AuthError::invalid_attribute(
                "proto",
                format!("expected {}, got {}", ANY_PROTOCOL, proto),
            ));
        }

        let role = match attributes.get("role") {
            Some(raw) => raw
                .parse::<Role>()
                .map_err(|e| AuthError::invalid_attribute("role", e))?,
            None => Role::Client,
        };

        if let Some(list) = attributes.get("protocols") {
            let protocols = normalize(list.split([',', ' ']));
            if protocols.is_empty() {
                return Err(AuthError::invalid_attribute("protocols", "empty protocol list"));
            }
            self.protocols = protocols;
        }

        let identity = Identity::new(attributes.required("user")?, ANY_PROTOCOL);
        Ok((identity, role))
    }

    fn queue(&mut self, message: Message, settle: Settle) -> Result<ProcessingMode, AuthError> {
        debug!("{} queued {}", ANY_PROTOCOL, message.name());
        self.outbox.queue(&message)?;
        self.after_send = Some(settle);
        Ok(ProcessingMode::PendingData)
    }

    fn produce(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError> {
        if self.outbox.is_empty() && self.after_send.is_none() {
            if self.started || self.core.role() != Some(Role::Server) {
                self.started = true;
                return Ok(ProcessingMode::NeedData);
            }
            self.started = true;
            self.queue(
                Message::Offer {
                    protocols: self.protocols.clone(),
                },
                Settle::Await,
            )?;
        }

        if !self.outbox.fill(blob) {
            return Ok(ProcessingMode::Continue);
        }
        let settle = self.after_send.take().unwrap_or(Settle::Await);
        Ok(self.core.apply(settle))
    }

    fn consume(&mut self, blob: &mut Blob) -> Result<ProcessingMode, AuthError> {
        self.inbox.absorb(blob);
        let Some(message) = self.inbox.next_message()? else {
            return Ok(ProcessingMode::NeedData);
        };
        debug!("{} received {}", ANY_PROTOCOL, message.name());

        match (self.core.role(), message) {
            (Some(Role::Server), Message::Choice { protocol }) => {
                if protocol.is_empty() {
                    Ok(self.core.fail("client found no common protocol"))
                } else if !self.protocols.contains(&protocol) {
                    warn!("{} client chose unoffered protocol {}", ANY_PROTOCOL, protocol);
                    Ok(self
                        .core
                        .fail(format!("client chose {} which was not offered", protocol)))
                } else {
                    Ok(self.core.delegate(protocol))
                }
            }
            (Some(Role::Client), Message::Offer { protocols: offered }) => {
                let choice = self
                    .protocols
                    .iter()
                    .find(|p| offered.contains(*p))
                    .cloned();
                match choice {
                    Some(protocol) => self.queue(
                        Message::Choice {
                            protocol: protocol.clone(),
                        },
                        Settle::Delegate(protocol),
                    ),
                    None => self.queue(
                        Message::Choice {
                            protocol: String::new(),
                        },
                        Settle::Fail(format!(
                            "no common protocol: server offered [{}], client accepts [{}]",
                            offered.join(" "),
                            self.protocols.join(" ")
                        )),
                    ),
                }
            }
            (None, _) => Ok(ProcessingMode::NoIdentity),
            (_, other) => Err(AuthError::malformed(format!(
                "unexpected {} in {} envelope",
                other.name(),
                ANY_PROTOCOL
            ))),
        }
    }
}

/// Trim, drop empties and the envelope's own name, keep first occurrences.
fn normalize<I, S>(protocols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for protocol in protocols {
        let protocol = protocol.into().trim().to_string();
        if protocol.is_empty() || protocol == ANY_PROTOCOL || out.contains(&protocol) {
            continue;
        }
        out.push(protocol);
    }
    out
}

#[async_trait]
impl AuthProtocolHandler for AnyProtocolHandler {
    fn protocol_name(&self) -> &str {
        self.core.protocol()
    }

    fn init(&mut self, identity: Option<Identity>, role: Role) -> bool {
        if self.protocols.is_empty() {
            return self.core.reject_init("no protocols to negotiate");
        }
        if let Some(id) = &identity
            && id.auth_protocol() != ANY_PROTOCOL
            && !self.protocols.iter().any(|p| p == id.auth_protocol())
        {
            return self.core.reject_init(format!(
                "identity {} is not usable inside {}",
                id, ANY_PROTOCOL
            ));
        }
        if role == Role::Client && identity.is_none() {
            return self.core.reject_init("client role requires an identity");
        }
        self.core.bind(identity, role);
        true
    }

    fn init_from_config(&mut self, attributes: &Attributes) -> bool {
        match self.configure(attributes) {
            Ok((identity, role)) => self.init(Some(identity), role),
            Err(e) => {
                warn!("{} declarative initialization rejected: {}", ANY_PROTOCOL, e);
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

    async fn process(&mut self, _channel: &mut dyn Channel) -> Result<ProcessingMode, AuthError> {
        if let Some(mode) = self.core.enter(ExchangeKind::Takeover)? {
            return Ok(mode);
        }
        Ok(self.core.not_supported())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styx::auth::testing::exchange;
    use crate::styx::channel::StreamChannel;

    fn client(preferences: &[&str]) -> AnyProtocolHandler {
        let mut handler = AnyProtocolHandler::new(preferences.iter().copied());
        assert!(handler.init(Some(Identity::new("alice", ANY_PROTOCOL)), Role::Client));
        handler
    }

    fn server(offer: &[&str]) -> AnyProtocolHandler {
        let mut handler = AnyProtocolHandler::new(offer.iter().copied());
        assert!(handler.init(None, Role::Server));
        handler
    }

    #[test]
    fn test_both_sides_delegate_to_client_preference() {
        let mut c = client(&["p9sk2", "p9sk1"]);
        let mut s = server(&["p9sk1", "p9sk2"]);

        let outcomes = exchange(&mut c, &mut s, 64).unwrap();
        assert_eq!(
            outcomes,
            (
                Some(ProcessingMode::Delegated),
                Some(ProcessingMode::Delegated)
            )
        );
        assert_eq!(c.info(), Some("p9sk2"));
        assert_eq!(s.info(), Some("p9sk2"));
        assert!(c.peer_credential().is_none());
    }

    #[test]
    fn test_no_common_protocol_fails_both_sides() {
        let mut c = client(&["p9sk2"]);
        let mut s = server(&["p9sk1"]);

        let outcomes = exchange(&mut c, &mut s, 64).unwrap();
        assert_eq!(
            outcomes,
            (Some(ProcessingMode::Failed), Some(ProcessingMode::Failed))
        );
        assert!(c.info().unwrap().starts_with("no common protocol"));
        assert_eq!(s.info(), Some("client found no common protocol"));
    }

    #[test]
    fn test_unoffered_choice_fails_server() {
        let mut s = server(&["p9sk1"]);
        let mut blob = Blob::with_capacity(64);
        assert_eq!(
            s.get_data_for_peer(&mut blob).unwrap(),
            ProcessingMode::NeedData
        );

        blob.clear();
        let choice = Message::Choice {
            protocol: "p9sk2".into(),
        };
        blob.write(&choice.encode().unwrap());
        assert_eq!(
            s.handle_peer_data(&mut blob).unwrap(),
            ProcessingMode::Failed
        );
        assert!(s.info().unwrap().contains("not offered"));
    }

    #[test]
    fn test_envelope_never_lists_itself() {
        let handler = AnyProtocolHandler::new(["p9any", "p9sk1", " ", "p9sk1", "p9sk2"]);
        assert_eq!(handler.protocols(), &["p9sk1".to_string(), "p9sk2".to_string()]);
    }

    #[test]
    fn test_client_requires_identity() {
        let mut handler = AnyProtocolHandler::new(["p9sk1"]);
        assert!(!handler.init(None, Role::Client));
    }

    #[test]
    fn test_identity_for_unlisted_protocol_is_rejected() {
        let mut handler = AnyProtocolHandler::new(["p9sk1"]);
        assert!(!handler.init(Some(Identity::new("alice", "p9sk2")), Role::Client));

        let mut handler = AnyProtocolHandler::new(["p9sk1"]);
        assert!(handler.init(Some(Identity::new("alice", "p9sk1")), Role::Client));
    }

    #[test]
    fn test_empty_protocol_list_cannot_init() {
        let mut handler = AnyProtocolHandler::new(Vec::<String>::new());
        assert!(!handler.init(None, Role::Server));
    }

    #[test]
    fn test_declarative_init() {
        let mut handler = AnyProtocolHandler::new(["p9sk1"]);
        let attrs = Attributes::parse("proto=p9any user=alice protocols='p9sk2,p9sk1'").unwrap();
        assert!(handler.init_from_config(&attrs));
        assert_eq!(handler.role(), Some(Role::Client));
        assert_eq!(handler.protocols(), &["p9sk2".to_string(), "p9sk1".to_string()]);

        let mut handler = AnyProtocolHandler::new(["p9sk1"]);
        let attrs = Attributes::new().with("role", "server").with("user", "fs");
        assert!(handler.init_from_config(&attrs));
        assert_eq!(handler.identity().unwrap().name(), "fs");

        let mut handler = AnyProtocolHandler::new(["p9sk1"]);
        assert!(!handler.init_from_config(&Attributes::new().with("role", "client")));
        let mut blob = Blob::with_capacity(32);
        assert_eq!(
            handler.get_data_for_peer(&mut blob).unwrap(),
            ProcessingMode::NoIdentity
        );
    }

    #[test]
    fn test_unexpected_message_is_malformed() {
        let mut c = client(&["p9sk1"]);
        let mut blob = Blob::with_capacity(64);
        c.get_data_for_peer(&mut blob).unwrap();

        blob.clear();
        let stray = Message::Proof { proof: vec![1] };
        blob.write(&stray.encode().unwrap());
        assert!(matches!(
            c.handle_peer_data(&mut blob),
            Err(AuthError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_takeover_is_not_supported() {
        let (a, _b) = tokio::io::duplex(64);
        let mut channel = StreamChannel::new(a);
        let mut s = server(&["p9sk1"]);
        assert_eq!(
            s.process(&mut channel).await.unwrap(),
            ProcessingMode::NotSupported
        );
        assert!(s.peer_credential().is_none());
    }
}
