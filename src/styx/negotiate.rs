//! Negotiation driver.
//!
//! [`Negotiator`] runs one authentication negotiation per call: it asks the
//! registry for a handler, initializes it, pumps blobs between the handler
//! and the peer until a terminal mode, and follows delegations to fresh
//! successor handlers.
//!
//! # Blob Loop
//!
//! | mode          | next action                                        |
//! |---------------|----------------------------------------------------|
//! | `NeedData`    | receive one frame into the cleared blob, consume   |
//! | `PendingData` | produce                                            |
//! | `Continue`    | repeat the same operation                          |
//! | `Wait`        | sleep on the [`Clock`], repeat the same operation  |
//! | `NoMoreData`  | SUCCESS if a credential is held, otherwise FAILED  |
//! | `Delegated`   | switch to the successor named by `info()`          |
//!
//! # Bounds
//!
//! Every negotiation runs under the configured overall timeout and the
//! negotiator's [`CancellationToken`]. Delegation chains are capped at
//! `max_delegations` hops and may not revisit a protocol.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::styx::auth::AuthProtocolHandler;
use crate::styx::blob::Blob;
use crate::styx::channel::PeerLink;
use crate::styx::config::{Attributes, MAX_RETRY_DELAY, NegotiatorConfig};
use crate::styx::error::AuthError;
use crate::styx::identity::{Credential, CredentialSummary, Identity};
use crate::styx::mode::{ProcessingMode, Role};
use crate::styx::registry::HandlerRegistry;

/// Source of the delays requested through `Wait`.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Result of a negotiation that ran to completion.
///
/// Faults (I/O errors, malformed data, delegation errors) are reported as
/// [`AuthError`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Success {
        protocol: String,
        credential: Credential,
    },
    Failed {
        protocol: String,
        info: String,
    },
    NotSupported {
        protocol: String,
    },
    NoIdentity {
        protocol: String,
        info: Option<String>,
    },
}

impl NegotiationOutcome {
    /// Protocol of the handler that produced the outcome.
    pub fn protocol(&self) -> &str {
        match self {
            NegotiationOutcome::Success { protocol, .. }
            | NegotiationOutcome::Failed { protocol, .. }
            | NegotiationOutcome::NotSupported { protocol }
            | NegotiationOutcome::NoIdentity { protocol, .. } => protocol,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NegotiationOutcome::Success { .. })
    }

    pub fn credential(&self) -> Option<&Credential> {
        match self {
            NegotiationOutcome::Success { credential, .. } => Some(credential),
            _ => None,
        }
    }

    pub fn info(&self) -> Option<&str> {
        match self {
            NegotiationOutcome::Failed { info, .. } => Some(info),
            NegotiationOutcome::NoIdentity { info, .. } => info.as_deref(),
            _ => None,
        }
    }

    /// Serializable summary, without key material.
    pub fn report(&self) -> OutcomeReport {
        let outcome = match self {
            NegotiationOutcome::Success { .. } => "success",
            NegotiationOutcome::Failed { .. } => "failed",
            NegotiationOutcome::NotSupported { .. } => "not_supported",
            NegotiationOutcome::NoIdentity { .. } => "no_identity",
        };
        OutcomeReport {
            outcome: outcome.to_string(),
            protocol: self.protocol().to_string(),
            credential: self.credential().map(Credential::summary),
            info: self.info().map(str::to_string),
        }
    }
}

/// JSON-friendly view of a [`NegotiationOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub outcome: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// How the first handler of a negotiation is initialized.
pub(crate) enum Start<'a> {
    Live {
        identity: Option<Identity>,
        role: Role,
    },
    Declarative(&'a Attributes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Produce,
    Consume,
}

/// Drives authentication negotiations against a shared handler registry.
///
/// Clones share the registry, clock and cancellation token.
#[derive(Clone)]
pub struct Negotiator {
    registry: Arc<HandlerRegistry>,
    config: NegotiatorConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Negotiator {
    pub fn new(registry: Arc<HandlerRegistry>, config: NegotiatorConfig) -> Self {
        Self {
            registry,
            config,
            clock: Arc::new(TokioClock),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the clock used to honor `Wait`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Abort every in-flight and future negotiation with [`AuthError::Cancelled`].
    pub fn cancel(&self) {
        info!("Cancelling negotiations");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Negotiate `protocol` over a blob link, initializing the first handler
    /// with `identity` and `role`.
    pub async fn negotiate<L: PeerLink + ?Sized>(
        &self,
        protocol: &str,
        identity: Option<Identity>,
        role: Role,
        link: &mut L,
    ) -> Result<NegotiationOutcome, AuthError> {
        self.guarded(
            protocol,
            self.run(protocol, Start::Live { identity, role }, link),
        )
        .await
    }

    /// Negotiate `protocol`, initializing the first handler from attributes.
    pub async fn negotiate_from_config<L: PeerLink + ?Sized>(
        &self,
        protocol: &str,
        attributes: &Attributes,
        link: &mut L,
    ) -> Result<NegotiationOutcome, AuthError> {
        self.guarded(
            protocol,
            self.run(protocol, Start::Declarative(attributes), link),
        )
        .await
    }

    /// Retry whole negotiations on retryable faults.
    ///
    /// `connect` is called once per attempt and must return a fresh link;
    /// every attempt also gets fresh handlers. Protocol-level outcomes,
    /// including FAILED, are never retried.
    pub async fn negotiate_with_retry<F, Fut, L>(
        &self,
        protocol: &str,
        identity: Option<Identity>,
        role: Role,
        connect: F,
    ) -> Result<NegotiationOutcome, AuthError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<L, AuthError>>,
        L: PeerLink,
    {
        let attempt_counter = AtomicU32::new(0);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.config.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("Negotiation retry attempt {} for {}", current_attempt, protocol);
            }
            let mut link = connect().await?;
            self.negotiate(protocol, identity.clone(), role, &mut link)
                .await
        })
        .retry(backoff)
        .when(|e| {
            let retryable = e.is_retryable() && !self.cancel.is_cancelled();
            if !retryable {
                warn!(
                    "Negotiation of {} failed with non-retryable error: {}",
                    protocol, e
                );
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("Negotiation failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        match &result {
            Ok(_) if total_attempts > 1 => info!(
                "Negotiation of {} completed after {} retry attempt(s)",
                protocol,
                total_attempts - 1
            ),
            Err(e) => error!(
                "Negotiation of {} failed after {} attempt(s). Last error: {}",
                protocol, total_attempts, e
            ),
            _ => {}
        }
        result
    }

    /// Apply the span, the overall timeout and cancellation to `work`.
    pub(crate) async fn guarded<F>(
        &self,
        protocol: &str,
        work: F,
    ) -> Result<NegotiationOutcome, AuthError>
    where
        F: Future<Output = Result<NegotiationOutcome, AuthError>>,
    {
        let span = info_span!("negotiation", id = %Uuid::new_v4(), protocol = %protocol);
        let timeout = self.config.timeout;

        async move {
            info!("Starting negotiation");
            let result = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    warn!("Negotiation cancelled");
                    Err(AuthError::Cancelled)
                }

                _ = tokio::time::sleep(timeout) => {
                    warn!("Negotiation timed out after {:?}", timeout);
                    Err(AuthError::Timeout(timeout))
                }

                result = work => result,
            };
            match &result {
                Ok(outcome) => info!(
                    "Negotiation finished: {} via {}",
                    outcome.report().outcome,
                    outcome.protocol()
                ),
                Err(e) => warn!("Negotiation aborted: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Create and initialize the first handler.
    ///
    /// The flag is `false` when initialization was refused.
    pub(crate) fn prepare(
        &self,
        protocol: &str,
        start: &Start<'_>,
    ) -> Result<(Box<dyn AuthProtocolHandler>, bool), AuthError> {
        let mut handler = self.registry.create(protocol)?;
        let ready = match start {
            Start::Live { identity, role } => handler.init(identity.clone(), *role),
            Start::Declarative(attributes) => handler.init_from_config(attributes),
        };
        if !ready {
            warn!(
                "Handler {} refused initialization: {}",
                protocol,
                handler.info().unwrap_or("no reason given")
            );
        }
        Ok((handler, ready))
    }

    async fn run<L: PeerLink + ?Sized>(
        &self,
        protocol: &str,
        start: Start<'_>,
        link: &mut L,
    ) -> Result<NegotiationOutcome, AuthError> {
        let (handler, ready) = self.prepare(protocol, &start)?;
        if !ready {
            return Ok(conclude(handler.as_ref(), ProcessingMode::NoIdentity));
        }
        self.run_chain(handler, vec![protocol.to_string()], None, link)
            .await
    }

    /// Drive `handler` and its successors over the blob loop.
    ///
    /// `pending` is a mode the handler already returned outside the loop.
    pub(crate) async fn run_chain<L: PeerLink + ?Sized>(
        &self,
        mut handler: Box<dyn AuthProtocolHandler>,
        mut chain: Vec<String>,
        mut pending: Option<ProcessingMode>,
        link: &mut L,
    ) -> Result<NegotiationOutcome, AuthError> {
        loop {
            let mode = match pending.take() {
                Some(mode) => mode,
                None => self.drive(handler.as_mut(), link).await?,
            };
            if mode != ProcessingMode::Delegated {
                return Ok(conclude(handler.as_ref(), mode));
            }

            let successor = self.successor(handler.as_ref(), &chain)?;
            let identity = handler.identity().map(|id| id.rescoped(successor.as_str()));
            let Some(role) = handler.role() else {
                return Ok(conclude(handler.as_ref(), ProcessingMode::NoIdentity));
            };
            info!(
                "Delegating from {} to {}",
                handler.protocol_name(),
                successor
            );

            chain.push(successor.clone());
            handler = self.registry.create(&successor)?;
            if !handler.init(identity, role) {
                warn!(
                    "Successor {} refused initialization: {}",
                    successor,
                    handler.info().unwrap_or("no reason given")
                );
                return Ok(conclude(handler.as_ref(), ProcessingMode::NoIdentity));
            }
        }
    }

    /// Validate the successor a delegating handler named.
    fn successor(
        &self,
        handler: &dyn AuthProtocolHandler,
        chain: &[String],
    ) -> Result<String, AuthError> {
        let current = handler.protocol_name();
        let successor = handler.info().unwrap_or_default().to_string();

        if successor == current {
            return Err(AuthError::SelfDelegation(successor));
        }
        if chain.contains(&successor) {
            let mut chain = chain.to_vec();
            chain.push(successor);
            return Err(AuthError::DelegationCycle { chain });
        }
        if chain.len() > self.config.max_delegations {
            let mut chain = chain.to_vec();
            chain.push(successor);
            return Err(AuthError::TooManyDelegations {
                max: self.config.max_delegations,
                chain,
            });
        }
        if !self.registry.contains(&successor) {
            return Err(AuthError::UnknownProtocol(successor));
        }
        Ok(successor)
    }

    /// Honor a `Wait` on the negotiator's clock.
    pub(crate) async fn pause(&self, protocol: &str, seconds: u32) {
        info!("{} asked to wait {}s", protocol, seconds);
        self.clock
            .sleep(Duration::from_secs(u64::from(seconds)))
            .await;
    }

    /// Run one handler's blob exchange until it is terminal or delegates.
    async fn drive<L: PeerLink + ?Sized>(
        &self,
        handler: &mut dyn AuthProtocolHandler,
        link: &mut L,
    ) -> Result<ProcessingMode, AuthError> {
        let mut blob = Blob::with_capacity(self.config.blob_capacity);
        let mut op = Op::Produce;

        loop {
            let mode = match op {
                Op::Produce => {
                    blob.clear();
                    let mode = handler.get_data_for_peer(&mut blob)?;
                    if !blob.is_empty() {
                        link.send(blob.as_slice()).await?;
                    }
                    mode
                }
                Op::Consume => handler.handle_peer_data(&mut blob)?,
            };
            debug!("{} returned {}", handler.protocol_name(), mode);

            match mode {
                ProcessingMode::NeedData => {
                    blob.clear();
                    let frame = link.recv(blob.capacity()).await?;
                    blob.write(&frame);
                    op = Op::Consume;
                }
                ProcessingMode::PendingData => op = Op::Produce,
                ProcessingMode::Continue => {}
                ProcessingMode::Wait { seconds } => {
                    self.pause(handler.protocol_name(), seconds).await;
                }
                other => return Ok(other),
            }
        }
    }
}

/// Map the mode a handler stopped at to an outcome.
pub(crate) fn conclude(handler: &dyn AuthProtocolHandler, mode: ProcessingMode) -> NegotiationOutcome {
    let protocol = handler.protocol_name().to_string();
    let failed = |info: Option<&str>| NegotiationOutcome::Failed {
        protocol: protocol.clone(),
        info: info.unwrap_or("authentication failed").to_string(),
    };

    match mode {
        ProcessingMode::Success | ProcessingMode::NoMoreData => match handler.peer_credential() {
            Some(credential) => NegotiationOutcome::Success {
                protocol: protocol.clone(),
                credential: credential.clone(),
            },
            None if mode == ProcessingMode::Success => {
                failed(Some("handler reported success without a credential"))
            }
            None => failed(handler.info().or(Some("exchange ended without an outcome"))),
        },
        ProcessingMode::NotSupported => NegotiationOutcome::NotSupported {
            protocol: protocol.clone(),
        },
        ProcessingMode::NoIdentity => NegotiationOutcome::NoIdentity {
            protocol: protocol.clone(),
            info: handler.info().map(str::to_string),
        },
        _ => failed(handler.info()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::styx::auth::{MemoryKeyStore, SecretKey};
    use crate::styx::channel::{FramedLink, StreamChannel};

    fn registry() -> Arc<HandlerRegistry> {
        let keys = Arc::new(
            MemoryKeyStore::new().with_key("alice", SecretKey::new(b"alice-secret".to_vec())),
        );
        Arc::new(HandlerRegistry::with_defaults(keys))
    }

    fn links() -> (
        FramedLink<StreamChannel<tokio::io::DuplexStream>>,
        FramedLink<StreamChannel<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (
            FramedLink::new(StreamChannel::new(a)),
            FramedLink::new(StreamChannel::new(b)),
        )
    }

    #[tokio::test]
    async fn test_loopback_success() {
        let negotiator = Negotiator::new(registry(), NegotiatorConfig::default());
        let (mut c, mut s) = links();

        let (client, server) = tokio::join!(
            negotiator.negotiate(
                "p9sk1",
                Some(Identity::new("alice", "p9sk1")),
                Role::Client,
                &mut c
            ),
            negotiator.negotiate("p9sk1", None, Role::Server, &mut s)
        );
        let client = client.unwrap();
        let server = server.unwrap();
        assert!(client.is_success());
        assert!(server.is_success());
        assert_eq!(server.credential().unwrap().peer(), "alice");
    }

    #[tokio::test]
    async fn test_refused_init_is_no_identity_without_traffic() {
        let negotiator = Negotiator::new(registry(), NegotiatorConfig::default());
        let (mut c, _s) = links();
        let outcome = negotiator
            .negotiate(
                "p9sk1",
                Some(Identity::new("nobody", "p9sk1")),
                Role::Client,
                &mut c,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            NegotiationOutcome::NoIdentity {
                protocol: "p9sk1".into(),
                info: Some("no key for user nobody".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_protocol_is_a_fault() {
        let negotiator = Negotiator::new(registry(), NegotiatorConfig::default());
        let (mut c, _s) = links();
        let err = negotiator
            .negotiate("krb5", None, Role::Server, &mut c)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownProtocol(_)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let config = NegotiatorConfig::default().with_timeout(Duration::from_millis(50));
        let negotiator = Negotiator::new(registry(), config);
        let (_c, mut s) = links();
        let err = negotiator
            .negotiate("p9sk1", None, Role::Server, &mut s)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_negotiator_refuses_work() {
        let negotiator = Negotiator::new(registry(), NegotiatorConfig::default());
        negotiator.cancel();
        assert!(negotiator.is_cancelled());
        let (_c, mut s) = links();
        let err = negotiator
            .negotiate("p9sk1", None, Role::Server, &mut s)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[test]
    fn test_report_serializes_without_key_material() {
        let outcome = NegotiationOutcome::Success {
            protocol: "p9sk1".into(),
            credential: Credential::new("alice", "p9sk1", vec![0xAB; 32]),
        };
        let json = serde_json::to_value(outcome.report()).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["credential"]["peer"], "alice");
        assert!(json.get("info").is_none());
        assert!(!json.to_string().contains("abab"));
    }

    #[test]
    fn test_failed_report_carries_info() {
        let outcome = NegotiationOutcome::Failed {
            protocol: "p9sk2".into(),
            info: "bad proof".into(),
        };
        let report = outcome.report();
        assert_eq!(report.outcome, "failed");
        assert_eq!(report.info.as_deref(), Some("bad proof"));
        assert!(report.credential.is_none());
    }
}
