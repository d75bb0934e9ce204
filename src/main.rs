#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::json;
use tracing::info;

use styx_auth::styx::auth::{ANY_PROTOCOL, MemoryKeyStore, SecretKey};
use styx_auth::styx::channel::{FramedLink, StreamChannel};
use styx_auth::styx::config::{Attributes, NegotiatorConfig};
use styx_auth::styx::registry::HandlerRegistry;
use styx_auth::styx::{Negotiator, Role};

/// User authenticated when no `user` attribute is given.
const DEFAULT_USER: &str = "glenda";

/// Size of the random key generated when no `key` attribute is given.
const GENERATED_KEY_LEN: usize = 32;

/// Loopback self-check.
///
/// Arguments are factotum-style attributes, for example
/// `styx-auth proto=p9sk2 user=alice key=00112233`. Recognised attributes:
///
/// - `proto`: protocol to negotiate (default `p9any`)
/// - `user`: client user name (default `glenda`)
/// - `key`: hex shared key (default: random)
/// - `protocols`: preference list for `p9any`
/// - `takeover`: `true` to let the handlers own the channel
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let attributes = Attributes::parse(&args.join(" "))?;

    let protocol = attributes.get("proto").unwrap_or(ANY_PROTOCOL).to_string();
    let user = attributes
        .get("user")
        .filter(|u| !u.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_string();
    let key = match attributes.get("key") {
        Some(hex_key) => SecretKey::from_hex(hex_key)?,
        None => {
            let mut bytes = vec![0u8; GENERATED_KEY_LEN];
            SystemRandom::new()
                .fill(&mut bytes)
                .map_err(|_| "system randomness unavailable")?;
            SecretKey::new(bytes)
        }
    };

    let keys = Arc::new(MemoryKeyStore::new().with_key(user.clone(), key));
    let registry = Arc::new(HandlerRegistry::with_defaults(keys));
    let negotiator = Negotiator::new(registry, NegotiatorConfig::from_env());
    info!(
        "Running loopback negotiation of {} for {} (timeout {:?})",
        protocol,
        user,
        negotiator.config().timeout
    );

    let mut client_attributes = Attributes::new()
        .with("proto", protocol.as_str())
        .with("user", user.as_str())
        .with("role", Role::Client.to_string());
    if let Some(preferences) = attributes.get("protocols") {
        client_attributes.insert("protocols", preferences);
    }

    let takeover = attributes.get("takeover") == Some("true");
    let (client_end, server_end) = tokio::io::duplex(negotiator.config().blob_capacity * 2);

    let (client, server) = if takeover {
        run_takeover(&negotiator, &protocol, &user, client_end, server_end).await
    } else {
        let mut client_link = FramedLink::new(StreamChannel::new(client_end));
        let mut server_link = FramedLink::new(StreamChannel::new(server_end));
        tokio::join!(
            negotiator.negotiate_from_config(&protocol, &client_attributes, &mut client_link),
            negotiator.negotiate(&protocol, None, Role::Server, &mut server_link)
        )
    };

    let (client, server) = (client?, server?);
    let report = json!({
        "protocol": protocol,
        "takeover": takeover,
        "client": client.report(),
        "server": server.report(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if client.is_success() && server.is_success() {
        Ok(())
    } else {
        Err("loopback negotiation did not succeed".into())
    }
}

type SideResult = Result<styx_auth::styx::NegotiationOutcome, styx_auth::styx::AuthError>;

#[cfg(feature = "takeover")]
async fn run_takeover(
    negotiator: &Negotiator,
    protocol: &str,
    user: &str,
    client_end: tokio::io::DuplexStream,
    server_end: tokio::io::DuplexStream,
) -> (SideResult, SideResult) {
    use styx_auth::styx::Identity;
    use styx_auth::styx::channel::SharedChannel;

    let client_channel = SharedChannel::new(StreamChannel::new(client_end));
    let server_channel = SharedChannel::new(StreamChannel::new(server_end));
    tokio::join!(
        negotiator.negotiate_direct(
            protocol,
            Some(Identity::new(user, protocol)),
            Role::Client,
            &client_channel
        ),
        negotiator.negotiate_direct(protocol, None, Role::Server, &server_channel)
    )
}

#[cfg(not(feature = "takeover"))]
async fn run_takeover(
    _negotiator: &Negotiator,
    _protocol: &str,
    _user: &str,
    _client_end: tokio::io::DuplexStream,
    _server_end: tokio::io::DuplexStream,
) -> (SideResult, SideResult) {
    let unsupported = || {
        Err(styx_auth::styx::AuthError::InvalidAttribute {
            name: "takeover".to_string(),
            reason: "channel takeover is not enabled. Rebuild with --features takeover"
                .to_string(),
        })
    };
    (unsupported(), unsupported())
}
