//! Watch Envoy listeners from a management server.
//!
//! # Configuration (environment variables)
//!
//! - `XDS_SERVERS`: Comma-separated server URIs, in fallback order (default: `http://localhost:18000`)
//! - `XDS_LISTENERS`: Comma-separated listener names to watch (required)
//! - `XDS_INITIAL_TIMEOUT_SECS`: Seconds to wait for a listener before reporting it unavailable (default: 15)
//!
//! # Usage
//!
//! ```sh
//! XDS_LISTENERS=listener-1,listener-2 cargo run -p xds-watch --example basic
//!
//! # Primary with a fallback server
//! XDS_SERVERS=http://primary:18000,http://backup:18000 XDS_LISTENERS=foo \
//!   cargo run -p xds-watch --example basic
//! ```

use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::config::listener::v3::Listener as ListenerProto;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, http_connection_manager::RouteSpecifier,
};
use prost::Message;
use tokio_stream::StreamExt;

use xds_watch::{
    ClientConfig, DecodeResult, Error, Node, Resource, ResourceEvent, ResourceTypeRegistry,
    ServerConfig, ServerIdentifier, TonicTransportBuilder, XdsClient,
};

struct Args {
    servers: Vec<String>,
    listeners: Vec<String>,
    initial_timeout: Duration,
}

fn comma_separated(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_args() -> Args {
    let servers = comma_separated(
        &std::env::var("XDS_SERVERS").unwrap_or_else(|_| "http://localhost:18000".to_string()),
    );
    let listeners = comma_separated(
        &std::env::var("XDS_LISTENERS")
            .expect("XDS_LISTENERS env var is required (comma-separated listener names)"),
    );
    if listeners.is_empty() {
        panic!("XDS_LISTENERS must contain at least one listener name");
    }
    let initial_timeout = std::env::var("XDS_INITIAL_TIMEOUT_SECS")
        .ok()
        .map(|s| s.parse().expect("XDS_INITIAL_TIMEOUT_SECS must be an integer"))
        .map_or(xds_watch::DEFAULT_RESOURCE_INITIAL_TIMEOUT, Duration::from_secs);

    Args {
        servers,
        listeners,
        initial_timeout,
    }
}

/// A simplified Listener: its name and the RDS route config it points at.
#[derive(Debug, Clone)]
pub struct Listener {
    /// The listener name.
    pub name: String,
    /// The RDS route config name (from HttpConnectionManager).
    pub rds_route_config_name: Option<String>,
}

impl Resource for Listener {
    const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.listener.v3.Listener";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    fn decode(bytes: Bytes) -> DecodeResult<Self> {
        let listener = match ListenerProto::decode(bytes) {
            Ok(listener) => listener,
            Err(e) => return DecodeResult::TopLevelError(Error::Decode(e.to_string())),
        };

        let Some(api_listener) = listener.api_listener.and_then(|api| api.api_listener) else {
            return DecodeResult::ResourceError {
                name: listener.name,
                error: Error::ResourceValidation("listener has no api_listener".into()),
            };
        };
        let hcm = match HttpConnectionManager::decode(Bytes::from(api_listener.value)) {
            Ok(hcm) => hcm,
            Err(e) => {
                return DecodeResult::ResourceError {
                    name: listener.name,
                    error: Error::ResourceValidation(format!("bad HttpConnectionManager: {e}")),
                };
            }
        };
        let rds_route_config_name = match hcm.route_specifier {
            Some(RouteSpecifier::Rds(rds)) => Some(rds.route_config_name),
            _ => None,
        };

        DecodeResult::Success {
            name: listener.name.clone(),
            resource: Self {
                name: listener.name,
                rds_route_config_name,
            },
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    println!("xds-watch Example\n");

    let node = Node::new("grpc", "1.0").with_id("example-node");
    let config = args.servers.iter().fold(
        ClientConfig::new(node)
            .with_resource_types(ResourceTypeRegistry::new().with::<Listener>())
            .with_transport_builder(TonicTransportBuilder::new())
            .with_resource_initial_timeout(Some(args.initial_timeout)),
        |config, uri| {
            println!("Server: {uri}");
            config.with_server(ServerConfig::new(ServerIdentifier::new(uri.as_str())))
        },
    );
    let client = XdsClient::new(config)?;

    let watchers = args.listeners.iter().map(|name| {
        println!("Watching for Listener: '{name}'");
        client.watch::<Listener>(name.as_str())
    });
    let mut events = tokio_stream::StreamMap::new();
    for (i, watcher) in watchers.enumerate() {
        events.insert(i, watcher);
    }
    println!();

    while let Some((i, event)) = events.next().await {
        let name = &args.listeners[i];
        match event {
            ResourceEvent::Changed(listener) => {
                println!("Listener '{name}' received:");
                if let Some(rds) = &listener.rds_route_config_name {
                    println!("  rds_config:  {rds}");
                }
                println!();
            }
            ResourceEvent::ResourceError(error) => println!("Listener '{name}' rejected: {error}"),
            ResourceEvent::DoesNotExist => println!("Listener '{name}' does not exist"),
            ResourceEvent::AmbientError(error) => println!("Listener '{name}' unavailable: {error}"),
        }
    }

    println!("Exiting");
    Ok(())
}
