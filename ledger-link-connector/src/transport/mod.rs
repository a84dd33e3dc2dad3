//! # Network Transports
//!
//! Connection descriptors, the per-kind sockets and the [`LiveTransport`] that ties a
//! socket to the engine transport built on top of it.
//!
//! - [`gql::GqlSocket`]: graphql endpoints behind an [`endpoint::EndpointSelector`].
//! - [`jrpc::JrpcSocket`]: a JSON-RPC endpoint with an optional secondary for reads.
//! - [`proto::ProtoSocket`]: a binary (protobuf) RPC endpoint.
//! - Proxy connections have no socket; their factory builds the transport directly.

pub mod endpoint;
pub mod gql;
pub mod jrpc;
pub mod proto;

use crate::{
    connection::ConnectionContext,
    engine::{BlockSource, ProxyConnectionFactory, StringSender, Transport},
    error::ConnectionError,
};
use gql::GqlSocket;
use jrpc::JrpcSocket;
use proto::ProtoSocket;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

const DEFAULT_LATENCY_DETECTION_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_LATENCY_MS: u64 = 60_000;

/// Immutable description of a network to connect to.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ConnectionDescriptor {
    pub id: u32,
    /// Display group. Derived from `id` when absent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub group: Option<String>,
    pub transport: ConnectionParams,
}

/// Kind-specific connection parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ConnectionParams {
    Graphql(GqlParams),
    Jrpc(JrpcParams),
    Proto(ProtoParams),
    #[cfg_attr(feature = "serde", serde(skip))]
    Proxy(ProxyParams),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct GqlParams {
    /// Graphql endpoints, e.g. `https://mainnet.evercloud.dev/123123/graphql`.
    pub endpoints: Vec<String>,
    /// Whether the node is a local one.
    #[cfg_attr(feature = "serde", serde(default))]
    pub local: bool,
    /// Frequency of sync latency detection.
    #[cfg_attr(feature = "serde", serde(default))]
    pub latency_detection_interval_ms: Option<u64>,
    /// Maximum value for the endpoint's blockchain data sync latency.
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_latency_ms: Option<u64>,
}

impl GqlParams {
    pub fn latency_detection_interval(&self) -> Duration {
        Duration::from_millis(
            self.latency_detection_interval_ms
                .unwrap_or(DEFAULT_LATENCY_DETECTION_INTERVAL_MS),
        )
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms.unwrap_or(DEFAULT_MAX_LATENCY_MS))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct JrpcParams {
    /// Full JRPC API endpoint.
    pub endpoint: String,
    /// Endpoint for requests that do not need the authoritative source.
    #[cfg_attr(feature = "serde", serde(default))]
    pub alternative_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ProtoParams {
    pub endpoint: String,
}

#[derive(Clone)]
pub struct ProxyParams {
    pub factory: Arc<dyn ProxyConnectionFactory>,
}

impl fmt::Debug for ProxyParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyParams").finish_non_exhaustive()
    }
}

/// The closed set of transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TransportKind {
    Graphql,
    Jrpc,
    Proto,
    Proxy,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Graphql => "graphql",
            TransportKind::Jrpc => "jrpc",
            TransportKind::Proto => "proto",
            TransportKind::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

impl ConnectionParams {
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionParams::Graphql(_) => TransportKind::Graphql,
            ConnectionParams::Jrpc(_) => TransportKind::Jrpc,
            ConnectionParams::Proto(_) => TransportKind::Proto,
            ConnectionParams::Proxy(_) => TransportKind::Proxy,
        }
    }
}

impl ConnectionDescriptor {
    /// Looks up one of the built-in network presets.
    pub fn preset(name: &str) -> Result<Self, ConnectionError> {
        let descriptor = match name {
            "mainnet-jrpc" | "mainnetJrpc" => Self {
                id: 1,
                group: None,
                transport: ConnectionParams::Jrpc(JrpcParams {
                    endpoint: "https://jrpc.everwallet.net/rpc".to_string(),
                    alternative_endpoint: None,
                }),
            },
            "fld" => Self {
                id: 10,
                group: None,
                transport: ConnectionParams::Graphql(GqlParams {
                    endpoints: vec!["gql.custler.net".to_string()],
                    local: false,
                    latency_detection_interval_ms: None,
                    max_latency_ms: None,
                }),
            },
            "local" => Self {
                id: 31337,
                group: None,
                transport: ConnectionParams::Graphql(GqlParams {
                    endpoints: vec!["127.0.0.1".to_string()],
                    local: true,
                    latency_detection_interval_ms: None,
                    max_latency_ms: None,
                }),
            },
            _ => return Err(ConnectionError::UnknownPreset(name.to_string())),
        };
        Ok(descriptor)
    }

    pub fn group(&self) -> String {
        self.group
            .clone()
            .unwrap_or_else(|| network_group(self.id))
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// Default display group for a network id.
pub fn network_group(id: u32) -> String {
    match id {
        1 => "mainnet".to_string(),
        2 => "testnet".to_string(),
        10 => "fld".to_string(),
        31337 => "localnet".to_string(),
        _ => format!("network{id}"),
    }
}

/// Read-only view of the current transport.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TransportInfo {
    pub id: u32,
    pub group: String,
    pub kind: TransportKind,
}

// Fields drop in declaration order: the engine transport goes before its socket.
enum Binding {
    Gql {
        transport: Arc<dyn Transport>,
        blocks: Arc<dyn BlockSource>,
        socket: Arc<GqlSocket>,
    },
    Jrpc {
        transport: Arc<dyn Transport>,
        socket: Arc<JrpcSocket>,
    },
    Proto {
        transport: Arc<dyn Transport>,
        socket: Arc<ProtoSocket>,
    },
    Proxy {
        transport: Arc<dyn Transport>,
    },
}

/// A constructed transport together with the socket it runs over.
///
/// Dropping it releases both; the connection controller guarantees that happens only
/// once no lease refers to it.
pub struct LiveTransport {
    id: u32,
    group: String,
    binding: Binding,
}

impl LiveTransport {
    pub(crate) fn build(
        context: &ConnectionContext,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Self, ConnectionError> {
        let engine = &context.engine;
        let binding = match &descriptor.transport {
            ConnectionParams::Graphql(params) => {
                let socket = Arc::new(GqlSocket::with_probe(
                    params,
                    context.http.clone(),
                    context.latency_probe(),
                    context.config.endpoints.clone(),
                ));
                let binding = engine
                    .gql_transport(socket.clone(), &context.clock)
                    .map_err(ConnectionError::Transport)?;
                Binding::Gql {
                    transport: binding.transport,
                    blocks: binding.blocks,
                    socket,
                }
            }
            ConnectionParams::Jrpc(params) => {
                let socket = Arc::new(JrpcSocket::new(params, context.http.clone()));
                let transport = engine
                    .jrpc_transport(socket.clone())
                    .map_err(ConnectionError::Transport)?;
                Binding::Jrpc { transport, socket }
            }
            ConnectionParams::Proto(params) => {
                let socket = Arc::new(ProtoSocket::new(params, context.http.clone()));
                let transport = engine
                    .proto_transport(socket.clone())
                    .map_err(ConnectionError::Transport)?;
                Binding::Proto { transport, socket }
            }
            ConnectionParams::Proxy(params) => {
                let transport = params
                    .factory
                    .create(&context.clock)
                    .map_err(ConnectionError::Transport)?;
                Binding::Proxy { transport }
            }
        };

        Ok(Self {
            id: descriptor.id,
            group: descriptor.group(),
            binding,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn kind(&self) -> TransportKind {
        match self.binding {
            Binding::Gql { .. } => TransportKind::Graphql,
            Binding::Jrpc { .. } => TransportKind::Jrpc,
            Binding::Proto { .. } => TransportKind::Proto,
            Binding::Proxy { .. } => TransportKind::Proxy,
        }
    }

    pub fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id,
            group: self.group.clone(),
            kind: self.kind(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        match &self.binding {
            Binding::Gql { transport, .. }
            | Binding::Jrpc { transport, .. }
            | Binding::Proto { transport, .. }
            | Binding::Proxy { transport } => transport,
        }
    }

    /// Block primitives, present only for transports that support reliable polling.
    pub fn block_source(&self) -> Option<&Arc<dyn BlockSource>> {
        match &self.binding {
            Binding::Gql { blocks, .. } => Some(blocks),
            _ => None,
        }
    }

    pub fn gql_socket(&self) -> Option<&GqlSocket> {
        match &self.binding {
            Binding::Gql { socket, .. } => Some(socket),
            _ => None,
        }
    }

    /// Local transports are health-checked with a code hash scan.
    pub fn is_local(&self) -> bool {
        match &self.binding {
            Binding::Gql { socket, .. } => socket.is_local(),
            Binding::Jrpc { socket, .. } => socket.is_local(),
            Binding::Proto { .. } => false,
            Binding::Proxy { .. } => true,
        }
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        tracing::debug!(network = self.id, group = %self.group, kind = %self.kind(), "Releasing transport");
    }
}
