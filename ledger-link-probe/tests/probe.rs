use ledger_link_connector::{
    transport::{GqlParams, JrpcParams},
    ConnectionDescriptor, ConnectionParams,
};
use ledger_link_probe::config::ProbeConfig;
use serde_json::json;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn config_for(transport: ConnectionParams) -> ProbeConfig {
    let mut config = ProbeConfig::default();
    config.network.custom = Some(ConnectionDescriptor {
        id: 42,
        group: None,
        transport,
    });
    config
}

async fn latency_server(latency: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/graphql"))
        .and(query_param("query", "{info{version time latency}}"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "info": { "version": "0.1", "time": 0, "latency": latency } }
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn select_prefers_endpoint_within_latency_ceiling() {
    let lagging = latency_server(30_000).await;
    let synced = latency_server(15).await;

    let config = config_for(ConnectionParams::Graphql(GqlParams {
        endpoints: vec![lagging.uri(), synced.uri()],
        local: false,
        latency_detection_interval_ms: None,
        max_latency_ms: Some(1_000),
    }));

    let endpoint = ledger_link_probe::select(&config).await.unwrap();
    assert_eq!(endpoint.url, format!("{}/graphql", synced.uri()));
}

#[tokio::test]
async fn select_rejects_non_graphql_networks() {
    let config = config_for(ConnectionParams::Jrpc(JrpcParams {
        endpoint: "http://127.0.0.1:1/rpc".to_string(),
        alternative_endpoint: None,
    }));

    let err = ledger_link_probe::select(&config).await.unwrap_err();
    assert!(err.to_string().contains("graphql"));
}

#[tokio::test]
async fn query_routes_jrpc_reads_by_db_requirement() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("primary"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/light"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secondary"))
        .mount(&server)
        .await;

    let config = config_for(ConnectionParams::Jrpc(JrpcParams {
        endpoint: format!("{}/rpc", server.uri()),
        alternative_endpoint: Some(format!("{}/light", server.uri())),
    }));

    let payload = r#"{"jsonrpc":"2.0","id":1,"method":"getLatestKeyBlock","params":{}}"#;
    let authoritative = ledger_link_probe::query(&config, payload.to_string(), true).await.unwrap();
    let best_effort = ledger_link_probe::query(&config, payload.to_string(), false).await.unwrap();
    assert_eq!(authoritative, "primary");
    assert_eq!(best_effort, "secondary");
}
