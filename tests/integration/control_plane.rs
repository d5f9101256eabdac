//! Supervisor talk and push cycles against a mocked control plane

use assert_matches::assert_matches;
use lookout::bridge::Bridge;
use lookout::cloud::CloudClient;
use lookout::collectors::factory::DefaultCollectors;
use lookout::supervisor::{Supervisor, SupervisorError};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate, Times};

use crate::helpers::*;

async fn answer_talk(server: &MockServer, response: ResponseTemplate, times: impl Into<Times>) {
    Mock::given(method("POST"))
        .and(path("/key/agent/"))
        .respond_with(response)
        .expect(times)
        .mount(server)
        .await;
}

async fn accept_pushes(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/key/update/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Bodies of every push the server received, oldest first
async fn pushed(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/key/update/")
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_talk_applies_global_config() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "config": {"cloud": {"talk_interval": 5}},
            "messages": ["welcome"],
        })),
        1,
    )
    .await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    supervisor.tick().await.unwrap();

    assert_eq!(supervisor.talk_failures(), 0);
    assert_eq!(supervisor.context().config.cloud.talk_interval, 5);
    assert_eq!(supervisor.managers().len(), 1);

    // the registry outlives the manager restart
    let tree = supervisor.tree().unwrap();
    assert_eq!(tree.definition["hostname"], "web-1");

    // the next talk is not due yet
    supervisor.tick().await.unwrap();
}

#[tokio::test]
async fn test_backpressure_silences_talk() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(503).insert_header("Retry-After", "120"),
        1,
    )
    .await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    supervisor.tick().await.unwrap();
    assert!(supervisor.is_backpressured());
    assert_eq!(supervisor.talk_failures(), 0);

    supervisor.tick().await.unwrap();
    supervisor.tick().await.unwrap();
}

#[tokio::test]
async fn test_server_error_counts_a_failure() {
    let server = MockServer::start().await;
    answer_talk(&server, ResponseTemplate::new(500), 1).await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    supervisor.tick().await.unwrap();
    assert_eq!(supervisor.talk_failures(), 1);
    assert!(!supervisor.is_backpressured());

    // backoff keeps the next attempt away; local collection goes on
    supervisor.tick().await.unwrap();
    assert_eq!(supervisor.talk_failures(), 1);
    assert!(supervisor.tree().is_some());
}

#[tokio::test]
async fn test_undecodable_answer_counts_a_failure() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"),
        1,
    )
    .await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    supervisor.tick().await.unwrap();
    assert_eq!(supervisor.talk_failures(), 1);
}

#[tokio::test]
async fn test_obsolete_agent_stops() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "versions": {"current": "999.0.0", "obsolete": "999.0.0"},
        })),
        1,
    )
    .await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    let result = supervisor.tick().await;

    assert_matches!(
        result,
        Err(SupervisorError::Obsolete { obsolete, .. }) if obsolete == "999.0.0"
    );
}

#[tokio::test]
async fn test_old_agent_keeps_running() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "versions": {"current": "999.0.0", "old": "999.0.0", "obsolete": "0.0.1"},
        })),
        1,
    )
    .await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    assert!(supervisor.tick().await.is_ok());
}

#[tokio::test]
async fn test_object_config_rebuilds_root() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "objects": [{
                "object": {"type": "system", "hostname": "web-1", "uuid": "uuid-1"},
                "config": {"upload_config": true},
            }],
        })),
        1,
    )
    .await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    supervisor.tick().await.unwrap();

    let old = supervisor.context().registry.read().unwrap().root().unwrap();
    assert!(old.need_restart());

    supervisor.tick().await.unwrap();
    let new = supervisor.context().registry.read().unwrap().root().unwrap();
    assert_eq!(new.id(), old.id());
    assert!(!new.need_restart());
    assert_eq!(new.object_config(), &json!({"upload_config": true}));
}

#[tokio::test]
async fn test_object_config_overrides_container_settings() {
    let server = MockServer::start().await;
    answer_talk(
        &server,
        ResponseTemplate::new(200).set_body_json(json!({
            "objects": [{
                "object": {"type": "system", "hostname": "web-1", "uuid": "uuid-1"},
                "config": {"upload_config": false},
            }],
        })),
        1,
    )
    .await;

    let mut config = test_config(&server.uri());
    if let Some(system) = config.containers.get_mut("system") {
        system.upload_config = true;
    }
    let context = lookout::context::AppContext::new(config).unwrap();
    let factory = DefaultCollectors::new(
        context.config.clone(),
        context.client.clone(),
        context.cache.clone(),
        context.registry.clone(),
    );

    let mut supervisor = Supervisor::with_managers(context, host_only);
    supervisor.tick().await.unwrap();
    let old = supervisor.context().registry.read().unwrap().root().unwrap();
    assert!(factory.settings_for(&old).upload_config);

    // the rebuilt root carries the object config
    supervisor.tick().await.unwrap();
    let root = supervisor.context().registry.read().unwrap().root().unwrap();
    assert!(!factory.settings_for(&root).upload_config);
}

#[tokio::test]
async fn test_push_delivers_flushed_channels() {
    let server = MockServer::start().await;
    answer_talk(&server, ResponseTemplate::new(200).set_body_json(json!({})), 1).await;
    accept_pushes(&server).await;

    let mut config = test_config(&server.uri());
    config.cloud.push_interval = 0;
    let context = lookout::context::AppContext::new(config).unwrap();

    let mut supervisor = Supervisor::with_managers(context, host_only);
    supervisor.tick().await.unwrap();

    let batches = pushed(&server).await;
    assert_eq!(batches.len(), 1);
    let root = &batches[0]["batches"][0]["objects"][0];
    assert_eq!(root["object"]["hostname"], "web-1");
    assert!(
        root["data"]["events"][0]["message"]
            .as_str()
            .unwrap()
            .starts_with("lookout agent started")
    );
}

#[tokio::test]
async fn test_failed_batches_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/key/update/"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    accept_pushes(&server).await;

    let context = test_context(&server.uri());
    let cloud = CloudClient::new(context.client.clone(), &context.config.cloud);
    let mut bridge = Bridge::new(cloud, context.registry.clone());

    assert!(bridge.push().await.is_err());
    assert_eq!(bridge.pending(), 1);

    bridge.push().await.unwrap();
    assert_eq!(bridge.pending(), 0);

    let batches = pushed(&server).await;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1]["batches"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_shutdown_pushes_the_stop_event() {
    let server = MockServer::start().await;
    answer_talk(&server, ResponseTemplate::new(200).set_body_json(json!({})), 1).await;
    accept_pushes(&server).await;

    let mut supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    supervisor.tick().await.unwrap();
    supervisor.shutdown().await;

    let batches = pushed(&server).await;
    let last = batches.last().unwrap().to_string();
    assert!(last.contains("lookout agent stopped"));

    let root = supervisor.context().registry.read().unwrap().root().unwrap();
    assert!(!root.is_running());
}

#[tokio::test]
async fn test_run_returns_on_shutdown() {
    let server = MockServer::start().await;
    answer_talk(&server, ResponseTemplate::new(200).set_body_json(json!({})), 0..=1).await;
    accept_pushes(&server).await;

    let supervisor = Supervisor::with_managers(test_context(&server.uri()), host_only);
    assert!(supervisor.run(std::future::ready(())).await.is_ok());
}
