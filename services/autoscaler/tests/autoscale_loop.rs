//! End-to-end reconciliation cycles against mocked Buildkite and GCE APIs.

use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use spotscale_autoscaler::{Autoscaler, ComputeClient, Config};

const PROJECT: &str = "acme-ci";

fn test_config(buildkite_url: &str, compute_url: &str) -> Config {
    Config::try_parse_from([
        "autoscaler",
        "--agent-token",
        "agent-token",
        "--organization",
        "acme",
        "--service-account",
        "worker@acme.iam.gserviceaccount.com",
        "--project-id",
        PROJECT,
        "--region",
        "us-west1",
        "--max-instances",
        "4",
        "--buildkite-api-url",
        buildkite_url,
        "--compute-api-url",
        compute_url,
    ])
    .expect("test config should parse")
}

fn metrics_body(
    scheduled: u32,
    running: u32,
    waiting: u32,
    idle: u32,
    busy: u32,
    total: u32,
) -> serde_json::Value {
    json!({
        "organization": {"slug": "acme"},
        "jobs": {
            "scheduled": scheduled,
            "running": running,
            "waiting": waiting,
            "queues": {
                "default": {"scheduled": scheduled, "running": running, "waiting": waiting}
            }
        },
        "agents": {
            "idle": idle,
            "busy": busy,
            "total": total,
            "queues": {
                "default": {"idle": idle, "busy": busy, "total": total}
            }
        },
        "polling": {"interval": 10}
    })
}

fn instance_page(instances: &[(&str, &[&str])]) -> serde_json::Value {
    let items: Vec<serde_json::Value> = instances
        .iter()
        .map(|(name, tags)| json!({"name": name, "status": "RUNNING", "tags": {"items": tags}}))
        .collect();
    json!({"items": items})
}

async fn mock_metrics(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .and(header("Authorization", "Token agent-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mock_zone(server: &MockServer, zone: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/projects/{PROJECT}/zones/{zone}/instances")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn deficit_provisions_exactly_one_worker() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    // desired = 2 running + 1 scheduled = 3 > 2 total agents.
    mock_metrics(&buildkite, metrics_body(1, 2, 0, 0, 2, 2)).await;

    // One tagged worker live in zone a; nothing else counts.
    mock_zone(
        &compute,
        "us-west1-a",
        instance_page(&[("worker-100", &["ssh", "icmp", "buildkite-agent"])]),
    )
    .await;
    mock_zone(&compute, "us-west1-b", json!({})).await;
    mock_zone(
        &compute,
        "us-west1-c",
        instance_page(&[("bastion", &["ssh"])]),
    )
    .await;

    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/instances"
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "op-1", "status": "RUNNING"})),
        )
        .expect(1)
        .mount(&compute)
        .await;

    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/operations/op-1/wait"
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "op-1", "status": "DONE"})),
        )
        .expect(1)
        .mount(&compute)
        .await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    let delay = autoscaler.run_cycle().await.unwrap();
    assert_eq!(delay.as_secs(), 10);

    // Inspect the insert body the cycle produced.
    let requests = compute.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path().ends_with("/instances"))
        .expect("an insert request should have been made");
    let body: serde_json::Value = serde_json::from_slice(&insert.body).unwrap();

    assert!(body["name"].as_str().unwrap().starts_with("worker-"));
    assert_eq!(body["disks"][0]["initializeParams"]["diskSizeGb"], "300");
    assert_eq!(body["scheduling"]["provisioningModel"], "SPOT");
    let tags = body["tags"]["items"].as_array().unwrap();
    assert!(tags.iter().any(|t| t == "buildkite-agent"));
}

#[tokio::test]
async fn satisfied_queue_makes_no_compute_calls() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    // desired = 0 <= 5 total agents: skip before any inventory call.
    mock_metrics(&buildkite, metrics_body(0, 0, 0, 5, 0, 5)).await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    let delay = autoscaler.run_cycle().await.unwrap();
    assert_eq!(delay.as_secs(), 10);

    let requests = compute.received_requests().await.unwrap();
    assert!(requests.is_empty(), "compute API should not be touched");
}

#[tokio::test]
async fn no_deficit_skips_provisioning() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    // desired = 2 > 0 total agents, but two tagged workers already live.
    mock_metrics(&buildkite, metrics_body(1, 1, 0, 0, 0, 0)).await;
    mock_zone(
        &compute,
        "us-west1-a",
        instance_page(&[
            ("worker-100", &["buildkite-agent"]),
            ("worker-101", &["buildkite-agent"]),
        ]),
    )
    .await;
    mock_zone(&compute, "us-west1-b", json!({})).await;
    mock_zone(&compute, "us-west1-c", json!({})).await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    autoscaler.run_cycle().await.unwrap();

    let requests = compute.received_requests().await.unwrap();
    assert!(
        requests.iter().all(|r| r.method.as_str() == "GET"),
        "no insert should have been submitted"
    );
}

#[tokio::test]
async fn paginated_listing_is_exhausted() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    // Big deficit so supply counting matters.
    mock_metrics(&buildkite, metrics_body(6, 0, 0, 0, 0, 0)).await;

    // Zone a pages: first page carries a token, second page finishes it.
    Mock::given(method("GET"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-a/instances"
        )))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            instance_page(&[("worker-101", &["buildkite-agent"])]),
        ))
        .expect(1)
        .mount(&compute)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-a/instances"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"name": "worker-100", "status": "RUNNING",
                       "tags": {"items": ["buildkite-agent"]}}],
            "nextPageToken": "page-2"
        })))
        .expect(1)
        .mount(&compute)
        .await;
    mock_zone(&compute, "us-west1-b", json!({})).await;
    mock_zone(&compute, "us-west1-c", json!({})).await;

    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/instances"
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "op-2", "status": "RUNNING"})),
        )
        .expect(1)
        .mount(&compute)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/operations/op-2/wait"
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "op-2", "status": "DONE"})),
        )
        .mount(&compute)
        .await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    autoscaler.run_cycle().await.unwrap();
}

#[tokio::test]
async fn zone_listing_failure_is_transient() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    mock_metrics(&buildkite, metrics_body(3, 0, 0, 0, 0, 0)).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend error"))
        .mount(&compute)
        .await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    let err = autoscaler.run_cycle().await.unwrap_err();
    assert!(!err.is_permanent());

    let requests = compute.received_requests().await.unwrap();
    assert!(
        requests.iter().all(|r| r.method.as_str() == "GET"),
        "a failed count must not lead to an insert"
    );
}

#[tokio::test]
async fn rejected_insert_is_permanent() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    mock_metrics(&buildkite, metrics_body(3, 0, 0, 0, 0, 0)).await;
    mock_zone(&compute, "us-west1-a", json!({})).await;
    mock_zone(&compute, "us-west1-b", json!({})).await;
    mock_zone(&compute, "us-west1-c", json!({})).await;

    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/instances"
        )))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid image"))
        .mount(&compute)
        .await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    let err = autoscaler.run_cycle().await.unwrap_err();
    assert!(err.is_permanent());
}

#[tokio::test]
async fn quota_exhaustion_during_wait_is_transient() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    mock_metrics(&buildkite, metrics_body(3, 0, 0, 0, 0, 0)).await;
    mock_zone(&compute, "us-west1-a", json!({})).await;
    mock_zone(&compute, "us-west1-b", json!({})).await;
    mock_zone(&compute, "us-west1-c", json!({})).await;

    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/instances"
        )))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "op-3", "status": "RUNNING"})),
        )
        .mount(&compute)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/projects/{PROJECT}/zones/us-west1-b/operations/op-3/wait"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "op-3",
            "status": "DONE",
            "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "Quota CPUS exceeded"}]}
        })))
        .mount(&compute)
        .await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    let err = autoscaler.run_cycle().await.unwrap_err();
    assert!(!err.is_permanent());
}

#[tokio::test]
async fn sampling_failure_backs_off_without_compute_calls() {
    let buildkite = MockServer::start().await;
    let compute = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&buildkite)
        .await;

    let config = test_config(&buildkite.uri(), &compute.uri());
    let mut autoscaler = Autoscaler::new(&config, Arc::new(ComputeClient::new(&config)));

    // Sampling failure is recoverable: the cycle succeeds with the
    // fallback delay instead of surfacing an error.
    let delay = autoscaler.run_cycle().await.unwrap();
    assert_eq!(delay.as_secs(), 100);

    let requests = compute.received_requests().await.unwrap();
    assert!(requests.is_empty());
}
