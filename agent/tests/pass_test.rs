//! End-to-end passes against a mock management API.

use converge_agent::{
    AgentError, AssignmentLocks, AssignmentSpec, Config, FixedBackoff, HttpTransport, Manifest,
    Pass, PassSettings, PassSummary, StateFile,
};
use converge_engine::{Category, KeyedState, PolicyRules, Record, Rule, Version};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

const MANIFEST: &str = r#"{
    "collections": {
        "hosts": {
            "target": {
                "endpoint": {"path": "/hosts"},
                "shape": {"fields": [{"name": "address"}, {"name": "updatedAt", "kind": "computed"}]}
            },
            "items": {
                "web": {"address": "10.0.0.1"},
                "db": {"address": "10.0.0.2"}
            }
        }
    },
    "policies": {
        "default": {
            "target": {
                "categories": {"path": "/policies/default/categories"},
                "rules": {"path": "/policies/default/rules"}
            },
            "categories": [{"name": "web"}],
            "rules": [
                {"category": "web", "section": "top", "action": "allow"},
                {"category": "web", "section": "top", "action": "deny"}
            ]
        }
    },
    "assignments": [{"path": "/assignments/default", "member": "default"}]
}"#;

fn manifest() -> Manifest {
    Manifest::from_json(MANIFEST).unwrap()
}

fn settings(refresh: bool) -> PassSettings {
    PassSettings {
        refresh,
        backoff: FixedBackoff::new(5, Duration::from_millis(1)),
        ..PassSettings::default()
    }
}

async fn run_pass(
    server: &MockServer,
    manifest: &Manifest,
    state: &mut StateFile,
    settings: &PassSettings,
) -> Result<PassSummary, AgentError> {
    let uri = server.uri();
    let config = Config::from_lookup(|name| (name == "API_URL").then(|| uri.clone())).unwrap();
    let transport = HttpTransport::new(&config).unwrap();
    let version = Version::lowest();
    let locks = AssignmentLocks::new();

    Pass::new(&transport, &version, settings, &locks)
        .run(manifest, state)
        .await
}

/// State as left behind by a complete pass over `MANIFEST`.
fn converged_state() -> StateFile {
    let mut hosts = KeyedState::new();
    hosts.insert(
        "web".into(),
        Record::new().with_field("address", "10.0.0.1").with_remote_id("h1"),
    );
    hosts.insert(
        "db".into(),
        Record::new().with_field("address", "10.0.0.2").with_remote_id("h2"),
    );

    let policy = PolicyRules::new(
        vec![Category::new("web", Record::new().with_remote_id("c1"))],
        vec![
            Rule::new(
                "web",
                "top",
                Record::new().with_field("action", "allow").with_remote_id("r1"),
            ),
            Rule::new(
                "web",
                "top",
                Record::new().with_field("action", "deny").with_remote_id("r2"),
            ),
        ],
    );

    let mut state = StateFile::default();
    state.snapshot.set_collection("hosts", hosts);
    state.snapshot.set_policy("default", policy);
    state.add_assignment(&AssignmentSpec::new("/assignments/default", "default"));
    state
}

async fn mount_host(server: &MockServer, name: &str, id: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path("/hosts"))
        .and(body_partial_json(json!({"name": name})))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "id": id,
            "name": name,
            "updatedAt": "now"
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_assignment_list(server: &MockServer, members: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/assignments/default"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"assignments": members})))
        .mount(server)
        .await;
}

// =============================================================================
// Full Passes
// =============================================================================

#[tokio::test]
async fn test_first_pass_creates_everything() {
    let server = MockServer::start().await;

    mount_host(&server, "web", "h1", 201).await;
    mount_host(&server, "db", "h2", 201).await;

    Mock::given(method("POST"))
        .and(path("/policies/default/categories"))
        .and(body_json(json!({"name": "web"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "c1", "name": "web"})))
        .expect(1)
        .mount(&server)
        .await;

    for (action, id) in [("allow", "r1"), ("deny", "r2")] {
        Mock::given(method("POST"))
            .and(path("/policies/default/rules"))
            .and(query_param("category", "c1"))
            .and(query_param("section", "top"))
            .and(body_json(json!({"action": action})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": id})))
            .expect(1)
            .mount(&server)
            .await;
    }

    mount_assignment_list(&server, json!(["other"])).await;
    Mock::given(method("PUT"))
        .and(path("/assignments/default"))
        .and(body_json(json!({"assignments": ["other", "default"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let mut state = StateFile::load(&state_path).unwrap();

    let summary = run_pass(&server, &manifest(), &mut state, &settings(true))
        .await
        .unwrap();

    assert_eq!(summary.collections["hosts"].created, 2);
    assert_eq!(summary.policies["default"].created, 3);
    assert_eq!(summary.assigned, 1);

    let hosts = state.snapshot.collection("hosts");
    assert_eq!(hosts["web"].remote_id(), Some("h1"));
    assert_eq!(hosts["db"].remote_id(), Some("h2"));
    assert_eq!(
        hosts["web"].field("updatedAt").known(),
        Some(&json!("now"))
    );

    let policy = state.snapshot.policy("default");
    let rule_ids: Vec<_> = policy.rules.iter().filter_map(|r| r.record.remote_id()).collect();
    assert_eq!(rule_ids, vec!["r1", "r2"]);
    assert_eq!(policy.categories[0].record.remote_id(), Some("c1"));
    assert_eq!(
        state.assignments,
        vec![AssignmentSpec::new("/assignments/default", "default")]
    );

    state.save(&state_path).unwrap();
    assert_eq!(StateFile::load(&state_path).unwrap(), state);
}

#[tokio::test]
async fn test_converged_pass_sends_no_writes() {
    let server = MockServer::start().await;

    mount_assignment_list(&server, json!(["default"])).await;
    for verb in ["POST", "PUT", "DELETE"] {
        Mock::given(method(verb))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
    }

    let mut state = converged_state();
    let before = state.clone();
    let summary = run_pass(&server, &manifest(), &mut state, &settings(false))
        .await
        .unwrap();

    assert!(summary.is_noop());
    assert_eq!(state, before);
}

#[tokio::test]
async fn test_refresh_recreates_vanished_records() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/hosts/h1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hosts/h2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "h2",
            "name": "db",
            "address": "10.0.0.2",
            "owner": "ops"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_host(&server, "web", "h9", 201).await;
    mount_assignment_list(&server, json!(["default"])).await;

    let mut state = converged_state();
    let summary = run_pass(&server, &manifest(), &mut state, &settings(true))
        .await
        .unwrap();

    assert_eq!(summary.collections["hosts"].created, 1);
    let hosts = state.snapshot.collection("hosts");
    assert_eq!(hosts["web"].remote_id(), Some("h9"));
    assert_eq!(hosts["db"].remote_id(), Some("h2"));
    assert!(hosts["db"].field("owner").is_unset());
}

// =============================================================================
// Partial Failure
// =============================================================================

#[tokio::test]
async fn test_failed_create_keeps_confirmed_records() {
    let server = MockServer::start().await;

    mount_host(&server, "db", "h2", 201).await;
    Mock::given(method("POST"))
        .and(path("/hosts"))
        .and(body_partial_json(json!({"name": "web"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "disk full"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/policies/default/categories"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let mut state = StateFile::default();
    let err = run_pass(&server, &manifest(), &mut state, &settings(true))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("disk full"), "{err}");
    let hosts = state.snapshot.collection("hosts");
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts["db"].remote_id(), Some("h2"));
    assert!(state.snapshot.policies.is_empty());
    assert!(state.assignments.is_empty());
}

// =============================================================================
// Assignments
// =============================================================================

#[tokio::test]
async fn test_assignment_put_is_retried() {
    let server = MockServer::start().await;

    mount_assignment_list(&server, json!([])).await;
    Mock::given(method("PUT"))
        .and(path("/assignments/default"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/assignments/default"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let manifest = Manifest {
        assignments: vec![AssignmentSpec::new("/assignments/default", "default")],
        ..Manifest::default()
    };
    let mut state = StateFile::default();
    let summary = run_pass(&server, &manifest, &mut state, &settings(true))
        .await
        .unwrap();

    assert_eq!(summary.assigned, 1);
    assert_eq!(state.assignments.len(), 1);
}

#[tokio::test]
async fn test_assignment_retries_run_out() {
    let server = MockServer::start().await;

    mount_assignment_list(&server, json!([])).await;
    Mock::given(method("PUT"))
        .and(path("/assignments/default"))
        .respond_with(ResponseTemplate::new(409))
        .expect(5)
        .mount(&server)
        .await;

    let manifest = Manifest {
        assignments: vec![AssignmentSpec::new("/assignments/default", "default")],
        ..Manifest::default()
    };
    let mut state = StateFile::default();
    let err = run_pass(&server, &manifest, &mut state, &settings(true))
        .await
        .unwrap_err();

    match err {
        AgentError::Engine(engine) => assert_eq!(engine.status(), Some(409)),
        other => panic!("unexpected error: {other}"),
    }
    assert!(state.assignments.is_empty());
}

#[tokio::test]
async fn test_undeclared_assignment_is_removed() {
    let server = MockServer::start().await;

    mount_assignment_list(&server, json!(["legacy", "other"])).await;
    Mock::given(method("PUT"))
        .and(path("/assignments/default"))
        .and(body_json(json!({"assignments": ["other"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let mut state = StateFile::default();
    state.add_assignment(&AssignmentSpec::new("/assignments/default", "legacy"));

    let summary = run_pass(&server, &Manifest::default(), &mut state, &settings(true))
        .await
        .unwrap();

    assert_eq!(summary.unassigned, 1);
    assert!(state.assignments.is_empty());
}

#[tokio::test]
async fn test_preexisting_assignment_is_not_owned() {
    let server = MockServer::start().await;

    mount_assignment_list(&server, json!(["default", "other"])).await;
    Mock::given(method("PUT"))
        .and(path("/assignments/default"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let spec = AssignmentSpec::new("/assignments/default", "default");
    let manifest = Manifest {
        assignments: vec![spec.clone()],
        ..Manifest::default()
    };
    let mut state = StateFile::default();

    let summary = run_pass(&server, &manifest, &mut state, &settings(true))
        .await
        .unwrap();
    assert_eq!(summary.assigned, 0);
    assert!(state.assignments.is_empty());

    // Dropping the declaration must leave a membership the agent never added.
    let summary = run_pass(&server, &Manifest::default(), &mut state, &settings(true))
        .await
        .unwrap();
    assert_eq!(summary.unassigned, 0);
    assert!(state.assignments.is_empty());
}
