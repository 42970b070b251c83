use super::*;
use crate::core::audit::testing::RecordingAuditSink;
use crate::core::config::EnvValue;
use crate::core::config::TransportConfig;
use crate::core::polling::PollingOptions;
use crate::mcp::oauth::flows::OAuthFlowRegistry;
use crate::mcp::oauth::tokens::{MemoryTokenStore, TokenStore};
use crate::mcp::testing::{env_values, result_text, FakeAuthorizer, FakeFactory};
use std::time::Duration;

struct Harness {
    manager: TargetConnectionManager,
    factory: Arc<FakeFactory>,
    tokens: Arc<MemoryTokenStore>,
    audit: Arc<RecordingAuditSink>,
}

fn harness(factory: FakeFactory) -> Harness {
    let factory = Arc::new(factory);
    let tokens = Arc::new(MemoryTokenStore::default());
    let audit = Arc::new(RecordingAuditSink::default());
    let oauth = OAuthConnectionHandler::new(
        factory.clone(),
        Arc::new(FakeAuthorizer::issuing("granted")),
        tokens.clone(),
        Arc::new(OAuthFlowRegistry::new()),
        PollingOptions::new(3, Duration::from_millis(100)),
    );
    Harness {
        manager: TargetConnectionManager::new(factory.clone(), oauth, audit.clone()),
        factory,
        tokens,
        audit,
    }
}

fn echo() -> TargetServerDescriptor {
    TargetServerDescriptor::stdio("echo-service", "echo-mcp")
}

fn linear() -> TargetServerDescriptor {
    TargetServerDescriptor::streamable_http("linear", "https://mcp.linear.app/mcp")
}

async fn wait_for_phase(manager: &TargetConnectionManager, name: &str, phase: TargetPhase) {
    let mut phases = manager.subscribe(name).expect("server registered");
    phases
        .wait_for(|current| *current == phase)
        .await
        .expect("server stays registered");
}

#[tokio::test(start_paused = true)]
async fn added_server_connects_and_serves_tools() {
    let h = harness(FakeFactory::new());
    h.factory.set_tools("echo-service", &["echo"]);

    h.manager.add_server(echo()).expect("add");
    assert_eq!(h.manager.phase("echo-service"), Some(TargetPhase::Connecting));
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );

    let tools = h.manager.list_tools("echo-service").await.expect("tools");
    assert_eq!(tools.len(), 1);
    let result = h
        .manager
        .call_tool("echo-service", "echo", None)
        .await
        .expect("call");
    assert_eq!(result_text(&result), "echo-service:echo");
    assert_eq!(
        h.audit.phases_for("echo-service"),
        vec![Some(TargetPhase::Connecting), Some(TargetPhase::Connected)]
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_add_leaves_first_connection_alone() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();

    let err = h.manager.add_server(echo()).expect_err("duplicate");
    assert!(matches!(
        err,
        GatewayError::AlreadyExists {
            kind: EntityKind::TargetServer,
            ..
        }
    ));
    assert_eq!(h.manager.phase("echo-service"), Some(TargetPhase::Connected));
    assert_eq!(h.factory.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn names_are_normalized_and_validated() {
    let h = harness(FakeFactory::new());
    h.manager
        .add_server(TargetServerDescriptor::stdio("Echo Service", "echo-mcp"))
        .unwrap();
    assert!(h.manager.phase("echo-service").is_some());

    let err = h
        .manager
        .add_server(TargetServerDescriptor::stdio("bad__name", "x"))
        .expect_err("delimiter in name");
    assert!(matches!(err, GatewayError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn removing_servers() {
    let h = harness(FakeFactory::new());
    let err = h.manager.remove_server("ghost").await.expect_err("unknown");
    assert!(matches!(err, GatewayError::NotFound { .. }));

    h.manager.add_server(echo()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();
    h.manager.remove_server("echo-service").await.expect("remove");

    assert_eq!(h.manager.phase("echo-service"), None);
    assert_eq!(h.factory.closed(), vec!["echo-service".to_string()]);
    assert_eq!(h.audit.phases_for("echo-service").last(), Some(&None));
}

fn echo_with_secret() -> TargetServerDescriptor {
    let mut descriptor = echo();
    if let TransportConfig::Stdio { env, .. } = &mut descriptor.transport {
        env.insert(
            "API_KEY".to_string(),
            EnvValue::FromEnv {
                from_env: "ECHO_API_KEY".to_string(),
            },
        );
    }
    descriptor
}

#[tokio::test(start_paused = true)]
async fn missing_secret_waits_for_input() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo_with_secret()).unwrap();
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::PendingInput
    );
    let status = h.manager.status("echo-service").unwrap();
    assert_eq!(status.missing_inputs, vec!["ECHO_API_KEY".to_string()]);

    let supplied: BTreeMap<String, String> = status
        .missing_inputs
        .iter()
        .map(|variable| (variable.clone(), "secret".to_string()))
        .collect();
    h.manager
        .supply_input("echo-service", &supplied)
        .await
        .expect("input accepted");
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );
    assert!(h.manager.status("echo-service").unwrap().missing_inputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn secrets_can_also_be_supplied_by_env_key() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo_with_secret()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();

    h.manager
        .supply_input("echo-service", &env_values(&[("API_KEY", "secret")]))
        .await
        .expect("input accepted");
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn supplying_input_requires_pending_input() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();
    let err = h
        .manager
        .supply_input("echo-service", &env_values(&[("A", "b")]))
        .await
        .expect_err("already connected");
    assert!(matches!(
        err,
        GatewayError::InvalidTransition {
            phase: TargetPhase::Connected,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_server_waits_for_explicit_reconnect() {
    let h = harness(FakeFactory::new());
    h.factory.refuse("echo-service");
    h.manager.add_server(echo()).unwrap();
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::ConnectionFailed
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.factory.connect_count(), 1);

    let err = h
        .manager
        .call_tool("echo-service", "echo", None)
        .await
        .expect_err("not connected");
    assert_eq!(
        err.to_string(),
        "target server 'echo-service' is not ready (phase: connection-failed)"
    );

    h.factory.accept("echo-service");
    h.manager.reconnect("echo-service").await.expect("reconnect");
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_mid_handshake_is_rejected() {
    let h = harness(FakeFactory::new());
    h.factory.set_delay(Duration::from_secs(5));
    h.manager.add_server(echo()).unwrap();

    let err = h.manager.reconnect("echo-service").await.expect_err("busy");
    assert!(matches!(
        err,
        GatewayError::InvalidTransition {
            phase: TargetPhase::Connecting,
            ..
        }
    ));
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_replaces_live_connection() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();

    h.manager.reconnect("echo-service").await.unwrap();
    assert_eq!(h.factory.closed(), vec!["echo-service".to_string()]);
    wait_for_phase(&h.manager, "echo-service", TargetPhase::Connected).await;
    assert_eq!(h.factory.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_server_completes_oauth() {
    let h = harness(FakeFactory::requiring_token("granted"));
    h.manager.add_server(linear()).unwrap();
    assert_eq!(
        h.manager.wait_until_settled("linear").await.unwrap(),
        TargetPhase::PendingAuth
    );

    let url = h
        .manager
        .get_authorization_url("linear")
        .unwrap()
        .expect("URL while pending");
    let state = url.split("state=").nth(1).expect("state in URL").to_string();
    assert_eq!(
        h.manager.complete_authorization(&state, "code-1").unwrap(),
        "linear"
    );

    wait_for_phase(&h.manager, "linear", TargetPhase::Connected).await;
    assert_eq!(h.manager.get_authorization_url("linear").unwrap(), None);
    assert_eq!(
        h.tokens.load("linear").unwrap().unwrap().access_token,
        "granted"
    );
    assert_eq!(
        h.audit.phases_for("linear"),
        vec![
            Some(TargetPhase::Connecting),
            Some(TargetPhase::PendingAuth),
            Some(TargetPhase::Connected)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stored_token_skips_authorization() {
    let h = harness(FakeFactory::requiring_token("granted"));
    h.tokens
        .save("linear", &crate::mcp::oauth::tokens::OAuthTokens::bearer("granted"))
        .unwrap();
    h.manager.add_server(linear()).unwrap();
    assert_eq!(
        h.manager.wait_until_settled("linear").await.unwrap(),
        TargetPhase::Connected
    );
    assert!(h.manager.oauth().flows().pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_polling_fails_and_keeps_flow_until_removal() {
    let h = harness(FakeFactory::requiring_token("granted"));
    h.manager.add_server(linear()).unwrap();
    h.manager.wait_until_settled("linear").await.unwrap();

    wait_for_phase(&h.manager, "linear", TargetPhase::ConnectionFailed).await;
    let status = h.manager.status("linear").unwrap();
    assert_eq!(
        status.last_error.as_deref(),
        Some("polling exhausted after 3 attempts")
    );
    assert_eq!(h.manager.oauth().flows().pending().len(), 1);

    h.manager.remove_server("linear").await.unwrap();
    assert!(h.manager.oauth().flows().pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_authorization_fails_the_server() {
    let h = harness(FakeFactory::requiring_token("granted"));
    h.manager.add_server(linear()).unwrap();
    h.manager.wait_until_settled("linear").await.unwrap();

    h.manager.cancel_authorization("linear").expect("cancel");
    let status = h.manager.status("linear").unwrap();
    assert_eq!(status.phase, TargetPhase::ConnectionFailed);
    assert_eq!(status.last_error.as_deref(), Some("polling aborted"));
    assert!(h.manager.oauth().flows().pending().is_empty());

    let err = h
        .manager
        .cancel_authorization("linear")
        .expect_err("nothing pending");
    assert!(matches!(err, GatewayError::InvalidTransition { .. }));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.manager.phase("linear"), Some(TargetPhase::ConnectionFailed));
}

#[tokio::test(start_paused = true)]
async fn failed_update_keeps_previous_connection() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();

    h.factory.refuse("echo-service");
    let err = h
        .manager
        .update_target_server(TargetServerDescriptor::stdio("echo-service", "echo-v2"))
        .await
        .expect_err("new descriptor refused");
    assert!(matches!(
        err,
        GatewayError::FailedToConnectToTargetServer { .. }
    ));
    assert_eq!(h.manager.phase("echo-service"), Some(TargetPhase::Connected));
    assert!(h.factory.closed().is_empty());

    h.factory.accept("echo-service");
    h.manager
        .update_target_server(TargetServerDescriptor::stdio("echo-service", "echo-v2"))
        .await
        .expect("update");
    assert_eq!(h.factory.closed(), vec!["echo-service".to_string()]);
    assert_eq!(h.manager.phase("echo-service"), Some(TargetPhase::Connected));
}

#[tokio::test(start_paused = true)]
async fn update_mid_handshake_is_rejected() {
    let h = harness(FakeFactory::new());
    h.factory.set_delay(Duration::from_secs(5));
    h.manager.add_server(echo()).unwrap();

    let err = h
        .manager
        .update_target_server(TargetServerDescriptor::stdio("echo-service", "echo-v2"))
        .await
        .expect_err("busy");
    assert!(matches!(
        err,
        GatewayError::InvalidTransition {
            phase: TargetPhase::Connecting,
            ..
        }
    ));
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );
    assert_eq!(h.factory.connect_count(), 1);
    assert!(h.factory.closed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn update_while_pending_input_passes_through_connecting() {
    let h = harness(FakeFactory::new());
    h.manager.add_server(echo_with_secret()).unwrap();
    assert_eq!(
        h.manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::PendingInput
    );

    h.manager
        .update_target_server(TargetServerDescriptor::stdio("echo-service", "echo-v2"))
        .await
        .expect("update");
    assert_eq!(h.manager.phase("echo-service"), Some(TargetPhase::Connected));

    let phases = h.audit.phases_for("echo-service");
    let tail: Vec<_> = phases[phases.len() - 3..].to_vec();
    assert_eq!(
        tail,
        vec![
            Some(TargetPhase::PendingInput),
            Some(TargetPhase::Connecting),
            Some(TargetPhase::Connected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn connect_all_reports_each_outcome() {
    let h = harness(FakeFactory::requiring_token("granted"));
    h.factory.refuse("broken");
    let mut outcomes = h
        .manager
        .connect_all(vec![
            echo(),
            TargetServerDescriptor::stdio("broken", "nope"),
            linear(),
            echo(),
        ])
        .await;
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    let phases: Vec<(String, Option<TargetPhase>)> = outcomes
        .into_iter()
        .map(|(name, outcome)| (name, outcome.ok()))
        .collect();
    assert!(phases.contains(&("broken".to_string(), Some(TargetPhase::ConnectionFailed))));
    assert!(phases.contains(&("linear".to_string(), Some(TargetPhase::PendingAuth))));
    assert!(phases.contains(&("echo-service".to_string(), Some(TargetPhase::Connected))));
    assert!(phases.contains(&("echo-service".to_string(), None)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_everything_once() {
    let h = harness(FakeFactory::requiring_token("granted"));
    h.manager.add_server(echo()).unwrap();
    h.manager.add_server(linear()).unwrap();
    h.manager.wait_until_settled("echo-service").await.unwrap();
    h.manager.wait_until_settled("linear").await.unwrap();

    h.manager.shutdown().await;
    h.manager.shutdown().await;

    assert!(h.manager.snapshot().is_empty());
    assert_eq!(h.factory.closed(), vec!["echo-service".to_string()]);
    assert!(h.manager.oauth().flows().pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failing_audit_sink_does_not_disturb_transitions() {
    let factory = Arc::new(FakeFactory::new());
    let audit = Arc::new(RecordingAuditSink::failing());
    let oauth = OAuthConnectionHandler::new(
        factory.clone(),
        Arc::new(FakeAuthorizer::default()),
        Arc::new(MemoryTokenStore::default()),
        Arc::new(OAuthFlowRegistry::new()),
        PollingOptions::new(1, Duration::from_millis(10)),
    );
    let manager = TargetConnectionManager::new(factory, oauth, audit.clone());
    manager.add_server(echo()).unwrap();
    assert_eq!(
        manager.wait_until_settled("echo-service").await.unwrap(),
        TargetPhase::Connected
    );
    assert_eq!(audit.phases_for("echo-service").len(), 2);
}
