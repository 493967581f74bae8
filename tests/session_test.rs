//! Session lifecycle integration tests: subscriptions, object sync, push
//! handling and reconnect replay over the scripted transport.

mod common;

use common::{eventually, transport_error, within, ScriptedTransport};
use serde_json::json;
use simuser_session::rpc::{CALC_EVAL_CONDITION_FAILED, TOPIC_AUTHENTICATION};
use simuser_session::{
    DataRequest, DefinitionOutcome, EngineObject, NoDefinitions, ObjectDefinitions, ObjectKind,
    ReconnectState, RpcResponse, Session, SessionConfig, SessionError, SimulationConfig,
    Transport,
};
use std::sync::Arc;
use std::time::Duration;

fn config() -> SessionConfig {
    let mut config = SessionConfig::new("engine.test:4848", "sales.qvf");
    config.request_timeout_secs = 5.0;
    config.reconnect.backoff = vec![0.001, 0.001, 0.001];
    config
}

fn session_with(
    transport: &Arc<ScriptedTransport>,
    config: SessionConfig,
    definitions: Arc<dyn ObjectDefinitions>,
) -> Arc<Session> {
    Session::new(config, Arc::clone(transport) as Arc<dyn Transport>, definitions)
}

fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

async fn open(session: &Session) {
    session.connect().await.unwrap();
    session.open_app().await.unwrap();
    session
        .subscribe_objects(ObjectKind::Sheet, &ids(&["sheet-1"]))
        .await
        .unwrap();
    session
        .subscribe_objects(ObjectKind::GenericObject, &ids(&["kpi", "table"]))
        .await
        .unwrap();
    within(session.wait_for_quiescence()).await.unwrap();
}

#[tokio::test]
async fn test_subscribe_syncs_layouts() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    session.begin_action("open");
    open(&session).await;

    let objects = session.executor().objects();
    assert_eq!(objects.len(), 4);
    for id in ["sheet-1", "kpi", "table"] {
        let kind = if id == "sheet-1" {
            ObjectKind::Sheet
        } else {
            ObjectKind::GenericObject
        };
        let handle = objects.handle_of(id, kind).unwrap();
        assert!(objects.get(handle).unwrap().layout.is_some(), "{} has no layout", id);
    }
    assert_eq!(transport.calls_to("GetLayout"), 3);
    assert_eq!(transport.connects(), vec![false]);

    let report = session.finish_action().await;
    assert!(!report.failed(), "{:?}", report.errors);
}

#[tokio::test]
async fn test_engine_close_unregisters_object() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    open(&session).await;

    let kpi = session
        .executor()
        .objects()
        .handle_of("kpi", ObjectKind::GenericObject)
        .unwrap();
    transport.push_changes(&[], &[kpi]);

    let executor = session.executor().clone();
    within(eventually(|| !executor.registry().is_registered(kpi))).await;
    within(session.wait_for_quiescence()).await.unwrap();
    assert!(session.executor().objects().get(kpi).is_none());
}

struct CubeDefinitions;

impl ObjectDefinitions for CubeDefinitions {
    fn data_requests(&self, object: &EngineObject) -> DefinitionOutcome {
        match object.id.as_str() {
            "table" => DefinitionOutcome::Requests(vec![
                DataRequest {
                    method: "GetHyperCubeData".into(),
                    params: json!(["/qHyperCubeDef", [{"qTop": 0, "qHeight": 50}]]),
                },
                DataRequest {
                    method: "GetHyperCubeReducedData".into(),
                    params: json!(["/qHyperCubeDef"]),
                },
            ]),
            "kpi" => DefinitionOutcome::NoDataCarrier,
            _ => DefinitionOutcome::NoDefinition,
        }
    }
}

#[tokio::test]
async fn test_data_requests_follow_layout() {
    let transport = ScriptedTransport::new();
    transport.respond("GetHyperCubeData", |_| {
        Ok(RpcResponse::ok(0, json!({"qDataPages": []})))
    });
    transport.respond("GetHyperCubeReducedData", |_| {
        Ok(RpcResponse::error(0, CALC_EVAL_CONDITION_FAILED, "condition"))
    });
    let session = session_with(&transport, config(), Arc::new(CubeDefinitions));
    session.begin_action("open");
    open(&session).await;
    within(session.wait_for_object_sync()).await.unwrap();

    let objects = session.executor().objects();
    let table = objects
        .handle_of("table", ObjectKind::GenericObject)
        .unwrap();
    let cached = objects.get(table).unwrap();
    assert!(cached.data.contains_key("GetHyperCubeData"));
    assert!(!cached.data.contains_key("GetHyperCubeReducedData"));

    let report = session.finish_action().await;
    assert!(!report.failed(), "{:?}", report.errors);
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    session.begin_action("reconnect");
    open(&session).await;

    let before = session.executor().objects().snapshot();
    let old_kpi = session
        .executor()
        .objects()
        .handle_of("kpi", ObjectKind::GenericObject)
        .unwrap();

    transport.queue_connect(Err(transport_error("refused")));
    transport.close("engine restarted");

    let supervisor_session = Arc::clone(&session);
    within(eventually(|| supervisor_session.supervisor().last_report().is_some())).await;
    within(session.wait_for_quiescence()).await.unwrap();

    let report = session.supervisor().last_report().unwrap();
    assert_eq!(report.attempts, 2);
    assert!(report.error.is_none());
    assert_eq!(session.supervisor().state(), ReconnectState::Connected);
    assert_eq!(transport.connects(), vec![false, true, true]);

    let objects = session.executor().objects();
    assert_eq!(objects.snapshot(), before);
    assert!(objects.document().is_some());
    let new_kpi = objects
        .handle_of("kpi", ObjectKind::GenericObject)
        .unwrap();
    assert_ne!(new_kpi, old_kpi);
    assert!(session.executor().registry().is_registered(new_kpi));
    assert!(!session.executor().registry().is_registered(old_kpi));
    assert!(objects.get(new_kpi).unwrap().layout.is_some());

    let action = session.finish_action().await;
    assert!(!action.failed(), "{:?}", action.errors);
}

#[tokio::test]
async fn test_repeated_close_reconnects_once() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    session.begin_action("reconnect");
    open(&session).await;

    transport.close("engine restarted");
    transport.close("engine restarted");

    let supervisor_session = Arc::clone(&session);
    within(eventually(|| supervisor_session.supervisor().last_report().is_some())).await;
    within(session.wait_for_quiescence()).await.unwrap();

    assert_eq!(transport.connects(), vec![false, true]);
    assert_eq!(session.supervisor().last_report().unwrap().attempts, 1);
    assert_eq!(session.supervisor().state(), ReconnectState::Connected);
    let action = session.finish_action().await;
    assert!(!action.failed(), "{:?}", action.errors);
}

#[tokio::test]
async fn test_object_sync_counted_before_start() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    session.connect().await.unwrap();
    session.open_app().await.unwrap();
    let handles = session
        .subscribe_objects(ObjectKind::GenericObject, &ids(&["kpi"]))
        .await
        .unwrap();

    within(session.wait_for_object_sync()).await.unwrap();
    assert!(session.executor().objects().get(handles[0]).unwrap().layout.is_some());
    assert_eq!(transport.calls_to("GetLayout"), 1);
}

#[tokio::test]
async fn test_cancel_interrupts_connect() {
    let transport = ScriptedTransport::new();
    transport.delay_connects(Duration::from_secs(60));
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));

    let dialing = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.connect().await })
    };
    let dialed = Arc::clone(&transport);
    within(eventually(|| !dialed.connects().is_empty())).await;
    session.cancel();

    let result = within(dialing).await.unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert!(session.executor().connection().is_err());
}

#[tokio::test]
async fn test_no_session_is_terminal() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    session.begin_action("lost");
    open(&session).await;

    transport.queue_connect(Err(SessionError::NoSessionToAttach));
    transport.close("engine restarted");

    let supervisor_session = Arc::clone(&session);
    within(eventually(|| supervisor_session.supervisor().last_report().is_some())).await;

    let report = session.finish_action().await;
    assert!(report.failed());
    assert!(report.errors[0].is_no_session());
    assert_eq!(session.supervisor().last_report().unwrap().attempts, 1);
    assert_eq!(session.supervisor().state(), ReconnectState::Failed);
    assert_eq!(transport.connects(), vec![false, true]);
}

#[tokio::test]
async fn test_disabled_reconnect_fails_action() {
    let transport = ScriptedTransport::new();
    let mut config = config();
    config.reconnect.enabled = false;
    let session = session_with(&transport, config, Arc::new(NoDefinitions));
    session.begin_action("lost");
    open(&session).await;

    transport.close("gone");
    let executor = session.executor().clone();
    within(eventually(|| executor.action().failed())).await;
    assert_eq!(transport.connects(), vec![false]);
}

#[tokio::test]
async fn test_cancel_suppresses_reconnect() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    open(&session).await;

    session.cancel();
    transport.close("shutdown");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.supervisor().last_report().is_none());
    assert_eq!(transport.connects(), vec![false]);
    assert!(matches!(
        session.wait_for_quiescence().await,
        Err(SessionError::Cancelled)
    ));

    session.reset().await;
    assert!(!session.executor().is_cancelled());
    assert!(session.executor().objects().is_empty());
    assert!(session.executor().registry().is_empty());
}

#[tokio::test]
async fn test_authentication_push_fails_action() {
    let transport = ScriptedTransport::new();
    let session = session_with(&transport, config(), Arc::new(NoDefinitions));
    session.begin_action("connect");
    session.connect().await.unwrap();

    transport.push(
        TOPIC_AUTHENTICATION,
        json!({"mustAuthenticate": true, "loginUri": "https://idp.test/login"}),
    );

    let executor = session.executor().clone();
    within(eventually(|| executor.action().failed())).await;
    let report = session.finish_action().await;
    assert!(matches!(
        report.errors[0].root(),
        SessionError::AuthenticationRequired(uri) if uri == "https://idp.test/login"
    ));
}

#[test]
fn test_simulation_config_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("simulation.toml");

    let mut session = config();
    session.virtual_proxy = Some("jwt".into());
    session
        .headers
        .insert("X-Qlik-User".into(), "UserDirectory=test;UserId=sim".into());
    let original = SimulationConfig {
        users: 4,
        iterations: 2,
        session,
        sheets: ids(&["sheet-1"]),
        objects: ids(&["kpi"]),
    };
    original.save(&path).unwrap();

    let loaded = SimulationConfig::load(&path).unwrap();
    assert_eq!(loaded.users, 4);
    assert_eq!(loaded.session.virtual_proxy.as_deref(), Some("jwt"));
    assert_eq!(loaded.session.header_pairs().len(), 1);
    assert_eq!(
        loaded.session.connect_url().unwrap(),
        "ws://engine.test:4848/jwt/app/sales.qvf"
    );
    loaded.validate().unwrap();

    assert!(SimulationConfig::load(dir.path().join("missing.toml")).is_err());
}
