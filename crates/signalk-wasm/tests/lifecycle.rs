mod common;

use common::{call_with_constant, manifest, start, supervisor, Guest};
use serde_json::json;
use signalk_wasm::{CapabilitySet, DeltaVersion, LifecycleState, PluginError};

const DELTA: &str = r#"{"context":"vessels.self","updates":[{"values":[{"path":"navigation.speedOverGround","value":3.2}]}]}"#;

fn healthy_guest() -> Guest {
    Guest::new()
        .identity("plugin_id", "healthy")
        .identity("plugin_name", "Healthy Plugin")
        .identity("plugin_schema", r#"{"type":"object"}"#)
        .start("(i32.const 0)")
        .item("(func (export \"ping\") (result i32) (i32.const 7))")
}

fn owning_guest() -> Guest {
    let mut guest = Guest::new()
        .import("sk_udp_create", "(param i32) (result i32)")
        .import("sk_register_resource_provider", "(param i32 i32) (result i32)")
        .import("sk_register_put_handler", "(param i32 i32 i32 i32) (result i32)");
    let register_charts = call_with_constant(&mut guest, "sk_register_resource_provider", "charts", true);
    let (ctx_ptr, ctx_len) = guest.constant("vessels.self");
    let (path_ptr, path_len) = guest.constant("steering.autopilot.state");
    guest.start(&format!(
        "(drop (call $sk_udp_create (i32.const 0)))
         (drop (call $sk_udp_create (i32.const 1)))
         {register_charts}
         (drop (call $sk_register_put_handler
           (i32.const {ctx_ptr}) (i32.const {ctx_len}) (i32.const {path_ptr}) (i32.const {path_len})))
         (i32.const 0)"
    ))
    .reply("resource_list", "{}")
}

fn owning_capabilities() -> CapabilitySet {
    CapabilitySet {
        raw_sockets: true,
        resource_provider: true,
        put_handlers: true,
        ..CapabilitySet::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_enable_reads_identity_and_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    start(
        &supervisor,
        manifest(dir.path(), "healthy", CapabilitySet::default(), &healthy_guest()),
    )
    .await;

    assert_eq!(supervisor.state("healthy").await.unwrap(), LifecycleState::Running);
    let identity = supervisor.identity("healthy").await.unwrap();
    assert_eq!(identity.id.as_deref(), Some("healthy"));
    assert_eq!(identity.name.as_deref(), Some("Healthy Plugin"));
    assert_eq!(identity.schema, Some(json!({"type": "object"})));
    assert_eq!(supervisor.call_status_export("healthy", "ping", None).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_trap_crashes_only_that_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    start(
        &supervisor,
        manifest(dir.path(), "healthy", CapabilitySet::default(), &healthy_guest()),
    )
    .await;

    let faulty = Guest::new().start("(unreachable)");
    supervisor
        .discover(manifest(dir.path(), "faulty", CapabilitySet::default(), &faulty))
        .await
        .unwrap();
    let err = supervisor.enable("faulty", json!({})).await.unwrap_err();
    assert!(matches!(err, PluginError::Trap { .. }), "unexpected error: {err}");

    assert_eq!(supervisor.state("faulty").await.unwrap(), LifecycleState::Crashed);
    assert!(supervisor.last_error("faulty").await.is_some());
    assert!(supervisor.status("faulty").error.is_some());

    assert_eq!(supervisor.state("healthy").await.unwrap(), LifecycleState::Running);
    assert_eq!(supervisor.call_status_export("healthy", "ping", None).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nonzero_start_status_crashes() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let guest = Guest::new().start("(i32.const 3)");
    supervisor
        .discover(manifest(dir.path(), "refuses", CapabilitySet::default(), &guest))
        .await
        .unwrap();

    let err = supervisor.enable("refuses", json!({})).await.unwrap_err();
    assert!(matches!(err, PluginError::Protocol(_)));
    assert_eq!(supervisor.state("refuses").await.unwrap(), LifecycleState::Crashed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trap_during_call_crashes_and_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let guest = owning_guest().item("(func (export \"explode\") (result i32) (unreachable))");
    start(&supervisor, manifest(dir.path(), "owner", owning_capabilities(), &guest)).await;
    assert_eq!(supervisor.socket_count("owner"), 2);

    let err = supervisor
        .call_status_export("owner", "explode", None)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(supervisor.state("owner").await.unwrap(), LifecycleState::Crashed);
    assert_eq!(supervisor.socket_count("owner"), 0);
    assert_eq!(supervisor.provider_count("owner"), 0);
    assert_eq!(supervisor.put_handler_count("owner"), 0);

    let err = supervisor.call_status_export("owner", "explode", None).await.unwrap_err();
    assert!(matches!(err, PluginError::InvalidState(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disable_releases_everything_the_instance_created() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    start(
        &supervisor,
        manifest(dir.path(), "owner", owning_capabilities(), &owning_guest()),
    )
    .await;

    assert_eq!(supervisor.socket_count("owner"), 2);
    assert_eq!(supervisor.provider_count("owner"), 1);
    assert_eq!(supervisor.put_handler_count("owner"), 1);

    supervisor.disable("owner").await.unwrap();
    assert_eq!(supervisor.state("owner").await.unwrap(), LifecycleState::Stopped);
    assert_eq!(supervisor.socket_count("owner"), 0);
    assert_eq!(supervisor.provider_count("owner"), 0);
    assert_eq!(supervisor.put_handler_count("owner"), 0);
    assert!(supervisor.instance_id("owner").await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reload_creates_fresh_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    start(
        &supervisor,
        manifest(dir.path(), "owner", owning_capabilities(), &owning_guest()),
    )
    .await;
    let first = supervisor.instance_id("owner").await.unwrap();

    supervisor.reload("owner", json!({"interval": 5})).await.unwrap();
    let second = supervisor.instance_id("owner").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(supervisor.state("owner").await.unwrap(), LifecycleState::Running);
    // the new instance re-registered, the old one left nothing behind
    assert_eq!(supervisor.socket_count("owner"), 2);
    assert_eq!(supervisor.provider_count("owner"), 1);
    assert_eq!(supervisor.put_handler_count("owner"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crashed_plugin_can_be_enabled_again() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let guest = healthy_guest().item("(func (export \"explode\") (result i32) (unreachable))");
    start(&supervisor, manifest(dir.path(), "healthy", CapabilitySet::default(), &guest)).await;

    supervisor.call_status_export("healthy", "explode", None).await.unwrap_err();
    assert_eq!(supervisor.state("healthy").await.unwrap(), LifecycleState::Crashed);

    supervisor.enable("healthy", json!({})).await.unwrap();
    assert_eq!(supervisor.state("healthy").await.unwrap(), LifecycleState::Running);
    assert!(supervisor.last_error("healthy").await.is_none());
    assert_eq!(supervisor.call_status_export("healthy", "ping", None).await.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_effects_delivered_only_after_successful_return() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, app) = supervisor(dir.path()).await;
    let mut guest = Guest::new().import("sk_handle_message", "(param i32 i32)");
    let emit = call_with_constant(&mut guest, "sk_handle_message", DELTA, false);
    let guest = guest
        .start("(i32.const 0)")
        .item(&format!("(func (export \"emit\") (result i32) {emit} (i32.const 0))"))
        .item(&format!("(func (export \"emit_then_trap\") (result i32) {emit} (unreachable))"));
    start(&supervisor, manifest(dir.path(), "emitter", CapabilitySet::default(), &guest)).await;

    supervisor.call_status_export("emitter", "emit", None).await.unwrap();
    assert_eq!(app.delta_count(), 1);
    {
        let deltas = app.deltas.lock();
        let (plugin, delta, version) = &deltas[0];
        assert_eq!(plugin, "emitter");
        assert_eq!(*version, DeltaVersion::V1);
        assert_eq!(delta["updates"][0]["values"][0]["value"], json!(3.2));
    }

    supervisor
        .call_status_export("emitter", "emit_then_trap", None)
        .await
        .unwrap_err();
    assert_eq!(app.delta_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_effects_delivered_once_running() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, app) = supervisor(dir.path()).await;
    let mut guest = Guest::new().import("sk_handle_message", "(param i32 i32)");
    let emit = call_with_constant(&mut guest, "sk_handle_message", DELTA, false);
    let guest = guest.start(&format!("{emit} (i32.const 0)"));
    start(&supervisor, manifest(dir.path(), "emitter", CapabilitySet::default(), &guest)).await;
    assert_eq!(app.delta_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_every_running_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    start(
        &supervisor,
        manifest(dir.path(), "healthy", CapabilitySet::default(), &healthy_guest()),
    )
    .await;
    start(
        &supervisor,
        manifest(dir.path(), "owner", owning_capabilities(), &owning_guest()),
    )
    .await;

    supervisor.shutdown().await;
    for id in ["healthy", "owner"] {
        assert_eq!(supervisor.state(id).await.unwrap(), LifecycleState::Stopped);
    }
    assert_eq!(supervisor.socket_count("owner"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fuel_limit_stops_runaway_guest() {
    let dir = tempfile::tempdir().unwrap();
    let app = std::sync::Arc::new(common::RecordingApp::default());
    let config = signalk_wasm::SandboxConfig {
        fuel_limit: Some(1_000_000),
        ..common::test_config(dir.path())
    };
    let supervisor = signalk_wasm::PluginSupervisor::new(config, app).await.unwrap();
    let guest = Guest::new()
        .start("(i32.const 0)")
        .item("(func (export \"spin\") (result i32) (loop $forever (br $forever)) (i32.const 0))");
    start(&supervisor, manifest(dir.path(), "spinner", CapabilitySet::default(), &guest)).await;

    let err = supervisor.call_status_export("spinner", "spin", None).await.unwrap_err();
    assert!(matches!(err, PluginError::FuelExhausted(_)), "unexpected error: {err}");
    assert_eq!(supervisor.state("spinner").await.unwrap(), LifecycleState::Crashed);
}
