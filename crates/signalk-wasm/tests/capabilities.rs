mod common;

use std::time::Duration;

use common::{call_with_constant, manifest, start, supervisor, Guest};
use serde_json::json;
use signalk_wasm::CapabilitySet;
use tokio::net::TcpListener;

/// Scratch space below the guest heap for host-written results.
const SCRATCH: u32 = 12 * 1024;
const SCRATCH_LEN: u32 = 2048;

const FETCH: &str = "(param i32 i32 i32 i32 i32 i32) (result i32)";

fn fetch_attempt(url: &str) -> Guest {
    let mut guest = Guest::new().import("sk_fetch", FETCH);
    let (url_ptr, url_len) = guest.constant(url);
    guest.start("(i32.const 0)").item(&format!(
        "(func (export \"try_fetch\") (result i32)
           (call $sk_fetch (i32.const {url_ptr}) (i32.const {url_len}) (i32.const 0) (i32.const 0)
             (i32.const {SCRATCH}) (i32.const {SCRATCH_LEN})))"
    ))
}

async fn assert_no_connection(listener: &TcpListener) {
    let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(accepted.is_err(), "the host issued a request");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_without_network_capability_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/weather", listener.local_addr().unwrap());

    start(
        &supervisor,
        manifest(dir.path(), "offline", CapabilitySet::default(), &fetch_attempt(&url)),
    )
    .await;

    assert_eq!(supervisor.call_status_export("offline", "try_fetch", None).await.unwrap(), -1);
    assert_no_connection(&listener).await;
    // a refused call is not a fault
    assert_eq!(
        supervisor.state("offline").await.unwrap(),
        signalk_wasm::LifecycleState::Running
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_from_module_without_asyncify_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/weather", listener.local_addr().unwrap());
    let capabilities = CapabilitySet {
        network: true,
        ..CapabilitySet::default()
    };

    start(&supervisor, manifest(dir.path(), "sync", capabilities, &fetch_attempt(&url))).await;

    assert_eq!(supervisor.call_status_export("sync", "try_fetch", None).await.unwrap(), -1);
    assert_no_connection(&listener).await;
}

fn socket_poker(target: i32) -> Guest {
    let mut guest = Guest::new()
        .import("sk_udp_create", "(param i32) (result i32)")
        .import("sk_udp_close", "(param i32) (result i32)")
        .import("sk_udp_pending", "(param i32) (result i32)")
        .import("sk_udp_set_broadcast", "(param i32 i32) (result i32)")
        .import("sk_udp_send", "(param i32 i32 i32 i32 i32 i32) (result i32)");
    let (host_ptr, host_len) = guest.constant("127.0.0.1");
    let (data_ptr, data_len) = guest.constant("$GPGGA");
    guest.start("(i32.const 0)").item(&format!(
        "(func (export \"create\") (result i32) (call $sk_udp_create (i32.const 0)))
         (func (export \"close\") (result i32) (call $sk_udp_close (i32.const {target})))
         (func (export \"pending\") (result i32) (call $sk_udp_pending (i32.const {target})))
         (func (export \"broadcast\") (result i32) (call $sk_udp_set_broadcast (i32.const {target}) (i32.const 1)))
         (func (export \"send\") (result i32)
           (call $sk_udp_send (i32.const {target}) (i32.const {host_ptr}) (i32.const {host_len})
             (i32.const 10110) (i32.const {data_ptr}) (i32.const {data_len})))"
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_foreign_socket_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let capabilities = CapabilitySet {
        raw_sockets: true,
        ..CapabilitySet::default()
    };
    start(&supervisor, manifest(dir.path(), "alpha", capabilities.clone(), &socket_poker(0))).await;
    let owned = supervisor.call_status_export("alpha", "create", None).await.unwrap();
    assert!(owned > 0);

    start(&supervisor, manifest(dir.path(), "beta", capabilities, &socket_poker(owned))).await;
    for export in ["close", "pending", "broadcast", "send"] {
        let result = supervisor.call_status_export("beta", export, None).await.unwrap();
        assert_eq!(result, -1, "{export} on a foreign socket");
    }
    assert_eq!(supervisor.socket_count("alpha"), 1);
    assert_eq!(supervisor.socket_count("beta"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sockets_require_raw_sockets_capability() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    start(
        &supervisor,
        manifest(dir.path(), "plain", CapabilitySet::default(), &socket_poker(1)),
    )
    .await;
    assert_eq!(supervisor.call_status_export("plain", "create", None).await.unwrap(), -1);
    assert_eq!(supervisor.socket_count("plain"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registrations_are_gated_by_capability() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let mut guest = Guest::new()
        .import("sk_register_resource_provider", "(param i32 i32) (result i32)")
        .import("sk_register_weather_provider", "(param i32 i32) (result i32)")
        .import("sk_register_put_handler", "(param i32 i32 i32 i32) (result i32)");
    let (name_ptr, name_len) = guest.constant("charts");
    let (ctx_ptr, ctx_len) = guest.constant("vessels.self");
    let (path_ptr, path_len) = guest.constant("electrical.switches.anchorLight.state");
    let guest = guest
        .start("(i32.const 0)")
        .item(&format!(
            "(func (export \"resource\") (result i32)
               (call $sk_register_resource_provider (i32.const {name_ptr}) (i32.const {name_len})))
             (func (export \"weather\") (result i32)
               (call $sk_register_weather_provider (i32.const {name_ptr}) (i32.const {name_len})))
             (func (export \"put\") (result i32)
               (call $sk_register_put_handler (i32.const {ctx_ptr}) (i32.const {ctx_len})
                 (i32.const {path_ptr}) (i32.const {path_len})))"
        ))
        .reply("resource_list", "{}");
    let capabilities = CapabilitySet {
        resource_provider: true,
        ..CapabilitySet::default()
    };
    start(&supervisor, manifest(dir.path(), "charts", capabilities, &guest)).await;

    assert_eq!(supervisor.call_status_export("charts", "resource", None).await.unwrap(), 1);
    assert_eq!(supervisor.call_status_export("charts", "weather", None).await.unwrap(), 0);
    assert_eq!(supervisor.call_status_export("charts", "put", None).await.unwrap(), 0);
    assert_eq!(supervisor.provider_count("charts"), 1);
    assert_eq!(supervisor.put_handler_count("charts"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capability_query_and_self_path() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, app) = supervisor(dir.path()).await;
    app.self_state
        .lock()
        .insert("navigation.position".into(), json!({"latitude": 60.1, "longitude": 24.9}));

    let mut guest = Guest::new()
        .import("sk_has_capability", "(param i32 i32) (result i32)")
        .import("sk_get_self_path", "(param i32 i32 i32 i32) (result i32)");
    let has_network = call_with_constant(&mut guest, "sk_has_capability", "network", false);
    let has_sockets = call_with_constant(&mut guest, "sk_has_capability", "rawSockets", false);
    let (path_ptr, path_len) = guest.constant("navigation.position");
    let (missing_ptr, missing_len) = guest.constant("navigation.log");
    let guest = guest.start("(i32.const 0)").item(&format!(
        "(func (export \"has_network\") (result i32) {has_network})
         (func (export \"has_sockets\") (result i32) {has_sockets})
         (func (export \"position\") (param i32 i32) (param $out i32) (param $max i32) (result i32)
           (call $sk_get_self_path (i32.const {path_ptr}) (i32.const {path_len}) (local.get $out) (local.get $max)))
         (func (export \"log\") (param i32 i32) (param $out i32) (param $max i32) (result i32)
           (call $sk_get_self_path (i32.const {missing_ptr}) (i32.const {missing_len}) (local.get $out) (local.get $max)))"
    ));
    let capabilities = CapabilitySet {
        network: true,
        ..CapabilitySet::default()
    };
    start(&supervisor, manifest(dir.path(), "query", capabilities, &guest)).await;

    assert_eq!(supervisor.call_status_export("query", "has_network", None).await.unwrap(), 1);
    assert_eq!(supervisor.call_status_export("query", "has_sockets", None).await.unwrap(), 0);

    let position = supervisor.call_export("query", "position", None).await.unwrap().unwrap();
    let position: serde_json::Value = serde_json::from_str(&position).unwrap();
    assert_eq!(position["latitude"], json!(60.1));
    assert_eq!(supervisor.call_export("query", "log", None).await.unwrap(), None);
}

fn receiver(port: u16) -> Guest {
    let mut guest = Guest::new()
        .import("sk_udp_create", "(param i32) (result i32)")
        .import("sk_udp_bind", "(param i32 i32 i32 i32) (result i32)")
        .import("sk_udp_recv", "(param i32 i32 i32 i32 i32) (result i32)")
        .import("sk_udp_pending", "(param i32) (result i32)");
    let (addr_ptr, addr_len) = guest.constant("127.0.0.1");
    guest.start("(i32.const 0)").item(&format!(
        "(global $socket (mut i32) (i32.const 0))
         (func (export \"open\") (result i32)
           (global.set $socket (call $sk_udp_create (i32.const 0)))
           (call $sk_udp_bind (global.get $socket) (i32.const {port})
             (i32.const {addr_ptr}) (i32.const {addr_len})))
         (func (export \"pending\") (result i32) (call $sk_udp_pending (global.get $socket)))
         (func (export \"recv_bad_address\") (result i32)
           (call $sk_udp_recv (global.get $socket) (i32.const {SCRATCH}) (i32.const 64)
             (i32.const -16) (i32.const 0)))
         (func (export \"recv\") (result i32)
           (call $sk_udp_recv (global.get $socket) (i32.const {SCRATCH}) (i32.const 64)
             (i32.const {addr_out}) (i32.const {port_out})))",
        addr_out = SCRATCH + 128,
        port_out = SCRATCH + 256,
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recv_with_bad_pointer_keeps_datagram() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _app) = supervisor(dir.path()).await;
    let port = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let capabilities = CapabilitySet {
        raw_sockets: true,
        ..CapabilitySet::default()
    };
    start(&supervisor, manifest(dir.path(), "nmea", capabilities, &receiver(port))).await;
    assert_eq!(supervisor.call_status_export("nmea", "open", None).await.unwrap(), 0);

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"$GPGGA", ("127.0.0.1", port)).unwrap();
    let mut pending = 0;
    for _ in 0..200 {
        pending = supervisor.call_status_export("nmea", "pending", None).await.unwrap();
        if pending > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pending, 1);

    assert_eq!(supervisor.call_status_export("nmea", "recv_bad_address", None).await.unwrap(), -1);
    assert_eq!(supervisor.call_status_export("nmea", "pending", None).await.unwrap(), 1);
    assert_eq!(supervisor.call_status_export("nmea", "recv", None).await.unwrap(), 6);
    assert_eq!(supervisor.call_status_export("nmea", "pending", None).await.unwrap(), 0);
}
