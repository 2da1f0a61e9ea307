//! Remote attribute access over a real local TCP server.

use rust_scope::remote::{AttributeServer, RemoteClient, RemoteClientConfig};
use rust_scope::sim::register_sim_classes;
use rust_scope::tree::{ComponentRegistry, ComponentTree, MicroscopeConfig, TreeBuilder};
use rust_scope::ScopeError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const MICROSCOPE: &str = r#"
    root = "orsaymic"

    [components.orsaymic]
    class = "sim.Microscope"
    role = "microscope"
    children = { detector = "Detector", focus = "Focus" }

    [components.Detector]
    class = "sim.Detector"
    role = "detector"
    init = { rng = 5 }
    children = { scanner = "Scanner" }

    [components.Scanner]
    class = "sim.Scanner"
    role = "scanner"

    [components.Focus]
    class = "sim.Focus"
    role = "focus"
"#;

fn build_tree() -> Arc<ComponentTree> {
    let mut registry = ComponentRegistry::new();
    register_sim_classes(&mut registry);
    let config = MicroscopeConfig::from_toml_str(MICROSCOPE).unwrap();
    Arc::new(TreeBuilder::new(&registry).build(&config).unwrap())
}

async fn serve(tree: Arc<ComponentTree>) -> rust_scope::remote::ServerHandle {
    AttributeServer::new(tree)
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

fn client_config(addr: SocketAddr) -> RemoteClientConfig {
    RemoteClientConfig::new(addr)
        .with_request_timeout(Duration::from_millis(500))
        .with_max_retries(0)
}

#[tokio::test]
async fn get_set_subscribe_match_local_behavior() {
    let tree = build_tree();
    let server = serve(tree.clone()).await;
    let client = RemoteClient::connect(client_config(server.local_addr()))
        .await
        .unwrap();

    let scanner = tree.find_by_role("scanner").unwrap();
    let local_position = scanner
        .attributes()
        .get_typed::<(f64, f64)>("position")
        .unwrap();
    let remote_position = client.component("Scanner").attribute::<(f64, f64)>("position");

    // Fresh read of the initial value.
    let read = remote_position.get().await.unwrap();
    assert_eq!(read.value, (0.0, 0.0));
    assert!(!read.stale);

    // A remote write lands on the local attribute, and vice versa.
    remote_position.set((1.0e-6, -1.0e-6)).await.unwrap();
    assert_eq!(local_position.get(), (1.0e-6, -1.0e-6));

    let mut updates = remote_position.subscribe().await.unwrap();
    // Initial emit first.
    let first = timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, (1.0e-6, -1.0e-6));

    local_position.set((2.0e-6, 2.0e-6)).unwrap();
    let pushed = timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed, (2.0e-6, 2.0e-6));
    assert_eq!(remote_position.get().await.unwrap().value, (2.0e-6, 2.0e-6));

    server.shutdown().await;
}

#[tokio::test]
async fn server_side_failures_surface_as_typed_errors() {
    let tree = build_tree();
    let server = serve(tree.clone()).await;
    let client = RemoteClient::connect(client_config(server.local_addr()))
        .await
        .unwrap();

    // Validation failure: outside the scanner's field of view. The value
    // must be untouched on both sides.
    let position = client.component("Scanner").attribute::<(f64, f64)>("position");
    let err = position.set((1.0, 1.0)).await.unwrap_err();
    assert!(matches!(err, ScopeError::Validation(_)));
    assert_eq!(position.get().await.unwrap().value, (0.0, 0.0));

    // Read-only attribute.
    let intensity = client.component("Detector").attribute::<f64>("intensity");
    assert!(matches!(
        intensity.set(1.0).await.unwrap_err(),
        ScopeError::ReadOnly(_)
    ));

    // Unknown component and attribute.
    let missing = client.component("Chamber").attribute::<f64>("pressure");
    assert!(matches!(
        missing.get().await.unwrap_err(),
        ScopeError::NotFound(_)
    ));

    let listing = client.list_components().await.unwrap();
    assert_eq!(listing.len(), 4);
    assert!(listing.iter().any(|c| c.name == "Scanner"));

    server.shutdown().await;
}

#[tokio::test]
async fn a_burst_of_writes_converges_on_the_latest_value() {
    let tree = build_tree();
    let server = serve(tree.clone()).await;
    let client = RemoteClient::connect(client_config(server.local_addr()))
        .await
        .unwrap();

    let scanner = tree.find_by_role("scanner").unwrap();
    let local_position = scanner
        .attributes()
        .get_typed::<(f64, f64)>("position")
        .unwrap();
    let remote_position = client.component("Scanner").attribute::<(f64, f64)>("position");

    let mut updates = remote_position.subscribe().await.unwrap();
    let initial = timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(initial, (0.0, 0.0));

    // Fire writes far faster than the client drains them. Intermediate
    // values may be coalesced away, but the stream must end on the final
    // one rather than dropping it.
    let last = (4.0e-6, -4.0e-6);
    for i in 1..=400_i32 {
        local_position
            .set((f64::from(i) * 1.0e-8, f64::from(i) * -1.0e-8))
            .unwrap();
    }

    loop {
        let value = timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("update stream stalled before the final value")
            .unwrap();
        if value == last {
            break;
        }
    }
    assert_eq!(remote_position.get().await.unwrap().value, last);

    server.shutdown().await;
}

#[tokio::test]
async fn connecting_to_a_dead_endpoint_fails_fast() {
    // Find a port with nothing listening on it.
    let addr = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap()
    };

    let err = RemoteClient::connect(client_config(addr)).await.unwrap_err();
    assert!(matches!(
        err,
        ScopeError::Unreachable(_) | ScopeError::Timeout(_)
    ));
}

#[tokio::test]
async fn reads_turn_stale_when_the_server_goes_away() {
    let tree = build_tree();
    let server = serve(tree.clone()).await;
    let client = RemoteClient::connect(client_config(server.local_addr()))
        .await
        .unwrap();

    let dwell = client.component("Scanner").attribute::<f64>("dwell_time");
    let fresh = dwell.get().await.unwrap();
    assert!(!fresh.stale);

    server.shutdown().await;
    // Give the client a moment to notice the broken connection.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stale = dwell.get().await.unwrap();
    assert!(stale.stale);
    assert_eq!(stale.value, fresh.value);
    assert!(stale.age > Duration::ZERO);

    // Writes are never answered from the cache.
    let err = dwell.set(2.0e-6).await.unwrap_err();
    assert!(matches!(
        err,
        ScopeError::Unreachable(_) | ScopeError::Timeout(_)
    ));
}

#[tokio::test]
async fn subscriptions_recover_after_a_reconnect() {
    let tree = build_tree();
    let server = serve(tree.clone()).await;
    let addr = server.local_addr();
    let client = RemoteClient::connect(client_config(addr)).await.unwrap();

    let scanner = tree.find_by_role("scanner").unwrap();
    let local_position = scanner
        .attributes()
        .get_typed::<(f64, f64)>("position")
        .unwrap();
    let remote_position = client.component("Scanner").attribute::<(f64, f64)>("position");

    let mut updates = remote_position.subscribe().await.unwrap();
    let initial = timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(initial, (0.0, 0.0));

    // Bounce the server on the same address; the value moves while the
    // client is away.
    server.shutdown().await;
    local_position.set((3.0e-6, 0.0)).unwrap();
    let server = AttributeServer::new(tree.clone())
        .serve(addr)
        .await
        .unwrap();

    // After reconnecting, the subscription re-emits the current value.
    let recovered = timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no re-emit after reconnect")
        .unwrap();
    assert_eq!(recovered, (3.0e-6, 0.0));

    // And stays live for subsequent changes.
    local_position.set((4.0e-6, 0.0)).unwrap();
    let pushed = timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed, (4.0e-6, 0.0));

    server.shutdown().await;
}
