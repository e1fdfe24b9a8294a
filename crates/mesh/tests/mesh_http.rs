//! End-to-end tests: a real mesh server on an ephemeral port driven by
//! `MeshInterface`.

use fleet_common::{Error, ErrorKind, ServiceDescriptor};
use fleet_mesh::{MeshInterface, MeshService};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;

struct TestMesh {
    client: MeshInterface,
    mesh: Arc<MeshService>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestMesh {
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mesh = Arc::new(MeshService::new("it-mesh", "mesh-1"));
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(fleet_mesh::serve(listener, mesh.clone(), async {
            let _ = rx.await;
        }));

        let mut client = MeshInterface::new().unwrap();
        client.register(format!("http://{}", addr));
        Self {
            client,
            mesh,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

fn ids(services: &[ServiceDescriptor]) -> Vec<String> {
    services.iter().map(|s| s.service_id.clone()).collect()
}

#[tokio::test]
async fn test_health_reports_identity() {
    let server = TestMesh::start().await;
    let health = server.client.health().await.unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.name, "it-mesh");
    assert_eq!(health.service_id, "mesh-1");
    assert_eq!(health.services, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_register_search_deregister_round_trip() {
    let server = TestMesh::start().await;
    let client = &server.client;

    for id in ["1", "2"] {
        let desc = ServiceDescriptor::new("A", id)
            .with_endpoints(format!("http://10.0.0.{}:8080", id))
            .with_tags(["web"]);
        client.register_service(&desc).await.unwrap();
    }

    assert_eq!(ids(&client.search_services("web").await.unwrap()), vec!["1", "2"]);
    assert_eq!(ids(&client.get_services("A").await.unwrap()), vec!["1", "2"]);

    client.deregister_service("A", "1").await.unwrap();
    assert_eq!(ids(&client.get_services("A").await.unwrap()), vec!["2"]);
    assert_eq!(ids(&client.discover_service("A").await.unwrap()), vec!["2"]);
    assert!(!server.mesh.references("A", "1"));

    // Deregistering twice is harmless
    client.deregister_service("A", "1").await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_absence_decodes_to_not_found() {
    let server = TestMesh::start().await;
    let client = &server.client;

    assert!(client.search_services("none").await.unwrap_err().is_not_found());
    assert!(client.get_services("none").await.unwrap_err().is_not_found());
    let err = client.get_key_value("none").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "Resource not found: key with id none");
    server.stop().await;
}

#[tokio::test]
async fn test_validation_error_crosses_the_wire() {
    let server = TestMesh::start().await;
    let err = server
        .client
        .register_service(&ServiceDescriptor::new("", "1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = server
        .client
        .register_service(&ServiceDescriptor::new(fleet_mesh::RESERVED_SERVICE_NAME, "1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    server.stop().await;
}

#[tokio::test]
async fn test_key_value_with_reserved_characters() {
    let server = TestMesh::start().await;
    let client = &server.client;

    client
        .set_key_value("feeds/yahoo finance", json!({"interval": 60}))
        .await
        .unwrap();
    client
        .set_key_value("feeds/yahoo finance", json!({"interval": 30}))
        .await
        .unwrap();
    assert_eq!(
        client.get_key_value("feeds/yahoo finance").await.unwrap(),
        json!({"interval": 30})
    );
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_registrations() {
    let server = TestMesh::start().await;
    let registrations = (0..16).map(|i| {
        let client = server.client.clone();
        async move {
            let desc = ServiceDescriptor::new("worker", i.to_string()).with_tags(["pool"]);
            client.register_service(&desc).await
        }
    });
    for result in futures::future::join_all(registrations).await {
        result.unwrap();
    }

    assert_eq!(server.client.search_services("pool").await.unwrap().len(), 16);
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_mesh_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut client = MeshInterface::new().unwrap();
    client.register(format!("http://{}", addr));
    assert!(matches!(client.health().await.unwrap_err(), Error::Transport(_)));
}
