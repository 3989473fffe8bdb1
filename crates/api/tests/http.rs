use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum_test::TestServer;
use roster_api::{auto_manifest_router, manifest_router, ManifestClient, POST_ONLY};
use roster_core::{Action, Manifest, ManifestError, ManifestKey, PayloadField};
use roster_schema::TypeRegistry;
use roster_store::Pool;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct MySpec {
    #[serde(default)]
    message: String,
}

type MyManifest = Manifest<MySpec, MySpec>;

const PATH: &str = "/example.com/v1alpha1/MyManifest";

const BODY: &str = r#"{
  "apiVersion": "example.com/v1alpha1",
  "kind": "MyManifest",
  "metadata": { "name": "my-manifest-1" },
  "spec": { "message": "hello, world" }
}"#;

fn setup() -> (TestServer, Pool<MySpec, MySpec>) {
    let pool: Pool<MySpec, MySpec> = Pool::new().unwrap();
    let server = TestServer::new(manifest_router(PATH, pool.clone())).unwrap();
    (server, pool)
}

mod endpoint {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn post_applies_and_echoes_manifest() {
        let (server, pool) = setup();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        pool.listen(move |_, action, m| sink.lock().unwrap().push((action, m.spec.message.clone())));

        let response = server.post(PATH).text(BODY).await;
        response.assert_status_ok();
        let echoed: MyManifest = response.json();
        assert_eq!(echoed.metadata.name, "my-manifest-1");
        assert_eq!(echoed.spec.message, "hello, world");

        let key = ManifestKey::new("example.com/v1alpha1", "MyManifest", "my-manifest-1");
        assert_eq!(pool.get_by_key(&key).unwrap().spec.message, "hello, world");
        pool.settled().await;
        assert_eq!(events.lock().unwrap().clone(), vec![(Action::Created, "hello, world".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn yaml_bodies_are_accepted() {
        let (server, pool) = setup();
        let yaml = "apiVersion: example.com/v1alpha1\nkind: MyManifest\nmetadata:\n  name: from-yaml\n";
        server.post(PATH).text(yaml).await.assert_status_ok();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_methods_are_rejected() {
        let (server, pool) = setup();
        let response = server.get(PATH).expect_failure().await;
        response.assert_status(StatusCode::METHOD_NOT_ALLOWED);
        response.assert_text(POST_ONLY);

        let response = server.put(PATH).text(BODY).expect_failure().await;
        response.assert_status(StatusCode::METHOD_NOT_ALLOWED);
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_body_is_a_bad_request() {
        let (server, pool) = setup();
        let response = server.post(PATH).text("{ not: [valid").expect_failure().await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn payload_mismatch_is_stored_with_errors() {
        let (server, pool) = setup();
        let body = r#"{"apiVersion":"example.com/v1alpha1","kind":"MyManifest","metadata":{"name":"bad"},"spec":{"message":[1,2]}}"#;
        let response = server.post(PATH).text(body).await;
        response.assert_status_ok();
        let echoed: serde_json::Value = response.json();
        assert_eq!(echoed["errors"][0]["reason"], "payloadDecode");
        assert_eq!(echoed["errors"][0]["field"], "spec");

        let stored = pool.get_by_key(&ManifestKey::new("example.com/v1alpha1", "MyManifest", "bad")).unwrap();
        assert_eq!(stored.errors.len(), 1);
        assert_eq!(stored.spec, MySpec::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_router_uses_registered_shapes() {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<MySpec, MySpec>("example.com/v1alpha1", "MyManifest");
        let pool: Pool = Pool::new().unwrap();
        let server = TestServer::new(auto_manifest_router(PATH, pool.clone(), registry)).unwrap();

        server.post(PATH).text(BODY).await.assert_status_ok();
        let stored = pool.get_by_key(&ManifestKey::new("example.com/v1alpha1", "MyManifest", "my-manifest-1")).unwrap();
        assert_eq!(stored.spec.downcast_ref::<MySpec>().map(|s| s.message.as_str()), Some("hello, world"));
        assert!(stored.errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_router_without_registration_reports_unresolved() {
        let pool: Pool = Pool::new().unwrap();
        let server = TestServer::new(auto_manifest_router(PATH, pool.clone(), Arc::new(TypeRegistry::new()))).unwrap();

        let response = server.post(PATH).text(BODY).await;
        response.assert_status_ok();
        let stored = pool.get_by_key(&ManifestKey::new("example.com/v1alpha1", "MyManifest", "my-manifest-1")).unwrap();
        assert_eq!(stored.errors.len(), 2);
        assert!(matches!(stored.errors[0], ManifestError::UnresolvedType { field: PayloadField::Spec, .. }));
    }
}

mod client {
    use super::*;

    async fn serve(pool: Pool<MySpec, MySpec>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = manifest_router(PATH, pool);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_round_trips_through_a_pool() {
        let pool: Pool<MySpec, MySpec> = Pool::new().unwrap();
        let endpoint = serve(pool.clone()).await;
        let client = ManifestClient::new(endpoint, "roster-test");

        let mut m: MyManifest = Manifest::new("example.com/v1alpha1", "MyManifest", "sent");
        m.spec.message = "over the wire".into();
        let reply = client.send(&m).await.unwrap();

        assert_eq!(reply, m);
        assert_eq!(pool.get_by_key(&m.key()).unwrap().spec.message, "over the wire");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_to_unknown_path_is_a_status_error() {
        let pool: Pool<MySpec, MySpec> = Pool::new().unwrap();
        let endpoint = serve(pool).await;
        let client = ManifestClient::new(endpoint, "roster-test");

        let m: MyManifest = Manifest::new("example.com/v1", "Other", "x");
        match client.send(&m).await {
            Err(roster_api::ClientError::Status { status, .. }) => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_auto_decodes_reply_with_registry() {
        let registry = TypeRegistry::new();
        registry.register::<MySpec, MySpec>("example.com/v1alpha1", "MyManifest");
        let pool: Pool<MySpec, MySpec> = Pool::new().unwrap();
        let endpoint = serve(pool).await;
        let client = ManifestClient::new(endpoint, "roster-test");

        let m = registry.auto_parse(BODY).unwrap();
        let reply = client.send_auto(&m, &registry).await.unwrap();
        assert_eq!(reply.spec.downcast_ref::<MySpec>(), Some(&MySpec { message: "hello, world".into() }));
    }
}
