//! Container image store against a mock registry.

mod common;

use arcstore::error::ErrorKind;
use arcstore::{ContainerImageObjectStore, ObjectStorage, RegistryConfig, Tags};
use bytes::Bytes;
use common::{collect, tar_bytes, tar_gz_bytes};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "library/app";
const GZIP_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const PLAIN_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

fn config(server: &MockServer) -> RegistryConfig {
    RegistryConfig::new("app")
        .with_registry(server.uri())
        .with_auth(format!("{}/token", server.uri()), "mock-registry")
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "mock-registry"))
        .and(query_param("scope", format!("repository:{REPO}:pull")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t0k"})))
        .mount(server)
        .await;
}

async fn mount_manifest(server: &MockServer, reference: &str, layers: &[(&str, &str)]) {
    let layers: Vec<_> = layers
        .iter()
        .map(|(media_type, digest)| json!({"mediaType": media_type, "digest": digest, "size": 0}))
        .collect();
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{reference}")))
        .and(header("authorization", "Bearer t0k"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg", "size": 0},
            "layers": layers,
        })))
        .mount(server)
        .await;
}

async fn mount_blob(server: &MockServer, digest: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(server)
        .await;
}

/// Two layers: the upper one edits, whites out and makes a directory opaque
async fn mount_layered_image(server: &MockServer) {
    mount_token(server).await;
    mount_manifest(
        server,
        "latest",
        &[(GZIP_LAYER, "sha256:base"), (PLAIN_LAYER, "sha256:top")],
    )
    .await;

    let base = tar_gz_bytes(&[
        ("./etc/", b""),
        ("./etc/config", b"v1"),
        ("./etc/old", b"old"),
        ("./bin/", b""),
        ("./bin/sh", b"#!"),
        ("./tmp/", b""),
        ("./tmp/a", b"a"),
    ]);
    let top = tar_bytes(&[
        ("etc/config", b"v2"),
        ("etc/.wh.old", b""),
        ("tmp/.wh..wh..opq", b""),
        ("tmp/b", b"b"),
    ]);
    mount_blob(server, "sha256:base", base).await;
    mount_blob(server, "sha256:top", top).await;
}

#[tokio::test]
async fn test_merged_filesystem() {
    let server = MockServer::start().await;
    mount_layered_image(&server).await;
    let store = ContainerImageObjectStore::new(config(&server)).unwrap();

    assert_eq!(&store.download_bytes("etc/config").await.unwrap()[..], b"v2");
    assert_eq!(&store.download_bytes("bin/sh").await.unwrap()[..], b"#!");
    assert!(!store.exists("etc/old").await.unwrap());
    assert!(!store.exists("tmp/a").await.unwrap());
    assert!(store.exists("tmp/b").await.unwrap());
    assert_eq!(
        store.download("etc/old").await.err().unwrap().kind(),
        ErrorKind::NotFound
    );

    let (objects, prefixes) = collect(store.list("").await.unwrap()).await;
    assert!(objects.is_empty());
    assert_eq!(prefixes, vec!["bin/", "etc/", "tmp/"]);

    let (objects, _) = collect(store.list("etc/").await.unwrap()).await;
    assert_eq!(objects, vec!["etc/config"]);
    let (objects, _) = collect(store.list("tmp/").await.unwrap()).await;
    assert_eq!(objects, vec!["tmp/b"]);

    assert_eq!(
        store.layer_digests().await.unwrap(),
        vec!["sha256:base", "sha256:top"]
    );
}

#[tokio::test]
async fn test_mutations_are_read_only() {
    let server = MockServer::start().await;
    let store = ContainerImageObjectStore::new(config(&server)).unwrap();

    for result in [
        store.upload("etc/config", Bytes::from_static(b"x"), Tags::new()).await,
        store.delete("etc/config").await,
        store.update_metadata("etc/config", Tags::new()).await,
    ] {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ReadOnly);
    }
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_token_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let store = ContainerImageObjectStore::new(config(&server)).unwrap();
    let err = store.exists("etc/config").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
}

#[tokio::test]
async fn test_unknown_manifest() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/nope")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store =
        ContainerImageObjectStore::new(config(&server).with_reference("nope")).unwrap();
    let err = store.list("").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_manifest_list_resolves_platform() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"digest": "sha256:arm", "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}},
                {"digest": "sha256:amd", "platform": {"os": "linux", "architecture": "amd64"}},
            ],
        })))
        .mount(&server)
        .await;
    mount_manifest(&server, "sha256:amd", &[(GZIP_LAYER, "sha256:amdlayer")]).await;
    mount_manifest(&server, "sha256:arm", &[(GZIP_LAYER, "sha256:armlayer")]).await;
    mount_blob(&server, "sha256:amdlayer", tar_gz_bytes(&[("arch", b"amd64")])).await;
    mount_blob(&server, "sha256:armlayer", tar_gz_bytes(&[("arch", b"arm64")])).await;

    let amd = ContainerImageObjectStore::new(config(&server)).unwrap();
    assert_eq!(&amd.download_bytes("arch").await.unwrap()[..], b"amd64");

    let arm_config = config(&server).with_platform("linux/arm64/v8");
    let arm = ContainerImageObjectStore::new(arm_config).unwrap();
    assert_eq!(&arm.download_bytes("arch").await.unwrap()[..], b"arm64");

    let windows_config = config(&server).with_platform("windows/amd64");
    let missing = ContainerImageObjectStore::new(windows_config).unwrap();
    assert_eq!(
        missing.exists("arch").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_anonymous_registry_and_close() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/latest")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schemaVersion": 2,
            "layers": [{"mediaType": GZIP_LAYER, "digest": "sha256:only", "size": 0}],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/blobs/sha256:only")))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(tar_gz_bytes(&[("hello", b"hi")])),
        )
        .expect(2)
        .mount(&server)
        .await;

    let anonymous = RegistryConfig::new("app").with_registry(server.uri());
    let store = ContainerImageObjectStore::new(anonymous).unwrap();
    assert!(store.exists("hello").await.unwrap());

    // Closing drops the layers; the next operation pulls again
    store.close().await.unwrap();
    assert_eq!(&store.download_bytes("hello").await.unwrap()[..], b"hi");
}
