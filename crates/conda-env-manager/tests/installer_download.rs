use conda_env_manager::{EnvError, HttpInstallerSource, InstallerSource};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn downloads_installer_to_destination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Miniconda3-Linux-x86_64.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"#!/bin/sh\nexit 0\n".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("nested").join("miniconda.sh");
    let source = HttpInstallerSource::new().unwrap();
    let bytes = source
        .fetch(&format!("{}/Miniconda3-Linux-x86_64.sh", server.uri()), &dest)
        .await
        .unwrap();

    assert_eq!(bytes, 17);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "#!/bin/sh\nexit 0\n");
}

#[tokio::test]
async fn missing_installer_is_a_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = HttpInstallerSource::new().unwrap();
    let err = source
        .fetch(
            &format!("{}/Miniconda3-Linux-aarch64.sh", server.uri()),
            &dir.path().join("miniconda.sh"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EnvError::DownloadStatus { status: 404, .. }));
}

#[tokio::test]
async fn empty_body_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = HttpInstallerSource::new().unwrap();
    let err = source
        .fetch(&server.uri(), &dir.path().join("miniconda.sh"))
        .await
        .unwrap_err();
    assert!(matches!(err, EnvError::EmptyInstaller(_)));
}
