/// Tests for the upload store: local save/fetch round trips and HTTP
/// downloads against a mock server
use coopcredit_api::config::Config;
use coopcredit_api::errors::AppError;
use coopcredit_api::storage::{FileStore, REPAYMENTS_PREFIX};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(upload_dir: &str, public_base_url: &str) -> Config {
    Config {
        database_url: "postgresql://localhost/test".to_string(),
        port: 0,
        upload_dir: upload_dir.to_string(),
        public_base_url: public_base_url.to_string(),
        webhook_secret: None,
        admin_account_ids: vec![],
    }
}

fn temp_upload_dir(label: &str) -> String {
    let dir = std::env::temp_dir().join(format!(
        "coopcredit-test-{}-{}",
        label,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    dir.to_string_lossy().into_owned()
}

#[cfg(test)]
mod local_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_fetch_round_trip() {
        let dir = temp_upload_dir("roundtrip");
        let store = FileStore::new(&test_config(&dir, "http://localhost:3000/files")).unwrap();

        let payload = b"Name,Phone,Amount Granted\nJane Doe,08011112222,100000\n";
        let stored = store
            .save_repayment_sheet("august repayments.csv", payload)
            .await
            .unwrap();

        assert!(stored.object_name.starts_with(REPAYMENTS_PREFIX));
        assert!(stored.object_name.ends_with("_august_repayments.csv"));
        assert!(stored.url.starts_with("http://localhost:3000/files/repayments/"));

        let fetched = store.fetch(&stored.url).await.unwrap();
        assert_eq!(fetched, payload);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_path_traversal_in_file_name_is_neutralized() {
        let dir = temp_upload_dir("traversal");
        let store = FileStore::new(&test_config(&dir, "http://localhost:3000/files")).unwrap();

        let stored = store
            .save_repayment_sheet("../../etc/passwd", b"x")
            .await
            .unwrap();

        // Only the base name survives, with unsafe characters replaced
        assert!(stored.object_name.ends_with("_passwd"));
        assert!(!stored.object_name.contains(".."));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_fetch_never_resolves_outside_the_upload_dir() {
        let dir = temp_upload_dir("escape");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        // A file that sits next to (not inside) the upload dir must stay
        // unreachable through the public URL space.
        let outside = std::path::Path::new(&dir)
            .parent()
            .unwrap()
            .join("coopcredit-test-outside.txt");
        tokio::fs::write(&outside, b"not yours").await.unwrap();

        let store = FileStore::new(&test_config(&dir, "http://localhost:3000/files")).unwrap();
        let err = store
            .fetch("http://localhost:3000/files/../coopcredit-test-outside.txt")
            .await
            .unwrap_err();
        match err {
            AppError::StorageError(msg) => assert!(msg.contains("Refusing")),
            other => panic!("expected StorageError, got {:?}", other),
        }

        // Absolute segments are refused too
        let err = store
            .fetch("http://localhost:3000/files//etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StorageError(_)));

        tokio::fs::remove_file(&outside).await.ok();
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_fetch_of_missing_local_file_is_a_storage_error() {
        let dir = temp_upload_dir("missing");
        let store = FileStore::new(&test_config(&dir, "http://localhost:3000/files")).unwrap();

        let err = store
            .fetch("http://localhost:3000/files/repayments/nope.xlsx")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StorageError(_)));
    }
}

#[cfg(test)]
mod http_fetch_tests {
    use super::*;

    #[tokio::test]
    async fn test_external_url_downloads_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/repayments/aug.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a,b\n1,2\n".to_vec()))
            .mount(&server)
            .await;

        let dir = temp_upload_dir("http");
        let store = FileStore::new(&test_config(&dir, "http://localhost:3000/files")).unwrap();

        let url = format!("{}/bucket/repayments/aug.csv", server.uri());
        let bytes = store.fetch(&url).await.unwrap();
        assert_eq!(bytes, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/repayments/gone.csv"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = temp_upload_dir("http404");
        let store = FileStore::new(&test_config(&dir, "http://localhost:3000/files")).unwrap();

        let url = format!("{}/bucket/repayments/gone.csv", server.uri());
        let err = store.fetch(&url).await.unwrap_err();
        match err {
            AppError::StorageError(msg) => assert!(msg.contains("404")),
            other => panic!("expected StorageError, got {:?}", other),
        }
    }
}
