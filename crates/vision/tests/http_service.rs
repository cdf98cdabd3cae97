use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use mockito::Matcher;
use vision::{
    BoundingBox, DetectionClient, DetectionError, DetectionService, HealthStatus,
    HttpDetectionService,
};

fn service(url: &str) -> HttpDetectionService {
    HttpDetectionService::new(url, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_detect_posts_multipart_image_and_parses_array() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/detect")
        .match_header("content-type", Matcher::Regex("^multipart/form-data".into()))
        .match_body(Matcher::Regex(r#"name="image""#.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"[{"label":"Bottle","class_id":39,"confidence":0.93,"box":[50.0,60.0,180.0,300.0]},
                {"label":"Soap","confidence":0.41,"box":[1,2,3,4]}]"#,
        )
        .create_async()
        .await;

    let detections = service(&format!("{}/", server.url()))
        .detect(Bytes::from_static(b"jpeg-bytes"))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0].caption(), "BOTTLE 93%");
    assert_eq!(detections[0].bbox, BoundingBox::new(50.0, 60.0, 180.0, 300.0));
    assert_eq!(detections[1].class_id, None);
}

#[tokio::test]
async fn test_object_body_is_invalid_response() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/detect")
        .with_status(200)
        .with_body(r#"{"detections":[]}"#)
        .create_async()
        .await;

    let err = service(&server.url())
        .detect(Bytes::from_static(b"jpeg-bytes"))
        .await
        .unwrap_err();
    assert!(matches!(err, DetectionError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_non_success_status_is_reported_with_body() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/detect")
        .with_status(400)
        .with_body(r#"{"error":"Invalid image format"}"#)
        .create_async()
        .await;

    match service(&server.url())
        .detect(Bytes::from_static(b"jpeg-bytes"))
        .await
    {
        Err(DetectionError::Status { status, body }) => {
            assert_eq!(status, 400);
            assert!(body.contains("Invalid image format"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_service_is_network_error() {
    let err = service("http://127.0.0.1:9")
        .detect(Bytes::from_static(b"jpeg-bytes"))
        .await
        .unwrap_err();
    assert!(matches!(err, DetectionError::Network(_)));
}

#[tokio::test]
async fn test_health_reports_service_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/health")
        .with_status(200)
        .with_body(r#"{"status":"ok","ml_engine":"yolov8m"}"#)
        .create_async()
        .await;

    let client = DetectionClient::new(Arc::new(service(&server.url())));
    assert_eq!(
        client.health().await,
        HealthStatus {
            status: "ok".into(),
            ml_engine: "yolov8m".into(),
        }
    );
}

#[tokio::test]
async fn test_health_is_offline_when_unreachable() {
    let client = DetectionClient::new(Arc::new(service("http://127.0.0.1:9")));
    assert_eq!(client.health().await, HealthStatus::offline());
}
