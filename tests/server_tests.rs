use axum::body::Body;
use axum::http::{Request, StatusCode};
use epicenter_sync::room::{RoomManager, RoomManagerConfig};
use epicenter_sync::server::router;
use http_body_util::BodyExt;
use tower::util::ServiceExt;

async fn body_to_string(body: Body) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let rooms = RoomManager::new(RoomManagerConfig::default());
    let app = router(rooms);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_string(response.into_body()).await, "OK");
}

#[tokio::test]
async fn unknown_room_route_upgrades_without_panicking() {
    let rooms = RoomManager::new(RoomManagerConfig::default());
    let app = router(rooms);

    // No `Upgrade` header, so axum rejects the request before it ever
    // reaches `RoomManager::join` — this only checks the route is wired.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/rooms/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_ne!(response.status(), StatusCode::NOT_FOUND);
}
