mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use arxiv_notifier::store::operations::subscribers::Recipient;
use common::app::{spawn_test_server, ADMIN_TOKEN};
use common::fakes::fresh_paper;
use common::http::{assert_json_error, assert_status_ok_json, bearer, request, response_json};

fn admin() -> Vec<(&'static str, String)> {
    vec![bearer(ADMIN_TOKEN)]
}

#[tokio::test]
async fn it_requires_admin_token() {
    let app = spawn_test_server().await;

    let missing = request(&app.app, Method::GET, "/api/subscribers", None, &[]).await;
    let (status, _, body) = response_json(missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_json_error(&body, "AUTH_UNAUTHORIZED");

    let wrong = request(
        &app.app,
        Method::GET,
        "/api/subscribers",
        None,
        &[bearer("not-the-token")],
    )
    .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn it_upsert_then_get_subscriber() {
    let app = spawn_test_server().await;

    let resp = request(
        &app.app,
        Method::PUT,
        "/api/subscribers/telegram/42",
        Some(json!({
            "description": "vision group",
            "searchQueries": [{"query": "cat:cs.CV", "maxResults": 5}],
            "schedule": "daily 08:30",
            "sinceDays": 3
        })),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(resp).await;
    assert_status_ok_json(status, &body);
    assert_eq!(body["data"]["effectiveSchedule"], "daily 08:30");
    assert_eq!(body["data"]["sinceDays"], 3);

    let resp = request(&app.app, Method::GET, "/api/subscribers/telegram/42", None, &admin()).await;
    let (status, _, body) = response_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["description"], "vision group");
    assert_eq!(body["data"]["searchQueries"][0]["query"], "cat:cs.CV");
    assert_eq!(body["data"]["recipient"]["chatId"], "42");
    // 从未推送过，下次推送时间即现在
    assert!(body["data"]["nextDue"].is_string());
}

#[tokio::test]
async fn it_upsert_rejects_invalid_input() {
    let app = spawn_test_server().await;

    let over_cap = request(
        &app.app,
        Method::PUT,
        "/api/subscribers/telegram/1",
        Some(json!({"searchQueries": [{"query": "a", "maxResults": 500}]})),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(over_cap).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_error(&body, "VALIDATION_ERROR");

    let dup = request(
        &app.app,
        Method::PUT,
        "/api/subscribers/telegram/1",
        Some(json!({"searchQueries": [
            {"query": "a", "maxResults": 1},
            {"query": " a ", "maxResults": 2}
        ]})),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(dup).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_json_error(&body, "DUPLICATE_QUERY");

    let schedule = request(
        &app.app,
        Method::PUT,
        "/api/subscribers/telegram/1",
        Some(json!({"schedule": "weekly"})),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(schedule).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_error(&body, "INVALID_SCHEDULE");

    let since = request(
        &app.app,
        Method::PUT,
        "/api/subscribers/telegram/1",
        Some(json!({"sinceDays": 0})),
        &admin(),
    )
    .await;
    assert_eq!(since.status(), StatusCode::BAD_REQUEST);

    // 超出范围的值会让时间运算溢出，必须在入口拒绝
    for body in [
        json!({"sinceDays": 4_294_967_295_u64}),
        json!({"sinceDays": 3651}),
        json!({"schedule": "4294967295h"}),
    ] {
        let resp = request(
            &app.app,
            Method::PUT,
            "/api/subscribers/telegram/1",
            Some(body.clone()),
            &admin(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body} accepted");
    }

    let platform = request(&app.app, Method::GET, "/api/subscribers/slack/1", None, &admin()).await;
    assert_eq!(platform.status(), StatusCode::BAD_REQUEST);

    assert!(app.store.get_subscriber(&Recipient::telegram(1)).unwrap().is_none());
}

#[tokio::test]
async fn it_malformed_body_is_json_error() {
    let app = spawn_test_server().await;

    let req = axum::http::Request::builder()
        .method(Method::PUT)
        .uri("/api/subscribers/telegram/1")
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"))
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let resp = tower::ServiceExt::oneshot(app.app.clone(), req).await.unwrap();
    let (status, _, body) = response_json(resp).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_error(&body, "INVALID_REQUEST_BODY");
    assert!(body["traceId"].is_string());

    let wrong_type = request(
        &app.app,
        Method::PUT,
        "/api/subscribers/telegram/1",
        Some(json!({"sinceDays": "soon"})),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(wrong_type).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_json_error(&body, "INVALID_FIELD");
    assert!(body["message"].as_str().unwrap().contains("sinceDays"));
}

#[tokio::test]
async fn it_query_add_and_remove() {
    let app = spawn_test_server().await;

    let resp = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/7/queries",
        Some(json!({"query": "cat:cs.CL", "maxResults": 3})),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(resp).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // 未指定 maxResults 时使用默认值
    let resp = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/7/queries",
        Some(json!({"query": "all:diffusion"})),
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(resp).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"][1]["maxResults"], 10);

    let dup = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/7/queries",
        Some(json!({"query": "cat:cs.CL"})),
        &admin(),
    )
    .await;
    assert_eq!(dup.status(), StatusCode::CONFLICT);

    let removed = request(
        &app.app,
        Method::DELETE,
        "/api/subscribers/telegram/7/queries/1",
        None,
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(removed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["query"], "cat:cs.CL");

    let missing = request(
        &app.app,
        Method::DELETE,
        "/api/subscribers/telegram/7/queries/5",
        None,
        &admin(),
    )
    .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let sub = app.store.get_subscriber(&Recipient::telegram(7)).unwrap().unwrap();
    assert_eq!(sub.search_queries.len(), 1);
    assert_eq!(sub.search_queries[0].query, "all:diffusion");
}

#[tokio::test]
async fn it_list_filters_by_platform() {
    let app = spawn_test_server().await;
    for path in [
        "/api/subscribers/telegram/1",
        "/api/subscribers/telegram/2",
        "/api/subscribers/matrix/!room:example.org",
    ] {
        let resp = request(&app.app, Method::PUT, path, Some(json!({})), &admin()).await;
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }

    let all = request(&app.app, Method::GET, "/api/subscribers", None, &admin()).await;
    let (_, _, body) = response_json(all).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 3);

    let tg = request(
        &app.app,
        Method::GET,
        "/api/subscribers?platform=telegram",
        None,
        &admin(),
    )
    .await;
    let (_, _, body) = response_json(tg).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn it_fetch_now_delivers_and_records() {
    let app = spawn_test_server().await;
    app.index.set(
        "cat:cs.CV",
        vec![fresh_paper("2401.00001v1"), fresh_paper("2401.00002v1")],
    );
    app.store
        .add_search_query(&Recipient::telegram(42), "cat:cs.CV", 5, 20)
        .unwrap();

    let resp = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/42/fetch",
        None,
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(resp).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sent"], 2);
    assert_eq!(app.telegram.sent().len(), 2);

    // 再次抓取不会重复推送
    let again = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/42/fetch",
        None,
        &admin(),
    )
    .await;
    let (_, _, body) = response_json(again).await;
    assert_eq!(body["data"]["sent"], 0);
    assert_eq!(body["data"]["skipped"], 2);

    let history = request(
        &app.app,
        Method::GET,
        "/api/subscribers/telegram/42/deliveries?limit=1",
        None,
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(history).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["status"], "delivered");
}

#[tokio::test]
async fn it_fetch_now_errors() {
    let app = spawn_test_server().await;

    let unknown = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/404/fetch",
        None,
        &admin(),
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    app.index.fail("cat:cs.AI");
    app.store
        .add_search_query(&Recipient::telegram(5), "cat:cs.AI", 5, 20)
        .unwrap();
    let failing = request(
        &app.app,
        Method::POST,
        "/api/subscribers/telegram/5/fetch",
        None,
        &admin(),
    )
    .await;
    let (status, _, body) = response_json(failing).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_json_error(&body, "ARXIV_UNAVAILABLE");
    assert!(app
        .store
        .get_subscriber(&Recipient::telegram(5))
        .unwrap()
        .unwrap()
        .last_check
        .is_none());
}

#[tokio::test]
async fn it_delete_subscriber() {
    let app = spawn_test_server().await;
    app.store
        .add_search_query(&Recipient::telegram(9), "q", 1, 20)
        .unwrap();

    let resp = request(&app.app, Method::DELETE, "/api/subscribers/telegram/9", None, &admin()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let again = request(&app.app, Method::DELETE, "/api/subscribers/telegram/9", None, &admin()).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}
