pub mod routes;
pub mod state;
mod ws;

use axum::Router;

pub use state::AppState;

pub fn app(state: AppState) -> Router {
    routes::router(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use tower::ServiceExt;

    use crate::{app, state::AppState};

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn wait_terminal(app: &Router, run_id: &str) -> Value {
        for _ in 0..2_000 {
            let (_, body) = send(app, get(&format!("/runs/{run_id}/status"))).await;
            if matches!(body["status"].as_str(), Some("COMPLETED" | "FAILED" | "ABORTED")) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn post_runs_accepts_a_backtest_and_serves_its_result() {
        let app = app(AppState::for_test());

        let request = post_json(
            "/runs",
            json!({"kind": "BACKTEST", "backtest": {"symbols": ["AAA", "BBB"]}}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        let run_id = body["runId"].as_str().unwrap().to_string();
        assert_eq!(body["status"], "QUEUED");
        assert_eq!(location, format!("/runs/{run_id}/status"));

        let status = wait_terminal(&app, &run_id).await;
        assert_eq!(status["status"], "COMPLETED");
        assert_eq!(status["success"], true);
        assert_eq!(status["progress"]["percentComplete"], 100.0);
        assert!(status.get("result").is_none());

        let (code, result) = send(&app, get(&format!("/runs/{run_id}/result"))).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(result["result"]["kind"], "BACKTEST");
        assert_eq!(result["resultHash"].as_str().map(str::len), Some(64));

        let (code, listing) = send(&app, get("/runs?limit=5")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(listing["runs"][0]["runId"], run_id.as_str());
    }

    #[tokio::test]
    async fn trade_journal_is_served_as_csv() {
        let state = AppState::for_test();
        let app = app(state.clone());

        let (_, body) = send(
            &app,
            post_json("/runs", json!({"backtest": {"symbols": ["AAA"]}})),
        )
        .await;
        let run_id = body["runId"].as_str().unwrap().to_string();
        wait_terminal(&app, &run_id).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/runs/{run_id}/trades.csv")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let expected = state.orchestrator().trades_csv(&run_id).unwrap().unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), expected);

        let (code, _) = send(&app, get("/runs/missing/trades.csv")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejected_runs_return_structured_errors() {
        let app = app(AppState::for_test());

        let (code, body) = send(&app, post_json("/runs", json!({"backtest": {"symbols": []}}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "CONFIG_INVALID");

        let (code, body) = send(&app, post_json("/runs", json!({"backtest": {"symbols": ["ZZZ"]}}))).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "DATA_NOT_FOUND");

        let fast: Vec<usize> = (1..=40).collect();
        let slow: Vec<usize> = (41..=80).collect();
        let grid = json!({
            "kind": "GRID_SEARCH",
            "backtest": {"symbols": ["AAA"]},
            "grid": {"fastPeriod": fast, "slowPeriod": slow}
        });
        let (code, body) = send(&app, post_json("/runs", grid)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "TOO_MANY_COMBINATIONS");

        let malformed = Request::post("/runs")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (code, body) = send(&app, malformed).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "CONFIG_INVALID");

        let (_, listing) = send(&app, get("/runs")).await;
        assert_eq!(listing["runs"], json!([]));
    }

    #[tokio::test]
    async fn unknown_runs_are_not_found() {
        let app = app(AppState::for_test());

        let (code, body) = send(&app, get("/runs/nope/status")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["status"], Value::Null);

        let request = Request::delete("/runs/nope").body(Body::empty()).unwrap();
        let (code, _) = send(&app, request).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_aborts_and_repeats_idempotently() {
        let app = app(AppState::for_test());

        let config = json!({
            "kind": "MONTE_CARLO",
            "backtest": {"symbols": ["AAA", "BBB"]},
            "monteCarlo": {"simulations": 5000}
        });
        let (code, body) = send(&app, post_json("/runs", config)).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        let run_id = body["runId"].as_str().unwrap().to_string();

        let abort = || Request::delete(format!("/runs/{run_id}")).body(Body::empty()).unwrap();
        let (code, _) = send(&app, abort()).await;
        assert_eq!(code, StatusCode::OK);

        let status = wait_terminal(&app, &run_id).await;
        let (code, again) = send(&app, abort()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(again["status"], status["status"]);
    }

    #[tokio::test]
    async fn event_stream_greets_then_forwards_lifecycle_events() {
        let state = AppState::for_test();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_app = app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, server_app).await.unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/events"))
            .await
            .unwrap();

        let next_json = |message: Message| -> Value {
            match message {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        };

        let greeting = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let greeting = next_json(greeting);
        assert_eq!(greeting["event_type"], "connected");
        assert_eq!(greeting["active_runs"], 0);

        let mut config = runtime::JobConfig::default();
        config.backtest.symbols = vec!["AAA".to_string()];
        let run_id = state.orchestrator().enqueue(config).unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(Ok(message)) = socket.next().await {
                let event = next_json(message);
                if event["event_type"] == "status_changed" && event["status"] == "COMPLETED" {
                    return event;
                }
            }
            panic!("stream closed before completion");
        })
        .await
        .unwrap();
        assert_eq!(completed["run_id"], run_id.as_str());
    }
}
