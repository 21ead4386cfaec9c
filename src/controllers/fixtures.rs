//! Scripted API server for exercising the write paths of the reconcilers

use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub struct ApiServer(ApiServerHandle);

/// A client talking to a scripted API server
pub fn client() -> (Client, ApiServer) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), ApiServer(handle))
}

/// An API error as the server renders it
pub fn api_error(code: StatusCode, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{reason} ({})", code.as_u16()),
        "reason": reason,
        "code": code.as_u16(),
    })
}

impl ApiServer {
    /// Answer the next request, which must be `method path`, and return its body
    pub async fn expect(
        &mut self,
        method: Method,
        path: &str,
        code: StatusCode,
        response: Value,
    ) -> Value {
        self.answer(method, path, |_| (code, response)).await
    }

    /// Answer the next request, which must be `method path`, with the object it carried
    pub async fn expect_echo(&mut self, method: Method, path: &str, code: StatusCode) -> Value {
        self.answer(method, path, |body| (code, body.clone())).await
    }

    async fn answer(
        &mut self,
        method: Method,
        path: &str,
        respond: impl FnOnce(&Value) -> (StatusCode, Value),
    ) -> Value {
        let (request, send) = tokio::time::timeout(Duration::from_secs(5), self.0.next_request())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {method} {path}"))
            .expect("client dropped before sending a request");

        assert_eq!(request.method(), &method, "unexpected method for {}", request.uri());
        assert_eq!(request.uri().path(), path);

        let bytes = request.into_body().collect_bytes().await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        let (code, response) = respond(&body);
        send.send_response(
            Response::builder()
                .status(code)
                .body(Body::from(serde_json::to_vec(&response).unwrap()))
                .unwrap(),
        );

        body
    }

    /// Accept an event publication, echoing the created object
    pub async fn expect_event(&mut self, namespace: &str) -> Value {
        let (request, send) = tokio::time::timeout(Duration::from_secs(5), self.0.next_request())
            .await
            .expect("timed out waiting for an event")
            .expect("client dropped before publishing an event");

        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.uri().path(),
            format!("/apis/events.k8s.io/v1/namespaces/{namespace}/events")
        );

        let bytes = request.into_body().collect_bytes().await.unwrap();
        send.send_response(
            Response::builder()
                .status(StatusCode::CREATED)
                .body(Body::from(bytes.to_vec()))
                .unwrap(),
        );

        serde_json::from_slice(&bytes).unwrap()
    }

    /// Every client is gone and nothing else was asked of the server
    pub async fn done(mut self) {
        let next = tokio::time::timeout(Duration::from_secs(5), self.0.next_request())
            .await
            .expect("clients still alive");
        assert!(
            next.is_none(),
            "unexpected request {:?}",
            next.map(|(req, _)| (req.method().clone(), req.uri().clone()))
        );
    }
}
