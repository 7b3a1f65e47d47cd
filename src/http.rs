//! HTTP API for the learning platform and the bot
//!
//! ## Linking
//! - `POST /link/code` - Issue a verification code for a platform user
//! - `POST /link/redeem` - Redeem a code on behalf of a bot user
//! - `GET /link/{platformUserId}` - Link status
//! - `DELETE /link/{platformUserId}` - Remove a user's link (admin)
//!
//! ## Events
//! - `POST /events/quiz-submitted` - One answered question
//! - `POST /events/attempt-submitted` - A whole quiz attempt
//!
//! ## Performance
//! - `GET /performance/{externalUserId}` - Per-topic records, weakest first
//! - `GET /performance/{externalUserId}/summary` - Totals across topics
//! - `DELETE /performance/{externalUserId}` - Reset a user's records (admin)
//! - `GET /topics` - Classifier catalogue
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST -d '{"platformUserId": 42}' http://localhost:8095/link/code
//!
//! curl -X POST -d '{"code": "123456", "externalUserId": "tg-900", "externalUsername": "alice"}' \
//!      http://localhost:8095/link/redeem
//!
//! curl -X POST -d '{"platformUserId": 42, "activityTitle": "Tema 1 - Constitución", "correct": true}' \
//!      http://localhost:8095/events/quiz-submitted
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{RedeemError, StorageError};
use crate::ingest::{AttemptSubmission, IngestCoordinator, QuizSubmission};

/// Request body of `POST /link/code`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCodeRequest {
    platform_user_id: i64,
}

/// Request body of `POST /link/redeem`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedeemRequest {
    code: String,
    external_user_id: String,
    #[serde(default)]
    external_username: Option<String>,
}

/// HTTP server state
pub struct HttpServer {
    coordinator: Arc<IngestCoordinator>,
    db: Arc<Database>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(coordinator: Arc<IngestCoordinator>, db: Arc<Database>, bind_addr: SocketAddr) -> Self {
        Self {
            coordinator,
            db,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), StorageError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().trim_end_matches('/').to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let decoded = match decode_segments(&path) {
            Ok(decoded) => decoded,
            Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
        };
        let segments: Vec<&str> = decoded.iter().map(String::as_str).collect();

        let result = match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => self.handle_health(),

            (&Method::POST, ["link", "code"]) => self.handle_issue_code(req).await,
            (&Method::POST, ["link", "redeem"]) => self.handle_redeem(req).await,
            (&Method::GET, ["link", id]) => self.handle_link_status(id),
            (&Method::DELETE, ["link", id]) => self.handle_unlink(id),

            (&Method::POST, ["events", "quiz-submitted"]) => self.handle_quiz_submitted(req).await,
            (&Method::POST, ["events", "attempt-submitted"]) => self.handle_attempt_submitted(req).await,

            (&Method::GET, ["performance", user]) => self.handle_performance(user),
            (&Method::GET, ["performance", user, "summary"]) => self.handle_summary(user),
            (&Method::DELETE, ["performance", user]) => self.handle_reset(user),

            (&Method::GET, ["topics"]) => self.handle_topics(),

            _ => Ok(error_response(StatusCode::NOT_FOUND, "Not Found")),
        };

        match result {
            Ok(response) => Ok(response),
            Err(StorageError::InvalidInput(msg)) => Ok(error_response(StatusCode::BAD_REQUEST, &msg)),
            Err(e) => {
                error!(method = %method, path = %path, error = %e, "Request error");
                Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
            }
        }
    }

    /// GET /health
    fn handle_health(&self) -> Result<Response<Full<Bytes>>, StorageError> {
        let stats = self.db.stats()?;
        let body = serde_json::json!({
            "status": "ok",
            "pending_codes": stats.pending_codes,
            "linked_accounts": stats.linked_accounts,
            "performance_records": stats.performance_records,
            "topics": self.coordinator.classifier().topics().len(),
        });
        Ok(json_response(StatusCode::OK, &body))
    }

    /// POST /link/code
    async fn handle_issue_code<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, StorageError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let request: IssueCodeRequest = read_json(req).await?;
        let code = self.coordinator.issue_code(request.platform_user_id)?;
        Ok(json_response(StatusCode::CREATED, &code))
    }

    /// POST /link/redeem
    async fn handle_redeem<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, StorageError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let request: RedeemRequest = read_json(req).await?;
        if request.external_user_id.trim().is_empty() {
            return Err(StorageError::InvalidInput("externalUserId is required".to_string()));
        }

        match self.coordinator.redeem(
            &request.code,
            &request.external_user_id,
            request.external_username.as_deref(),
        ) {
            Ok(link) => Ok(json_response(StatusCode::OK, &link)),
            Err(RedeemError::Storage(e)) => Err(e),
            Err(e) => {
                let status = match e {
                    RedeemError::NotFound => StatusCode::NOT_FOUND,
                    RedeemError::Expired => StatusCode::GONE,
                    _ => StatusCode::CONFLICT,
                };
                Ok(error_response(status, &e.to_string()))
            }
        }
    }

    /// GET /link/{platformUserId}
    fn handle_link_status(&self, id: &str) -> Result<Response<Full<Bytes>>, StorageError> {
        let platform_user_id = parse_platform_user_id(id)?;
        let status = self.coordinator.links().status(platform_user_id)?;
        Ok(json_response(StatusCode::OK, &status))
    }

    /// DELETE /link/{platformUserId}
    fn handle_unlink(&self, id: &str) -> Result<Response<Full<Bytes>>, StorageError> {
        let platform_user_id = parse_platform_user_id(id)?;
        let removed = self.coordinator.links().unlink(platform_user_id)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({ "removed": removed })))
    }

    /// POST /events/quiz-submitted
    async fn handle_quiz_submitted<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, StorageError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let submission: QuizSubmission = read_json(req).await?;
        let outcome = self.coordinator.on_quiz_submitted(&submission)?;
        Ok(json_response(StatusCode::OK, &outcome))
    }

    /// POST /events/attempt-submitted
    async fn handle_attempt_submitted<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, StorageError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let attempt: AttemptSubmission = read_json(req).await?;
        let outcome = self.coordinator.on_attempt_submitted(&attempt)?;
        Ok(json_response(StatusCode::OK, &outcome))
    }

    /// GET /performance/{externalUserId}
    fn handle_performance(&self, user: &str) -> Result<Response<Full<Bytes>>, StorageError> {
        let records = self.coordinator.performance().get_by_user(user)?;
        Ok(json_response(StatusCode::OK, &records))
    }

    /// GET /performance/{externalUserId}/summary
    fn handle_summary(&self, user: &str) -> Result<Response<Full<Bytes>>, StorageError> {
        let summary = self.coordinator.performance().summary(user)?;
        Ok(json_response(StatusCode::OK, &summary))
    }

    /// DELETE /performance/{externalUserId}
    fn handle_reset(&self, user: &str) -> Result<Response<Full<Bytes>>, StorageError> {
        let removed = self.coordinator.performance().reset_user(user)?;
        Ok(json_response(StatusCode::OK, &serde_json::json!({ "removed": removed })))
    }

    /// GET /topics
    fn handle_topics(&self) -> Result<Response<Full<Bytes>>, StorageError> {
        let classifier = self.coordinator.classifier();
        let body = serde_json::json!({
            "topics": classifier.topics(),
            "fallback": classifier.fallback(),
        });
        Ok(json_response(StatusCode::OK, &body))
    }
}

/// Split a path into percent-decoded segments
fn decode_segments(path: &str) -> Result<Vec<String>, StorageError> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .map_err(|_| StorageError::InvalidInput(format!("Invalid path segment: {}", segment)))
        })
        .collect()
}

fn parse_platform_user_id(raw: &str) -> Result<i64, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::InvalidInput(format!("Invalid platform user id: {}", raw)))
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, StorageError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| StorageError::InvalidInput(format!("Failed to read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| StorageError::InvalidInput(format!("Invalid JSON body: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            let mut response = Response::new(Full::new(Bytes::from_static(b"Serialization failed")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TopicClassifier;
    use crate::clock::{Clock, ManualClock};
    use crate::db::{LinkStore, PerformanceStore};
    use crate::notifier::{Dispatcher, NoopNotifier};

    fn server() -> (HttpServer, Arc<ManualClock>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let coordinator = IngestCoordinator::new(
            Arc::new(LinkStore::new(db.clone(), dyn_clock.clone())),
            Arc::new(PerformanceStore::new(db.clone(), dyn_clock.clone())),
            Arc::new(TopicClassifier::default()),
            Dispatcher::new(Arc::new(NoopNotifier)),
            dyn_clock,
        );
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        (HttpServer::new(Arc::new(coordinator), db, addr), clock)
    }

    async fn call(
        server: &HttpServer,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body)))
            .unwrap();

        let response = server.handle_request(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_link_then_record_over_http() {
        let (server, _) = server();

        let (status, issued) = call(
            &server,
            Method::POST,
            "/link/code",
            Some(serde_json::json!({ "platformUserId": 42 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let code = issued["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);

        let redeem_body = serde_json::json!({
            "code": code,
            "externalUserId": "tg-900",
            "externalUsername": "alice",
        });
        let (status, link) = call(&server, Method::POST, "/link/redeem", Some(redeem_body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(link["platformUserId"], 42);
        assert_eq!(link["externalUserId"], "tg-900");

        let (status, _) = call(&server, Method::POST, "/link/redeem", Some(redeem_body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, linked) = call(&server, Method::GET, "/link/42", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(linked["status"], "linked");

        let (status, outcome) = call(
            &server,
            Method::POST,
            "/events/quiz-submitted",
            Some(serde_json::json!({
                "platformUserId": 42,
                "activityTitle": "Tema 1 - Constitución",
                "correct": true,
                "responseTimeMs": 2500,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "recorded");
        assert_eq!(outcome["topic"], "Constitución Española");

        let (_, records) = call(&server, Method::GET, "/performance/tg-900", None).await;
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["totalQuestions"], 1);

        let (_, summary) = call(&server, Method::GET, "/performance/tg-900/summary", None).await;
        assert_eq!(summary["correctAnswers"], 1);
    }

    #[tokio::test]
    async fn test_redeem_error_statuses() {
        let (server, clock) = server();

        let (status, _) = call(
            &server,
            Method::POST,
            "/link/redeem",
            Some(serde_json::json!({ "code": "000000", "externalUserId": "tg-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, issued) = call(
            &server,
            Method::POST,
            "/link/code",
            Some(serde_json::json!({ "platformUserId": 7 })),
        )
        .await;
        clock.advance(16 * 60);

        let (status, _) = call(
            &server,
            Method::POST,
            "/link/redeem",
            Some(serde_json::json!({ "code": issued["code"], "externalUserId": "tg-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_path_segments_are_percent_decoded() {
        let (server, _) = server();

        let (_, issued) = call(
            &server,
            Method::POST,
            "/link/code",
            Some(serde_json::json!({ "platformUserId": 21 })),
        )
        .await;
        let (status, _) = call(
            &server,
            Method::POST,
            "/link/redeem",
            Some(serde_json::json!({ "code": issued["code"], "externalUserId": "tg 900/a" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        call(
            &server,
            Method::POST,
            "/events/quiz-submitted",
            Some(serde_json::json!({ "platformUserId": 21, "activityTitle": "OTAN", "correct": true })),
        )
        .await;

        let (status, records) = call(&server, Method::GET, "/performance/tg%20900%2Fa", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["externalUserId"], "tg 900/a");

        let (_, summary) = call(&server, Method::GET, "/performance/tg%20900%2Fa/summary", None).await;
        assert_eq!(summary["totalQuestions"], 1);

        let (status, _) = call(&server, Method::GET, "/performance/%FF", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (server, _) = server();

        let (status, _) = call(&server, Method::GET, "/link/not-a-number", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&server, Method::POST, "/events/quiz-submitted", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Invalid JSON"));

        let (status, _) = call(&server, Method::GET, "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unlinked_submission_and_catalogue() {
        let (server, _) = server();

        let (status, outcome) = call(
            &server,
            Method::POST,
            "/events/attempt-submitted",
            Some(serde_json::json!({
                "platformUserId": 5,
                "activityTitle": "OTAN",
                "questionResults": [true, false],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "unlinked");

        let (_, topics) = call(&server, Method::GET, "/topics", None).await;
        assert_eq!(topics["fallback"], "general");
        assert_eq!(topics["topics"][0], "Constitución Española");

        let (_, health) = call(&server, Method::GET, "/health", None).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["linked_accounts"], 0);
    }
}
