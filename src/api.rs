use crate::batcher::Batcher;
use crate::errors::ProxyError;
use crate::fields::Fields;
use crate::types::{Response as GeoResponse, SharedEntry};
use crate::upstream::Client;
use crate::wait::WaitSet;
use http::header;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Serialize;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;

const LANGUAGES: &[&str] = &["en", "de", "es", "pt-BR", "fr", "ja", "zh-CN", "ru"];
const DEFAULT_LANGUAGE: &str = "en";

/// The HTTP front-end: a thin translator from HTTP to batcher operations.
#[derive(Clone)]
pub struct ProxyService {
    batcher: Batcher,
    client: Arc<dyn Client>,
}

impl ProxyService {
    pub fn new(batcher: Batcher, client: Arc<dyn Client>) -> ProxyService {
        ProxyService { batcher, client }
    }

    async fn handle<B>(self, req: Request<B>) -> Result<Response<Full<Bytes>>, ProxyError>
    where
        B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if req.method() == Method::OPTIONS {
            return empty_response(StatusCode::OK);
        }

        let path = req.uri().path().to_string();
        if path == "/json" || path.starts_with("/json/") {
            self.single(&req, &path).await
        } else if path == "/batch" {
            self.batch(req).await
        } else if path == "/debug" {
            json_response(StatusCode::OK, &json!({"fetcher": self.client.debug()}))
        } else {
            empty_response(StatusCode::NOT_FOUND)
        }
    }

    /// `GET /json/{ip}?fields=&lang=`. An empty IP means "my own IP" and
    /// bypasses the batcher.
    async fn single<B>(
        &self,
        req: &Request<B>,
        path: &str,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        let params = QueryParams::from_uri(req.uri());
        let fields = params.fields();

        let lang = match params.lang() {
            Ok(lang) => lang,
            Err(()) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &GeoResponse::error("fail", "invalid language").trim(fields),
                );
            }
        };

        let ip = path.strip_prefix("/json/").unwrap_or("");
        if ip.is_empty() {
            return match self.client.fetch_self(&lang, fields).await {
                Ok(response) => json_response(StatusCode::OK, &response.trim(fields)),
                Err(e) => {
                    tracing::warn!(error = %e, "self lookup failed");
                    json_response(
                        StatusCode::OK,
                        &GeoResponse::error("fail", "error in upstream").trim(fields),
                    )
                }
            };
        }

        if ip.parse::<IpAddr>().is_err() {
            return json_response(
                StatusCode::BAD_REQUEST,
                &GeoResponse::error("fail", "invalid query").trim(fields),
            );
        }

        let (entry, handle) = self.batcher.add(ip, &lang, fields);
        if let Some(handle) = handle {
            handle.wait().await;
        }

        let response = entry.read().response.clone();
        json_response(StatusCode::OK, &response.trim(fields))
    }

    /// `GET|POST /batch?fields=&lang=` with a JSON array body whose elements
    /// are bare IP strings or `{query, fields?, lang?}` objects.
    async fn batch<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ProxyError>
    where
        B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let params = QueryParams::from_uri(req.uri());
        let default_fields = params.fields();

        let default_lang = match params.lang() {
            Ok(lang) => lang,
            Err(()) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &vec![GeoResponse::error("fail", "invalid language").trim(default_fields)],
                );
            }
        };

        let invalid_body = |fields: Fields| {
            vec![GeoResponse::error("fail", "invalid body").trim(fields)]
        };
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => {
                return json_response(StatusCode::BAD_REQUEST, &invalid_body(default_fields));
            }
        };
        let parts: Vec<Value> = match serde_json::from_slice(&body) {
            Ok(parts) => parts,
            Err(_) => {
                return json_response(StatusCode::BAD_REQUEST, &invalid_body(default_fields));
            }
        };

        enum Element {
            Invalid(Fields),
            Pending(SharedEntry, Fields),
        }

        let mut wait_set = WaitSet::new();
        let mut elements = Vec::with_capacity(parts.len());
        for part in &parts {
            match parse_element(part, default_fields, &default_lang) {
                Ok((ip, lang, fields)) => {
                    let (entry, handle) = self.batcher.add(&ip, &lang, fields);
                    if let Some(handle) = handle {
                        wait_set.add(handle);
                    }
                    elements.push(Element::Pending(entry, fields));
                }
                Err(fields) => elements.push(Element::Invalid(fields)),
            }
        }

        wait_set.wait().await;

        let responses: Vec<GeoResponse> = elements
            .into_iter()
            .map(|element| match element {
                Element::Invalid(fields) => {
                    GeoResponse::error("fail", "invalid query").trim(fields)
                }
                Element::Pending(entry, fields) => entry.read().response.clone().trim(fields),
            })
            .collect();

        json_response(StatusCode::OK, &responses)
    }
}

impl<B> Service<Request<B>> for ProxyService
where
    B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle(req).await })
    }
}

/// Accept loop: every connection is served on its own task with protocol
/// auto-detection. A panicking handler aborts only its connection's task.
pub async fn serve(listener: TcpListener, service: ProxyService) -> Result<(), ProxyError> {
    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let service = service.clone();

        tokio::spawn(async move {
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }
}

struct QueryParams {
    fields: Option<String>,
    lang: Option<String>,
}

impl QueryParams {
    fn from_uri(uri: &Uri) -> QueryParams {
        let mut params = QueryParams { fields: None, lang: None };
        if let Some(query) = uri.query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "fields" => params.fields = Some(value.into_owned()),
                    "lang" => params.lang = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        params
    }

    fn fields(&self) -> Fields {
        match self.fields.as_deref() {
            None | Some("") => Fields::DEFAULT,
            Some(s) => Fields::parse(s),
        }
    }

    fn lang(&self) -> Result<String, ()> {
        match self.lang.as_deref() {
            None | Some("") => Ok(DEFAULT_LANGUAGE.to_string()),
            Some(lang) if LANGUAGES.contains(&lang) => Ok(lang.to_string()),
            Some(_) => Err(()),
        }
    }
}

/// Extracts `(ip, lang, fields)` from one batch element. The error value is
/// the fields mask to trim that element's failure response with.
fn parse_element(
    part: &Value,
    default_fields: Fields,
    default_lang: &str,
) -> Result<(String, String, Fields), Fields> {
    match part {
        Value::String(ip) => {
            if ip.parse::<IpAddr>().is_err() {
                return Err(default_fields);
            }
            Ok((ip.clone(), default_lang.to_string(), default_fields))
        }
        Value::Object(map) => {
            let fields = match map.get("fields") {
                Some(Value::String(s)) => Fields::parse(s),
                Some(Value::Number(n)) => {
                    n.as_u64().map(Fields::from_int).unwrap_or(default_fields)
                }
                _ => default_fields,
            };

            let ip = match map.get("query") {
                Some(Value::String(ip)) if ip.parse::<IpAddr>().is_ok() => ip.clone(),
                _ => return Err(fields),
            };

            // Unknown or mistyped languages fall back to the request default.
            let lang = match map.get("lang") {
                Some(Value::String(lang)) if LANGUAGES.contains(&lang.as_str()) => lang.clone(),
                _ => default_lang.to_string(),
            };

            Ok((ip, lang, fields))
        }
        _ => Err(default_fields),
    }
}

fn response_builder(status: StatusCode) -> http::response::Builder {
    Response::builder()
        .status(status)
        .header(header::CACHE_CONTROL, "public, max-age=1800")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "POST, GET, OPTIONS")
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Content-Length, Accept-Encoding",
        )
        .header(header::CONTENT_TYPE, "application/json")
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    let body = serde_json::to_vec(value)?;
    Ok(response_builder(status).body(Full::new(Bytes::from(body)))?)
}

fn empty_response(status: StatusCode) -> Result<Response<Full<Bytes>>, ProxyError> {
    Ok(response_builder(status).body(Full::new(Bytes::new()))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::MAX_BATCH_ENTRIES;
    use crate::clock::mock::MockClock;
    use crate::testutils::{MockUpstream, mock_response_for};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::{Duration, SystemTime};

    fn test_service() -> (ProxyService, Arc<MockUpstream>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let upstream = Arc::new(MockUpstream::new(clock.clone()));
        let batcher = Batcher::new(1_000_000, upstream.clone(), clock.clone());
        tokio::spawn({
            let batcher = batcher.clone();
            async move { batcher.process_loop().await }
        });
        (ProxyService::new(batcher, upstream.clone()), upstream, clock)
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn call(
        service: &ProxyService,
        req: Request<Full<Bytes>>,
    ) -> (StatusCode, http::HeaderMap, Value) {
        let response = service.call(req).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (parts.status, parts.headers, value)
    }

    #[tokio::test]
    async fn single_lookup() {
        let (service, upstream, _clock) = test_service();

        let (status, headers, body) = call(&service, get("/json/1.1.1.1?fields=8209")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            body,
            json!({"country": "Some Country", "city": "Some City", "query": "1.1.1.1"})
        );
        assert_eq!(upstream.batches().len(), 1);
    }

    #[tokio::test]
    async fn mixed_batch_coalesces_into_one_upstream_call() {
        let (service, upstream, _clock) = test_service();

        let body = r#"[{"query": "1.1.1.1", "fields": 8209, "lang": "ja"}, "2.2.2.2"]"#;
        let (status, _, value) = call(&service, post("/batch", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value,
            json!([
                {
                    "country": "Some japanese Country",
                    "city": "Some japanese City",
                    "query": "1.1.1.1"
                },
                {
                    "status": "success",
                    "country": "Some other Country",
                    "countryCode": "SO",
                    "region": "SX",
                    "regionName": "Some other Region",
                    "city": "Some other City",
                    "zip": "some other zip",
                    "lat": 13.0,
                    "lon": 37.0,
                    "timezone": "some/timezone",
                    "isp": "Some other ISP",
                    "org": "Some other Org",
                    "as": "Some other AS",
                    "query": "2.2.2.2"
                }
            ])
        );

        let batches = upstream.batches();
        assert_eq!(batches.len(), 1);
        let mut keys = batches[0].clone();
        keys.sort();
        assert_eq!(keys, ["1.1.1.1ja", "2.2.2.2en"]);
    }

    #[tokio::test]
    async fn batch_of_150_splits_across_upstream_batches() {
        let (service, upstream, _clock) = test_service();

        let ips: Vec<String> = (0..150).map(|i| format!("10.0.0.{i}")).collect();
        let body = serde_json::to_string(&ips).unwrap();
        let (status, _, value) = call(&service, post("/batch", &body)).await;
        assert_eq!(status, StatusCode::OK);

        let responses = value.as_array().unwrap();
        assert_eq!(responses.len(), 150);
        for (ip, response) in ips.iter().zip(responses) {
            assert_eq!(response["query"], json!(ip));
            assert_eq!(response["country"], json!(format!("{ip}en")));
        }

        let batches = upstream.batches();
        assert!(batches.len() >= 2);
        assert!(batches.iter().all(|batch| batch.len() <= MAX_BATCH_ENTRIES));
        // Coalescing: every key was fetched exactly once.
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 150);
    }

    #[tokio::test]
    async fn cache_serves_until_expiry() {
        let (service, upstream, clock) = test_service();

        for _ in 0..3 {
            let (_, _, body) = call(&service, get("/json/1.1.1.1?fields=country,city,query")).await;
            assert_eq!(
                body,
                json!({"country": "Some Country", "city": "Some City", "query": "1.1.1.1"})
            );
            clock.advance(Duration::from_secs(40));
        }

        // The second request hit the cache; the third missed by expiry.
        assert_eq!(upstream.batches().len(), 2);
    }

    #[tokio::test]
    async fn failed_batch_fails_only_its_entries() {
        let (service, upstream, _clock) = test_service();

        let mut ips = vec!["0.0.0.0".to_string()];
        ips.extend((0..149).map(|i| format!("10.1.0.{i}")));
        let body = serde_json::to_string(&ips).unwrap();
        let (status, _, value) = call(&service, post("/batch", &body)).await;
        assert_eq!(status, StatusCode::OK);

        let responses = value.as_array().unwrap();
        assert_eq!(responses.len(), 150);
        assert_eq!(
            responses[0],
            json!({"status": "fail", "message": "error in upstream"})
        );

        // Every entry sharing the poisoned batch reads the error response.
        let batches = upstream.batches();
        let failing = batches
            .iter()
            .find(|batch| batch.iter().any(|key| key == "0.0.0.0en"))
            .unwrap();
        let index: HashMap<&str, usize> = ips
            .iter()
            .enumerate()
            .map(|(i, ip)| (ip.as_str(), i))
            .collect();
        for key in failing {
            let i = index[&key[..key.len() - 2]];
            assert_eq!(responses[i]["status"], json!("fail"));
        }

        // Entries routed to a later batch succeeded.
        let last = ips.last().unwrap();
        assert_eq!(responses[149]["country"], json!(format!("{last}en")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hammer() {
        let (service, _upstream, _clock) = test_service();
        let mut tasks = tokio::task::JoinSet::new();

        fn random_ip() -> String {
            format!("1.1.{}.{}", rand::random::<u8>() % 8, rand::random::<u8>())
        }

        // Batch clients.
        for _ in 0..10 {
            let service = service.clone();
            tasks.spawn(async move {
                for _ in 0..50 {
                    let count = 1 + rand::random::<usize>() % 20;
                    let ips: Vec<String> = (0..count).map(|_| random_ip()).collect();
                    let expected: Vec<Value> = ips
                        .iter()
                        .map(|ip| {
                            serde_json::to_value(
                                mock_response_for(&format!("{ip}en")).trim(Fields::DEFAULT),
                            )
                            .unwrap()
                        })
                        .collect();

                    let body = serde_json::to_string(&ips).unwrap();
                    let (status, _, value) = call(&service, post("/batch", &body)).await;
                    assert_eq!(status, StatusCode::OK);
                    assert_eq!(value, Value::Array(expected));

                    tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 5)).await;
                }
            });
        }

        // Single-lookup clients.
        for _ in 0..30 {
            let service = service.clone();
            tasks.spawn(async move {
                for _ in 0..50 {
                    let ip = random_ip();
                    let expected = serde_json::to_value(
                        mock_response_for(&format!("{ip}en")).trim(Fields::from_int(8209)),
                    )
                    .unwrap();

                    let (status, _, value) =
                        call(&service, get(&format!("/json/{ip}?fields=8209"))).await;
                    assert_eq!(status, StatusCode::OK);
                    assert_eq!(value, expected);

                    tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 5)).await;
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    }

    #[tokio::test]
    async fn self_lookup_bypasses_batcher() {
        let (service, upstream, _clock) = test_service();

        let (status, _, body) = call(&service, get("/json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"status": "success", "country": "Self Country", "query": "198.51.100.1"})
        );
        assert!(upstream.batches().is_empty());
    }

    #[tokio::test]
    async fn invalid_ip_is_bad_request() {
        let (service, _, _) = test_service();

        let (status, _, body) = call(&service, get("/json/notanip")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"status": "fail", "message": "invalid query"}));
    }

    #[tokio::test]
    async fn invalid_language_is_bad_request() {
        let (service, _, _) = test_service();

        let (status, _, body) = call(&service, get("/json/1.1.1.1?lang=xx")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"status": "fail", "message": "invalid language"}));
    }

    #[tokio::test]
    async fn batch_rejects_unparseable_body() {
        let (service, _, _) = test_service();

        let (status, _, body) = call(&service, post("/batch", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!([{"status": "fail", "message": "invalid body"}]));
    }

    #[tokio::test]
    async fn batch_per_element_errors_and_fallbacks() {
        let (service, _, _) = test_service();

        let body = r#"[
            "notanip",
            {"fields": 8209},
            {"query": "1.1.1.1", "lang": "xx", "fields": "country,city,query"},
            42
        ]"#;
        let (status, _, value) = call(&service, post("/batch", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value,
            json!([
                // Invalid elements trim their error to the applicable mask:
                // the default mask keeps status and message...
                {"status": "fail", "message": "invalid query"},
                // ...while 8209 (country|city|query) keeps neither.
                {},
                // Unknown per-element language falls back to the default.
                {"country": "Some Country", "city": "Some City", "query": "1.1.1.1"},
                {"status": "fail", "message": "invalid query"}
            ])
        );
    }

    #[tokio::test]
    async fn options_preflight_gets_cors_headers() {
        let (service, _, _) = test_service();

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/json/1.1.1.1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, headers, _) = call(&service, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "POST, GET, OPTIONS"
        );
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=1800"
        );
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (service, _, _) = test_service();

        for path in ["/", "/bla", "/jsons", "/batch/", "/batchasd"] {
            let (status, _, _) = call(&service, get(path)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "path {path}");
        }
    }

    #[tokio::test]
    async fn debug_exposes_fetcher_state() {
        let (service, _, _) = test_service();

        let (status, _, body) = call(&service, get("/debug")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"fetcher": null}));
    }
}
