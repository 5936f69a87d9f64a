/// Inbound control API - the seven controller-facing POST routes
///
/// Authentication lives in the transport collaborator; everything arriving
/// here is already trusted. Validation failures answer HTTP 200 with a
/// `status` string starting `failed,`; only malformed envelopes yield 400.
use std::sync::Arc;

use actix_web::{web, HttpResponse};
use base64::Engine;
use serde_json::{json, Map, Value};
use url::Url;

use crate::monitoring::customer::{Customer, MINIMUM_POLLING_INTERVAL};
use crate::monitoring::host_scheme::HostScheme;
use crate::monitoring::monitor::{Monitor, MonitorSettings};
use crate::monitoring::types::{
    ContentCheckMode, CustomerId, HostSchemeId, Method, MonitorId, PostContentType,
};
use crate::resources;
use crate::tracker::ServiceTracker;

pub struct ApiState {
    pub tracker: Arc<ServiceTracker>,
    /// Handle of the runtime owning the timing wheels and probe tasks.
    /// Handlers enter it so work spawned under a request lands there rather
    /// than on the HTTP worker's runtime.
    pub runtime: tokio::runtime::Handle,
}

pub fn configure(config: &mut web::ServiceConfig) {
    config
        .route("/state/active", web::post().to(state_active))
        .route("/state/inactive", web::post().to(state_inactive))
        .route("/region/change", web::post().to(region_change))
        .route("/loading/get", web::post().to(loading_get))
        .route("/customer/add", web::post().to(customer_add))
        .route("/customer/remove", web::post().to(customer_remove))
        .route("/customer/pause", web::post().to(customer_pause));
}

fn ok_response() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "OK"}))
}

fn status_response(status: String) -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": status}))
}

async fn state_active(state: web::Data<ApiState>, _body: web::Json<Value>) -> HttpResponse {
    let _runtime = state.runtime.enter();
    state.tracker.go_active();
    ok_response()
}

async fn state_inactive(state: web::Data<ApiState>, _body: web::Json<Value>) -> HttpResponse {
    let _runtime = state.runtime.enter();
    state.tracker.go_inactive();
    ok_response()
}

async fn region_change(state: web::Data<ApiState>, body: web::Json<Value>) -> HttpResponse {
    let Some(request) = body.as_object() else {
        return HttpResponse::BadRequest().finish();
    };
    let (Some(region_index), Some(number_regions)) = (
        request.get("region_index").and_then(Value::as_i64),
        request.get("number_regions").and_then(Value::as_i64),
    ) else {
        return HttpResponse::BadRequest().finish();
    };

    if number_regions > 0 && region_index >= 0 && region_index < number_regions {
        let _runtime = state.runtime.enter();
        state.tracker.update_region_data(region_index as u32, number_regions as u32);
        ok_response()
    } else {
        status_response("failed, invalid parameters".to_string())
    }
}

async fn loading_get(state: web::Data<ApiState>, _body: web::Json<Value>) -> HttpResponse {
    let mut single_region = Map::new();
    let mut multi_region = Map::new();

    for (signed_interval, loading) in state.tracker.loading_data() {
        let entry = json!({
            "polled_host_schemes": loading.polled_host_schemes,
            "missed_timing_marks": loading.missed_timing_marks,
            "average_timing_error": loading.average_timing_error,
        });

        let target = if signed_interval < 0 { &mut single_region } else { &mut multi_region };
        let key = signed_interval.unsigned_abs().to_string();
        match target.entry(key).or_insert_with(|| Value::Array(Vec::new())).as_array_mut() {
            Some(array) => array.push(entry),
            None => {}
        }
    }

    HttpResponse::Ok().json(json!({
        "status": "OK",
        "data": {
            "cpu": resources::cpu_utilization(),
            "memory": resources::memory_utilization(),
            "single_region": single_region,
            "multi_region": multi_region,
        }
    }))
}

/// Install the pushed customer trees. Every tree is validated before any is
/// installed; a failure anywhere aborts the whole call.
async fn customer_add(state: web::Data<ApiState>, body: web::Json<Value>) -> HttpResponse {
    let Some(request) = body.as_object() else {
        return HttpResponse::BadRequest().finish();
    };

    let mut customers: Vec<Arc<Customer>> = Vec::with_capacity(request.len());
    for (customer_id_string, customer_value) in request {
        let customer_id = match customer_id_string.parse::<CustomerId>() {
            Ok(id) if id != 0 => id,
            _ => {
                return status_response(format!(
                    "failed, invalid customer ID {customer_id_string}"
                ))
            }
        };

        match generate_customer(customer_id, customer_value) {
            Ok(customer) => customers.push(customer),
            Err(status) => return status_response(status),
        }
    }

    let _runtime = state.runtime.enter();
    for customer in customers {
        state.tracker.remove_customer(customer.id());
        state.tracker.add_customer(customer);
    }

    ok_response()
}

async fn customer_remove(state: web::Data<ApiState>, body: web::Json<Value>) -> HttpResponse {
    let Some(request) = body.as_object() else {
        return HttpResponse::BadRequest().finish();
    };
    if request.len() != 1 {
        return HttpResponse::BadRequest().finish();
    }
    let Some(customer_id) = request.get("customer_id").and_then(Value::as_f64) else {
        return HttpResponse::BadRequest().finish();
    };

    if customer_id < 1.0 || customer_id > u32::MAX as f64 {
        return status_response("failed, invalid customer ID".to_string());
    }

    let _runtime = state.runtime.enter();
    if state.tracker.remove_customer(customer_id as CustomerId) {
        ok_response()
    } else {
        status_response("failed, unknown customer ID".to_string())
    }
}

async fn customer_pause(state: web::Data<ApiState>, body: web::Json<Value>) -> HttpResponse {
    let Some(request) = body.as_object() else {
        return HttpResponse::BadRequest().finish();
    };
    if request.len() != 2 {
        return HttpResponse::BadRequest().finish();
    }
    let (Some(customer_id), Some(pause)) = (
        request.get("customer_id").and_then(Value::as_f64),
        request.get("pause").and_then(Value::as_bool),
    ) else {
        return HttpResponse::BadRequest().finish();
    };

    if customer_id < 1.0 || customer_id > u32::MAX as f64 {
        return status_response("failed, invalid customer ID".to_string());
    }

    state.tracker.set_paused(customer_id as CustomerId, pause);
    ok_response()
}

fn generate_customer(customer_id: CustomerId, value: &Value) -> Result<Arc<Customer>, String> {
    let Some(data) = value.as_object() else {
        return Err(format!("failed, expected object for customer {customer_id}"));
    };

    let (Some(polling_interval_value), Some(host_schemes_value)) =
        (data.get("polling_interval"), data.get("host_schemes"))
    else {
        return Err(format!("failed, missing required fields, customer {customer_id}"));
    };

    let Some(host_schemes) = host_schemes_value.as_object() else {
        return Err(format!("failed, expected host/schemes object, customer {customer_id}"));
    };

    let polling_interval = polling_interval_value.as_i64().unwrap_or(-1);
    if polling_interval < MINIMUM_POLLING_INTERVAL as i64 {
        return Err(format!("failed, invalid polling interval, customer {customer_id}"));
    }

    let customer = Customer::new(
        customer_id,
        data.get("ping").and_then(Value::as_bool).unwrap_or(false),
        data.get("ssl_expiration").and_then(Value::as_bool).unwrap_or(false),
        data.get("latency").and_then(Value::as_bool).unwrap_or(false),
        data.get("multi_region").and_then(Value::as_bool).unwrap_or(false),
        polling_interval as u32,
    );

    for (host_scheme_id_string, host_scheme_value) in host_schemes {
        let host_scheme_id = match host_scheme_id_string.parse::<HostSchemeId>() {
            Ok(id) if id != 0 => id,
            _ => return Err(format!("failed, invalid host/scheme ID {host_scheme_id_string}")),
        };

        let host_scheme = generate_host_scheme(host_scheme_id, host_scheme_value)?;
        customer.add_host_scheme(host_scheme);
    }

    Ok(customer)
}

fn generate_host_scheme(
    host_scheme_id: HostSchemeId,
    value: &Value,
) -> Result<Arc<HostScheme>, String> {
    let Some(data) = value.as_object() else {
        return Err(format!("failed, expected object, host/scheme {host_scheme_id}"));
    };

    let (Some(url_value), Some(monitors_value)) = (data.get("url"), data.get("monitors")) else {
        return Err(format!("failed, missing required fields, host/scheme {host_scheme_id}"));
    };

    let Some(monitors) = monitors_value.as_object() else {
        return Err(format!("failed, expected object, host/scheme {host_scheme_id}"));
    };

    let url = url_value
        .as_str()
        .and_then(|url_string| Url::parse(url_string).ok())
        .ok_or_else(|| format!("failed, invalid URL, host/scheme {host_scheme_id}"))?;

    let host_scheme = HostScheme::new(host_scheme_id, url);

    for (monitor_id_string, monitor_value) in monitors {
        let monitor_id = match monitor_id_string.parse::<MonitorId>() {
            Ok(id) if id != 0 => id,
            _ => return Err(format!("failed, invalid monitors ID {monitor_id_string}")),
        };

        let monitor = generate_monitor(monitor_id, monitor_value)?;
        host_scheme.add_monitor(monitor);
    }

    Ok(host_scheme)
}

fn generate_monitor(monitor_id: MonitorId, value: &Value) -> Result<Arc<Monitor>, String> {
    let Some(data) = value.as_object() else {
        return Err(format!("failed, expected object, monitor ID {monitor_id}"));
    };

    let mut recognized_fields = 0usize;
    let mut settings = MonitorSettings::default();

    match data.get("uri") {
        Some(Value::String(uri)) => {
            settings.path = uri.clone();
            recognized_fields += 1;
        }
        Some(_) => return Err(format!("failed, uri must be a string, monitor {monitor_id}")),
        None => {
            return Err(format!("failed, missing required field \"uri\", monitor ID {monitor_id}"))
        }
    }

    if let Some(method_value) = data.get("method") {
        let method = method_value
            .as_str()
            .and_then(Method::parse)
            .ok_or_else(|| format!("failed, invalid method, monitor ID {monitor_id}"))?;
        settings.method = method;
        recognized_fields += 1;
    }

    if let Some(mode_value) = data.get("content_check_mode") {
        let mode = mode_value.as_str().and_then(ContentCheckMode::parse).ok_or_else(|| {
            format!(
                "failed, invalid content_check_mode, use \"no_check\", \"content_match\", \
                 \"all_keywords\", \"any_keywords\", or \"smart_content_match\", monitor ID {monitor_id}"
            )
        })?;
        settings.content_check_mode = mode;
        recognized_fields += 1;
    }

    if let Some(content_type_value) = data.get("post_content_type") {
        let content_type =
            content_type_value.as_str().and_then(PostContentType::parse).ok_or_else(|| {
                format!(
                    "failed, invalid post_content_type, use \"text\", \"json\", or \"xml\", \
                     monitor ID {monitor_id}"
                )
            })?;
        settings.post_content_type = content_type;
        recognized_fields += 1;
    }

    if let Some(keywords_value) = data.get("keywords") {
        let keywords = keywords_value.as_array().ok_or_else(|| {
            format!(
                "failed, keywords must be an array of RFC4648 base64 encoded values, \
                 monitor ID {monitor_id}"
            )
        })?;
        for keyword in keywords {
            let decoded = keyword
                .as_str()
                .and_then(|encoded| {
                    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
                })
                .ok_or_else(|| {
                    format!(
                        "failed, keyword entries should be base64 encoded as per RFC4648, \
                         monitor ID {monitor_id}"
                    )
                })?;
            settings.keywords.push(decoded);
        }
        recognized_fields += 1;
    }

    if let Some(user_agent_value) = data.get("post_user_agent") {
        let user_agent = user_agent_value
            .as_str()
            .ok_or_else(|| format!("failed, post_user_agent must be a string, monitor ID {monitor_id}"))?;
        settings.user_agent = user_agent.to_string();
        recognized_fields += 1;
    }

    if let Some(post_content_value) = data.get("post_content") {
        let content = post_content_value
            .as_str()
            .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
            .ok_or_else(|| {
                format!(
                    "failed, post_content should be base64 encoded as per RFC4648, \
                     monitor ID {monitor_id}"
                )
            })?;
        settings.post_content = content;
        recognized_fields += 1;
    }

    if recognized_fields != data.len() {
        return Err(format!("failed, unexpected entries, monitor ID {monitor_id}"));
    }

    Ok(Monitor::new(monitor_id, settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::DataAggregator;
    use crate::outbound::ControllerTransport;
    use crate::tracker::ServerStatus;
    use actix_web::{test, App};
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl ControllerTransport for NullTransport {
        async fn post_binary(
            &self,
            _path: &str,
            _body: Vec<u8>,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(json!({"status": "OK"}))
        }

        async fn post_json(
            &self,
            _path: &str,
            _body: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(json!({"status": "OK"}))
        }
    }

    fn test_state() -> web::Data<ApiState> {
        let aggregator = DataAggregator::new(Arc::new(NullTransport));
        let tracker = ServiceTracker::new(Arc::clone(&aggregator), 2).expect("tracker builds");
        aggregator.set_tracker(&tracker);
        web::Data::new(ApiState { tracker, runtime: tokio::runtime::Handle::current() })
    }

    macro_rules! build_service {
        ($state:expr) => {
            test::init_service(
                App::new().app_data($state.clone()).configure(configure),
            )
            .await
        };
    }

    macro_rules! post {
        ($service:expr, $path:expr, $body:expr) => {{
            let request = test::TestRequest::post().uri($path).set_json($body).to_request();
            let reply: Value = test::call_and_read_body_json(&$service, request).await;
            reply
        }};
    }

    fn sample_customer_payload() -> Value {
        json!({
            "42": {
                "polling_interval": 30,
                "ping": false,
                "ssl_expiration": true,
                "latency": true,
                "multi_region": false,
                "host_schemes": {
                    "7": {
                        "url": "https://example.com",
                        "monitors": {
                            "71": {
                                "uri": "/healthz",
                                "method": "get",
                                "content_check_mode": "all_keywords",
                                "keywords": [
                                    base64::engine::general_purpose::STANDARD.encode(b"alpha"),
                                    base64::engine::general_purpose::STANDARD.encode(b"beta")
                                ]
                            },
                            "72": {
                                "uri": "/api/submit",
                                "method": "post",
                                "post_content_type": "json",
                                "post_content": base64::engine::general_purpose::STANDARD.encode(b"{}"),
                                "post_user_agent": "probe/1.0"
                            }
                        }
                    }
                }
            }
        })
    }

    #[actix_web::test]
    async fn state_routes_flip_the_tracker() {
        let state = test_state();
        let service = build_service!(state);

        let reply = post!(service, "/state/active", json!({}));
        assert_eq!(reply["status"], "OK");
        assert_eq!(state.tracker.status(), ServerStatus::Active);

        let reply = post!(service, "/state/inactive", json!({}));
        assert_eq!(reply["status"], "OK");
        assert_eq!(state.tracker.status(), ServerStatus::Inactive);
    }

    #[actix_web::test]
    async fn region_change_validates_parameters() {
        let state = test_state();
        let service = build_service!(state);

        let reply =
            post!(service, "/region/change", json!({"region_index": 1, "number_regions": 3}));
        assert_eq!(reply["status"], "OK");
        assert_eq!(state.tracker.status(), ServerStatus::Active);

        let reply =
            post!(service, "/region/change", json!({"region_index": 3, "number_regions": 3}));
        assert_eq!(reply["status"], "failed, invalid parameters");

        let reply =
            post!(service, "/region/change", json!({"region_index": -1, "number_regions": 2}));
        assert_eq!(reply["status"], "failed, invalid parameters");

        // Missing keys are a malformed envelope.
        let request = test::TestRequest::post()
            .uri("/region/change")
            .set_json(json!({"region_index": 1}))
            .to_request();
        let response = test::call_service(&service, request).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn customer_add_installs_the_tree() {
        let state = test_state();
        let service = build_service!(state);

        let reply = post!(service, "/customer/add", sample_customer_payload());
        assert_eq!(reply["status"], "OK");

        let customer = state.tracker.get_customer(42).expect("customer installed");
        assert_eq!(customer.polling_interval(), 30);
        assert!(customer.supports_latency_measurements());
        assert!(!customer.supports_multi_region_testing());
        assert_eq!(customer.number_host_schemes(), 1);
        assert_eq!(customer.number_monitors(), 2);
        assert!(state.tracker.get_host_scheme(7).is_some());
        assert!(state.tracker.get_monitor(71).is_some());

        let monitor = state.tracker.get_monitor(71).expect("monitor installed");
        let settings = monitor.settings();
        assert_eq!(settings.content_check_mode, ContentCheckMode::AllKeywords);
        assert_eq!(settings.keywords, vec![b"alpha".to_vec(), b"beta".to_vec()]);

        let monitor = state.tracker.get_monitor(72).expect("monitor installed");
        let settings = monitor.settings();
        assert_eq!(settings.method, Method::Post);
        assert_eq!(settings.post_content_type, PostContentType::Json);
        assert_eq!(settings.post_content, b"{}".to_vec());
        assert_eq!(settings.user_agent, "probe/1.0");
    }

    #[actix_web::test]
    async fn customer_add_replaces_an_existing_tree() {
        let state = test_state();
        let service = build_service!(state);

        let reply = post!(service, "/customer/add", sample_customer_payload());
        assert_eq!(reply["status"], "OK");

        let mut replacement = sample_customer_payload();
        replacement["42"]["polling_interval"] = json!(60);
        let reply = post!(service, "/customer/add", replacement);
        assert_eq!(reply["status"], "OK");

        let customer = state.tracker.get_customer(42).expect("customer installed");
        assert_eq!(customer.polling_interval(), 60);
    }

    #[actix_web::test]
    async fn customer_add_rejects_bad_trees_atomically() {
        let state = test_state();
        let service = build_service!(state);

        // Two customers; the second one carries an invalid monitor, so
        // neither is installed.
        let mut payload = sample_customer_payload();
        payload["43"] = json!({
            "polling_interval": 30,
            "host_schemes": {
                "8": {
                    "url": "https://other.example.com",
                    "monitors": {
                        "81": {"uri": "/x", "method": "teleport"}
                    }
                }
            }
        });

        let reply = post!(service, "/customer/add", payload);
        let status = reply["status"].as_str().expect("status string");
        assert!(status.starts_with("failed,"), "unexpected status {status}");
        assert!(state.tracker.get_customer(42).is_none());
        assert!(state.tracker.get_customer(43).is_none());
    }

    #[actix_web::test]
    async fn customer_add_validates_interval_and_ids() {
        let state = test_state();
        let service = build_service!(state);

        let reply = post!(
            service,
            "/customer/add",
            json!({"42": {"polling_interval": 5, "host_schemes": {}}})
        );
        assert_eq!(reply["status"], "failed, invalid polling interval, customer 42");

        let reply = post!(
            service,
            "/customer/add",
            json!({"0": {"polling_interval": 30, "host_schemes": {}}})
        );
        assert_eq!(reply["status"], "failed, invalid customer ID 0");

        let reply = post!(
            service,
            "/customer/add",
            json!({"42": {"polling_interval": 30, "host_schemes": {"7": {
                "url": "https://example.com",
                "monitors": {"71": {"uri": "/x", "surprise": 1}}
            }}}})
        );
        assert_eq!(reply["status"], "failed, unexpected entries, monitor ID 71");
    }

    #[actix_web::test]
    async fn customer_remove_and_pause() {
        let state = test_state();
        let service = build_service!(state);

        post!(service, "/customer/add", sample_customer_payload());

        let reply =
            post!(service, "/customer/pause", json!({"customer_id": 42, "pause": true}));
        assert_eq!(reply["status"], "OK");
        assert!(state.tracker.paused(42));

        let reply = post!(service, "/customer/remove", json!({"customer_id": 999}));
        assert_eq!(reply["status"], "failed, unknown customer ID");

        let reply = post!(service, "/customer/remove", json!({"customer_id": 42}));
        assert_eq!(reply["status"], "OK");
        assert!(state.tracker.get_customer(42).is_none());

        let reply = post!(service, "/customer/remove", json!({"customer_id": 0}));
        assert_eq!(reply["status"], "failed, invalid customer ID");
    }

    #[actix_web::test]
    async fn loading_get_reports_both_region_groups() {
        let state = test_state();
        let service = build_service!(state);

        let mut payload = sample_customer_payload();
        payload["42"]["multi_region"] = json!(true);
        post!(service, "/customer/add", payload);

        let reply = post!(service, "/loading/get", json!({}));
        assert_eq!(reply["status"], "OK");
        assert!(reply["data"]["cpu"].is_number());
        assert!(reply["data"]["memory"].is_number());
        assert!(reply["data"]["multi_region"]["30"].is_array());
        assert!(reply["data"]["single_region"].is_object());
    }

    #[actix_web::test]
    async fn malformed_envelopes_yield_bad_request() {
        let state = test_state();
        let service = build_service!(state);

        let request = test::TestRequest::post()
            .uri("/customer/remove")
            .insert_header(("content-type", "application/json"))
            .set_payload("{ not json")
            .to_request();
        let response = test::call_service(&service, request).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let request = test::TestRequest::post()
            .uri("/customer/remove")
            .set_json(json!({"customer_id": 1, "extra": 2}))
            .to_request();
        let response = test::call_service(&service, request).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
