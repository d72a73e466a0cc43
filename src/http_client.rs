use actix_web::HttpResponse;
use anyhow::{Context, Result, ensure};
use log::error;
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::Duration;

/// Create the HTTP client used to talk to the device
///
/// `request_timeout` is the default deadline of every request. Test attempts
/// override it per request with the deadline of the test definition.
///
/// # Examples
/// ```no_run
/// use linky_console::http_client::device_http_client;
/// use std::time::Duration;
///
/// let client = device_http_client(Duration::from_secs(10))
///     .expect("failed to create client");
/// ```
pub fn device_http_client(request_timeout: Duration) -> Result<Client> {
    ensure!(
        !request_timeout.is_zero(),
        "failed to create device HTTP client: request timeout must not be zero"
    );

    Client::builder()
        .timeout(request_timeout)
        .build()
        .context("failed to create device HTTP client")
}

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for () {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().finish()
    }
}

impl ServiceResultResponse for serde_json::Value {
    fn into_response(self) -> HttpResponse {
        json_response(HttpResponse::Ok(), &self)
    }
}

impl ServiceResultResponse for crate::device_client::WifiScan {
    fn into_response(self) -> HttpResponse {
        json_response(HttpResponse::Ok(), &self)
    }
}

impl ServiceResultResponse for crate::services::provisioning::RunStarted {
    fn into_response(self) -> HttpResponse {
        json_response(HttpResponse::Accepted(), &self)
    }
}

fn json_response(
    mut builder: actix_web::HttpResponseBuilder,
    value: &impl Serialize,
) -> HttpResponse {
    match serde_json::to_string(value) {
        Ok(json) => builder.content_type("application/json").body(json),
        Err(e) => {
            error!("failed to serialize response: {e:#}");
            HttpResponse::InternalServerError().body("failed to serialize response")
        }
    }
}

/// Handle Result and convert data to Response
///
/// # Arguments
/// * `result` - The Result to handle
/// * `operation` - Context message describing the operation
///
/// # Returns
/// * `HttpResponse` - The ServiceResultResponse or HttpResponse::InternalServerError
pub fn handle_service_result<T>(result: Result<T>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) => {
            error!("{operation} failed: {e:#}");
            HttpResponse::InternalServerError().body(format!("{e:#}"))
        }
    }
}

/// Handle HTTP response by checking status and extracting body
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "GET /config")
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}
