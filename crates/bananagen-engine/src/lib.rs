use std::str::FromStr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bananagen_contracts::batch::{format_duration, BatchProgress, BatchSummary};
use bananagen_contracts::error::GenerateError;
use bananagen_contracts::request::{GenerationRequest, ResolutionTier, ServiceConfig};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

const CONNECT_TIMEOUT_DIRECT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT_PROXY: Duration = Duration::from_secs(120);
const GENERATE_READ_TIMEOUT: Duration = Duration::from_secs(600);
const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_READ_TIMEOUT: Duration = Duration::from_secs(120);
const DOWNLOAD_MAX_ATTEMPTS: u32 = 3;
const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_secs(2);
const ERROR_BODY_PREVIEW_CHARS: usize = 300;
const THROTTLE_BACKOFF_FACTOR: f64 = 1.5;
const FAILURE_SUMMARY_LIMIT: usize = 3;

/// Which of the two wire dialects a model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    NativeContents,
    OpenAiImages,
}

/// Protocol selection is a pure function of the model identifier. Unknown
/// identifiers route to the OpenAI-style dialect, which newer models use.
pub fn select_protocol(model: &str) -> ProtocolVariant {
    if model.to_ascii_lowercase().contains("gemini") {
        ProtocolVariant::NativeContents
    } else {
        ProtocolVariant::OpenAiImages
    }
}

/// Pixel-dimension string for the OpenAI-style `size` field. Anything
/// outside the known table falls back to square 1K.
pub fn openai_size(ratio: &str) -> &'static str {
    match ratio {
        "1:1" => "1024x1024",
        "2:3" => "848x1264",
        "3:2" => "1264x848",
        "3:4" => "896x1200",
        "4:3" => "1200x896",
        "4:5" => "928x1152",
        "5:4" => "1152x928",
        "9:16" => "768x1376",
        "16:9" => "1376x768",
        "21:9" => "1584x672",
        _ => "1024x1024",
    }
}

/// Folds the resolution tier into the model name. Models carrying a `-url`
/// marker keep it last: `gemini-x-url` at 2K becomes `gemini-x-2k-url`.
pub fn tiered_model_name(model: &str, tier: ResolutionTier) -> String {
    let suffix = tier.model_suffix();
    if suffix.is_empty() {
        return model.to_string();
    }
    match model.strip_suffix("-url") {
        Some(stem) => format!("{stem}{suffix}-url"),
        None => format!("{model}{suffix}"),
    }
}

/// Endpoint, resolved model name, and dialect for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub protocol: ProtocolVariant,
    pub endpoint: String,
    pub model: String,
}

pub fn adapt(request: &GenerationRequest, base_url: &str) -> PreparedRequest {
    let protocol = select_protocol(&request.model);
    let model = tiered_model_name(&request.model, request.resolution);
    let base = base_url.trim_end_matches('/');
    let endpoint = match protocol {
        ProtocolVariant::NativeContents => {
            format!("{base}/v1beta/models/{model}:generateContent")
        }
        ProtocolVariant::OpenAiImages => {
            if request.reference_images.is_empty() {
                format!("{base}/v1/images/generations")
            } else {
                format!("{base}/v1/images/edits")
            }
        }
    };
    PreparedRequest {
        protocol,
        endpoint,
        model,
    }
}

/// Builds the contents/parts body: prompt text first, then one inline-data
/// part per reference image. `-url` models additionally pin the content role
/// and restrict output modalities to images.
fn native_payload(request: &GenerationRequest, model: &str) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    for bytes in &request.reference_images {
        parts.push(json!({
            "inline_data": {
                "mime_type": "image/png",
                "data": BASE64.encode(bytes),
            }
        }));
    }

    let mut content = json!({ "parts": parts });
    let mut generation_config = json!({
        "imageConfig": {
            "aspectRatio": request.aspect_ratio.as_str(),
            "imageSize": request.resolution.as_str(),
        }
    });
    if model.ends_with("-url") {
        content["role"] = json!("user");
        generation_config["responseModalities"] = json!(["IMAGE"]);
    }

    json!({
        "contents": [content],
        "generationConfig": generation_config,
    })
}

fn openai_json_payload(request: &GenerationRequest, model: &str, size: &str) -> Value {
    json!({
        "model": model,
        "prompt": request.prompt,
        "size": size,
        "response_format": request.response_format.wire_value(),
    })
}

fn openai_multipart_form(
    request: &GenerationRequest,
    model: &str,
    size: &str,
) -> Result<Form, GenerateError> {
    let mut form = Form::new()
        .text("model", model.to_string())
        .text("prompt", request.prompt.clone())
        .text("size", size.to_string())
        .text("response_format", request.response_format.wire_value());
    for (idx, bytes) in request.reference_images.iter().enumerate() {
        let part = Part::bytes(bytes.clone())
            .file_name(format!("image_{idx}.png"))
            .mime_str("image/png")
            .map_err(|err| GenerateError::InvalidRequest {
                message: format!("reference image {idx} could not be attached: {err}"),
            })?;
        form = form.part("image", part);
    }
    Ok(form)
}

/// One HTTP exchange, as seen on the wire. Produced by `Transport`,
/// consumed immediately by the extractor.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value, GenerateError> {
        serde_json::from_slice(&self.body).map_err(|err| GenerateError::MalformedResponse {
            message: format!("response body is not valid JSON: {err}"),
        })
    }
}

/// Blocking HTTP boundary. Generation calls and image downloads get separate
/// clients because their connect budgets differ by an order of magnitude.
///
/// Certificate validation is relaxed only for request URLs whose origin is on
/// the configured allowlist; a second client pair serves those.
#[derive(Debug)]
pub struct Transport {
    api: Client,
    api_insecure: Client,
    download: Client,
    download_insecure: Client,
    insecure_origins: Vec<String>,
}

impl Transport {
    pub fn new(config: &ServiceConfig) -> Result<Self, GenerateError> {
        let connect_timeout = if config.proxy.is_some() {
            CONNECT_TIMEOUT_PROXY
        } else {
            CONNECT_TIMEOUT_DIRECT
        };
        let proxy = config.proxy.as_deref();
        Ok(Self {
            api: build_client(connect_timeout, proxy, false)?,
            api_insecure: build_client(connect_timeout, proxy, true)?,
            download: build_client(DOWNLOAD_CONNECT_TIMEOUT, proxy, false)?,
            download_insecure: build_client(DOWNLOAD_CONNECT_TIMEOUT, proxy, true)?,
            insecure_origins: config
                .insecure_origins
                .iter()
                .map(|origin| origin.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    fn trusts_origin_insecurely(&self, url: &str) -> bool {
        match origin_of(url) {
            Some(origin) => self.insecure_origins.iter().any(|o| *o == origin),
            None => false,
        }
    }

    fn api_client(&self, url: &str) -> &Client {
        if self.trusts_origin_insecurely(url) {
            &self.api_insecure
        } else {
            &self.api
        }
    }

    fn download_client(&self, url: &str) -> &Client {
        if self.trusts_origin_insecurely(url) {
            &self.download_insecure
        } else {
            &self.download
        }
    }

    pub fn post_json(
        &self,
        url: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<RawResponse, GenerateError> {
        let response = self
            .api_client(url)
            .post(url)
            .bearer_auth(api_key)
            .timeout(GENERATE_READ_TIMEOUT)
            .json(payload)
            .send()
            .map_err(network_failure)?;
        read_response(response)
    }

    pub fn post_multipart(
        &self,
        url: &str,
        api_key: &str,
        form: Form,
    ) -> Result<RawResponse, GenerateError> {
        let response = self
            .api_client(url)
            .post(url)
            .bearer_auth(api_key)
            .timeout(GENERATE_READ_TIMEOUT)
            .multipart(form)
            .send()
            .map_err(network_failure)?;
        read_response(response)
    }

    pub fn get(&self, url: &str) -> Result<RawResponse, GenerateError> {
        let response = self
            .download_client(url)
            .get(url)
            .timeout(DOWNLOAD_READ_TIMEOUT)
            .send()
            .map_err(network_failure)?;
        read_response(response)
    }

    /// Fetches an image link returned by the service. Transport-level errors
    /// retry with a fixed delay; an HTTP error status means the link is stale
    /// or expired and is terminal.
    pub fn download_image(&self, url: &str) -> Result<DynamicImage, GenerateError> {
        let mut last_error = String::new();
        for attempt in 1..=DOWNLOAD_MAX_ATTEMPTS {
            match self.get(url) {
                Ok(response) if response.status == 200 => {
                    return image::load_from_memory(&response.body).map_err(|err| {
                        GenerateError::DownloadFailure {
                            message: format!("downloaded bytes are not a readable image: {err}"),
                        }
                    });
                }
                Ok(response) => {
                    return Err(GenerateError::DownloadFailure {
                        message: format!(
                            "image link answered HTTP {}; the link has likely expired",
                            response.status
                        ),
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt < DOWNLOAD_MAX_ATTEMPTS {
                        thread::sleep(DOWNLOAD_RETRY_DELAY);
                    }
                }
            }
        }
        Err(GenerateError::DownloadFailure {
            message: format!("giving up after {DOWNLOAD_MAX_ATTEMPTS} attempts: {last_error}"),
        })
    }
}

fn build_client(
    connect_timeout: Duration,
    proxy: Option<&str>,
    accept_invalid_certs: bool,
) -> Result<Client, GenerateError> {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(accept_invalid_certs);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|err| GenerateError::InvalidRequest {
            message: format!("invalid proxy address: {err}"),
        })?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|err| GenerateError::NetworkFailure {
        message: format!("could not build HTTP client: {err}"),
    })
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}

fn read_response(response: reqwest::blocking::Response) -> Result<RawResponse, GenerateError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().map_err(network_failure)?.to_vec();
    Ok(RawResponse {
        status,
        headers,
        body,
    })
}

fn network_failure(err: reqwest::Error) -> GenerateError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    GenerateError::NetworkFailure {
        message: format!("{kind}: {}", error_chain_text(&err)),
    }
}

fn error_chain_text(err: &dyn std::error::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(" | caused by: ")
}

/// Maps a non-200 exchange to a typed error. The "no available channel"
/// payload marker wins over the status code because it is actionable
/// differently (wait for the model, rather than fix credentials or retry).
pub fn classify_http_failure(status: u16, body: &str) -> GenerateError {
    if body.contains("model_not_found") || body.contains("无可用渠道") {
        return GenerateError::ModelUnavailable {
            message: format!(
                "the requested model has no available upstream channel right now (HTTP {status}); wait a moment and retry"
            ),
        };
    }
    match status {
        401 => GenerateError::Auth,
        429 => GenerateError::RateLimited,
        504 => GenerateError::GatewayTimeout,
        502 | 503 | 520..=524 => GenerateError::Gateway {
            status: Some(status),
            retryable: true,
            message: gateway_message(status, body),
        },
        400..=499 => GenerateError::Gateway {
            status: Some(status),
            retryable: false,
            message: gateway_message(status, body),
        },
        _ => GenerateError::Gateway {
            status: Some(status),
            retryable: true,
            message: gateway_message(status, body),
        },
    }
}

fn gateway_message(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() || looks_like_html(trimmed) {
        format!("upstream returned HTTP {status}")
    } else {
        format!(
            "upstream returned HTTP {status}: {}",
            truncate_text(trimmed, ERROR_BODY_PREVIEW_CHARS)
        )
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    let lower: String = head.chars().take(16).collect::<String>().to_ascii_lowercase();
    lower.starts_with("<!doctype") || lower.starts_with("<html")
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

/// Resampling kernels callers may request when shrinking outputs. The image
/// crate ships no box or hamming kernels; those map to the closest available
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMethod {
    Nearest,
    Bilinear,
    Bicubic,
    Box,
    Hamming,
    Lanczos,
}

impl ResampleMethod {
    pub fn filter(self) -> FilterType {
        match self {
            ResampleMethod::Nearest => FilterType::Nearest,
            ResampleMethod::Bilinear | ResampleMethod::Box => FilterType::Triangle,
            ResampleMethod::Bicubic => FilterType::CatmullRom,
            ResampleMethod::Hamming => FilterType::Gaussian,
            ResampleMethod::Lanczos => FilterType::Lanczos3,
        }
    }
}

impl FromStr for ResampleMethod {
    type Err = GenerateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(ResampleMethod::Nearest),
            "bilinear" => Ok(ResampleMethod::Bilinear),
            "bicubic" => Ok(ResampleMethod::Bicubic),
            "box" => Ok(ResampleMethod::Box),
            "hamming" => Ok(ResampleMethod::Hamming),
            "lanczos" => Ok(ResampleMethod::Lanczos),
            _ => Err(GenerateError::InvalidRequest {
                message: format!(
                    "unknown resample method {value:?}; expected nearest, bilinear, bicubic, box, hamming, or lanczos"
                ),
            }),
        }
    }
}

/// Decodes a base64 image payload, repairing the damage servers commonly
/// inflict: a `data:image/...;base64,` prefix, stray whitespace, and missing
/// `=` padding. Valid input passes through untouched.
pub fn decode_base64_image(data: &str) -> Result<DynamicImage, GenerateError> {
    let bytes = decode_base64_payload(data)?;
    image::load_from_memory(&bytes).map_err(|err| GenerateError::MalformedResponse {
        message: format!("inline payload decoded but is not a readable image: {err}"),
    })
}

fn decode_base64_payload(data: &str) -> Result<Vec<u8>, GenerateError> {
    let data = match (data.starts_with("data:"), data.find(',')) {
        (true, Some(comma)) => &data[comma + 1..],
        _ => data,
    };
    let mut cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    while cleaned.len() % 4 != 0 {
        cleaned.push('=');
    }
    BASE64
        .decode(cleaned.as_bytes())
        .map_err(|err| GenerateError::MalformedResponse {
            message: format!("invalid base64 image payload: {err}"),
        })
}

/// Shrinks `image` so its longer side is exactly `max_dim`, preserving the
/// aspect ratio. Images already within bounds are returned unchanged.
pub fn resize_to_max_dimension(
    image: &DynamicImage,
    max_dim: u32,
    method: ResampleMethod,
) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let longest = width.max(height);
    if max_dim == 0 || longest <= max_dim {
        return image.clone();
    }
    let (new_width, new_height) = if width >= height {
        let scaled = (f64::from(height) * f64::from(max_dim) / f64::from(width)).round();
        (max_dim, (scaled as u32).max(1))
    } else {
        let scaled = (f64::from(width) * f64::from(max_dim) / f64::from(height)).round();
        ((scaled as u32).max(1), max_dim)
    };
    image.resize_exact(new_width, new_height, method.filter())
}

static MARKDOWN_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[.*?\]\((https?://[^)]+)\)").expect("markdown image pattern"));
static BARE_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(https?://[^\s)]+\.(?:png|jpe?g|webp|gif))").expect("bare image url pattern")
});

fn find_image_url(text: &str) -> Option<String> {
    if let Some(captures) = MARKDOWN_IMAGE.captures(text) {
        return Some(captures[1].to_string());
    }
    BARE_IMAGE_URL
        .captures(text)
        .map(|captures| captures[1].to_string())
}

/// Turns a raw exchange into a decoded image or a typed error.
pub fn extract_image(
    transport: &Transport,
    protocol: ProtocolVariant,
    response: &RawResponse,
) -> Result<DynamicImage, GenerateError> {
    if response.status != 200 {
        return Err(classify_http_failure(response.status, &response.text()));
    }
    let body = response.json()?;
    match protocol {
        ProtocolVariant::OpenAiImages => extract_openai_body(transport, &body),
        ProtocolVariant::NativeContents => extract_native_body(transport, &body),
    }
}

fn extract_openai_body(
    transport: &Transport,
    body: &Value,
) -> Result<DynamicImage, GenerateError> {
    let first = body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .ok_or_else(|| GenerateError::MalformedResponse {
            message: "response carries no data entries".to_string(),
        })?;
    if let Some(encoded) = first.get("b64_json").and_then(Value::as_str) {
        return decode_base64_image(encoded);
    }
    if let Some(url) = first.get("url").and_then(Value::as_str) {
        return transport.download_image(url);
    }
    Err(GenerateError::MalformedResponse {
        message: "data entry has neither b64_json nor url".to_string(),
    })
}

/// The native dialect has shipped several response shapes over time: inline
/// data as an object or as a bare base64 string, and text parts that embed
/// the image as a markdown or bare URL. All of them are accepted here.
fn extract_native_body(
    transport: &Transport,
    body: &Value,
) -> Result<DynamicImage, GenerateError> {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| GenerateError::MalformedResponse {
            message: "response carries no candidates".to_string(),
        })?;

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        match reason {
            "" | "STOP" | "MAX_TOKENS" => {}
            "SAFETY" | "IMAGE_SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" | "SPII"
            | "BLOCKLIST" => {
                return Err(GenerateError::ContentFiltered {
                    reason: reason.to_string(),
                });
            }
            "MALFORMED_FUNCTION_CALL" => {
                return Err(GenerateError::Gateway {
                    status: None,
                    retryable: true,
                    message: "the model answered with a malformed function call; this is a transient upstream fault".to_string(),
                });
            }
            // any other reason ended the candidate without output
            other => {
                return Err(GenerateError::Gateway {
                    status: None,
                    retryable: false,
                    message: format!(
                        "generation stopped early (finish reason {other}); no image was produced"
                    ),
                });
            }
        }
    }

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| GenerateError::Gateway {
            status: None,
            retryable: true,
            message: "the candidate arrived with empty content; the upstream likely dropped the render".to_string(),
        })?;

    for part in parts {
        let inline = part.get("inline_data").or_else(|| part.get("inlineData"));
        if let Some(inline) = inline {
            if let Some(encoded) = inline.as_str() {
                return decode_base64_image(encoded);
            }
            if let Some(encoded) = inline.get("data").and_then(Value::as_str) {
                return decode_base64_image(encoded);
            }
        }
    }

    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if let Some(url) = find_image_url(text) {
                return transport.download_image(&url);
            }
        }
    }

    Err(GenerateError::MalformedResponse {
        message: "candidate contains neither inline image data nor an image link".to_string(),
    })
}

/// Enforces a minimum interval between requests and widens it when the
/// service pushes back. The interval only grows within a session; `reset`
/// returns it to the baseline.
#[derive(Debug)]
pub struct RateLimiter {
    baseline: Duration,
    current: Duration,
    last_request: Option<Instant>,
    throttle_hits: u32,
}

impl RateLimiter {
    pub fn new(baseline: Duration) -> Self {
        Self {
            baseline,
            current: baseline,
            last_request: None,
            throttle_hits: 0,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current
    }

    pub fn throttle_hits(&self) -> u32 {
        self.throttle_hits
    }

    /// Blocks until the interval since the previous request has elapsed,
    /// then stamps the request time.
    pub fn wait_before_next(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.current {
                thread::sleep(self.current - elapsed);
            }
        }
        self.last_request = Some(Instant::now());
    }

    /// Widens the interval after a throttling signal. A zero interval still
    /// becomes positive so the expansion is always strict.
    pub fn note_throttle(&mut self) {
        self.throttle_hits += 1;
        self.current = if self.current.is_zero() {
            Duration::from_secs(1)
        } else {
            self.current.mul_f64(THROTTLE_BACKOFF_FACTOR)
        };
    }

    pub fn reset(&mut self) {
        self.current = self.baseline;
        self.last_request = None;
        self.throttle_hits = 0;
    }
}

/// Counters and timing samples for one sequential batch. Owned by the loop
/// that advances the batch; never shared across batches.
#[derive(Debug)]
pub struct BatchSession {
    total: usize,
    processed: usize,
    succeeded: usize,
    failed: usize,
    durations: Vec<Duration>,
    started: Instant,
}

impl BatchSession {
    pub fn start(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            durations: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.processed += 1;
        self.succeeded += 1;
        self.durations.push(duration);
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            total: self.total,
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    pub fn mean_item_secs(&self) -> Option<f64> {
        if self.durations.is_empty() {
            return None;
        }
        let total: f64 = self.durations.iter().map(Duration::as_secs_f64).sum();
        Some(total / self.durations.len() as f64)
    }

    /// Projects remaining wall time from the rolling mean plus the pacing
    /// interval. `None` until the first success provides a sample.
    pub fn format_eta(&self, interval: Duration) -> Option<String> {
        let mean = self.mean_item_secs()?;
        let remaining = self.total.saturating_sub(self.processed);
        Some(format_duration(
            (mean + interval.as_secs_f64()) * remaining as f64,
        ))
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            mean_item_secs: self.mean_item_secs(),
        }
    }
}

/// Runs `worker` for indices `0..count` on scoped threads and hands back
/// successes and failures, each re-sorted by submission index.
fn fan_out<T, F>(count: usize, worker: F) -> (Vec<(usize, T)>, Vec<(usize, GenerateError)>)
where
    T: Send,
    F: Fn(usize) -> Result<T, GenerateError> + Sync,
{
    let (sender, receiver) = mpsc::channel();
    thread::scope(|scope| {
        for index in 0..count {
            let sender = sender.clone();
            let worker = &worker;
            scope.spawn(move || {
                let _ = sender.send((index, worker(index)));
            });
        }
    });
    drop(sender);

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (index, result) in receiver {
        match result {
            Ok(value) => successes.push((index, value)),
            Err(err) => failures.push((index, err)),
        }
    }
    successes.sort_by_key(|(index, _)| *index);
    failures.sort_by_key(|(index, _)| *index);
    (successes, failures)
}

fn push_unique_warning(warnings: &mut Vec<String>, warning: String) {
    if !warnings.iter().any(|existing| *existing == warning) {
        warnings.push(warning);
    }
}

fn exhausted_error(attempted: usize, failures: &[(usize, GenerateError)]) -> GenerateError {
    let summary = failures
        .iter()
        .take(FAILURE_SUMMARY_LIMIT)
        .map(|(index, err)| format!("#{index}: {err}"))
        .collect::<Vec<_>>()
        .join("; ");
    GenerateError::BatchExhausted { attempted, summary }
}

/// Result of fanning one logical request out N ways: the images that made
/// it, in submission order, plus warnings for the attempts that did not.
#[derive(Debug)]
pub struct FanoutOutcome {
    pub images: Vec<DynamicImage>,
    pub warnings: Vec<String>,
}

/// Folds fan-out results into an outcome: at least one success satisfies the
/// request, identical failures collapse into one warning, and an all-fail run
/// becomes a single aggregated error.
fn fan_out_outcome<F>(count: usize, worker: F) -> Result<FanoutOutcome, GenerateError>
where
    F: Fn(usize) -> Result<DynamicImage, GenerateError> + Sync,
{
    let (successes, failures) = fan_out(count, worker);
    if successes.is_empty() {
        return Err(exhausted_error(count, &failures));
    }
    let mut warnings = Vec::new();
    for (_, err) in &failures {
        push_unique_warning(&mut warnings, format!("a generation attempt failed: {err}"));
    }
    Ok(FanoutOutcome {
        images: successes.into_iter().map(|(_, image)| image).collect(),
        warnings,
    })
}

/// Result of a sequential batch run. Indices refer to the caller's request
/// slice so outputs stay associated with their prompts.
#[derive(Debug)]
pub struct BatchOutcome {
    pub images: Vec<(usize, DynamicImage)>,
    pub failures: Vec<(usize, GenerateError)>,
    pub summary: BatchSummary,
}

/// Facade over the whole pipeline: adapt, send, extract, classify.
#[derive(Debug)]
pub struct GenerationClient {
    config: ServiceConfig,
    transport: Transport,
}

impl GenerationClient {
    pub fn new(config: ServiceConfig) -> Result<Self, GenerateError> {
        let transport = Transport::new(&config)?;
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// One full round trip: returns a decoded image or a typed error. No
    /// retry happens here; a timed-out generation may already be billing
    /// server-side, so the retry decision belongs to the caller.
    pub fn generate(&self, request: &GenerationRequest) -> Result<DynamicImage, GenerateError> {
        request.validate()?;
        let prepared = adapt(request, &self.config.base_url);
        let response = match prepared.protocol {
            ProtocolVariant::NativeContents => {
                let payload = native_payload(request, &prepared.model);
                self.transport
                    .post_json(&prepared.endpoint, &self.config.api_key, &payload)?
            }
            ProtocolVariant::OpenAiImages => {
                let size = openai_size(request.aspect_ratio.as_str());
                if request.reference_images.is_empty() {
                    let payload = openai_json_payload(request, &prepared.model, size);
                    self.transport
                        .post_json(&prepared.endpoint, &self.config.api_key, &payload)?
                } else {
                    let form = openai_multipart_form(request, &prepared.model, size)?;
                    self.transport
                        .post_multipart(&prepared.endpoint, &self.config.api_key, form)?
                }
            }
        };
        extract_image(&self.transport, prepared.protocol, &response)
    }

    /// Fans the same request out `parallelism` ways on worker threads.
    /// Satisfied when at least one attempt succeeds; the rest become
    /// warnings. All-fail collapses into a single aggregated error.
    pub fn generate_many(
        &self,
        request: &GenerationRequest,
        parallelism: usize,
    ) -> Result<FanoutOutcome, GenerateError> {
        request.validate()?;
        let count = parallelism.max(1);
        if count == 1 {
            let image = self.generate(request)?;
            return Ok(FanoutOutcome {
                images: vec![image],
                warnings: Vec::new(),
            });
        }

        fan_out_outcome(count, |_| self.generate(request))
    }

    /// Sequential paced batch: one item's full pipeline finishes before the
    /// limiter is consulted for the next, so pacing reacts to the most
    /// recent observation. Individual failures are recorded and skipped; the
    /// batch fails outright only when nothing succeeded.
    pub fn run_batch<F>(
        &self,
        requests: &[GenerationRequest],
        limiter: &mut RateLimiter,
        mut on_progress: F,
    ) -> Result<BatchOutcome, GenerateError>
    where
        F: FnMut(&BatchProgress, Option<&str>),
    {
        let mut session = BatchSession::start(requests.len());
        let mut images = Vec::new();
        let mut failures: Vec<(usize, GenerateError)> = Vec::new();

        for (index, request) in requests.iter().enumerate() {
            limiter.wait_before_next();
            let started = Instant::now();
            match self.generate(request) {
                Ok(image) => {
                    session.record_success(started.elapsed());
                    images.push((index, image));
                }
                Err(err) => {
                    session.record_failure();
                    if err.is_throttle_signal() {
                        limiter.note_throttle();
                    }
                    failures.push((index, err));
                }
            }
            let eta = session.format_eta(limiter.current_interval());
            on_progress(&session.progress(), eta.as_deref());
        }

        if images.is_empty() && !requests.is_empty() {
            return Err(exhausted_error(requests.len(), &failures));
        }
        Ok(BatchOutcome {
            images,
            failures,
            summary: session.summary(),
        })
    }
}
