//! Shared helpers for integration tests
//!
//! A loopback HTTP server with scripted responses, a mock segmentation backend
//! and image fixtures. Nothing here touches the network or real model files.

#![allow(dead_code)]

use async_trait::async_trait;
use bgremove_fallback::{
    BackendCache, BackendFactory, BackendType, BgRemovalError, FailureCause, LocalConfig,
    LocalInferenceStrategy, ModelInfo, PipelineConfig, RemoteRemovalStrategy,
    RemovalOrchestrator, Result, Segment, SegmentationBackend, SegmentationMask,
};
use bgremove_fallback::models::PreprocessingConfig;
use image::ImageEncoder;
use ndarray::Array4;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One request as seen by [`TestServer`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn body_contains(&self, needle: &str) -> bool {
        self.body
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    }
}

/// Response returned by a [`TestServer`] handler
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::new(status, "application/json", body.as_bytes().to_vec())
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(200, "image/png", bytes)
    }

    pub fn not_found() -> Self {
        Self::new(404, "text/plain", b"not found".to_vec())
    }
}

type Handler = dyn Fn(&RecordedRequest) -> ScriptedResponse + Send + Sync;

/// Minimal HTTP/1.1 server on 127.0.0.1 that records every request
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> ScriptedResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, handler, recorded).await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    /// Server that answers every request with the same response
    pub async fn always(response: ScriptedResponse) -> Self {
        Self::start(move |_| response.clone()).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let header_end = loop {
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if read_more(&mut stream, &mut buffer).await? == 0 {
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let mut rest = buffer.split_off(header_end + 4);
    let body = if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked(&mut stream, &mut rest).await?
    } else {
        let length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        while rest.len() < length {
            if read_more(&mut stream, &mut rest).await? == 0 {
                break;
            }
        }
        rest.truncate(length);
        rest
    };

    let request = RecordedRequest {
        method,
        path,
        headers,
        body,
    };
    let response = handler(&request);
    recorded.lock().unwrap().push(request);

    let head = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await?;
    stream.shutdown().await
}

async fn read_chunked(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find(buffer, b"\r\n") {
                break pos;
            }
            if read_more(stream, buffer).await? == 0 {
                return Ok(body);
            }
        };
        let size_field = String::from_utf8_lossy(&buffer[..line_end]).into_owned();
        let size = usize::from_str_radix(size_field.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        buffer.drain(..line_end + 2);
        if size == 0 {
            return Ok(body);
        }
        while buffer.len() < size + 2 {
            if read_more(stream, buffer).await? == 0 {
                return Ok(body);
            }
        }
        body.extend_from_slice(&buffer[..size]);
        buffer.drain(..size + 2);
    }
}

async fn read_more(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut chunk = [0u8; 16 * 1024];
    let n = stream.read(&mut chunk).await?;
    buffer.extend_from_slice(&chunk[..n]);
    Ok(n)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Mask produced by a [`FixedMaskBackend`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskScript {
    /// Every value equals the constant
    Constant(f32),
    /// One value short of the image size
    WrongLength,
    /// Left half 1.0, right half 0.0
    LeftHalf,
}

/// Backend producing scripted masks sized to the encoded input
#[derive(Debug)]
pub struct FixedMaskBackend {
    script: MaskScript,
    initialized: bool,
    segment_dims: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl SegmentationBackend for FixedMaskBackend {
    fn initialize(&mut self, _config: &LocalConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        self.initialized = true;
        Ok(Some(Duration::from_millis(2)))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (_, _, height, width) = input.dim();
        Ok(Array4::zeros((1, 1, height, width)))
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(PreprocessingConfig::default())
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        Ok(ModelInfo {
            name: "fixed-mask".to_string(),
            precision: "fp32".to_string(),
            size_bytes: 0,
            input_shape: (1, 3, 512, 512),
            labels: vec!["background".to_string()],
        })
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn segment(&mut self, encoded: &[u8]) -> Result<Vec<Segment>> {
        let decoded = image::load_from_memory(encoded)
            .map_err(|e| BgRemovalError::inference(format!("fixture decode failed: {e}")))?;
        let (width, height) = (decoded.width(), decoded.height());
        self.segment_dims.lock().unwrap().push((width, height));
        let pixels = width as usize * height as usize;

        let data = match self.script {
            MaskScript::Constant(value) => vec![value; pixels],
            MaskScript::WrongLength => vec![0.0; pixels - 1],
            MaskScript::LeftHalf => (0..pixels)
                .map(|i| if (i as u32 % width) < width / 2 { 1.0 } else { 0.0 })
                .collect(),
        };

        Ok(vec![Segment {
            label: "background".to_string(),
            score: None,
            mask: SegmentationMask::new(data, (width, height)),
        }])
    }
}

/// Factory handing out [`FixedMaskBackend`]s, or failing with a cause
#[derive(Debug)]
pub struct MockFactory {
    script: MaskScript,
    failure: Option<FailureCause>,
    created: AtomicUsize,
    segment_dims: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl MockFactory {
    pub fn new(script: MaskScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            failure: None,
            created: AtomicUsize::new(0),
            segment_dims: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn failing(cause: FailureCause) -> Arc<Self> {
        Arc::new(Self {
            script: MaskScript::Constant(0.0),
            failure: Some(cause),
            created: AtomicUsize::new(0),
            segment_dims: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Dimensions of every image the backends segmented
    pub fn segment_dims(&self) -> Vec<(u32, u32)> {
        self.segment_dims.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendFactory for MockFactory {
    async fn create_backend(
        &self,
        _config: &LocalConfig,
        _use_local_model_cache: bool,
    ) -> Result<Box<dyn SegmentationBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(cause) = self.failure {
            return Err(BgRemovalError::model_load(cause, "scripted backend failure"));
        }
        Ok(Box::new(FixedMaskBackend {
            script: self.script,
            initialized: false,
            segment_dims: Arc::clone(&self.segment_dims),
        }))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::Onnx]
    }
}

/// Route `log` output through the test harness; `RUST_LOG=debug` to see it
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config pointing the remote strategy at `server`
pub fn config_for(server: &TestServer, credential: Option<&str>) -> PipelineConfig {
    init_logging();
    let mut builder = PipelineConfig::builder()
        .remote_endpoint(server.url("/v1.0/removebg"))
        .remote_timeout(Duration::from_secs(5));
    if let Some(credential) = credential {
        builder = builder.default_credential(credential);
    }
    builder.build().unwrap()
}

/// Real remote strategy plus a local strategy backed by `factory`
pub fn orchestrator(config: &PipelineConfig, factory: Arc<MockFactory>) -> RemovalOrchestrator {
    let remote = Arc::new(RemoteRemovalStrategy::new(config).unwrap());
    let local = Arc::new(LocalInferenceStrategy::with_factory(
        config,
        factory,
        Arc::new(BackendCache::new()),
    ));
    RemovalOrchestrator::with_strategies(config.clone(), remote, local)
}

/// Gradient RGB image encoded as JPEG
pub fn jpeg_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 96])
    });
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// Transparent RGBA image encoded as PNG, standing in for a remote result
pub fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 0]));
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgba8)
        .unwrap();
    out
}
