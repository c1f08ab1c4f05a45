//! Anchor: the overlay tunnel endpoint the portal relays into
//!
//! The portal treats the anchor as a black box reached through [`Anchor`]:
//! lifecycle, batched frame I/O, the CIDR it was assigned, identity accessors,
//! a done-signal and a metrics endpoint. [`MemoryAnchor`] is an in-process
//! implementation whose overlay side is driven through an [`AnchorPeer`].

use crate::error::{PortalError, Result};
use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, MethodRouter};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Parameters an anchor is started with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnchorParams {
    /// Guardian (coordination service) base URL
    pub endpoint: String,
    /// Anchor credential
    pub token: String,
    /// Anchor name
    pub name: String,
    /// Overlay domain name
    pub domain: String,
    /// Deployment region
    pub region: String,
}

/// Overlay tunnel endpoint consumed by the portal
#[async_trait]
pub trait Anchor: Send + Sync {
    /// Join the overlay
    async fn start(&self, params: &AnchorParams) -> Result<()>;

    /// Leave the overlay; fires the done-signal
    async fn stop(&self);

    /// Read up to `batch_size` frames from the overlay. Each filled buffer is
    /// resized to the frame length. Returns the number of frames read.
    async fn read(&self, bufs: &mut [Vec<u8>], batch_size: usize) -> Result<usize>;

    /// Send `bufs[i][..sizes[i]]` for each frame. Returns the number sent.
    async fn write(&self, bufs: &[Vec<u8>], sizes: &[usize]) -> Result<usize>;

    /// Address assigned to this portal on the overlay, as `ip/prefix`
    async fn cidr(&self) -> Result<String>;

    fn name(&self) -> String;

    fn domain(&self) -> String;

    fn region(&self) -> String;

    /// Cancelled once the anchor has stopped
    fn done(&self) -> CancellationToken;

    /// HTTP handler serving the anchor's metrics
    fn metrics_handler(&self) -> MethodRouter;
}

/// Constructs anchors
pub trait AnchorConnector: Send + Sync {
    /// Build an anchor. `portal` selects portal (gateway) mode, `public`
    /// whether the portal is advertised to the overlay.
    fn connect(&self, portal: bool, public: bool) -> Result<Arc<dyn Anchor>>;
}

/// Frame and byte counters exposed by [`MemoryAnchor`]
pub struct AnchorMetrics {
    registry: Registry,
    /// Frames delivered from the overlay to the portal
    pub frames_in: IntCounter,
    /// Frames sent from the portal to the overlay
    pub frames_out: IntCounter,
    pub bytes_in: IntCounter,
    pub bytes_out: IntCounter,
}

impl AnchorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help)
                .map_err(|e| PortalError::Anchor(format!("metrics init failed: {}", e)))?;
            registry
                .register(Box::new(c.clone()))
                .map_err(|e| PortalError::Anchor(format!("metrics init failed: {}", e)))?;
            Ok(c)
        };

        let frames_in = counter(
            "veilnet_anchor_frames_in_total",
            "Frames received from the overlay",
        )?;
        let frames_out = counter(
            "veilnet_anchor_frames_out_total",
            "Frames sent to the overlay",
        )?;
        let bytes_in = counter(
            "veilnet_anchor_bytes_in_total",
            "Bytes received from the overlay",
        )?;
        let bytes_out = counter("veilnet_anchor_bytes_out_total", "Bytes sent to the overlay")?;

        Ok(Self {
            registry,
            frames_in,
            frames_out,
            bytes_in,
            bytes_out,
        })
    }

    /// Encode in Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PortalError::Anchor(format!("metrics encode failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| PortalError::Anchor(format!("metrics encode failed: {}", e)))
    }
}

/// Frames kept for [`AnchorPeer::received`] unless configured otherwise
pub const DEFAULT_PEER_HISTORY: usize = 1024;

/// Most recent frames written by the portal; older ones are dropped
struct SentLog {
    frames: VecDeque<Vec<u8>>,
    total: usize,
    limit: usize,
}

impl SentLog {
    fn new(limit: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            total: 0,
            limit,
        }
    }

    fn push(&mut self, frame: Vec<u8>) {
        self.total += 1;
        if self.limit == 0 {
            return;
        }
        if self.frames.len() == self.limit {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }
}

/// Overlay side of a [`MemoryAnchor`]
#[derive(Clone)]
pub struct AnchorPeer {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    sent: Arc<StdMutex<SentLog>>,
    notify: Arc<Notify>,
}

impl AnchorPeer {
    /// Deliver a frame from the overlay toward the portal
    pub fn send(&self, frame: Vec<u8>) {
        let _ = self.inbound.send(frame);
    }

    /// The most recent frames the portal has written to the overlay, oldest
    /// first. At most the configured history limit is kept.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .map(|s| s.frames.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of frames written so far, including those no longer retained
    pub fn received_total(&self) -> usize {
        self.sent.lock().map(|s| s.total).unwrap_or(0)
    }

    /// Wait until at least `count` frames have arrived, or `timeout` elapses
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.received_total() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Anchor living entirely in-process.
///
/// It accepts any non-empty credentials, reports the CIDR it was configured
/// with and exchanges frames with its [`AnchorPeer`].
pub struct MemoryAnchor {
    cidr: String,
    portal: bool,
    public: bool,
    params: StdMutex<Option<AnchorParams>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    peer: AnchorPeer,
    done: CancellationToken,
    metrics: Arc<AnchorMetrics>,
}

impl MemoryAnchor {
    pub fn new(cidr: &str) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            cidr: cidr.to_string(),
            portal: true,
            public: true,
            params: StdMutex::new(None),
            inbound: Mutex::new(rx),
            peer: AnchorPeer {
                inbound: tx,
                sent: Arc::new(StdMutex::new(SentLog::new(DEFAULT_PEER_HISTORY))),
                notify: Arc::new(Notify::new()),
            },
            done: CancellationToken::new(),
            metrics: Arc::new(AnchorMetrics::new()?),
        })
    }

    pub fn with_mode(mut self, portal: bool, public: bool) -> Self {
        self.portal = portal;
        self.public = public;
        self
    }

    /// Keep at most `limit` written frames for the peer; 0 keeps none
    pub fn with_history_limit(self, limit: usize) -> Self {
        if let Ok(mut sent) = self.peer.sent.lock() {
            sent.limit = limit;
            while sent.frames.len() > limit {
                sent.frames.pop_front();
            }
        }
        self
    }

    pub fn peer(&self) -> AnchorPeer {
        self.peer.clone()
    }

    pub fn metrics(&self) -> &AnchorMetrics {
        &self.metrics
    }

    pub fn is_portal(&self) -> bool {
        self.portal
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_started(&self) -> bool {
        self.params.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    fn param(&self, field: impl Fn(&AnchorParams) -> &str) -> String {
        self.params
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|p| field(p).to_string()))
            .unwrap_or_default()
    }

    fn stopped_error() -> PortalError {
        PortalError::Anchor("anchor stopped".to_string())
    }
}

#[async_trait]
impl Anchor for MemoryAnchor {
    async fn start(&self, params: &AnchorParams) -> Result<()> {
        if self.done.is_cancelled() {
            return Err(Self::stopped_error());
        }
        for (field, value) in [
            ("endpoint", &params.endpoint),
            ("token", &params.token),
            ("name", &params.name),
        ] {
            if value.is_empty() {
                return Err(PortalError::Anchor(format!("anchor {} is required", field)));
            }
        }

        let mut current = self
            .params
            .lock()
            .map_err(|_| PortalError::Anchor("anchor state poisoned".to_string()))?;
        if current.is_some() {
            return Err(PortalError::Anchor("anchor already started".to_string()));
        }
        *current = Some(params.clone());

        info!(
            name = %params.name,
            domain = %params.domain,
            region = %params.region,
            cidr = %self.cidr,
            "Anchor started"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.done.is_cancelled() {
            self.done.cancel();
            debug!("Anchor stopped");
        }
    }

    async fn read(&self, bufs: &mut [Vec<u8>], batch_size: usize) -> Result<usize> {
        if self.done.is_cancelled() {
            return Err(Self::stopped_error());
        }
        let limit = bufs.len().min(batch_size);
        if limit == 0 {
            return Ok(0);
        }

        let mut inbound = self.inbound.lock().await;
        let first = tokio::select! {
            biased;
            _ = self.done.cancelled() => return Err(Self::stopped_error()),
            frame = inbound.recv() => frame.ok_or_else(Self::stopped_error)?,
        };

        let mut n = 0;
        let mut next = Some(first);
        while let Some(frame) = next {
            self.metrics.frames_in.inc();
            self.metrics.bytes_in.inc_by(frame.len() as u64);
            bufs[n] = frame;
            n += 1;
            next = if n < limit { inbound.try_recv().ok() } else { None };
        }
        Ok(n)
    }

    async fn write(&self, bufs: &[Vec<u8>], sizes: &[usize]) -> Result<usize> {
        if self.done.is_cancelled() {
            return Err(Self::stopped_error());
        }

        let mut frames = Vec::with_capacity(bufs.len());
        for (buf, &size) in bufs.iter().zip(sizes) {
            let frame = buf.get(..size).ok_or_else(|| {
                PortalError::Anchor(format!(
                    "frame size {} exceeds buffer of {} bytes",
                    size,
                    buf.len()
                ))
            })?;
            frames.push(frame.to_vec());
        }

        let n = frames.len();
        for frame in &frames {
            self.metrics.frames_out.inc();
            self.metrics.bytes_out.inc_by(frame.len() as u64);
        }
        if let Ok(mut sent) = self.peer.sent.lock() {
            for frame in frames {
                sent.push(frame);
            }
        }
        self.peer.notify.notify_waiters();
        Ok(n)
    }

    async fn cidr(&self) -> Result<String> {
        if !self.is_started() {
            return Err(PortalError::Anchor("anchor not started".to_string()));
        }
        Ok(self.cidr.clone())
    }

    fn name(&self) -> String {
        self.param(|p| &p.name)
    }

    fn domain(&self) -> String {
        self.param(|p| &p.domain)
    }

    fn region(&self) -> String {
        self.param(|p| &p.region)
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn metrics_handler(&self) -> MethodRouter {
        let metrics = self.metrics.clone();
        get(move || async move {
            match metrics.encode() {
                Ok(body) => (
                    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    body,
                )
                    .into_response(),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            }
        })
    }
}

/// Connector handing out one shared [`MemoryAnchor`]
pub struct MemoryAnchorConnector {
    anchor: Arc<MemoryAnchor>,
}

impl MemoryAnchorConnector {
    pub fn new(anchor: Arc<MemoryAnchor>) -> Self {
        Self { anchor }
    }
}

impl AnchorConnector for MemoryAnchorConnector {
    fn connect(&self, portal: bool, public: bool) -> Result<Arc<dyn Anchor>> {
        debug!(portal, public, "Connecting in-process anchor");
        Ok(self.anchor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AnchorParams {
        AnchorParams {
            endpoint: "https://guardian.veilnet.org".to_string(),
            token: "secret".to_string(),
            name: "edge-1".to_string(),
            domain: "corp.veilnet".to_string(),
            region: "ap-southeast".to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_requires_token() {
        let anchor = MemoryAnchor::new("10.128.0.2/16").unwrap();
        let mut p = params();
        p.token.clear();

        let err = anchor.start(&p).await.unwrap_err();
        assert!(matches!(err, PortalError::Anchor(_)));
        assert!(anchor.cidr().await.is_err());
    }

    #[tokio::test]
    async fn test_accessors_after_start() {
        let anchor = MemoryAnchor::new("10.128.0.2/16").unwrap();
        anchor.start(&params()).await.unwrap();

        assert_eq!(anchor.cidr().await.unwrap(), "10.128.0.2/16");
        assert_eq!(anchor.name(), "edge-1");
        assert_eq!(anchor.domain(), "corp.veilnet");
        assert_eq!(anchor.region(), "ap-southeast");
        assert!(anchor.start(&params()).await.is_err());
    }

    #[tokio::test]
    async fn test_read_batches_peer_frames() {
        let anchor = MemoryAnchor::new("10.128.0.2/16").unwrap();
        let peer = anchor.peer();
        for i in 0..3u8 {
            peer.send(vec![i; (i + 1) as usize]);
        }

        let mut bufs = vec![Vec::new(); 2];
        assert_eq!(anchor.read(&mut bufs, 2).await.unwrap(), 2);
        assert_eq!(bufs[0], vec![0]);
        assert_eq!(bufs[1], vec![1, 1]);
        assert_eq!(anchor.read(&mut bufs, 2).await.unwrap(), 1);
        assert_eq!(bufs[0], vec![2, 2, 2]);
        assert_eq!(anchor.metrics().frames_in.get(), 3);
    }

    #[tokio::test]
    async fn test_write_honours_sizes() {
        let anchor = MemoryAnchor::new("10.128.0.2/16").unwrap();
        let bufs = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]];

        assert_eq!(anchor.write(&bufs, &[2, 4]).await.unwrap(), 2);
        assert_eq!(anchor.peer().received(), vec![vec![1, 2], vec![5, 6, 7, 8]]);
        assert_eq!(anchor.metrics().bytes_out.get(), 6);
        assert!(anchor.write(&bufs, &[9, 1]).await.is_err());
    }

    #[tokio::test]
    async fn test_written_history_is_bounded() {
        let anchor = MemoryAnchor::new("10.128.0.2/16")
            .unwrap()
            .with_history_limit(16);
        let peer = anchor.peer();

        for i in 0..10_000u32 {
            let frame = i.to_be_bytes().repeat(375);
            anchor.write(&[frame], &[1500]).await.unwrap();
        }

        let kept = peer.received();
        assert_eq!(kept.len(), 16);
        assert_eq!(kept[0][..4], 9_984u32.to_be_bytes());
        assert_eq!(kept[15][..4], 9_999u32.to_be_bytes());
        assert_eq!(peer.received_total(), 10_000);
        assert_eq!(anchor.metrics().frames_out.get(), 10_000);
        assert!(peer.wait_for_frames(10_000, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_zero_history_keeps_only_counts() {
        let anchor = MemoryAnchor::new("10.128.0.2/16")
            .unwrap()
            .with_history_limit(0);

        anchor.write(&[vec![7; 64]], &[64]).await.unwrap();

        assert!(anchor.peer().received().is_empty());
        assert_eq!(anchor.peer().received_total(), 1);
        assert_eq!(anchor.metrics().bytes_out.get(), 64);
    }

    #[tokio::test]
    async fn test_stop_unblocks_read() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let reader = anchor.clone();
        let pending = tokio::spawn(async move {
            let mut bufs = vec![Vec::new()];
            reader.read(&mut bufs, 1).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        anchor.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(anchor.done().is_cancelled());
    }

    #[test]
    fn test_metrics_encode() {
        let metrics = AnchorMetrics::new().unwrap();
        metrics.frames_out.inc_by(5);

        let text = metrics.encode().unwrap();
        assert!(text.contains("veilnet_anchor_frames_out_total 5"));
    }
}
