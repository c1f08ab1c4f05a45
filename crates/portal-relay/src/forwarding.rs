//! Packet forwarding between the anchor and the virtual interface
//!
//! Two independent loops run for the lifetime of the portal:
//!
//! - **ingress**: anchor -> virtual interface. Each frame is copied into a
//!   fresh buffer behind [`HEADER_OFFSET`] reserved bytes, which the device
//!   skips when writing.
//! - **egress**: virtual interface -> anchor. Frames are read into MTU-sized
//!   buffers that are reused across iterations and forwarded with their
//!   original sizes.
//!
//! Both loops check the shared cancellation token before every blocking call
//! and never interrupt an in-flight read or write; stopping the anchor and
//! closing the device is what unblocks them. Read failures are retried with
//! backoff under [`ForwardingPolicy`] and become fatal once the consecutive
//! failure budget is exhausted.

use crate::anchor::Anchor;
use crate::device::{VirtualInterface, DEFAULT_MTU};
use crate::error::{PortalError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bytes reserved in front of every frame handed to the virtual interface
pub const HEADER_OFFSET: usize = 16;

/// Retry policy shared by both forwarding loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingPolicy {
    /// Consecutive read failures tolerated before the loop fails
    pub max_consecutive_failures: u32,
    /// Delay after the first failure; doubles per further failure
    pub initial_backoff: Duration,
    /// Upper bound for the retry delay
    pub max_backoff: Duration,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 8,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl ForwardingPolicy {
    /// Delay before retrying after `failures` consecutive failures (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Outcome of a failed read inside a loop
enum Retry {
    Continue,
    Stop,
}

/// Consecutive failure accounting for one loop
struct FailureBudget<'a> {
    direction: &'static str,
    policy: &'a ForwardingPolicy,
    consecutive: u32,
}

impl<'a> FailureBudget<'a> {
    fn new(direction: &'static str, policy: &'a ForwardingPolicy) -> Self {
        Self {
            direction,
            policy,
            consecutive: 0,
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Record a read failure; sleeps for the backoff delay unless cancelled
    async fn on_failure(
        &mut self,
        err: &PortalError,
        cancel: &CancellationToken,
    ) -> std::result::Result<Retry, String> {
        if cancel.is_cancelled() {
            return Ok(Retry::Stop);
        }

        self.consecutive += 1;
        let transient = PortalError::TransientIo(err.to_string());
        if self.consecutive >= self.policy.max_consecutive_failures {
            return Err(format!(
                "{} consecutive read failures, last: {}",
                self.consecutive, err
            ));
        }

        let delay = self.policy.backoff(self.consecutive);
        warn!(
            direction = self.direction,
            failures = self.consecutive,
            retry_in_ms = delay.as_millis() as u64,
            error = %transient,
            "Forwarding read failed"
        );

        tokio::select! {
            _ = cancel.cancelled() => Ok(Retry::Stop),
            _ = tokio::time::sleep(delay) => Ok(Retry::Continue),
        }
    }
}

/// Forward frames from the anchor to the virtual interface until cancelled
pub async fn run_ingress(
    anchor: Arc<dyn Anchor>,
    device: Arc<dyn VirtualInterface>,
    policy: ForwardingPolicy,
    cancel: CancellationToken,
) -> Result<()> {
    let batch_size = device.batch_size().max(1);
    let mut bufs: Vec<Vec<u8>> = vec![Vec::new(); batch_size];
    let mut budget = FailureBudget::new("ingress", &policy);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let n = match anchor.read(&mut bufs, batch_size).await {
            Ok(n) => {
                budget.reset();
                n
            }
            Err(e) => match budget.on_failure(&e, &cancel).await {
                Ok(Retry::Continue) => continue,
                Ok(Retry::Stop) => break,
                Err(msg) => {
                    error!(error = %msg, "Failed to read from anchor");
                    return Err(PortalError::Anchor(msg));
                }
            },
        };
        if n == 0 {
            continue;
        }

        let frames: Vec<Vec<u8>> = bufs[..n]
            .iter()
            .map(|frame| {
                let mut buf = vec![0u8; HEADER_OFFSET + frame.len()];
                buf[HEADER_OFFSET..].copy_from_slice(frame);
                buf
            })
            .collect();

        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = device.write(&frames, HEADER_OFFSET).await {
            warn!(frames = n, error = %e, "Dropped ingress batch");
        }
    }

    info!("Portal ingress stopped");
    Ok(())
}

/// Forward frames from the virtual interface to the anchor until cancelled
pub async fn run_egress(
    anchor: Arc<dyn Anchor>,
    device: Arc<dyn VirtualInterface>,
    policy: ForwardingPolicy,
    cancel: CancellationToken,
) -> Result<()> {
    let batch_size = device.batch_size().max(1);
    let mtu = device.mtu().unwrap_or_else(|e| {
        error!(error = %e, fallback = DEFAULT_MTU, "Failed to get interface MTU");
        DEFAULT_MTU
    });
    debug!(mtu, batch_size, "Egress buffers allocated");

    let mut bufs = vec![vec![0u8; mtu]; batch_size];
    let mut sizes = vec![0usize; batch_size];
    let mut budget = FailureBudget::new("egress", &policy);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let n = match device.read(&mut bufs, &mut sizes, 0).await {
            Ok(n) => {
                budget.reset();
                n
            }
            Err(e) => match budget.on_failure(&e, &cancel).await {
                Ok(Retry::Continue) => continue,
                Ok(Retry::Stop) => break,
                Err(msg) => {
                    error!(error = %msg, "Failed to read from virtual interface");
                    return Err(PortalError::Device(msg));
                }
            },
        };
        if n == 0 {
            continue;
        }

        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = anchor.write(&bufs[..n], &sizes[..n]).await {
            warn!(frames = n, error = %e, "Dropped egress batch");
        }
    }

    info!("Portal egress stopped");
    Ok(())
}

/// Spawn both loops. A loop that fails cancels `fatal`.
pub fn spawn_loops(
    anchor: Arc<dyn Anchor>,
    device: Arc<dyn VirtualInterface>,
    policy: ForwardingPolicy,
    cancel: CancellationToken,
    fatal: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let ingress = {
        let (anchor, device, cancel, fatal) =
            (anchor.clone(), device.clone(), cancel.clone(), fatal.clone());
        tokio::spawn(async move {
            if let Err(e) = run_ingress(anchor, device, policy, cancel).await {
                error!(error = %e, "Ingress loop failed");
                fatal.cancel();
            }
        })
    };

    let egress = tokio::spawn(async move {
        if let Err(e) = run_egress(anchor, device, policy, cancel).await {
            error!(error = %e, "Egress loop failed");
            fatal.cancel();
        }
    });

    vec![ingress, egress]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::MemoryAnchor;
    use crate::device::MemoryInterface;

    fn fast_policy(max: u32) -> ForwardingPolicy {
        ForwardingPolicy {
            max_consecutive_failures: max,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ForwardingPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(80));
        assert_eq!(policy.backoff(30), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_ingress_reserves_header_offset() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 1500).with_batch_size(4));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_ingress(
            anchor.clone(),
            device.clone(),
            ForwardingPolicy::default(),
            cancel.clone(),
        ));

        anchor.peer().send(vec![0x45, 1, 2]);
        anchor.peer().send(vec![0x45, 3]);
        assert!(device.wait_for_writes(2, Duration::from_secs(1)).await);

        let written = device.written();
        assert_eq!(written[0].offset, HEADER_OFFSET);
        assert_eq!(written[0].buffer.len(), HEADER_OFFSET + 3);
        assert_eq!(written[0].payload(), &[0x45, 1, 2]);
        assert_eq!(written[1].payload(), &[0x45, 3]);

        cancel.cancel();
        anchor.stop().await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_egress_preserves_order_and_sizes() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 1500).with_batch_size(3));
        let frames: Vec<Vec<u8>> = (1..=5u8).map(|i| vec![i; i as usize * 10]).collect();
        for frame in &frames {
            device.inject(frame.clone());
        }
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_egress(
            anchor.clone(),
            device.clone(),
            ForwardingPolicy::default(),
            cancel.clone(),
        ));

        assert!(anchor.peer().wait_for_frames(5, Duration::from_secs(1)).await);
        assert_eq!(anchor.peer().received(), frames);

        cancel.cancel();
        device.close().await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_egress_falls_back_to_default_mtu() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 9000).without_mtu());
        device.inject(vec![7u8; DEFAULT_MTU]);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_egress(
            anchor.clone(),
            device.clone(),
            ForwardingPolicy::default(),
            cancel.clone(),
        ));

        assert!(anchor.peer().wait_for_frames(1, Duration::from_secs(1)).await);
        assert_eq!(anchor.peer().received()[0].len(), DEFAULT_MTU);

        cancel.cancel();
        device.close().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 1500));
        device.fail_next_reads(2);
        device.inject(vec![1, 2, 3]);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_egress(
            anchor.clone(),
            device.clone(),
            fast_policy(3),
            cancel.clone(),
        ));

        assert!(anchor.peer().wait_for_frames(1, Duration::from_secs(1)).await);

        cancel.cancel();
        device.close().await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_persistent_failures_escalate() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 1500));
        device.fail_next_reads(3);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            run_egress(anchor, device, fast_policy(3), CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(PortalError::Device(_))));
    }

    #[tokio::test]
    async fn test_failed_loop_raises_fatal() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 1500));
        device.fail_next_reads(1);
        let cancel = CancellationToken::new();
        let fatal = CancellationToken::new();

        let handles = spawn_loops(
            anchor.clone(),
            device.clone(),
            fast_policy(1),
            cancel.clone(),
            fatal.clone(),
        );

        tokio::time::timeout(Duration::from_secs(1), fatal.cancelled())
            .await
            .unwrap();

        cancel.cancel();
        anchor.stop().await;
        device.close().await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_error_after_cancel_is_clean_exit() {
        let anchor = Arc::new(MemoryAnchor::new("10.128.0.2/16").unwrap());
        let device = Arc::new(MemoryInterface::new("veilnet", 1500));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_ingress(
            anchor.clone(),
            device.clone(),
            fast_policy(1),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        anchor.stop().await;

        assert!(task.await.unwrap().is_ok());
        assert!(device.written().is_empty());
    }
}
