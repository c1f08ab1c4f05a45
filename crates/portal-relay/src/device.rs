//! Virtual network interface (TUN) access
//!
//! The forwarding loops only see [`VirtualInterface`]: batched frame reads
//! and writes with a caller-chosen leading offset. [`TunInterface`] is the
//! Linux TUN implementation; [`MemoryInterface`] is an in-process stand-in
//! used by tests and standalone runs.

use crate::error::{PortalError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tun::{AbstractDevice, DeviceReader, DeviceWriter};

/// Default interface name
pub const DEFAULT_INTERFACE_NAME: &str = "veilnet";

/// Default (and fallback) interface MTU
pub const DEFAULT_MTU: usize = 1500;

/// A TUN-style device moving raw IP frames in batches
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Kernel name of the interface
    fn name(&self) -> &str;

    /// Preferred number of frames per read/write call
    fn batch_size(&self) -> usize;

    /// Current MTU of the interface
    fn mtu(&self) -> Result<usize>;

    /// Read up to `bufs.len()` frames. Frame `i` is stored in
    /// `bufs[i][offset..offset + sizes[i]]`. Returns the number of frames read.
    async fn read(&self, bufs: &mut [Vec<u8>], sizes: &mut [usize], offset: usize)
        -> Result<usize>;

    /// Write each buffer's bytes from `offset` onward as one frame.
    /// Returns the number of frames written.
    async fn write(&self, bufs: &[Vec<u8>], offset: usize) -> Result<usize>;

    /// Close the device. Pending and future reads fail.
    async fn close(&self) -> Result<()>;
}

/// Creates virtual interfaces
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn create(&self, name: &str, mtu: usize) -> Result<Arc<dyn VirtualInterface>>;
}

/// Linux TUN device backed by the `tun` crate
pub struct TunInterface {
    name: String,
    mtu: usize,
    reader: Mutex<Option<DeviceReader>>,
    writer: Mutex<Option<DeviceWriter>>,
    closed: CancellationToken,
}

impl TunInterface {
    /// Create (or attach to) the TUN device `name`. Addressing and link state
    /// are left to the route configurator.
    pub fn create(name: &str, mtu: usize) -> Result<Self> {
        let mtu_u16 = u16::try_from(mtu)
            .map_err(|_| PortalError::Device(format!("MTU {} out of range", mtu)))?;

        let mut config = tun::Configuration::default();
        config.tun_name(name).mtu(mtu_u16);

        let device = tun::create_as_async(&config)
            .map_err(|e| PortalError::Device(format!("failed to create TUN device: {}", e)))?;

        let name = device
            .tun_name()
            .map_err(|e| PortalError::Device(format!("failed to get TUN name: {}", e)))?;
        let mtu = device.mtu().map(usize::from).unwrap_or(mtu);

        // tun returns (writer, reader)
        let (writer, reader) = device
            .split()
            .map_err(|e| PortalError::Device(format!("failed to split TUN device: {}", e)))?;

        info!(interface = %name, mtu, "Created virtual interface");

        Ok(Self {
            name,
            mtu,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        })
    }

    fn closed_error(&self) -> PortalError {
        PortalError::Device(format!("interface {} is closed", self.name))
    }
}

/// A zero-length read means the TUN descriptor hit EOF
fn frames_read(name: &str, bytes: usize) -> Result<usize> {
    if bytes == 0 {
        return Err(PortalError::Device(format!("interface {} closed", name)));
    }
    Ok(1)
}

#[async_trait]
impl VirtualInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn mtu(&self) -> Result<usize> {
        Ok(self.mtu)
    }

    async fn read(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize> {
        let (Some(buf), Some(size)) = (bufs.first_mut(), sizes.first_mut()) else {
            return Ok(0);
        };
        if buf.len() <= offset {
            return Err(PortalError::Device(format!(
                "read buffer of {} bytes leaves no room after offset {}",
                buf.len(),
                offset
            )));
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(|| self.closed_error())?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.closed_error()),
            n = reader.read(&mut buf[offset..]) => {
                let n = n?;
                *size = n;
                frames_read(&self.name, n)
            }
        }
    }

    async fn write(&self, bufs: &[Vec<u8>], offset: usize) -> Result<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;

        let mut written = 0;
        for buf in bufs {
            let frame = buf.get(offset..).unwrap_or_default();
            writer.write_all(frame).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        debug!(interface = %self.name, "Closed virtual interface");
        Ok(())
    }
}

/// Creates [`TunInterface`] devices
#[derive(Debug, Clone, Copy, Default)]
pub struct TunDeviceFactory;

#[async_trait]
impl DeviceFactory for TunDeviceFactory {
    async fn create(&self, name: &str, mtu: usize) -> Result<Arc<dyn VirtualInterface>> {
        Ok(Arc::new(TunInterface::create(name, mtu)?))
    }
}

/// In-memory virtual interface.
///
/// Frames given to [`inject`](Self::inject) are returned by `read`, frames
/// passed to `write` are captured (payload after the offset, plus the full
/// buffer) and can be inspected with [`written`](Self::written).
pub struct MemoryInterface {
    name: String,
    mtu: Option<usize>,
    batch_size: usize,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: StdMutex<Vec<WrittenFrame>>,
    write_notify: Notify,
    read_failures: AtomicUsize,
    closed: CancellationToken,
}

/// A frame captured by [`MemoryInterface::write`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFrame {
    /// Offset the writer asked the interface to skip
    pub offset: usize,
    /// Entire buffer handed to the interface, reserved prefix included
    pub buffer: Vec<u8>,
}

impl WrittenFrame {
    /// Bytes the interface treats as the frame
    pub fn payload(&self) -> &[u8] {
        self.buffer.get(self.offset..).unwrap_or_default()
    }
}

impl MemoryInterface {
    pub fn new(name: &str, mtu: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            mtu: Some(mtu),
            batch_size: 1,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            written: StdMutex::new(Vec::new()),
            write_notify: Notify::new(),
            read_failures: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Frames returned per read at most
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Make `mtu()` fail, as a device without a queryable MTU would
    pub fn without_mtu(mut self) -> Self {
        self.mtu = None;
        self
    }

    /// Queue a frame for the next read
    pub fn inject(&self, frame: Vec<u8>) {
        let _ = self.inbound_tx.send(frame);
    }

    /// Make the next `count` reads fail
    pub fn fail_next_reads(&self, count: usize) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Frames written so far, in order
    pub fn written(&self) -> Vec<WrittenFrame> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Wait until at least `count` frames were written, or `timeout` elapses
    pub async fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.write_notify.notified();
                if self.written().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn closed_error(&self) -> PortalError {
        PortalError::Device(format!("interface {} is closed", self.name))
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn mtu(&self) -> Result<usize> {
        self.mtu
            .ok_or_else(|| PortalError::Device("MTU not available".to_string()))
    }

    async fn read(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        let failing = self
            .read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(PortalError::Device("scripted read failure".to_string()));
        }

        let limit = bufs.len().min(sizes.len()).min(self.batch_size);
        if limit == 0 {
            return Ok(0);
        }

        let mut rx = self.inbound_rx.lock().await;
        let first = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            frame = rx.recv() => frame.ok_or_else(|| self.closed_error())?,
        };

        let mut frames = vec![first];
        while frames.len() < limit {
            match rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }

        for (i, frame) in frames.iter().enumerate() {
            let end = offset + frame.len();
            if bufs[i].len() < end {
                return Err(PortalError::Device(format!(
                    "frame of {} bytes does not fit a {} byte buffer",
                    frame.len(),
                    bufs[i].len()
                )));
            }
            bufs[i][offset..end].copy_from_slice(frame);
            sizes[i] = frame.len();
        }
        Ok(frames.len())
    }

    async fn write(&self, bufs: &[Vec<u8>], offset: usize) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        if let Ok(mut written) = self.written.lock() {
            written.extend(bufs.iter().map(|buf| WrittenFrame {
                offset,
                buffer: buf.clone(),
            }));
        }
        self.write_notify.notify_waiters();
        Ok(bufs.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Hands out a shared [`MemoryInterface`], or fails creation on request
#[derive(Clone)]
pub struct MemoryDeviceFactory {
    interface: Arc<MemoryInterface>,
    failure: Option<String>,
}

impl MemoryDeviceFactory {
    pub fn new(interface: Arc<MemoryInterface>) -> Self {
        Self {
            interface,
            failure: None,
        }
    }

    /// Fail every `create` with a device error carrying `message`
    pub fn failing(interface: Arc<MemoryInterface>, message: &str) -> Self {
        Self {
            interface,
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl DeviceFactory for MemoryDeviceFactory {
    async fn create(&self, _name: &str, _mtu: usize) -> Result<Arc<dyn VirtualInterface>> {
        if let Some(message) = &self.failure {
            return Err(PortalError::Device(message.clone()));
        }
        Ok(self.interface.clone())
    }
}
