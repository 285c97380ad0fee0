//! Virtual Adapter Abstraction
//!
//! Seam between the capture/inject bridge and whatever provides the
//! virtual network interface on a given platform (TAP driver, pcap,
//! tun). The bridge enumerates adapters through an [`AdapterProvider`]
//! and picks the one whose descriptor matches the expected signature.
//!
//! A channel-backed in-memory implementation ships alongside the trait:
//! it is what the tests drive and a reference for real backends.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Descriptor substring identifying the expected virtual adapter.
pub const DEFAULT_ADAPTER_SIGNATURE: &str = "Virtlan Virtual Adapter";

/// Capture channel depth. Frames beyond this are dropped at the
/// adapter, never queued unboundedly.
const CAPTURE_QUEUE_DEPTH: usize = 256;

/// Adapter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// No interface matching the expected signature exists. Callers
    /// degrade to a no-LAN-emulation mode rather than failing hard.
    #[error("no virtual adapter matching \"{0}\" found")]
    Unavailable(String),

    /// Adapter handle has been closed.
    #[error("adapter is closed")]
    Closed,

    /// Capture was already started on this handle.
    #[error("capture already started")]
    AlreadyCapturing,
}

/// One enumerable network interface.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Platform interface name.
    pub name: String,
    /// Human-readable descriptor (driver description).
    pub descriptor: String,
}

/// An open virtual network interface handle.
pub trait VirtualAdapter: Send {
    /// Descriptor of the underlying interface.
    fn descriptor(&self) -> &str;

    /// Switch the interface into promiscuous capture. Captured frames
    /// arrive on the returned channel; the callback path behind it must
    /// never block on the consumer.
    fn start_capture(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError>;

    /// Inject a frame onto the interface so the local stack receives it
    /// as if it arrived over real hardware. Non-blocking.
    fn inject(&mut self, frame: &[u8]) -> Result<(), AdapterError>;

    /// Close the handle. No captures or injections after this.
    fn close(&mut self);
}

/// Enumerates and opens virtual adapters.
pub trait AdapterProvider: Send + Sync {
    /// List available interfaces.
    fn enumerate(&self) -> Vec<AdapterInfo>;

    /// Open an interface by name.
    fn open(&self, name: &str) -> Result<Box<dyn VirtualAdapter>, AdapterError>;
}

/// Open the first adapter whose descriptor contains `signature`
/// (case-insensitive).
pub fn open_matching(
    provider: &dyn AdapterProvider,
    signature: &str,
) -> Result<Box<dyn VirtualAdapter>, AdapterError> {
    let wanted = signature.to_ascii_lowercase();
    let info = provider
        .enumerate()
        .into_iter()
        .find(|i| i.descriptor.to_ascii_lowercase().contains(&wanted))
        .ok_or_else(|| AdapterError::Unavailable(signature.to_string()))?;
    provider.open(&info.name)
}

// =============================================================================
// IN-MEMORY ADAPTER
// =============================================================================

/// Test-side handle to a [`MemoryAdapter`]: feeds "captured" frames in
/// and observes injected frames out.
pub struct MemoryAdapterHandle {
    /// Push a frame as if the local game process emitted it.
    pub capture_tx: mpsc::Sender<Vec<u8>>,
    /// Frames the bridge injected toward the local game process.
    pub injected_rx: mpsc::Receiver<Vec<u8>>,
}

/// Channel-backed adapter with no OS dependency.
pub struct MemoryAdapter {
    info: AdapterInfo,
    capture_rx: Option<mpsc::Receiver<Vec<u8>>>,
    injected_tx: mpsc::Sender<Vec<u8>>,
    closed: bool,
}

impl MemoryAdapter {
    /// Create an adapter and its test-side handle.
    pub fn new(name: &str, descriptor: &str) -> (Self, MemoryAdapterHandle) {
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        let (injected_tx, injected_rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);

        let adapter = Self {
            info: AdapterInfo {
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            },
            capture_rx: Some(capture_rx),
            injected_tx,
            closed: false,
        };
        let handle = MemoryAdapterHandle {
            capture_tx,
            injected_rx,
        };
        (adapter, handle)
    }
}

impl VirtualAdapter for MemoryAdapter {
    fn descriptor(&self) -> &str {
        &self.info.descriptor
    }

    fn start_capture(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, AdapterError> {
        if self.closed {
            return Err(AdapterError::Closed);
        }
        self.capture_rx.take().ok_or(AdapterError::AlreadyCapturing)
    }

    fn inject(&mut self, frame: &[u8]) -> Result<(), AdapterError> {
        if self.closed {
            return Err(AdapterError::Closed);
        }
        // Full queue mirrors a saturated NIC: the frame is lost.
        if self.injected_tx.try_send(frame.to_vec()).is_err() {
            trace!(len = frame.len(), "injection queue full, frame dropped");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Provider over a fixed set of pre-built memory adapters.
pub struct MemoryAdapterProvider {
    adapters: Mutex<BTreeMap<String, MemoryAdapter>>,
}

impl MemoryAdapterProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self {
            adapters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register an adapter; returns the test-side handle.
    pub fn add(&self, name: &str, descriptor: &str) -> MemoryAdapterHandle {
        let (adapter, handle) = MemoryAdapter::new(name, descriptor);
        self.adapters
            .lock()
            .expect("adapter registry poisoned")
            .insert(name.to_string(), adapter);
        handle
    }
}

impl Default for MemoryAdapterProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterProvider for MemoryAdapterProvider {
    fn enumerate(&self) -> Vec<AdapterInfo> {
        self.adapters
            .lock()
            .expect("adapter registry poisoned")
            .values()
            .map(|a| a.info.clone())
            .collect()
    }

    fn open(&self, name: &str) -> Result<Box<dyn VirtualAdapter>, AdapterError> {
        let adapter = self
            .adapters
            .lock()
            .expect("adapter registry poisoned")
            .remove(name)
            .ok_or_else(|| AdapterError::Unavailable(name.to_string()))?;
        Ok(Box::new(adapter))
    }
}
