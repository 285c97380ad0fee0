//! Capture/Inject Bridge
//!
//! Couples a virtual adapter to a relay session: frames captured from
//! the local interface are classified and forwarded through the
//! session, and frames relayed from other members get their source
//! address rewritten to the sender's virtual address before injection.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::adapter::{open_matching, AdapterError, AdapterProvider, VirtualAdapter};
use crate::client::session::SessionClient;
use crate::core::frame::{classify, rewrite_source, FrameClass};
use crate::protocol::FrameRecv;

/// Bridge errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Adapter acquisition or capture failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// `start` called in a state other than `Ready`.
    #[error("bridge is not ready to start")]
    NotReady,
}

/// Bridge lifecycle. Transitions are one-way; a stopped bridge is not
/// restartable, callers build a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No adapter acquired yet.
    Uninitialized,
    /// Adapter acquired, not capturing.
    Ready,
    /// Pump running.
    Capturing,
    /// Pump stopped and adapter closed.
    Stopped,
}

type SharedAdapter = Arc<Mutex<Box<dyn VirtualAdapter>>>;

/// Bidirectional frame pump between a virtual adapter and a session.
pub struct Bridge {
    adapter: SharedAdapter,
    state: BridgeState,
    pump: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Bridge {
    /// Acquire the adapter matching `signature` from `provider`.
    pub fn new(provider: &dyn AdapterProvider, signature: &str) -> Result<Self, BridgeError> {
        let adapter = open_matching(provider, signature)?;
        Ok(Self {
            adapter: Arc::new(Mutex::new(adapter)),
            state: BridgeState::Ready,
            pump: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Start capturing. `frames` is the inbound half of the session
    /// (relayed frames to inject locally); outbound frames go through
    /// `client`.
    pub fn start(
        &mut self,
        client: SessionClient,
        frames: mpsc::Receiver<FrameRecv>,
    ) -> Result<(), BridgeError> {
        if self.state != BridgeState::Ready {
            return Err(BridgeError::NotReady);
        }
        let captured = self
            .adapter
            .lock()
            .expect("adapter lock poisoned")
            .start_capture()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(pump(self.adapter.clone(), captured, frames, client, stop_rx));
        self.pump = Some((stop_tx, handle));
        self.state = BridgeState::Capturing;
        Ok(())
    }

    /// Stop the pump and close the adapter. When this returns, no
    /// further frames will be injected.
    pub async fn stop(&mut self) {
        if let Some((stop_tx, handle)) = self.pump.take() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
        self.adapter.lock().expect("adapter lock poisoned").close();
        self.state = BridgeState::Stopped;
    }
}

/// Frame pump. Runs until stopped or either frame source ends.
async fn pump(
    adapter: SharedAdapter,
    mut captured: mpsc::Receiver<Vec<u8>>,
    mut relayed: mpsc::Receiver<FrameRecv>,
    client: SessionClient,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,

            frame = captured.recv() => {
                let Some(frame) = frame else { return };
                match classify(&frame) {
                    Err(e) => debug!(error = %e, "captured frame dropped"),
                    Ok(FrameClass::Broadcast) => {
                        if let Err(e) = client.send_broadcast(frame) {
                            trace!(error = %e, "outbound broadcast dropped");
                        }
                    }
                    Ok(FrameClass::Unicast(target)) => {
                        if let Err(e) = client.send_unicast(target, frame) {
                            trace!(error = %e, "outbound unicast dropped");
                        }
                    }
                }
            }

            envelope = relayed.recv() => {
                let Some(mut envelope) = envelope else { return };
                if let Err(e) = rewrite_source(&mut envelope.frame, envelope.sender) {
                    debug!(error = %e, "relayed frame dropped");
                    continue;
                }
                let result = adapter
                    .lock()
                    .expect("adapter lock poisoned")
                    .inject(&envelope.frame);
                if let Err(e) = result {
                    debug!(error = %e, "frame injection failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::adapter::{MemoryAdapterProvider, DEFAULT_ADAPTER_SIGNATURE};
    use crate::client::session::ClientConfig;
    use crate::core::frame::{DST_ADDR_OFFSET, SRC_ADDR_OFFSET};
    use crate::relay::{RelayConfig, RelayServer};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    async fn spawn_relay() -> String {
        let server = RelayServer::bind(RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..RelayConfig::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        format!("ws://{}", addr)
    }

    fn test_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut frame = vec![0u8; 28];
        frame[0] = 0x45;
        frame[SRC_ADDR_OFFSET..SRC_ADDR_OFFSET + 4].copy_from_slice(&src.octets());
        frame[DST_ADDR_OFFSET..DST_ADDR_OFFSET + 4].copy_from_slice(&dst.octets());
        frame
    }

    #[tokio::test]
    async fn test_no_adapter_available() {
        let provider = MemoryAdapterProvider::new();
        assert!(matches!(
            Bridge::new(&provider, DEFAULT_ADAPTER_SIGNATURE),
            Err(BridgeError::Adapter(AdapterError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let endpoint = spawn_relay().await;
        let (client, inbound) = SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
            .await
            .unwrap();

        let provider = MemoryAdapterProvider::new();
        let _handle = provider.add("vlan0", DEFAULT_ADAPTER_SIGNATURE);

        let mut bridge = Bridge::new(&provider, DEFAULT_ADAPTER_SIGNATURE).unwrap();
        assert_eq!(bridge.state(), BridgeState::Ready);

        bridge.start(client.clone(), inbound.frames).unwrap();
        assert_eq!(bridge.state(), BridgeState::Capturing);

        bridge.stop().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_start_requires_ready() {
        let endpoint = spawn_relay().await;
        let (client, inbound) = SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
            .await
            .unwrap();

        let provider = MemoryAdapterProvider::new();
        let _handle = provider.add("vlan0", DEFAULT_ADAPTER_SIGNATURE);

        let mut bridge = Bridge::new(&provider, DEFAULT_ADAPTER_SIGNATURE).unwrap();
        bridge.stop().await;

        let err = bridge.start(client, inbound.frames).unwrap_err();
        assert!(matches!(err, BridgeError::NotReady));
    }

    #[tokio::test]
    async fn test_inject_rewrites_source() {
        let endpoint = spawn_relay().await;
        let (client, _inbound) = SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
            .await
            .unwrap();

        let provider = MemoryAdapterProvider::new();
        let mut handle = provider.add("vlan0", DEFAULT_ADAPTER_SIGNATURE);
        let mut bridge = Bridge::new(&provider, DEFAULT_ADAPTER_SIGNATURE).unwrap();

        // Drive the inject path directly through the frames channel.
        let (frames_tx, frames_rx) = mpsc::channel(16);
        bridge.start(client, frames_rx).unwrap();

        let sender = Ipv4Addr::new(10, 5, 6, 2);
        let frame = test_frame(Ipv4Addr::new(192, 168, 0, 7), Ipv4Addr::new(10, 5, 6, 1));
        frames_tx
            .send(FrameRecv {
                sender,
                frame: frame.clone(),
            })
            .await
            .unwrap();

        let injected = tokio::time::timeout(Duration::from_secs(5), handle.injected_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&injected[SRC_ADDR_OFFSET..SRC_ADDR_OFFSET + 4], &sender.octets());
        assert_eq!(
            &injected[DST_ADDR_OFFSET..],
            &frame[DST_ADDR_OFFSET..],
        );

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_round_trip_between_two_members() {
        let endpoint = spawn_relay().await;

        let (host, host_inbound) =
            SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
                .await
                .unwrap();
        let host_provider = MemoryAdapterProvider::new();
        let mut host_handle = host_provider.add("vlan0", DEFAULT_ADAPTER_SIGNATURE);
        let mut host_bridge = Bridge::new(&host_provider, DEFAULT_ADAPTER_SIGNATURE).unwrap();
        let (code, host_addr) = host.create_room("DOTA", 8).await.unwrap();
        host_bridge.start(host.clone(), host_inbound.frames).unwrap();

        let (guest, guest_inbound) =
            SessionClient::connect(&endpoint, "Bob", ClientConfig::default())
                .await
                .unwrap();
        let guest_provider = MemoryAdapterProvider::new();
        let mut guest_handle = guest_provider.add("vlan0", DEFAULT_ADAPTER_SIGNATURE);
        let mut guest_bridge = Bridge::new(&guest_provider, DEFAULT_ADAPTER_SIGNATURE).unwrap();
        let (guest_addr, _members) = guest.join_room(&code).await.unwrap();
        guest_bridge
            .start(guest.clone(), guest_inbound.frames)
            .unwrap();

        // Guest's game emits a unicast toward the host's virtual address.
        let frame = test_frame(Ipv4Addr::new(192, 168, 0, 7), host_addr);
        guest_handle.capture_tx.send(frame.clone()).await.unwrap();

        let injected = tokio::time::timeout(Duration::from_secs(5), host_handle.injected_rx.recv())
            .await
            .unwrap()
            .unwrap();
        // Identical bytes except the source field now names the guest.
        assert_eq!(&injected[..SRC_ADDR_OFFSET], &frame[..SRC_ADDR_OFFSET]);
        assert_eq!(
            &injected[SRC_ADDR_OFFSET..SRC_ADDR_OFFSET + 4],
            &guest_addr.octets()
        );
        assert_eq!(&injected[DST_ADDR_OFFSET..], &frame[DST_ADDR_OFFSET..]);

        // Broadcast from the host reaches the guest.
        let bcast = test_frame(Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::BROADCAST);
        host_handle.capture_tx.send(bcast).await.unwrap();

        let injected =
            tokio::time::timeout(Duration::from_secs(5), guest_handle.injected_rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(
            &injected[SRC_ADDR_OFFSET..SRC_ADDR_OFFSET + 4],
            &host_addr.octets()
        );

        host_bridge.stop().await;
        guest_bridge.stop().await;
    }

    #[tokio::test]
    async fn test_truncated_capture_dropped() {
        let endpoint = spawn_relay().await;
        let (client, inbound) = SessionClient::connect(&endpoint, "Alice", ClientConfig::default())
            .await
            .unwrap();

        let provider = MemoryAdapterProvider::new();
        let handle = provider.add("vlan0", DEFAULT_ADAPTER_SIGNATURE);
        let mut bridge = Bridge::new(&provider, DEFAULT_ADAPTER_SIGNATURE).unwrap();
        bridge.start(client.clone(), inbound.frames).unwrap();

        // Too short to carry addresses; the pump drops it quietly.
        handle.capture_tx.send(vec![1, 2, 3]).await.unwrap();

        // The session is still healthy afterwards.
        assert!(client.ping().await.is_ok());
        bridge.stop().await;
    }
}
