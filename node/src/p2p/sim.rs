//! In-process simulated peer fleet.
//!
//! Backs the localnet demo binary, the soak harness, and the end-to-end
//! tests: real channels, real latency, scripted misbehaviour, no sockets.

use super::{NetworkCommand, NetworkEvent, PeerId, PeerMessage};
use crate::chain::Block;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Scripted behaviour for a simulated peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerScript {
    /// Serves every request within its window.
    Honest,
    /// Never answers block requests.
    Stalled,
    /// Ignores requests for one height, serves the rest.
    SilentAt { height: i64 },
    /// Claims to have no block at one height it advertises.
    ClaimsNoBlockAt { height: i64 },
    /// Serves a block with a broken parent link at one height.
    CorruptAt { height: i64 },
}

#[derive(Debug, Clone)]
pub struct SimPeerSpec {
    pub id: PeerId,
    pub base: i64,
    pub height: i64,
    pub latency: Duration,
    pub status_interval: Duration,
    pub script: PeerScript,
}

impl SimPeerSpec {
    pub fn honest(id: impl Into<String>, base: i64, height: i64, latency: Duration) -> Self {
        Self {
            id: PeerId::new(id),
            base,
            height,
            latency,
            status_interval: Duration::from_secs(2),
            script: PeerScript::Honest,
        }
    }

    pub fn with_script(mut self, script: PeerScript) -> Self {
        self.script = script;
        self
    }
}

enum Control {
    Connect(SimPeerSpec),
    Disconnect(PeerId),
}

/// Handle for steering the fleet mid-run (churn scenarios).
#[derive(Clone)]
pub struct SimNetworkHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl SimNetworkHandle {
    /// Connect a new peer into the running fleet.
    pub fn connect(&self, spec: SimPeerSpec) {
        let _ = self.control.send(Control::Connect(spec));
    }

    /// Disconnect a peer as if its connection dropped.
    pub fn disconnect(&self, peer: PeerId) {
        let _ = self.control.send(Control::Disconnect(peer));
    }
}

type Fleet = Arc<RwLock<HashMap<PeerId, SimPeerSpec>>>;

/// Spawn the fleet task. It runs until the command channel closes.
pub fn spawn_sim_network(
    chain: Arc<Vec<Block>>,
    specs: Vec<SimPeerSpec>,
    events_tx: mpsc::Sender<NetworkEvent>,
    commands_rx: mpsc::Receiver<NetworkCommand>,
) -> SimNetworkHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_fleet(chain, specs, events_tx, commands_rx, control_rx));
    SimNetworkHandle {
        control: control_tx,
    }
}

async fn run_fleet(
    chain: Arc<Vec<Block>>,
    specs: Vec<SimPeerSpec>,
    events_tx: mpsc::Sender<NetworkEvent>,
    mut commands_rx: mpsc::Receiver<NetworkCommand>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let fleet: Fleet = Arc::new(RwLock::new(HashMap::new()));
    let mut control_open = true;

    for spec in specs {
        connect_peer(&fleet, &events_tx, spec).await;
    }

    loop {
        tokio::select! {
            maybe_command = commands_rx.recv() => {
                let Some(command) = maybe_command else {
                    break;
                };
                match command {
                    NetworkCommand::RequestBlock { peer, height } => {
                        serve_request(&fleet, &chain, &events_tx, peer, height);
                    }
                    NetworkCommand::ReportPeerError { peer, reason } => {
                        debug!(peer = %peer, reason = %reason, "disconnecting reported peer");
                        disconnect_peer(&fleet, &events_tx, &peer).await;
                    }
                    NetworkCommand::ReportPeersPruned { peers } => {
                        for peer in peers {
                            disconnect_peer(&fleet, &events_tx, &peer).await;
                        }
                    }
                }
            }
            maybe_control = control_rx.recv(), if control_open => {
                match maybe_control {
                    Some(Control::Connect(spec)) => {
                        connect_peer(&fleet, &events_tx, spec).await;
                    }
                    Some(Control::Disconnect(peer)) => {
                        disconnect_peer(&fleet, &events_tx, &peer).await;
                    }
                    // Handle dropped; keep serving until the driver goes away.
                    None => control_open = false,
                }
            }
        }
    }
}

async fn connect_peer(fleet: &Fleet, events_tx: &mpsc::Sender<NetworkEvent>, spec: SimPeerSpec) {
    let peer = spec.id.clone();
    fleet.write().insert(peer.clone(), spec.clone());
    if events_tx
        .send(NetworkEvent::PeerConnected { peer: peer.clone() })
        .await
        .is_err()
    {
        return;
    }

    // Status announcements run until the peer drops or the driver goes away.
    let fleet = Arc::clone(fleet);
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        loop {
            let Some((base, height)) = fleet.read().get(&peer).map(|s| (s.base, s.height)) else {
                break;
            };
            let sent = events_tx
                .send(NetworkEvent::Message {
                    peer: peer.clone(),
                    message: PeerMessage::Status { base, height },
                    received_at: Instant::now(),
                })
                .await;
            if sent.is_err() {
                break;
            }
            sleep(spec.status_interval).await;
        }
    });
}

async fn disconnect_peer(fleet: &Fleet, events_tx: &mpsc::Sender<NetworkEvent>, peer: &PeerId) {
    if fleet.write().remove(peer).is_none() {
        return;
    }
    let _ = events_tx
        .send(NetworkEvent::PeerDisconnected { peer: peer.clone() })
        .await;
}

fn serve_request(
    fleet: &Fleet,
    chain: &Arc<Vec<Block>>,
    events_tx: &mpsc::Sender<NetworkEvent>,
    peer: PeerId,
    height: i64,
) {
    let Some(spec) = fleet.read().get(&peer).cloned() else {
        return;
    };
    let fleet = Arc::clone(fleet);
    let chain = Arc::clone(chain);
    let events_tx = events_tx.clone();

    tokio::spawn(async move {
        sleep(spec.latency).await;
        // Connection may have dropped while the reply was in flight.
        if !fleet.read().contains_key(&peer) {
            return;
        }

        let message = match spec.script {
            PeerScript::Stalled => return,
            PeerScript::SilentAt { height: silent } if silent == height => return,
            PeerScript::ClaimsNoBlockAt { height: claimed } if claimed == height => {
                PeerMessage::NoBlock { height }
            }
            _ => match block_at(&chain, &spec, height) {
                Some(mut block) => {
                    if matches!(spec.script, PeerScript::CorruptAt { height: bad } if bad == height)
                    {
                        block.header.last_block_hash.0[0] ^= 0xff;
                    }
                    PeerMessage::Block { block }
                }
                None => PeerMessage::NoBlock { height },
            },
        };

        trace!(peer = %peer, height, "sim peer replying");
        let _ = events_tx
            .send(NetworkEvent::Message {
                peer,
                message,
                received_at: Instant::now(),
            })
            .await;
    });
}

fn block_at(chain: &[Block], spec: &SimPeerSpec, height: i64) -> Option<Block> {
    if height < spec.base || height > spec.height {
        return None;
    }
    let index = usize::try_from(height - 1).ok()?;
    chain.get(index).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::devnet_chain;

    async fn next_message(
        events_rx: &mut mpsc::Receiver<NetworkEvent>,
        want: &PeerId,
    ) -> PeerMessage {
        loop {
            match events_rx.recv().await.expect("event") {
                NetworkEvent::Message { peer, message, .. } if &peer == want => return message,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn fleet_announces_and_serves_blocks() {
        let chain = Arc::new(devnet_chain(10, 1));
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let p1 = PeerId::from("P1");
        let _handle = spawn_sim_network(
            Arc::clone(&chain),
            vec![SimPeerSpec::honest("P1", 1, 10, Duration::from_millis(1))],
            events_tx,
            commands_rx,
        );

        match events_rx.recv().await.expect("event") {
            NetworkEvent::PeerConnected { peer } => assert_eq!(peer, p1),
            other => panic!("expected connect, got {other:?}"),
        }
        match next_message(&mut events_rx, &p1).await {
            PeerMessage::Status { base, height } => {
                assert_eq!((base, height), (1, 10));
            }
            other => panic!("expected status, got {other:?}"),
        }

        commands_tx
            .send(NetworkCommand::RequestBlock {
                peer: p1.clone(),
                height: 3,
            })
            .await
            .expect("send");
        loop {
            match next_message(&mut events_rx, &p1).await {
                PeerMessage::Block { block } => {
                    assert_eq!(block.height(), 3);
                    assert_eq!(block, chain[2]);
                    break;
                }
                PeerMessage::Status { .. } => continue,
                other => panic!("expected block, got {other:?}"),
            }
        }

        // Outside the window: honest peers answer NoBlock.
        commands_tx
            .send(NetworkCommand::RequestBlock {
                peer: p1.clone(),
                height: 11,
            })
            .await
            .expect("send");
        loop {
            match next_message(&mut events_rx, &p1).await {
                PeerMessage::NoBlock { height } => {
                    assert_eq!(height, 11);
                    break;
                }
                PeerMessage::Status { .. } => continue,
                other => panic!("expected no-block, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn reported_peer_is_disconnected_once() {
        let chain = Arc::new(devnet_chain(5, 1));
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let p1 = PeerId::from("P1");
        let _handle = spawn_sim_network(
            chain,
            vec![SimPeerSpec::honest("P1", 1, 5, Duration::from_millis(1))],
            events_tx,
            commands_rx,
        );

        for _ in 0..2 {
            commands_tx
                .send(NetworkCommand::ReportPeerError {
                    peer: p1.clone(),
                    reason: "test".to_string(),
                })
                .await
                .expect("send");
        }

        let mut disconnects = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await
        {
            if matches!(event, NetworkEvent::PeerDisconnected { ref peer } if peer == &p1) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }
}
