//! End-to-end runs of several clients wired through an in-process relay.

use std::sync::Arc;
use std::time::Duration;

use mixclient::{
    BlameReason, BlameVerdict, ChainParams, Client, Denomination, DigestCrypto, FailureReason,
    HookAction, HookPoint, MemoryRelay, MixConfig, MixError, MixMessage, MixOutcome,
    NoopObserver, OutputCommitment, PairRequest, PairRequestId, PeerId, PhaseBudgets,
    PhaseMessage, RunContext, RunObserver, SessionId,
};
use tokio::sync::mpsc;

const TIP: u32 = 1000;
const PHASE: Duration = Duration::from_millis(300);
const WAIT: Duration = Duration::from_secs(20);

struct Node {
    client: Client,
    outcomes: mpsc::UnboundedReceiver<MixOutcome>,
    request: PairRequestId,
    output: OutputCommitment,
}

impl Node {
    async fn outcome(&mut self) -> MixOutcome {
        tokio::time::timeout(WAIT, self.outcomes.recv())
            .await
            .expect("no outcome in time")
            .expect("outcome channel closed")
    }
}

#[derive(Clone, Copy)]
enum Fault {
    Corrupt,
    Withhold,
}

/// Misbehaves at one hook point during the first epoch only.
struct Inject {
    point: HookPoint,
    fault: Fault,
}

impl RunObserver for Inject {
    fn before_publish(
        &self,
        point: HookPoint,
        ctx: &RunContext,
        message: &mut PhaseMessage,
    ) -> HookAction {
        if ctx.epoch != 0 || point != self.point {
            return HookAction::Continue;
        }
        match self.fault {
            Fault::Corrupt => {
                message.payload.truncate(4);
                HookAction::Continue
            }
            Fault::Withhold => HookAction::Withhold,
        }
    }
}

fn peer(i: usize) -> PeerId {
    PeerId([i as u8 + 1; 32])
}

fn output(i: usize) -> OutputCommitment {
    OutputCommitment([i as u8 + 101; 32])
}

fn honest(n: usize) -> Vec<Arc<dyn RunObserver>> {
    (0..n)
        .map(|_| Arc::new(NoopObserver) as Arc<dyn RunObserver>)
        .collect()
}

fn config(min_participants: usize) -> MixConfig {
    MixConfig::new(
        min_participants,
        PhaseBudgets::uniform(PHASE),
        ChainParams::new(Duration::from_secs(150)),
    )
    .with_max_no_fault_retries(1)
}

/// Builds one client per observer and exchanges every pair request before returning.
async fn network(min_participants: usize, observers: Vec<Arc<dyn RunObserver>>) -> Vec<Node> {
    let relay = MemoryRelay::new();
    let mut nodes = Vec::new();
    let mut inbound = Vec::new();
    let mut requests = Vec::new();

    for (i, observer) in observers.into_iter().enumerate() {
        let (handle, rx) = relay.connect(peer(i));
        let (client, outcomes) = Client::new(
            peer(i),
            config(min_participants),
            Arc::new(DigestCrypto),
            Arc::new(handle),
            observer,
        )
        .unwrap();
        client.set_tip(TIP).await;
        let expiry = client.max_expiry().await;
        let request =
            PairRequest::new(peer(i), vec![output(i)], Denomination(50_000), expiry).unwrap();
        nodes.push(Node {
            client,
            outcomes,
            request: request.id(),
            output: output(i),
        });
        inbound.push(rx);
        requests.push(request);
    }

    for (node, request) in nodes.iter().zip(requests) {
        node.client.submit(request).await.unwrap();
    }
    for (node, rx) in nodes.iter().zip(inbound.iter_mut()) {
        while let Ok(message) = rx.try_recv() {
            node.client.receive(message).await.unwrap();
        }
    }
    for (node, rx) in nodes.iter().zip(inbound) {
        node.client.attach(rx);
    }
    nodes
}

async fn pair_all(nodes: &[Node]) {
    for node in nodes {
        let results = node.client.pair().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok(), "pairing failed: {:?}", results[0].1);
    }
}

fn completed(outcome: MixOutcome) -> (SessionId, u32, [u8; 32], Vec<BlameVerdict>) {
    match outcome {
        MixOutcome::Completed {
            session_id,
            epoch,
            transaction,
            verdicts,
            ..
        } => (session_id, epoch, transaction.hash(), verdicts),
        other => panic!("expected a completed mix, got {:?}", other),
    }
}

#[tokio::test]
async fn test_honest_peers_complete_without_blame() {
    let mut nodes = network(3, honest(4)).await;
    pair_all(&nodes).await;

    let mut results = Vec::new();
    for node in nodes.iter_mut() {
        results.push(completed(node.outcome().await));
    }
    let (session_id, _, tx_hash, _) = results[0].clone();
    for (sid, epoch, hash, verdicts) in results {
        assert_eq!(sid, session_id);
        assert_eq!(epoch, 0);
        assert_eq!(hash, tx_hash);
        assert!(verdicts.is_empty());
    }
    for node in &nodes {
        assert!(!node.client.is_locked(&node.output).await);
        assert!(!node.client.knows_request(&node.request).await);
    }
}

#[tokio::test]
async fn test_malformed_ciphertext_blames_only_sender() {
    let mut observers = honest(4);
    observers[0] = Arc::new(Inject {
        point: HookPoint::BeforeCtPublish,
        fault: Fault::Corrupt,
    });
    let mut nodes = network(3, observers).await;
    pair_all(&nodes).await;

    let mut tx_hash = None;
    for node in nodes.iter_mut().skip(1) {
        let (session_id, epoch, hash, verdicts) = completed(node.outcome().await);
        assert_eq!(epoch, 1);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].blamed, vec![peer(0)]);
        assert_eq!(verdicts[0].reason, BlameReason::Misbehavior);
        assert_eq!(verdicts[0].epoch, 0);
        assert_ne!(verdicts[0].session_id, session_id);
        assert_eq!(*tx_hash.get_or_insert(hash), hash);
    }

    // The saboteur's request stays excluded; a fresh one from the same identity is welcome.
    let excluded =
        PairRequest::new(peer(0), vec![output(0)], Denomination(50_000), TIP + 25).unwrap();
    assert_eq!(excluded.id(), nodes[0].request);
    assert_eq!(
        nodes[1]
            .client
            .receive(MixMessage::PairRequest(excluded))
            .await,
        Err(MixError::Excluded(nodes[0].request))
    );
    let fresh =
        PairRequest::new(peer(0), vec![output(0)], Denomination(50_000), TIP + 24).unwrap();
    assert_eq!(
        nodes[1]
            .client
            .receive(MixMessage::PairRequest(fresh))
            .await,
        Ok(())
    );
}

#[tokio::test]
async fn test_withheld_dc_blames_unresponsive_peer() {
    let mut observers = honest(4);
    observers[2] = Arc::new(Inject {
        point: HookPoint::BeforeDcPublish,
        fault: Fault::Withhold,
    });
    let mut nodes = network(3, observers).await;
    pair_all(&nodes).await;

    for (i, node) in nodes.iter_mut().enumerate() {
        if i == 2 {
            continue;
        }
        let (_, epoch, _, verdicts) = completed(node.outcome().await);
        assert_eq!(epoch, 1);
        assert_eq!(verdicts[0].blamed, vec![peer(2)]);
        assert_eq!(verdicts[0].reason, BlameReason::Unresponsive);
    }
}

#[tokio::test]
async fn test_silence_retries_same_participants() {
    let observers: Vec<Arc<dyn RunObserver>> = (0..3)
        .map(|_| {
            Arc::new(Inject {
                point: HookPoint::BeforeSrPublish,
                fault: Fault::Withhold,
            }) as Arc<dyn RunObserver>
        })
        .collect();
    let mut nodes = network(3, observers).await;
    pair_all(&nodes).await;

    for node in nodes.iter_mut() {
        let (session_id, epoch, _, verdicts) = completed(node.outcome().await);
        assert_eq!(epoch, 1);
        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].is_empty());
        assert_eq!(verdicts[0].reason, BlameReason::NoFault);
        assert_eq!(verdicts[0].session_id, session_id);
    }
}

#[tokio::test]
async fn test_locked_output_cannot_join_second_session() {
    let mut nodes = network(3, honest(3)).await;
    // Node 2 never pairs, so the session of nodes 0 and 1 stalls in its first phase.
    pair_all(&nodes[..2]).await;
    assert!(nodes[0].client.is_locked(&output(0)).await);
    assert!(nodes[0].client.pair().await.is_empty());

    let reuse = PairRequest::new(
        PeerId([77; 32]),
        vec![output(1)],
        Denomination(50_000),
        TIP + 5,
    )
    .unwrap();
    assert_eq!(
        nodes[0]
            .client
            .receive(MixMessage::PairRequest(reuse))
            .await,
        Err(MixError::OutputLocked(output(1)))
    );

    // Node 2 is silent towards both: each of them blames it and the session dissolves.
    match nodes[0].outcome().await {
        MixOutcome::Failed {
            reason, verdicts, ..
        } => {
            assert_eq!(reason, FailureReason::InsufficientPeers { have: 2, need: 3 });
            assert_eq!(verdicts[0].blamed, vec![peer(2)]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!nodes[0].client.is_locked(&output(0)).await);
}

#[tokio::test]
async fn test_cancel_releases_locks_without_verdict() {
    let mut nodes = network(3, honest(3)).await;
    pair_all(&nodes[..2]).await;
    assert!(nodes[0].client.is_locked(&output(0)).await);

    nodes[0].client.cancel(&nodes[0].request).await.unwrap();
    assert!(!nodes[0].client.is_locked(&output(0)).await);
    assert!(!nodes[0].client.is_locked(&output(1)).await);

    match nodes[0].outcome().await {
        MixOutcome::Failed {
            request,
            reason,
            verdicts,
        } => {
            assert_eq!(request.id(), nodes[0].request);
            assert_eq!(reason, FailureReason::Cancelled);
            assert!(verdicts.is_empty());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // Back in the idle pool.
    assert!(nodes[0].client.knows_request(&nodes[0].request).await);
    assert_eq!(nodes[0].client.active_sessions().await, 0);
}

#[tokio::test]
async fn test_spent_output_cancels_run() {
    let mut nodes = network(3, honest(3)).await;
    pair_all(&nodes[..2]).await;

    assert_eq!(nodes[0].client.outputs_spent(&[output(0)]).await, 1);
    match nodes[0].outcome().await {
        MixOutcome::Failed {
            reason, verdicts, ..
        } => {
            assert_eq!(reason, FailureReason::OutputsSpent);
            assert!(verdicts.is_empty());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!nodes[0].client.knows_request(&nodes[0].request).await);
    assert!(!nodes[0].client.is_locked(&output(1)).await);
}

#[tokio::test]
async fn test_pairing_loop_forms_session() {
    let mut nodes = network(3, honest(3)).await;
    for node in &nodes {
        node.client.spawn_pairing_loop();
    }
    let mut sessions = Vec::new();
    for node in nodes.iter_mut() {
        let (session_id, epoch, _, _) = completed(node.outcome().await);
        assert_eq!(epoch, 0);
        sessions.push(session_id);
    }
    assert!(sessions.windows(2).all(|w| w[0] == w[1]));
}
