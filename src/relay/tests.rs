use super::{catch_up::*, publisher::PublishedMessage, *};
use crate::{
    ledger::{memory::MemoryLedger, KvWrite, Ledger, RevocationList, Transaction},
    merkle::MerkleTree,
    pcn::{ProofChainNotarization, RevocationInstruction},
    test_util::{self, TestIdentity},
    types::Fingerprint,
};
use openssl::x509::X509;
use tokio::sync::broadcast;

struct Fixture {
    ledger:    Arc<MemoryLedger>,
    relay:     Arc<Relay>,
    publisher: Arc<ChannelPublisher>,
    verifier:  RelayVerifier,
    root:      TestIdentity,
}

impl Fixture {
    fn new(genesis_block: u64) -> Self {
        let root = test_util::self_signed("Root");
        let ledger = Arc::new(
            MemoryLedger::with_instantiation_block(&[root.cert.clone()], genesis_block)
                .expect("Ledger."),
        );
        let session = Arc::new(LedgerSession::new(ledger.clone()));
        let publisher = Arc::new(ChannelPublisher::new(1024));
        let signer = RelaySigner::from_pkey(test_util::rsa_key()).expect("RSA is supported.");
        let verifier = signer.verifier().expect("Public key.");
        let config = RelayConfig::new().set_genesis_block(genesis_block);
        let relay = Arc::new(
            Relay::new(session, signer, publisher.clone(), config).expect("Relay."),
        );
        Self {
            ledger,
            relay,
            publisher,
            verifier,
            root,
        }
    }

    /// Append a block committing one batch root with the given revocations.
    fn append(&self, tag: &[u8], revoked: &[&X509]) -> u64 {
        let revoker = test_util::identity("Bob", &self.root);
        let anchor = {
            let mut proof = MerkleTree::build([b"anchor"]).validation_info(0).expect("In range.");
            proof.height = 0;
            proof
        };
        let pcns = revoked
            .iter()
            .map(|cert| {
                let mut pcn = ProofChainNotarization::new(
                    vec![revoker.cert.clone(), self.root.cert.clone()],
                    vec![anchor.clone()],
                )
                .expect("Valid chain.");
                pcn.set_revocation(RevocationInstruction::sign(cert, &revoker.key).expect("Signed."));
                pcn.to_text().expect("Serializable.")
            })
            .collect();
        let value = serde_json::to_vec(&RevocationList(pcns)).expect("JSON");
        self.ledger
            .append_block(vec![Transaction {
                valid:  true,
                writes: vec![KvWrite {
                    key: MerkleTree::build([tag]).root().to_hex(),
                    value,
                }],
            }])
            .expect("Appended.")
    }
}

fn drain(rx: &mut broadcast::Receiver<PublishedMessage>) -> (Vec<RelayBlockMessage>, Vec<BloomMessage>) {
    let mut blocks = Vec::new();
    let mut blooms = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if message.topic == RELAY_BLOCK_TOPIC {
            blocks.push(serde_json::from_slice(&message.payload).expect("Block message."));
        } else {
            assert_eq!(message.topic, BLOOM_FILTER_TOPIC);
            blooms.push(serde_json::from_slice(&message.payload).expect("Bloom message."));
        }
    }
    (blocks, blooms)
}

fn assert_chain(blocks: &[RelayBlockMessage], verifier: &RelayVerifier) {
    for (i, message) in blocks.iter().enumerate() {
        assert_eq!(message.blockhash, message.block.hash());
        assert_eq!(message.siglist.len(), 1);
        assert!(verifier.verify(&message.block, &message.siglist[0]));
        if i > 0 {
            assert!(message.block.follows(&blocks[i - 1].block));
        }
    }
}

fn fingerprint(cert: &X509) -> Fingerprint { Fingerprint::of_certificate(cert).expect("Supported key.") }

#[tokio::test]
async fn catch_up_after_missed_blocks() {
    let fixture = Fixture::new(5);
    let controller = CatchUpController::new(fixture.relay.clone()).expect("Controller.");
    let mut rx = fixture.publisher.subscribe();

    // Blocks before the instantiation are not relayed.
    controller.catch_up_to(3).await.expect("Nothing to do.");
    controller.catch_up_to(5).await.expect("Genesis.");
    let (genesis, blooms) = drain(&mut rx);
    assert_eq!(genesis.len(), 1);
    assert!(blooms.is_empty());
    let anchors = MerkleTree::build([fixture.root.cert.to_der().expect("DER")]);
    assert_eq!(genesis[0].block.index, 0);
    assert_eq!(genesis[0].block.root, anchors.root());
    assert!(genesis[0].block.bloom.is_empty() && genesis[0].block.previous.is_empty());

    let alice = test_util::identity("Alice", &fixture.root);
    let carol = test_util::identity("Carol", &fixture.root);
    assert_eq!(fixture.append(b"six", &[&alice.cert]), 6);
    fixture.append(b"seven", &[]);
    fixture.append(b"eight", &[&carol.cert]);
    assert_eq!(fixture.append(b"nine", &[]), 9);

    // Only the event for the last block arrives.
    controller.catch_up_to(9).await.expect("Caught up.");
    let (blocks, blooms) = drain(&mut rx);
    assert_eq!(
        blocks.iter().map(|m| m.block.index).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert!(blocks[0].block.follows(&genesis[0].block));
    assert_chain(&blocks, &fixture.verifier);
    assert_eq!(blooms.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    for (block, bloom) in blocks.iter().zip(&blooms) {
        let filter = BloomFilterState::from_bytes(&bloom.filter).expect("Filter.");
        assert_eq!(block.block.bloom, filter.hash().to_vec());
    }
    let first = BloomFilterState::from_bytes(&blooms[0].filter).expect("Filter.");
    assert!(first.contains(&fingerprint(&alice.cert)));
    assert!(!first.contains(&fingerprint(&carol.cert)));
    let last = BloomFilterState::from_bytes(&blooms[3].filter).expect("Filter.");
    assert!(last.contains(&fingerprint(&alice.cert)));
    assert!(last.contains(&fingerprint(&carol.cert)));
    assert_eq!(fixture.relay.filter().expect("Filter.").to_bytes(), blooms[3].filter);

    let block_nine = fixture.relay.tail().expect("State.").expect("Tail.");
    assert_eq!(block_nine, blocks[3].block);
    let session_root = LedgerSession::new(fixture.ledger.clone())
        .query_block(9)
        .await
        .expect("Block.")
        .root_tree()
        .root();
    assert_eq!(block_nine.root, session_root);

    // Retained messages are the latest ones.
    let retained = fixture
        .publisher
        .retained(RELAY_BLOCK_TOPIC)
        .expect("Readable.")
        .expect("Retained.");
    assert_eq!(
        serde_json::from_slice::<RelayBlockMessage>(&retained).expect("Block message."),
        blocks[3]
    );

    // Repeated and stale events change nothing.
    controller.catch_up_to(9).await.expect("Idempotent.");
    controller.catch_up_to(7).await.expect("Already there.");
    let (blocks, blooms) = drain(&mut rx);
    assert!(blocks.is_empty() && blooms.is_empty());
    assert_eq!(controller.progress().next_block, 10);
}

#[tokio::test]
async fn replay_matches_live_chain() {
    let fixture = Fixture::new(1);
    let controller = CatchUpController::new(fixture.relay.clone()).expect("Controller.");
    let mut rx = fixture.publisher.subscribe();
    let alice = test_util::identity("Alice", &fixture.root);
    fixture.append(b"two", &[]);
    fixture.append(b"three", &[&alice.cert]);
    fixture.append(b"four", &[]);

    assert_eq!(fixture.relay.latest_index().await.expect("Height."), Some(3));
    controller.catch_up_to(4).await.expect("Caught up.");
    let (blocks, _) = drain(&mut rx);
    assert_eq!(blocks.len(), 4);
    assert_chain(&blocks, &fixture.verifier);

    for (i, live) in blocks.iter().enumerate() {
        let replayed = fixture.relay.replay(i as u64).await.expect("Replayed.");
        assert_eq!(&replayed, live);
    }
    assert!(matches!(
        fixture.relay.replay(4).await,
        Err(RelayError::BeyondTip {
            index:  4,
            latest: Some(3),
        })
    ));
    // Replaying publishes nothing and leaves the live chain alone.
    assert!(drain(&mut rx).0.is_empty());
    assert_eq!(fixture.relay.next_block().expect("State."), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_collapse() {
    let fixture = Fixture::new(1);
    let controller = CatchUpController::new(fixture.relay.clone()).expect("Controller.");
    let mut rx = fixture.publisher.subscribe();
    for i in 0..12u8 {
        fixture.append(&[i], &[]);
    }
    let tip = fixture.ledger.query_chain_height().await.expect("Height.") - 1;
    assert_eq!(tip, 13);

    let tasks: Vec<_> = (0..24u64)
        .map(|i| {
            let controller = controller.clone();
            let target = 1 + (i * 7) % tip;
            tokio::spawn(async move { controller.catch_up_to(target).await.map(|_| target) })
        })
        .collect();
    for task in tasks {
        let target = task.await.expect("Task.").expect("Caught up.");
        assert!(fixture.relay.next_block().expect("State.") > target);
    }
    controller.catch_up_to(tip).await.expect("Caught up.");

    let (blocks, blooms) = drain(&mut rx);
    assert_eq!(
        blocks.iter().map(|m| m.block.index).collect::<Vec<_>>(),
        (0..=12).collect::<Vec<u32>>()
    );
    assert_eq!(blooms.len(), 12);
    assert_chain(&blocks, &fixture.verifier);
}

#[tokio::test]
async fn stalled_catch_up_recovers() {
    let fixture = Fixture::new(1);
    let controller = CatchUpController::new(fixture.relay.clone()).expect("Controller.");
    fixture.append(b"two", &[]);

    // An event for a block the ledger cannot serve yet.
    match controller.catch_up_to(3).await {
        Err(CatchUpError::Stalled {
            reached, target, ..
        }) => {
            assert_eq!(reached, 3);
            assert_eq!(target, 3);
        }
        other => panic!("Unexpected result {:?}", other),
    }
    assert_eq!(controller.progress().failures, 1);
    assert_eq!(fixture.relay.next_block().expect("State."), 3);

    fixture.append(b"three", &[]);
    controller.catch_up_to(3).await.expect("Recovered.");
    assert_eq!(fixture.relay.next_block().expect("State."), 4);
}

#[tokio::test]
async fn relays_block_events_from_listener() {
    let fixture = Fixture::new(1);
    let controller = CatchUpController::new(fixture.relay.clone()).expect("Controller.");
    let session = Arc::new(LedgerSession::new(fixture.ledger.clone()));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let config = crate::listener::ListenerConfig::new().set_stop_signal(async move {
        let _ = stop_rx.await;
    });
    let task = {
        let session = session.clone();
        let controller = controller.clone();
        tokio::spawn(async move { config.listen(&session, &controller).await })
    };
    while fixture.ledger.active_registrations().expect("Count.") == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    fixture.append(b"two", &[]);
    fixture.append(b"three", &[]);
    let mut progress = controller.subscribe();
    while progress.borrow_and_update().next_block < 4 {
        progress.changed().await.expect("Controller alive.");
    }
    assert_eq!(
        fixture.relay.tail().expect("State.").map(|b| b.index),
        Some(2)
    );
    stop_tx.send(()).expect("Listener running.");
    task.await.expect("Task.").expect("Listener.");
}
