use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use hushdrop_engine::gate::CredentialParams;
use hushdrop_engine::vault::{self, LayerKdfParams};
use hushdrop_engine::{
    DbStore, EngineConfig, ManualClock, MemoryStore, NewSecret, RecordStore, RedeemError,
    RedemptionLedger,
};
use tempfile::TempDir;
use uuid::Uuid;

const NOW: i64 = 1_700_000_000;

fn config() -> EngineConfig {
    EngineConfig {
        data_dir: None,
        public_base_url: "https://drop.test".into(),
        sweep_interval: Duration::from_secs(60),
        credentials: CredentialParams {
            iterations: 1_000,
            ..Default::default()
        },
        password_layer: true,
        layer_kdf: LayerKdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
    }
}

fn ledger_over(store: Arc<dyn RecordStore>) -> (RedemptionLedger, ManualClock) {
    let clock = ManualClock::new(NOW);
    let ledger = RedemptionLedger::new(store, vault::generate_key(), &config())
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    (ledger, clock)
}

/// Both backends, with the tempdir kept alive alongside the redb store.
fn backends() -> Vec<(&'static str, Arc<dyn RecordStore>, Option<TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let memory: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let db: Arc<dyn RecordStore> = Arc::new(DbStore::open(&dir.path().join("race.db")).unwrap());
    vec![("memory", memory, None), ("redb", db, Some(dir))]
}

/// Fire `n` concurrent views released by one barrier.
fn race_views(
    ledger: &RedemptionLedger,
    id: Uuid,
    n: usize,
    password: Option<&str>,
) -> Vec<Result<u32, RedeemError>> {
    let barrier = Barrier::new(n);
    thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let barrier = &barrier;
                s.spawn(move || {
                    let viewer = format!("viewer-{i}");
                    barrier.wait();
                    ledger
                        .view(&id, password, Some(&viewer))
                        .map(|r| r.winners_remaining)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn no_over_redemption_under_contention() {
    for (name, store, _dir) in backends() {
        for (k, n) in [(1u32, 16usize), (3, 24), (8, 8), (5, 3)] {
            let (ledger, _) = ledger_over(store.clone());
            let created = ledger
                .create(NewSecret::new("contested", NOW + 600).max_winners(k))
                .unwrap();

            // Poll the store for the whole race; the bound must hold in every snapshot.
            let done = AtomicBool::new(false);
            let (results, snapshots) = thread::scope(|s| {
                let reader = s.spawn(|| {
                    let mut seen = 0usize;
                    loop {
                        let finished = done.load(Ordering::Acquire);
                        if let Some(r) = store.get(&created.id).unwrap() {
                            assert!(
                                r.current_winners <= r.max_winners,
                                "{name}: observed {} of {} winners",
                                r.current_winners,
                                r.max_winners
                            );
                            assert_eq!(r.solved_by.len(), r.current_winners as usize);
                            seen += 1;
                        }
                        if finished {
                            break seen;
                        }
                    }
                });
                let results = race_views(&ledger, created.id, n, None);
                done.store(true, Ordering::Release);
                (results, reader.join().unwrap())
            });
            assert!(snapshots > 0, "{name}: reader never observed the record");
            let wins = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(wins, n.min(k as usize), "{name}: k={k} n={n}");
            assert!(
                results
                    .iter()
                    .filter_map(|r| r.as_ref().err())
                    .all(|e| matches!(e, RedeemError::Exhausted)),
                "{name}: losers must observe Exhausted"
            );

            // Every winner saw a distinct remaining count.
            let mut remaining: Vec<u32> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
            remaining.sort_unstable();
            remaining.dedup();
            assert_eq!(remaining.len(), wins, "{name}: duplicate slot handed out");

            let stored = store.get(&created.id).unwrap().unwrap();
            assert_eq!(stored.current_winners as usize, n.min(k as usize));
            assert!(stored.current_winners <= stored.max_winners);
            assert_eq!(stored.solved, n >= k as usize);
            assert_eq!(stored.solved_by.len(), wins);
        }
    }
}

#[test]
fn one_time_has_exactly_one_first_view() {
    for (name, store, _dir) in backends() {
        let (ledger, _) = ledger_over(store.clone());
        let created = ledger
            .create(NewSecret::new("only once", NOW + 600).one_time().with_password("P1"))
            .unwrap();

        let results = race_views(&ledger, created.id, 12, Some("P1"));
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{name}");
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RedeemError::NotFound | RedeemError::Exhausted)));

        assert!(matches!(ledger.get_metadata(&created.id), Err(RedeemError::NotFound)));
        assert!(matches!(ledger.unlock(&created.id, "P1"), Err(RedeemError::NotFound)));
        assert!(matches!(ledger.view(&created.id, Some("P1"), None), Err(RedeemError::NotFound)));
        assert!(store.get(&created.id).unwrap().is_none());
    }
}

#[test]
fn failed_passwords_never_consume_slots() {
    for (name, store, _dir) in backends() {
        let (ledger, _) = ledger_over(store.clone());
        let created = ledger
            .create(NewSecret::new("guarded", NOW + 600).with_password("P1").max_winners(2))
            .unwrap();

        let results = race_views(&ledger, created.id, 10, Some("wrong"));
        assert!(results.iter().all(|r| matches!(r, Err(RedeemError::InvalidPassword))), "{name}");
        for _ in 0..5 {
            assert!(matches!(ledger.unlock(&created.id, "nope"), Err(RedeemError::InvalidPassword)));
        }

        let stored = store.get(&created.id).unwrap().unwrap();
        assert_eq!(stored.current_winners, 0);
        assert!(!stored.solved);

        let r = ledger.view(&created.id, Some("P1"), None).unwrap();
        assert_eq!(r.plaintext.as_slice(), b"guarded");
        assert_eq!(r.winners_remaining, 1);
    }
}

#[test]
fn mixed_passwords_race_for_last_slot() {
    for (name, store, _dir) in backends() {
        let (ledger, _) = ledger_over(store.clone());
        let created = ledger
            .create(NewSecret::new("last", NOW + 600).with_password("P1").max_winners(1))
            .unwrap();

        let barrier = Barrier::new(8);
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (barrier, ledger) = (&barrier, &ledger);
                    let id = created.id;
                    s.spawn(move || {
                        let password = if i % 2 == 0 { "P1" } else { "bad" };
                        barrier.wait();
                        ledger.view(&id, Some(password), None).map(|_| ())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "{name}");
        let invalid = results
            .iter()
            .filter(|r| matches!(r, Err(RedeemError::InvalidPassword)))
            .count();
        assert_eq!(invalid, 4, "{name}: wrong passwords must be rejected, not exhausted");
    }
}

#[test]
fn expiry_beats_remaining_slots() {
    for (name, store, _dir) in backends() {
        let (ledger, clock) = ledger_over(store.clone());
        let created = ledger
            .create(NewSecret::new("deadline", NOW + 30).max_winners(5))
            .unwrap();
        ledger.view(&created.id, None, None).unwrap();

        clock.set(NOW + 30);
        assert!(matches!(ledger.view(&created.id, None, None), Err(RedeemError::Expired)), "{name}");
        assert!(matches!(ledger.get_metadata(&created.id), Err(RedeemError::NotFound)));
    }
}

#[test]
fn metadata_races_with_one_time_view() {
    for (name, store, _dir) in backends() {
        let (ledger, _) = ledger_over(store.clone());
        for _ in 0..20 {
            let created = ledger.create(NewSecret::new("blink", NOW + 600).one_time()).unwrap();
            let barrier = Barrier::new(2);
            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    ledger.view(&created.id, None, None).unwrap();
                });
                s.spawn(|| {
                    barrier.wait();
                    match ledger.get_metadata(&created.id) {
                        Ok(meta) => {
                            assert_eq!(meta.winners_remaining, 1, "{name}: saw a half-consumed record");
                            assert!(!meta.solved);
                        }
                        Err(e) => assert!(matches!(e, RedeemError::NotFound), "{name}: {e}"),
                    }
                });
            });
        }
    }
}

#[test]
fn round_trip_arbitrary_content() {
    let (ledger, _) = ledger_over(Arc::new(MemoryStore::new()));
    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"plain ascii".to_vec(),
        "unicode: Ωμέγα — 秘密 🔐".as_bytes().to_vec(),
        (0u8..=255).collect(),
        vec![0u8; 64 * 1024],
    ];
    for payload in payloads {
        let plain = ledger.create(NewSecret::new(payload.clone(), NOW + 60)).unwrap();
        assert_eq!(ledger.view(&plain.id, None, None).unwrap().plaintext.as_slice(), payload.as_slice());

        let layered = ledger
            .create(NewSecret::new(payload.clone(), NOW + 60).with_password("pw"))
            .unwrap();
        assert_eq!(
            ledger.view(&layered.id, Some("pw"), None).unwrap().plaintext.as_slice(),
            payload.as_slice()
        );
    }
}

#[test]
fn durable_store_survives_restart_with_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restart.db");
    let key_path = dir.path().join("master.key");
    hushdrop_engine::config::write_new_key_file(&key_path).unwrap();

    let id = {
        let store = Arc::new(DbStore::open(&path).unwrap());
        let key = hushdrop_engine::read_key_file(&key_path).unwrap();
        let ledger = RedemptionLedger::new(store, key, &config()).unwrap();
        let far = NOW * 2;
        let created = ledger.create(NewSecret::new("persisted", far).max_winners(2)).unwrap();
        ledger.view(&created.id, None, None).unwrap();
        created.id
    };

    let store = Arc::new(DbStore::open(&path).unwrap());
    let key = hushdrop_engine::read_key_file(&key_path).unwrap();
    let ledger = RedemptionLedger::new(store, key, &config()).unwrap();
    let r = ledger.view(&id, None, None).unwrap();
    assert_eq!(r.plaintext.as_slice(), b"persisted");
    assert!(r.solved);
    assert!(matches!(ledger.view(&id, None, None), Err(RedeemError::Exhausted)));
}

#[test]
fn different_master_key_cannot_decrypt() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let (a, _) = ledger_over(store.clone());
    let (b, _) = ledger_over(store);
    let created = a.create(NewSecret::new("sealed", NOW + 60).max_winners(2)).unwrap();
    assert!(matches!(b.view(&created.id, None, None), Err(RedeemError::Integrity)));
}
