use super::*;
use super::conflict::{check_no_conflict, validate_span};
use crate::limits::*;
use crate::model::*;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

fn today() -> Day {
    day("2026-11-01")
}

/// `today + offset` days.
fn d(offset: i64) -> Day {
    today() + chrono::Days::new(offset as u64)
}

fn camper(email: &str) -> User {
    User::new(Some("Sam".into()), Some("Camper".into()), email)
}

fn policy(max_stay_length: u32) -> BookingPolicy {
    BookingPolicy {
        max_stay_length,
        default_listing_length: 3,
        min_days_ahead: 1,
        max_days_ahead: 30,
    }
}

fn reservation_at(start: Day, end: Day) -> Reservation {
    Reservation {
        id: Some(Ulid::new()),
        version: Some(1),
        start_date: start,
        end_date: end,
        owner: camper("x@example.com"),
    }
}

// ── Pure checks ──────────────────────────────────────────

#[test]
fn validate_span_requires_start_before_end() {
    assert!(validate_span(d(3), d(4)).is_ok());
    assert_eq!(
        validate_span(d(4), d(4)),
        Err(EngineError::InvalidArgument("start date must be before end date"))
    );
    assert!(validate_span(d(5), d(4)).is_err());
}

#[test]
fn check_no_conflict_reports_first_overlap() {
    let a = reservation_at(d(10), d(15));
    let b = reservation_at(d(20), d(22));
    let existing = vec![a.clone(), b];
    assert_eq!(
        check_no_conflict(&existing, &Span::new(d(12), d(17))),
        Err(EngineError::Conflict(a.id.unwrap()))
    );
    // Back-to-back stays share a boundary day but not a night.
    assert!(check_no_conflict(&existing, &Span::new(d(15), d(20))).is_ok());
}

// ── Async engine tests ───────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("campsite_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(name: &str, max_stay: u32) -> (Engine, Arc<WalStore>, PathBuf) {
    let path = test_wal_path(name);
    let (engine, store) = Engine::open(policy(max_stay), path.clone()).unwrap();
    (engine, store, path)
}

#[tokio::test]
async fn create_assigns_identity_and_first_version() {
    let (engine, _, _) = open_engine("create_identity.wal", 3);
    let created = assert_ok!(
        engine
            .create_as_of(camper("a@example.com"), d(5), d(7), today())
            .await
    );
    assert!(created.is_persisted());
    assert_eq!(created.version, Some(1));
    assert!(created.owner.id.is_some());
    assert_eq!(created.span(), Some(Span::new(d(5), d(7))));

    let fetched = engine.get(created.id.unwrap()).await.unwrap();
    assert_eq!(fetched, Some(created));
}

#[tokio::test]
async fn policy_scenarios_with_five_day_stays() {
    let (engine, _, _) = open_engine("policy_scenarios.wal", 5);
    let owner = || camper("p@example.com");

    // Exactly five nights.
    assert_ok!(engine.create_as_of(owner(), d(1), d(6), today()).await);

    let too_long = engine.create_as_of(owner(), d(10), d(16), today()).await;
    assert_eq!(
        too_long,
        Err(EngineError::PolicyViolation(PolicyViolation::StayTooLong {
            requested_days: 6,
            max_days: 5,
        }))
    );

    let same_day = engine.create_as_of(owner(), d(0), d(1), today()).await;
    assert!(matches!(
        same_day,
        Err(EngineError::PolicyViolation(PolicyViolation::TooSoon { .. }))
    ));

    // Last allowed start, then one past it.
    assert_ok!(engine.create_as_of(owner(), d(30), d(31), today()).await);
    let too_far = engine.create_as_of(owner(), d(31), d(32), today()).await;
    assert!(matches!(
        too_far,
        Err(EngineError::PolicyViolation(PolicyViolation::TooFarAhead { .. }))
    ));
}

#[tokio::test]
async fn overlapping_create_conflicts_back_to_back_succeeds() {
    let (engine, _, _) = open_engine("overlap.wal", 5);
    let a = engine
        .create_as_of(camper("a@example.com"), d(10), d(15), today())
        .await
        .unwrap();

    let b = engine
        .create_as_of(camper("b@example.com"), d(12), d(17), today())
        .await;
    assert_eq!(b, Err(EngineError::Conflict(a.id.unwrap())));

    let c = assert_ok!(
        engine
            .create_as_of(camper("c@example.com"), d(15), d(20), today())
            .await
    );
    assert_ne!(c.id, a.id);

    let listed = engine.list_within_range(d(10), Some(10)).await.unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn create_rejects_bad_arguments() {
    let (engine, _, _) = open_engine("bad_args.wal", 3);
    assert!(matches!(
        engine.create_as_of(camper("a@example.com"), d(5), d(5), today()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.create_as_of(User::new(None, None, ""), d(5), d(6), today()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    let long_name = "x".repeat(MAX_NAME_LEN + 1);
    assert!(matches!(
        engine
            .create_as_of(User::new(Some(long_name), None, "a@example.com"), d(5), d(6), today())
            .await,
        Err(EngineError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn stale_update_then_retry_with_fresh_version() {
    let (engine, _, _) = open_engine("stale_update.wal", 5);
    let original = engine
        .create_as_of(camper("x@example.com"), d(5), d(7), today())
        .await
        .unwrap();
    let id = original.id.unwrap();

    // Two clients read version 1.
    let x = engine.get(id).await.unwrap().unwrap();
    let y = engine.get(id).await.unwrap().unwrap();

    let x2 = assert_ok!(
        engine
            .update(Reservation {
                end_date: d(8),
                ..x
            })
            .await
    );
    assert_eq!(x2.version, Some(2));

    let stale = engine
        .update(Reservation {
            start_date: d(6),
            ..y
        })
        .await;
    assert_eq!(
        stale,
        Err(EngineError::StaleVersion {
            id,
            expected: 1,
            actual: Some(2),
        })
    );

    let fresh = engine.get(id).await.unwrap().unwrap();
    let y3 = assert_ok!(
        engine
            .update(Reservation {
                start_date: d(6),
                ..fresh
            })
            .await
    );
    assert_eq!(y3.version, Some(3));
    assert_eq!(y3.span(), Some(Span::new(d(6), d(8))));
    assert_eq!(y3.owner.id, original.owner.id);
}

#[tokio::test]
async fn update_and_delete_require_identity() {
    let (engine, _, _) = open_engine("identity_required.wal", 3);
    let unsaved = Reservation::new(camper("a@example.com"), Span::new(d(2), d(3)));
    assert!(matches!(
        engine.update(unsaved.clone()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.delete(&unsaved).await,
        Err(EngineError::InvalidArgument(_))
    ));

    let no_version = Reservation {
        id: Some(Ulid::new()),
        ..unsaved
    };
    assert!(matches!(
        engine.update(no_version.clone()).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.delete(&no_version).await,
        Err(EngineError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn stale_delete_leaves_reservation_in_place() {
    let (engine, _, _) = open_engine("stale_delete.wal", 5);
    let v1 = engine
        .create_as_of(camper("a@example.com"), d(3), d(5), today())
        .await
        .unwrap();
    let v2 = engine
        .update(Reservation {
            end_date: d(6),
            ..v1.clone()
        })
        .await
        .unwrap();

    let err = assert_err!(engine.delete(&v1).await);
    assert_eq!(err.kind(), "stale_version");
    assert_eq!(engine.get(v1.id.unwrap()).await.unwrap(), Some(v2.clone()));

    assert_ok!(engine.delete(&v2).await);
    assert_eq!(engine.get(v1.id.unwrap()).await.unwrap(), None);

    // Gone: any version is stale now.
    assert_eq!(
        engine.delete(&v2).await,
        Err(EngineError::StaleVersion {
            id: v2.id.unwrap(),
            expected: 2,
            actual: None,
        })
    );
}

#[tokio::test]
async fn deleted_dates_can_be_rebooked() {
    let (engine, _, _) = open_engine("rebook.wal", 3);
    let first = engine
        .create_as_of(camper("a@example.com"), d(4), d(6), today())
        .await
        .unwrap();
    engine.delete(&first).await.unwrap();
    assert_ok!(
        engine
            .create_as_of(camper("b@example.com"), d(4), d(6), today())
            .await
    );
}

#[tokio::test]
async fn listing_uses_default_length() {
    let (engine, _, _) = open_engine("listing_default.wal", 3);
    engine
        .create_as_of(camper("a@example.com"), d(2), d(3), today())
        .await
        .unwrap();
    engine
        .create_as_of(camper("b@example.com"), d(4), d(5), today())
        .await
        .unwrap();
    engine
        .create_as_of(camper("c@example.com"), d(5), d(7), today())
        .await
        .unwrap();

    // Window [d1, d4): only the first stay.
    let default = engine.list_within_range(d(1), None).await.unwrap();
    let explicit = engine.list_within_range(d(1), Some(3)).await.unwrap();
    assert_eq!(default, explicit);
    assert_eq!(default.len(), 1);

    // Repeating a listing with no writes in between gives the same answer.
    let wide = engine.list_within_range(d(1), Some(10)).await.unwrap();
    assert_eq!(wide.len(), 3);
    assert_eq!(engine.list_within_range(d(1), Some(10)).await.unwrap(), wide);
    assert!(wide.windows(2).all(|w| w[0].start_date <= w[1].start_date));
}

#[tokio::test]
async fn listing_rejects_bad_windows() {
    let (engine, _, _) = open_engine("listing_bad.wal", 3);
    assert!(matches!(
        engine.list_within_range(d(1), Some(0)).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.list_within_range(d(1), Some(MAX_LISTING_DAYS + 1)).await,
        Err(EngineError::InvalidArgument(_))
    ));
    assert_eq!(engine.list_within_range(d(1), Some(MAX_LISTING_DAYS)).await, Ok(vec![]));
}

#[tokio::test]
async fn concurrent_creates_never_double_book() {
    let (engine, store, _) = open_engine("concurrent.wal", 5);
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        // Staggered three-night stays, each overlapping its neighbours.
        let start = d(5 + (i % 4));
        handles.push(tokio::spawn(async move {
            engine
                .create_as_of(camper(&format!("c{i}@example.com")), start, start + chrono::Days::new(3), today())
                .await
        }));
    }

    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => created += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(created >= 1);
    assert_eq!(store.len().await, created);

    let all = engine.list_within_range(d(1), Some(30)).await.unwrap();
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert!(!a.span().unwrap().overlaps(&b.span().unwrap()), "{a:?} overlaps {b:?}");
        }
    }
}

#[tokio::test]
async fn concurrent_updates_exactly_one_wins() {
    let (engine, _, _) = open_engine("concurrent_update.wal", 5);
    let engine = Arc::new(engine);
    let original = engine
        .create_as_of(camper("a@example.com"), d(3), d(5), today())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let attempt = Reservation {
            owner: camper(&format!("u{i}@example.com")),
            ..original.clone()
        };
        handles.push(tokio::spawn(async move { engine.update(attempt).await }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(r) => {
                wins += 1;
                assert_eq!(r.version, Some(2));
            }
            Err(e) => assert_eq!(e.kind(), "stale_version"),
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn replay_restores_reservations_and_versions() {
    let (engine, _, path) = open_engine("replay.wal", 5);
    let kept = engine
        .create_as_of(camper("a@example.com"), d(2), d(4), today())
        .await
        .unwrap();
    let kept = engine
        .update(Reservation {
            end_date: d(5),
            ..kept
        })
        .await
        .unwrap();
    let dropped = engine
        .create_as_of(camper("b@example.com"), d(8), d(9), today())
        .await
        .unwrap();
    engine.delete(&dropped).await.unwrap();
    drop(engine);

    let (reopened, store) = Engine::open(policy(5), path).unwrap();
    assert_eq!(store.len().await, 1);
    assert_eq!(reopened.get(kept.id.unwrap()).await.unwrap(), Some(kept.clone()));
    assert_eq!(reopened.get(dropped.id.unwrap()).await.unwrap(), None);

    // The restored version is the one writers must present.
    let next = reopened
        .update(Reservation {
            start_date: d(3),
            ..kept
        })
        .await
        .unwrap();
    assert_eq!(next.version, Some(3));
}

#[tokio::test]
async fn compaction_preserves_versions() {
    let (engine, store, path) = open_engine("compaction.wal", 5);
    let mut r = engine
        .create_as_of(camper("a@example.com"), d(2), d(4), today())
        .await
        .unwrap();
    for _ in 0..4 {
        r = engine.update(r).await.unwrap();
    }
    assert_eq!(r.version, Some(5));

    store.compact().await.unwrap();
    drop(engine);
    drop(store);

    let (reopened, _) = Engine::open(policy(5), path).unwrap();
    let restored = reopened.get(r.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(restored, r);
    assert!(reopened
        .create_as_of(camper("b@example.com"), d(3), d(4), today())
        .await
        .is_err());
}

#[tokio::test]
async fn abandoned_create_still_blocks_its_dates() {
    let (engine, store, path) = open_engine("abandoned_create.wal", 5);

    // Polled once and dropped: the insert is queued, its reply never read.
    let abandoned = engine.create_as_of(camper("a@example.com"), d(2), d(4), today());
    assert!(abandoned.now_or_never().is_none());

    let err = assert_err!(
        engine
            .create_as_of(camper("b@example.com"), d(3), d(5), today())
            .await
    );
    assert_eq!(err.kind(), "conflict");

    let window = Span::new(d(1), d(10));
    let live = store.find_conflicting(window).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].owner.email, "a@example.com");
    drop(engine);
    drop(store);

    let (_, reopened) = Engine::open(policy(5), path).unwrap();
    assert_eq!(reopened.find_conflicting(window).await.unwrap(), live);
}

#[tokio::test]
async fn failed_wal_sync_leaves_ledger_and_log_unchanged() {
    let (engine, store, path) = open_engine("failed_sync.wal", 5);
    let kept = assert_ok!(
        engine
            .create_as_of(camper("a@example.com"), d(2), d(4), today())
            .await
    );

    store.fail_next_sync().await;
    let err = assert_err!(
        engine
            .create_as_of(camper("b@example.com"), d(6), d(8), today())
            .await
    );
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert_eq!(store.len().await, 1);
    assert!(store.find_conflicting(Span::new(d(6), d(8))).await.unwrap().is_empty());

    store.fail_next_sync().await;
    let err = assert_err!(
        engine
            .update(Reservation {
                end_date: d(5),
                ..kept.clone()
            })
            .await
    );
    assert_eq!(err.kind(), "store_unavailable");
    assert_eq!(store.find_by_id(kept.id.unwrap()).await.unwrap(), Some(kept.clone()));

    // Later writes go through and the failed ones never reach the log.
    let retried = assert_ok!(
        engine
            .create_as_of(camper("b@example.com"), d(6), d(8), today())
            .await
    );
    drop(engine);
    drop(store);

    let (reopened, store) = Engine::open(policy(5), path).unwrap();
    assert_eq!(store.len().await, 2);
    assert_eq!(reopened.get(kept.id.unwrap()).await.unwrap(), Some(kept));
    assert_eq!(reopened.get(retried.id.unwrap()).await.unwrap(), Some(retried));
}

#[tokio::test]
async fn writes_during_compaction_survive_the_swap() {
    let (engine, store, path) = open_engine("compaction_tail.wal", 5);
    let first = engine
        .create_as_of(camper("a@example.com"), d(2), d(4), today())
        .await
        .unwrap();
    let first = engine.update(first).await.unwrap();

    let (compacted, second, third) = tokio::join!(
        store.compact(),
        engine.create_as_of(camper("b@example.com"), d(6), d(8), today()),
        engine.create_as_of(camper("c@example.com"), d(10), d(12), today()),
    );
    assert_ok!(compacted);
    let second = assert_ok!(second);
    let third = assert_ok!(third);

    let window = Span::new(d(1), d(20));
    let live = store.find_conflicting(window).await.unwrap();
    assert_eq!(live, vec![first, second, third]);
    drop(engine);
    drop(store);

    let (_, reopened) = Engine::open(policy(5), path).unwrap();
    assert_eq!(reopened.find_conflicting(window).await.unwrap(), live);
}

// ── Failing store ────────────────────────────────────────

struct DownStore;

#[async_trait]
impl ReservationStore for DownStore {
    async fn find_conflicting(&self, _span: Span) -> Result<Vec<Reservation>, StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }

    async fn find_by_id(&self, _id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }

    async fn save(&self, _reservation: Reservation) -> Result<Reservation, StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }

    async fn delete(&self, _reservation: &Reservation) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }
}

#[tokio::test]
async fn store_failures_surface_as_unavailable() {
    let engine = Engine::new(policy(3), Arc::new(DownStore));
    let is_down = |r: Result<_, EngineError>| matches!(r, Err(EngineError::StoreUnavailable(_)));

    assert!(is_down(
        engine
            .create_as_of(camper("a@example.com"), d(2), d(3), today())
            .await
            .map(|_| ())
    ));
    assert!(is_down(engine.list_within_range(d(2), None).await.map(|_| ())));
    assert!(is_down(engine.get(Ulid::new()).await.map(|_| ())));
    assert!(is_down(engine.update(reservation_at(d(2), d(3))).await.map(|_| ())));
    assert!(is_down(engine.delete(&reservation_at(d(2), d(3))).await));
}

#[tokio::test]
async fn policy_is_checked_before_the_store() {
    let engine = Engine::new(policy(3), Arc::new(DownStore));
    let err = engine
        .create_as_of(camper("a@example.com"), d(2), d(9), today())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "policy_violation");
}
