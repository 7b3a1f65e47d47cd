//! Integration tests for the code issue / redeem lifecycle on an on-disk database

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use quizlink::clock::{Clock, ManualClock};
use quizlink::db::links::CodeGenerator;
use quizlink::{Database, LinkStatus, LinkStore, RedeemError};
use tempfile::TempDir;

const T0: i64 = 1_700_000_000;

fn open_store(temp_dir: &TempDir) -> (LinkStore, Arc<ManualClock>, Arc<Database>) {
    let db = Arc::new(Database::open(&temp_dir.path().join("quizlink.db")).unwrap());
    let clock = Arc::new(ManualClock::new(T0));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    (LinkStore::new(db.clone(), dyn_clock), clock, db)
}

/// Test the documented example: issue(42), redeem by tg-900, redeem again
#[test]
fn test_issue_redeem_and_replay() {
    let temp_dir = TempDir::new().unwrap();
    let (store, _, _) = open_store(&temp_dir);

    let code = store.issue(42).unwrap();
    assert_eq!(code.code.len(), 6);
    assert!(code.code.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(code.expires_at, T0 + 900);

    let link = store.redeem(&code.code, "tg-900", Some("alice")).unwrap();
    assert_eq!(link.platform_user_id, 42);
    assert_eq!(link.external_user_id, "tg-900");
    assert_eq!(link.external_username.as_deref(), Some("alice"));

    let replay = store.redeem(&code.code, "tg-666", Some("mallory"));
    assert!(matches!(replay, Err(RedeemError::AlreadyVerified)));

    // The first link is untouched by the replay
    let found = store.find_link_by_platform_user(42).unwrap().unwrap();
    assert_eq!(found, link);
}

#[test]
fn test_link_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let (store, _, _) = open_store(&temp_dir);
        let code = store.issue(7).unwrap();
        store.redeem(&code.code, "tg-7", None).unwrap();
    }

    let (store, _, db) = open_store(&temp_dir);
    let link = store.find_link_by_external_user("tg-7").unwrap().unwrap();
    assert_eq!(link.platform_user_id, 7);
    assert!(link.external_username.is_none());
    assert_eq!(db.stats().unwrap().linked_accounts, 1);
}

#[test]
fn test_reissue_invalidates_previous_code() {
    let temp_dir = TempDir::new().unwrap();
    let (store, _, db) = open_store(&temp_dir);
    let store = store.with_code_generator(sequence(&["271828", "314159"]));

    let first = store.issue(3).unwrap();
    let second = store.issue(3).unwrap();
    assert_eq!(first.code, "271828");
    assert_eq!(second.code, "314159");
    assert_eq!(db.stats().unwrap().pending_codes, 1);

    assert!(matches!(
        store.redeem(&first.code, "tg-3", None),
        Err(RedeemError::NotFound)
    ));
    assert!(store.redeem(&second.code, "tg-3", None).is_ok());
}

/// Hands out the given codes in order, repeating the last one
fn sequence(codes: &[&str]) -> CodeGenerator {
    let queue = Mutex::new(codes.iter().map(|c| c.to_string()).collect::<Vec<_>>());
    Box::new(move || {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue[0].clone()
        }
    })
}

#[test]
fn test_expired_code_then_sweep() {
    let temp_dir = TempDir::new().unwrap();
    let (store, clock, db) = open_store(&temp_dir);

    let code = store.issue(11).unwrap();
    clock.advance(15 * 60 + 1);

    assert!(matches!(
        store.redeem(&code.code, "tg-11", None),
        Err(RedeemError::Expired)
    ));
    assert!(store.find_link_by_platform_user(11).unwrap().is_none());
    assert_eq!(store.status(11).unwrap(), LinkStatus::Unlinked);

    assert_eq!(store.sweep_expired().unwrap(), 1);
    assert_eq!(db.stats().unwrap().pending_codes, 0);

    // Once swept the code is simply unknown
    assert!(matches!(
        store.redeem(&code.code, "tg-11", None),
        Err(RedeemError::NotFound)
    ));
}

#[test]
fn test_two_handles_redeem_in_turn() {
    let temp_dir = TempDir::new().unwrap();
    let (store_a, _, _) = open_store(&temp_dir);
    let (store_b, _, _) = open_store(&temp_dir);

    let code = store_a.issue(99).unwrap();

    let a = store_a.redeem(&code.code, "tg-a", None);
    let b = store_b.redeem(&code.code, "tg-b", None);

    assert!(a.is_ok());
    assert!(matches!(b, Err(RedeemError::AlreadyVerified)));
    let link = store_b.find_link_by_platform_user(99).unwrap().unwrap();
    assert_eq!(link.external_user_id, "tg-a");
}

/// Many connections redeem the same code at once; exactly one wins
#[test]
fn test_concurrent_redeem_has_single_winner() {
    const THREADS: usize = 8;
    const ROUNDS: i64 = 10;

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("quizlink.db");
    let (issuer, _, db) = open_store(&temp_dir);

    for round in 0..ROUNDS {
        let platform_user_id = 100 + round;
        let code = issuer.issue(platform_user_id).unwrap().code;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let db_path = db_path.clone();
                let barrier = Arc::clone(&barrier);
                let code = code.clone();
                thread::spawn(move || {
                    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(T0));
                    let store = LinkStore::new(Arc::new(Database::open(&db_path).unwrap()), clock);
                    let external_user_id = format!("tg-{}-{}", round, i);

                    barrier.wait();
                    store
                        .redeem(&code, &external_user_id, None)
                        .map(|link| link.external_user_id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&String> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "round {}: {:?}", round, results);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(RedeemError::AlreadyVerified))));

        let link = issuer.find_link_by_platform_user(platform_user_id).unwrap().unwrap();
        assert_eq!(&link.external_user_id, winners[0]);
    }

    assert_eq!(db.stats().unwrap().linked_accounts, ROUNDS as u64);
}
