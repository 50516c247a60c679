use super::*;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

const H: Ms = 3_600_000;
/// 2026-03-02T00:00:00Z
const DAY: Ms = 1_772_409_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bayslot_test_ledger");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(name: &str) -> Ledger {
    Ledger::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn occupancy(bay_id: BayId, start: Ms, end: Ms, status: BookingStatus) -> BookingOccupancy {
    BookingOccupancy {
        booking_id: Ulid::new(),
        bay_id,
        branch_id: Ulid::new(),
        scheduled: TimeRange::new(start, end).unwrap(),
        status,
    }
}

#[tokio::test]
async fn record_and_list() {
    let ledger = open("record_and_list.wal");
    let bay = Ulid::new();
    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    let b = occupancy(bay, DAY + 14 * H, DAY + 15 * H, BookingStatus::Pending);
    ledger.record_booking(b.clone(), Some("brake check".into())).await.unwrap();
    ledger.record_booking(a.clone(), None).await.unwrap();

    let listed = ledger
        .list_occupancies(bay, TimeRange::new(DAY, DAY + 24 * H).unwrap())
        .await
        .unwrap();
    assert_eq!(listed, vec![a.clone(), b.clone()]);

    let entry = ledger.get(b.booking_id).await.unwrap();
    assert_eq!(entry.label.as_deref(), Some("brake check"));
    assert!(ledger.get(Ulid::new()).await.is_none());
}

#[tokio::test]
async fn list_is_scoped_to_bay_and_range() {
    let ledger = open("list_scoped.wal");
    let bay = Ulid::new();
    let other = Ulid::new();
    ledger
        .record_booking(occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed), None)
        .await
        .unwrap();
    ledger
        .record_booking(occupancy(other, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed), None)
        .await
        .unwrap();

    let morning = TimeRange::new(DAY + 8 * H, DAY + 12 * H).unwrap();
    assert_eq!(ledger.list_occupancies(bay, morning).await.unwrap().len(), 1);
    // touching the booking's end is not an overlap
    let after = TimeRange::new(DAY + 10 * H, DAY + 11 * H).unwrap();
    assert!(ledger.list_occupancies(bay, after).await.unwrap().is_empty());
    assert!(ledger.list_occupancies(Ulid::new(), morning).await.unwrap().is_empty());
}

#[tokio::test]
async fn overlapping_blocking_booking_rejected() {
    let ledger = open("overlap_rejected.wal");
    let bay = Ulid::new();
    let first = occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::Confirmed);
    ledger.record_booking(first.clone(), None).await.unwrap();

    let clash = occupancy(bay, DAY + 10 * H + H / 2, DAY + 11 * H + H / 2, BookingStatus::Pending);
    match ledger.record_booking(clash, None).await {
        Err(EngineError::SlotConflict { conflicts }) => assert_eq!(conflicts, vec![first]),
        other => panic!("expected SlotConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn back_to_back_bookings_allowed() {
    let ledger = open("back_to_back.wal");
    let bay = Ulid::new();
    assert_ok!(
        ledger
            .record_booking(occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed), None)
            .await
    );
    assert_ok!(
        ledger
            .record_booking(occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::Confirmed), None)
            .await
    );
    assert_eq!(ledger.bookings(bay).await.len(), 2);
}

#[tokio::test]
async fn cancelled_booking_does_not_block() {
    let ledger = open("cancelled_no_block.wal");
    let bay = Ulid::new();
    let first = occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::Confirmed);
    ledger.record_booking(first.clone(), None).await.unwrap();
    let cancelled = ledger.cancel(first.booking_id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    ledger
        .record_booking(occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::Confirmed), None)
        .await
        .unwrap();

    // a non-blocking record never conflicts either
    ledger
        .record_booking(occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::NoShow), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn reactivating_into_blocking_set_rechecks() {
    let ledger = open("reactivate.wal");
    let bay = Ulid::new();
    let first = occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::Confirmed);
    ledger.record_booking(first.clone(), None).await.unwrap();
    ledger.cancel(first.booking_id).await.unwrap();

    let second = occupancy(bay, DAY + 10 * H, DAY + 11 * H, BookingStatus::Confirmed);
    ledger.record_booking(second.clone(), None).await.unwrap();

    match ledger.set_status(first.booking_id, BookingStatus::Pending).await {
        Err(EngineError::SlotConflict { conflicts }) => assert_eq!(conflicts, vec![second.clone()]),
        other => panic!("expected SlotConflict, got {other:?}"),
    }

    // moving between blocking statuses never rechecks against itself
    let checked_in = ledger.set_status(second.booking_id, BookingStatus::CheckedIn).await.unwrap();
    assert_eq!(checked_in.status, BookingStatus::CheckedIn);
}

#[tokio::test]
async fn reschedule_checks_and_moves() {
    let ledger = open("reschedule.wal");
    let bay = Ulid::new();
    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    let b = occupancy(bay, DAY + 12 * H, DAY + 13 * H, BookingStatus::Confirmed);
    ledger.record_booking(a.clone(), None).await.unwrap();
    ledger.record_booking(b.clone(), None).await.unwrap();

    let onto_b = TimeRange::new(DAY + 12 * H, DAY + 13 * H).unwrap();
    assert!(matches!(
        ledger.reschedule(a.booking_id, onto_b).await,
        Err(EngineError::SlotConflict { .. })
    ));

    // overlapping its own old slot is fine
    let later = TimeRange::new(DAY + 9 * H + H / 2, DAY + 10 * H + H / 2).unwrap();
    let moved = ledger.reschedule(a.booking_id, later).await.unwrap();
    assert_eq!(moved.scheduled, later);

    let entries = ledger.bookings(bay).await;
    assert_eq!(entries[0].occupancy.scheduled, later);
    assert_eq!(entries[1].occupancy.booking_id, b.booking_id);
}

#[tokio::test]
async fn unknown_booking_not_found() {
    let ledger = open("unknown.wal");
    let id = Ulid::new();
    assert_eq!(ledger.cancel(id).await, Err(EngineError::NotFound(id)));
    let range = TimeRange::new(DAY, DAY + H).unwrap();
    assert_eq!(ledger.reschedule(id, range).await, Err(EngineError::NotFound(id)));
}

#[tokio::test]
async fn duplicate_id_rejected() {
    let ledger = open("duplicate.wal");
    let bay = Ulid::new();
    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    ledger.record_booking(a.clone(), None).await.unwrap();
    let again = BookingOccupancy {
        scheduled: TimeRange::new(DAY + 15 * H, DAY + 16 * H).unwrap(),
        ..a.clone()
    };
    assert_eq!(
        ledger.record_booking(again, None).await,
        Err(EngineError::AlreadyExists(a.booking_id))
    );
}

#[tokio::test]
async fn limits_enforced() {
    let ledger = open("limits.wal");
    let bay = Ulid::new();
    let ancient = occupancy(bay, 1_000, 2_000, BookingStatus::Confirmed);
    assert_eq!(
        ledger.record_booking(ancient, None).await,
        Err(EngineError::LimitExceeded("timestamp out of range"))
    );
    let long = occupancy(bay, DAY, DAY + 25 * H, BookingStatus::Confirmed);
    assert_eq!(
        ledger.record_booking(long, None).await,
        Err(EngineError::LimitExceeded("booking too long"))
    );
    let labelled = occupancy(bay, DAY, DAY + H, BookingStatus::Confirmed);
    assert_eq!(
        ledger.record_booking(labelled, Some("x".repeat(MAX_LABEL_LEN + 1))).await,
        Err(EngineError::LimitExceeded("label too long"))
    );
}

#[tokio::test]
async fn changes_are_broadcast() {
    let ledger = open("broadcast.wal");
    let bay = Ulid::new();
    let mut all = ledger.notify().subscribe_all();
    let mut per_bay = ledger.notify().subscribe(bay);

    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    ledger.record_booking(a.clone(), None).await.unwrap();
    ledger.cancel(a.booking_id).await.unwrap();

    assert!(matches!(all.recv().await.unwrap(), LedgerEvent::BookingRecorded { .. }));
    match all.recv().await.unwrap() {
        LedgerEvent::StatusChanged { booking_id, status, .. } => {
            assert_eq!(booking_id, a.booking_id);
            assert_eq!(status, BookingStatus::Cancelled);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(per_bay.recv().await.unwrap().bay_id(), bay);
}

#[tokio::test]
async fn rejected_write_is_not_broadcast() {
    let ledger = open("rejected_silent.wal");
    let bay = Ulid::new();
    ledger
        .record_booking(occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed), None)
        .await
        .unwrap();
    let mut all = ledger.notify().subscribe_all();
    assert_err!(
        ledger
            .record_booking(occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed), None)
            .await
    );
    assert_err!(all.try_recv());
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restores.wal");
    let bay = Ulid::new();
    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    let b = occupancy(bay, DAY + 11 * H, DAY + 12 * H, BookingStatus::Pending);
    let later = TimeRange::new(DAY + 13 * H, DAY + 14 * H).unwrap();
    {
        let ledger = Ledger::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        ledger.record_booking(a.clone(), Some("tyres".into())).await.unwrap();
        ledger.record_booking(b.clone(), None).await.unwrap();
        ledger.cancel(a.booking_id).await.unwrap();
        ledger.reschedule(b.booking_id, later).await.unwrap();
    }

    let reopened = Ledger::open(path, Arc::new(NotifyHub::new())).unwrap();
    let a_entry = reopened.get(a.booking_id).await.unwrap();
    assert_eq!(a_entry.occupancy.status, BookingStatus::Cancelled);
    assert_eq!(a_entry.label.as_deref(), Some("tyres"));
    assert_eq!(reopened.get(b.booking_id).await.unwrap().occupancy.scheduled, later);

    // the constraint survives the restart
    let clash = occupancy(bay, DAY + 13 * H, DAY + 14 * H, BookingStatus::Confirmed);
    assert!(matches!(
        reopened.record_booking(clash, None).await,
        Err(EngineError::SlotConflict { .. })
    ));
}

#[tokio::test]
async fn bookings_after_torn_tail_restart_survive_next_restart() {
    let path = test_wal_path("torn_tail_restart.wal");
    let bay = Ulid::new();
    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    let b = occupancy(bay, DAY + 11 * H, DAY + 12 * H, BookingStatus::Confirmed);
    {
        let ledger = Ledger::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        ledger.record_booking(a.clone(), None).await.unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8; 6]).unwrap();
    }
    {
        let ledger = Ledger::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(ledger.bookings(bay).await.len(), 1);
        ledger.record_booking(b.clone(), None).await.unwrap();
    }

    let reopened = Ledger::open(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(reopened.bookings(bay).await.len(), 2);
    assert!(reopened.get(b.booking_id).await.is_some());
    let clash = occupancy(bay, DAY + 11 * H, DAY + 12 * H, BookingStatus::Pending);
    assert_err!(reopened.record_booking(clash, None).await);
}

#[tokio::test]
async fn compaction_preserves_current_state() {
    let path = test_wal_path("compaction.wal");
    let bay = Ulid::new();
    let a = occupancy(bay, DAY + 9 * H, DAY + 10 * H, BookingStatus::Confirmed);
    {
        let ledger = Ledger::open(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        ledger.record_booking(a.clone(), None).await.unwrap();
        ledger.set_status(a.booking_id, BookingStatus::CheckedIn).await.unwrap();
        ledger.set_status(a.booking_id, BookingStatus::InProgress).await.unwrap();
        assert_eq!(ledger.wal_appends_since_compact().await, 3);

        ledger.compact_wal().await.unwrap();
        assert_eq!(ledger.wal_appends_since_compact().await, 0);
    }

    assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    let reopened = Ledger::open(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(
        reopened.get(a.booking_id).await.unwrap().occupancy.status,
        BookingStatus::InProgress
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_records_admit_one() {
    let ledger = Arc::new(open("concurrent_records.wal"));
    let bay = Ulid::new();
    let mut handles = Vec::new();
    for i in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            let start = DAY + 10 * H + i * 60_000;
            ledger
                .record_booking(occupancy(bay, start, start + H, BookingStatus::Confirmed), None)
                .await
        }));
    }
    let mut accepted = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
}
