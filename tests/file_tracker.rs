use std::time::Duration;

mod support;

use nfs_mamont_state::state::StateType;
use nfs_mamont_state::xdr::nfs4::{
    nfsstat4, open_delegation_type4, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_ACCESS_READ,
    OPEN4_SHARE_ACCESS_WANT_ANY_DELEG, OPEN4_SHARE_ACCESS_WANT_NO_DELEG,
    OPEN4_SHARE_ACCESS_WANT_READ_DELEG, OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG,
    OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_BOTH, OPEN4_SHARE_DENY_NONE,
    OPEN4_SHARE_DENY_READ, OPEN4_SHARE_DENY_WRITE,
};

use support::{
    client_v41, failing_callback, handler, inode, next_recall, recording_callback,
};

#[tokio::test]
async fn open_creates_open_state() {
    let handler = handler();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");

    let open = handler
        .file_tracker()
        .add_open(&client, &owner, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .expect("open failed");

    assert_eq!(open.state.state_type(), StateType::Open);
    assert_eq!(open.stateid.seqid, 1);
    assert!(open.delegation.is_none());
    assert_eq!(
        handler.file_tracker().get_share_access(&client, &file, &open.stateid),
        Ok(OPEN4_SHARE_ACCESS_READ)
    );
    assert_eq!(client.state(&open.stateid).expect("state missing").other(), open.stateid.other);
}

#[tokio::test]
async fn deny_write_blocks_other_writers() {
    let handler = handler();
    let a = client_v41(&handler, "client-a", None);
    let b = client_v41(&handler, "client-b", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let a_owner = a.get_or_create_owner(b"o", 0);
    tracker
        .add_open(&a, &a_owner, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_WRITE)
        .expect("open failed");

    let b_owner = b.get_or_create_owner(b"o", 0);
    assert_eq!(
        tracker
            .add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_NONE)
            .err(),
        Some(nfsstat4::NFS4ERR_SHARE_DENIED)
    );
    assert_eq!(
        tracker
            .add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_DENY_NONE)
            .err(),
        Some(nfsstat4::NFS4ERR_SHARE_DENIED)
    );
    tracker
        .add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .expect("read open must not conflict");
}

#[tokio::test]
async fn new_deny_conflicts_with_existing_access() {
    let handler = handler();
    let a = client_v41(&handler, "client-a", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let reader = a.get_or_create_owner(b"reader", 0);
    tracker
        .add_open(&a, &reader, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .expect("open failed");

    // another owner of the same client is still subject to share reservations
    let exclusive = a.get_or_create_owner(b"exclusive", 0);
    let err = tracker
        .add_open(&a, &exclusive, &file, OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_READ)
        .err();
    assert_eq!(err, Some(nfsstat4::NFS4ERR_SHARE_DENIED));
    assert_eq!(tracker.open_count(&file), 1);
}

#[tokio::test]
async fn same_owner_opens_merge() {
    let handler = handler();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let first = tracker
        .add_open(&client, &owner, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .expect("open failed");
    let second = tracker
        .add_open(&client, &owner, &file, OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_WRITE)
        .expect("open failed");

    assert_eq!(first.stateid.other, second.stateid.other);
    assert_eq!(second.stateid.seqid, first.stateid.seqid + 1);
    assert_eq!(second.share_access, OPEN4_SHARE_ACCESS_BOTH);
    assert_eq!(second.share_deny, OPEN4_SHARE_DENY_WRITE);
    assert_eq!(tracker.open_count(&file), 1);
}

#[tokio::test]
async fn invalid_share_bits() {
    let handler = handler();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");
    let tracker = handler.file_tracker();

    for (access, deny) in [(0, OPEN4_SHARE_DENY_NONE), (4, 0), (OPEN4_SHARE_ACCESS_READ, 4)] {
        assert_eq!(
            tracker.add_open(&client, &owner, &file, access, deny).err(),
            Some(nfsstat4::NFS4ERR_INVAL),
            "access {access} deny {deny}"
        );
    }
    assert_eq!(tracker.file_count(), 0);
}

#[tokio::test]
async fn downgrade() {
    let handler = handler();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let open = tracker
        .add_open(&client, &owner, &file, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_DENY_BOTH)
        .expect("open failed");

    // not a subset
    let other = client_v41(&handler, "client-b", None);
    assert_eq!(
        tracker.downgrade_open(&other, &file, &open.stateid, OPEN4_SHARE_ACCESS_READ, 0),
        Err(nfsstat4::NFS4ERR_BAD_STATEID)
    );
    let stateid = tracker
        .downgrade_open(
            &client,
            &file,
            &open.stateid,
            OPEN4_SHARE_ACCESS_READ,
            OPEN4_SHARE_DENY_WRITE,
        )
        .expect("downgrade failed");
    assert_eq!(stateid.seqid, open.stateid.seqid + 1);
    assert_eq!(
        tracker.downgrade_open(&client, &file, &stateid, OPEN4_SHARE_ACCESS_BOTH, 0),
        Err(nfsstat4::NFS4ERR_INVAL)
    );
    assert_eq!(
        tracker.downgrade_open(
            &client,
            &file,
            &stateid,
            OPEN4_SHARE_ACCESS_READ,
            OPEN4_SHARE_DENY_READ
        ),
        Err(nfsstat4::NFS4ERR_INVAL)
    );
    assert_eq!(
        tracker.get_share_access(&client, &file, &stateid),
        Ok(OPEN4_SHARE_ACCESS_READ)
    );
}

#[tokio::test]
async fn close_removes_open_record() {
    let handler = handler();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");

    let open = handler
        .open_file(&client, &owner, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_BOTH, false)
        .expect_err("still in grace");
    assert_eq!(open, nfsstat4::NFS4ERR_GRACE);

    let handler = support::handler_out_of_grace();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);
    let open = handler
        .open_file(&client, &owner, &file, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_BOTH, false)
        .expect("open failed");
    assert_eq!(handler.file_tracker().open_count(&file), 1);

    let closed = handler.close_file(&client, &open.stateid).expect("close failed");
    assert_eq!(closed.seqid, open.stateid.seqid + 1);
    assert!(open.state.is_disposed());
    assert_eq!(handler.file_tracker().file_count(), 0);
    assert_eq!(client.state(&open.stateid).err(), Some(nfsstat4::NFS4ERR_BAD_STATEID));
}

#[tokio::test]
async fn no_delegation_without_want() {
    let handler = handler();
    let (callback, _recalls) = recording_callback();
    let client = client_v41(&handler, "client-a", Some(callback));
    let owner = client.get_or_create_owner(b"owner", 0);
    let tracker = handler.file_tracker();

    let open = tracker
        .add_open(&client, &owner, &inode("f1"), OPEN4_SHARE_ACCESS_READ, 0)
        .expect("open failed");
    assert!(open.delegation.is_none());

    let open = tracker
        .add_open(
            &client,
            &owner,
            &inode("f2"),
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_NO_DELEG,
            0,
        )
        .expect("open failed");
    assert!(open.delegation.is_none());
}

#[tokio::test]
async fn no_delegation_without_callback() {
    let handler = handler();
    let client = client_v41(&handler, "client-a", None);
    let owner = client.get_or_create_owner(b"owner", 0);

    let open = handler
        .file_tracker()
        .add_open(
            &client,
            &owner,
            &inode("file"),
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    assert!(open.delegation.is_none());
}

#[tokio::test]
async fn read_delegation_granted() {
    let handler = handler();
    let (callback, _recalls) = recording_callback();
    let client = client_v41(&handler, "client-a", Some(callback));
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let open = tracker
        .add_open(
            &client,
            &owner,
            &file,
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    let grant = open.delegation.expect("no delegation");

    assert_eq!(grant.delegation_type, open_delegation_type4::OPEN_DELEGATE_READ);
    assert_eq!(grant.state.state_type(), StateType::Delegation);
    assert!(tracker.has_delegation(&file));
    let info = tracker.delegation(&file).expect("no delegation record");
    assert_eq!(info.client_id, client.id());
    assert!(!info.recalling);
}

#[tokio::test]
async fn read_delegation_refused_with_foreign_writer() {
    let handler = handler();
    let (callback, _recalls) = recording_callback();
    let a = client_v41(&handler, "client-a", Some(callback));
    let b = client_v41(&handler, "client-b", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    tracker
        .add_open(&b, &b.get_or_create_owner(b"o", 0), &file, OPEN4_SHARE_ACCESS_WRITE, 0)
        .expect("open failed");
    let open = tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &file,
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    assert!(open.delegation.is_none());
}

#[tokio::test]
async fn write_delegation_only_for_sole_client() {
    let handler = handler();
    let (callback, _recalls) = recording_callback();
    let a = client_v41(&handler, "client-a", Some(callback));
    let b = client_v41(&handler, "client-b", None);
    let tracker = handler.file_tracker();

    let shared = inode("shared");
    tracker
        .add_open(&b, &b.get_or_create_owner(b"o", 0), &shared, OPEN4_SHARE_ACCESS_READ, 0)
        .expect("open failed");
    let open = tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &shared,
            OPEN4_SHARE_ACCESS_BOTH | OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG,
            0,
        )
        .expect("open failed");
    assert!(open.delegation.is_none());

    let private = inode("private");
    let open = tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &private,
            OPEN4_SHARE_ACCESS_BOTH | OPEN4_SHARE_ACCESS_WANT_ANY_DELEG,
            0,
        )
        .expect("open failed");
    assert_eq!(
        open.delegation.map(|d| d.delegation_type),
        Some(open_delegation_type4::OPEN_DELEGATE_WRITE)
    );
}

#[tokio::test]
async fn one_delegation_per_file() {
    let handler = handler();
    let (cb_a, _ra) = recording_callback();
    let (cb_b, _rb) = recording_callback();
    let a = client_v41(&handler, "client-a", Some(cb_a));
    let b = client_v41(&handler, "client-b", Some(cb_b));
    let file = inode("file");
    let tracker = handler.file_tracker();
    let want = OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG;

    let a_owner = a.get_or_create_owner(b"o", 0);
    let b_owner = b.get_or_create_owner(b"o", 0);
    let first = tracker.add_open(&a, &a_owner, &file, want, 0).expect("open failed");
    let second = tracker.add_open(&b, &b_owner, &file, want, 0).expect("open failed");

    assert!(first.delegation.is_some());
    assert!(second.delegation.is_none());
}

#[tokio::test]
async fn conflicting_open_recalls_once() {
    let handler = handler();
    let (callback, mut recalls) = recording_callback();
    let a = client_v41(&handler, "client-a", Some(callback));
    let b = client_v41(&handler, "client-b", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let open = tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &file,
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    let delegation = open.delegation.expect("no delegation");

    let b_owner = b.get_or_create_owner(b"o", 0);
    for _ in 0..3 {
        assert_eq!(
            tracker.add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_WRITE, 0).err(),
            Some(nfsstat4::NFS4ERR_DELAY)
        );
    }

    let recall = next_recall(&mut recalls).await;
    assert_eq!(recall.inode, file);
    assert_eq!(recall.stateid, delegation.stateid);
    assert!(!recall.is_write);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recalls.try_recv().is_err(), "recall sent more than once");
    assert!(tracker.delegation(&file).expect("delegation gone").recalling);

    // DELEGRETURN clears the way
    handler.return_delegation(&a, &delegation.stateid).expect("delegreturn failed");
    assert!(!tracker.has_delegation(&file));
    tracker
        .add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_WRITE, 0)
        .expect("open after return failed");
}

#[tokio::test]
async fn reader_does_not_recall_read_delegation() {
    let handler = handler();
    let (callback, mut recalls) = recording_callback();
    let a = client_v41(&handler, "client-a", Some(callback));
    let b = client_v41(&handler, "client-b", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &file,
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    tracker
        .add_open(&b, &b.get_or_create_owner(b"o", 0), &file, OPEN4_SHARE_ACCESS_READ, 0)
        .expect("reader must not be delayed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recalls.try_recv().is_err());
}

#[tokio::test]
async fn failed_recall_keeps_delegation() {
    let handler = handler();
    let (callback, mut recalls) = failing_callback(nfsstat4::NFS4ERR_BADHANDLE);
    let a = client_v41(&handler, "client-a", Some(callback));
    let b = client_v41(&handler, "client-b", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &file,
            OPEN4_SHARE_ACCESS_BOTH | OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG,
            0,
        )
        .expect("open failed");
    let err = tracker
        .add_open(&b, &b.get_or_create_owner(b"o", 0), &file, OPEN4_SHARE_ACCESS_READ, 0)
        .err();
    assert_eq!(err, Some(nfsstat4::NFS4ERR_DELAY));

    let recall = next_recall(&mut recalls).await;
    assert!(recall.is_write);
    assert!(tracker.has_delegation(&file));
}

#[tokio::test]
async fn disposing_client_clears_its_records() {
    let handler = handler();
    let (callback, _recalls) = recording_callback();
    let client = client_v41(&handler, "client-a", Some(callback));
    let owner = client.get_or_create_owner(b"owner", 0);
    let file = inode("file");
    let tracker = handler.file_tracker();

    tracker
        .add_open(
            &client,
            &owner,
            &file,
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    assert!(tracker.has_delegation(&file));

    handler.remove_client(&client);
    assert_eq!(tracker.file_count(), 0);
    assert!(!tracker.has_delegation(&file));
}

#[test]
fn recall_is_retried_once_a_runtime_is_up() {
    let handler = handler();
    let (callback, mut recalls) = recording_callback();
    let a = client_v41(&handler, "client-a", Some(callback));
    let b = client_v41(&handler, "client-b", None);
    let file = inode("file");
    let tracker = handler.file_tracker();

    let open = tracker
        .add_open(
            &a,
            &a.get_or_create_owner(b"o", 0),
            &file,
            OPEN4_SHARE_ACCESS_READ | OPEN4_SHARE_ACCESS_WANT_READ_DELEG,
            0,
        )
        .expect("open failed");
    let delegation = open.delegation.expect("no delegation");
    let b_owner = b.get_or_create_owner(b"o", 0);

    // nothing to send the recall on
    assert_eq!(
        tracker.add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_WRITE, 0).err(),
        Some(nfsstat4::NFS4ERR_DELAY)
    );
    assert!(!tracker.delegation(&file).expect("delegation gone").recalling);
    assert!(recalls.try_recv().is_err());

    let runtime = tokio::runtime::Runtime::new().expect("cannot start runtime");
    runtime.block_on(async {
        assert_eq!(
            tracker.add_open(&b, &b_owner, &file, OPEN4_SHARE_ACCESS_WRITE, 0).err(),
            Some(nfsstat4::NFS4ERR_DELAY)
        );
        let recall = next_recall(&mut recalls).await;
        assert_eq!(recall.stateid, delegation.stateid);
        assert!(tracker.delegation(&file).expect("delegation gone").recalling);
    });
}
