use std::path::Path;

mod support;

use nfs_mamont_state::config::RecoveryStoreConfig;
use nfs_mamont_state::state::recovery::{
    ClientRecoveryStore, EphemeralClientRecoveryStore, SledClientRecoveryStore,
};
use nfs_mamont_state::xdr::nfs4::{nfsstat4, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE};

use support::{handler_with, inode, new_client, test_config};

fn reopen(path: &Path) -> SledClientRecoveryStore {
    SledClientRecoveryStore::open(path).expect("cannot open recovery store")
}

#[test]
fn ephemeral_store_knows_nobody_from_before() {
    let store = EphemeralClientRecoveryStore::new();

    store.add_client(b"host-a").expect("cannot add client");
    store.add_client(b"host-b").expect("cannot add client");
    assert_eq!(store.len(), 2);
    store.remove_client(b"host-b").expect("cannot remove client");
    assert_eq!(store.len(), 1);

    assert!(store.in_grace());
    assert!(!store.waiting_for_reclaim());
    assert_eq!(store.want_reclaim(b"host-a"), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));

    store.reclaim_complete().expect("cannot end grace");
    assert!(!store.in_grace());
    assert_eq!(store.want_reclaim(b"host-a"), Err(nfsstat4::NFS4ERR_NO_GRACE));
}

#[test]
fn sled_store_survives_restart() {
    let dir = tempfile::tempdir().expect("cannot create temp dir");
    let path = dir.path().join("recovery");

    {
        let store = reopen(&path);
        assert_eq!(store.generation(), 1);
        store.add_client(b"host-a").expect("cannot add client");
        store.add_client(b"host-b").expect("cannot add client");
        // first boot: nothing to reclaim
        assert!(!store.waiting_for_reclaim());
        assert_eq!(store.want_reclaim(b"host-a"), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));
        store.reclaim_complete().expect("cannot end grace");
        store.flush().expect("cannot flush");
    }

    {
        let store = reopen(&path);
        assert_eq!(store.generation(), 2);
        assert!(store.in_grace());
        assert!(store.waiting_for_reclaim());

        store.want_reclaim(b"host-a").expect("known client cannot reclaim");
        assert_eq!(store.want_reclaim(b"host-c"), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));
        assert!(store.waiting_for_reclaim());

        // host-b never comes back; its record is dropped with the grace period
        store.reclaim_complete().expect("cannot end grace");
        assert!(!store.in_grace());
        assert!(!store.waiting_for_reclaim());
        assert_eq!(store.want_reclaim(b"host-a"), Err(nfsstat4::NFS4ERR_NO_GRACE));
    }

    let store = reopen(&path);
    assert_eq!(store.generation(), 3);
    store.want_reclaim(b"host-a").expect("reclaimed client lost");
    assert_eq!(store.want_reclaim(b"host-b"), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));
}

#[test]
fn removed_client_is_not_awaited() {
    let dir = tempfile::tempdir().expect("cannot create temp dir");
    let path = dir.path().join("recovery");

    reopen(&path).add_client(b"host-a").expect("cannot add client");

    let store = reopen(&path);
    assert!(store.waiting_for_reclaim());
    store.remove_client(b"host-a").expect("cannot remove client");
    assert!(!store.waiting_for_reclaim());
    assert_eq!(store.want_reclaim(b"host-a"), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));
    drop(store);

    assert!(!reopen(&path).waiting_for_reclaim());
}

#[test]
fn readded_client_survives_grace_end() {
    let dir = tempfile::tempdir().expect("cannot create temp dir");
    let path = dir.path().join("recovery");

    reopen(&path).add_client(b"host-a").expect("cannot add client");

    {
        // the client comes back with a fresh EXCHANGE_ID instead of reclaiming
        let store = reopen(&path);
        store.add_client(b"host-a").expect("cannot add client");
        store.reclaim_complete().expect("cannot end grace");
    }

    let store = reopen(&path);
    store.want_reclaim(b"host-a").expect("record of new client dropped");
}

#[tokio::test]
async fn reboot_reclaim_through_handler() {
    let dir = tempfile::tempdir().expect("cannot create temp dir");
    let config = test_config().with_recovery(RecoveryStoreConfig::Sled(dir.path().join("state")));
    let file = inode("file");

    {
        let handler = handler_with(config.clone());
        let client = handler.create_client(new_client(1, "host-a", None));
        assert!(handler.recovery_store().in_grace());
        assert_eq!(handler.want_reclaim(&client), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));
        handler.shutdown();
    }

    let handler = handler_with(config);
    let client = handler.create_client(new_client(1, "host-a", None));
    let stranger = handler.create_client(new_client(1, "host-z", None));
    let owner = client.get_or_create_owner(b"owner", 0);

    let (access, deny) = (OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE);

    assert_eq!(
        handler.open_file(&client, &owner, &file, access, deny, false).err(),
        Some(nfsstat4::NFS4ERR_GRACE)
    );
    let open = handler
        .open_file(&client, &owner, &file, access, deny, true)
        .expect("reclaim failed");
    assert_eq!(handler.file_tracker().open_count(&file), 1);
    assert_eq!(handler.want_reclaim(&stranger), Err(nfsstat4::NFS4ERR_RECLAIM_BAD));

    // the only client from before has reclaimed: grace ends early
    handler.reclaim_complete(&client).expect("reclaim_complete failed");
    assert!(!handler.in_grace_period());
    assert_eq!(handler.check_grace(true), Err(nfsstat4::NFS4ERR_NO_GRACE));
    assert_eq!(handler.check_grace(false), Ok(()));
    assert_eq!(handler.reclaim_complete(&client), Err(nfsstat4::NFS4ERR_COMPLETE_ALREADY));

    handler.close_file(&client, &open.stateid).expect("close failed");
    handler.shutdown();
}
