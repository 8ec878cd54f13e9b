use std::fmt::Debug;

use nfs_mamont_state::xdr::nfs4::{
    channel_attrs4, client_owner4, nfs_lock_type4, nfsstat4, open_delegation_type4, stateid4,
};
use nfs_mamont_state::xdr::{deserialize, Deserialize, Serialize};

#[derive(Default)]
struct Context {
    buf: Vec<u8>,
}

trait TestValue: Deserialize + Serialize + Eq + Default + Debug + Clone {}
impl<T: Deserialize + Serialize + Eq + Default + Debug + Clone> TestValue for T {}

impl Context {
    fn check<T: TestValue>(&mut self, src_value: &T) {
        for exsist in 0..4 {
            self.buf.clear();
            self.buf.resize(exsist, Default::default());

            src_value.serialize(&mut self.buf).expect("cannot serialize");
            assert_eq!((self.buf.len() - exsist) % 4, 0);

            let result_value =
                deserialize::<T>(&mut &self.buf[exsist..]).expect("cannot deserialize");

            assert_eq!(src_value, &result_value);
        }
    }

    fn check_multi<T: TestValue>(&mut self, src_values: &[T]) {
        src_values.iter().for_each(|i| self.check(i));
    }
}

#[test]
fn test_scalar_bijection() {
    let mut ctx = Context::default();

    ctx.check_multi(&[u32::MIN, 1u32, u32::MAX]);
    ctx.check_multi(&[u64::MIN, 1u64, u64::MAX]);
    ctx.check_multi(&[[0u8; 8], [0xa5u8; 8]]);
    ctx.check_multi(&[vec![], vec![1u8], vec![1u8, 2, 3, 4, 5]]);
}

#[test]
fn test_stateid_layout() {
    let mut other = [0u8; 12];
    other.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8 + 1);
    let stateid = stateid4::new(0x0102_0304, other);

    let mut buf = Vec::new();
    stateid.serialize(&mut buf).expect("cannot serialize");

    assert_eq!(buf.len(), 16);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert_eq!(&buf[4..], &other);
    assert_eq!(deserialize::<stateid4>(&mut &buf[..]).expect("cannot deserialize"), stateid);
}

#[test]
fn test_nfsstat_wire_values() {
    let mut buf = Vec::new();
    nfsstat4::NFS4ERR_BADSESSION.serialize(&mut buf).expect("cannot serialize");
    assert_eq!(buf, 10052u32.to_be_bytes());

    let mut ctx = Context::default();
    ctx.check_multi(&[
        nfsstat4::NFS4_OK,
        nfsstat4::NFS4ERR_SHARE_DENIED,
        nfsstat4::NFS4ERR_SEQ_MISORDERED,
        nfsstat4::NFS4ERR_RETRY_UNCACHED_REP,
    ]);
    ctx.check_multi(&[
        open_delegation_type4::OPEN_DELEGATE_NONE,
        open_delegation_type4::OPEN_DELEGATE_WRITE,
    ]);
    ctx.check(&nfs_lock_type4::WRITEW_LT);
}

#[test]
fn test_unknown_status_rejected() {
    let buf = 4242u32.to_be_bytes();
    assert!(deserialize::<nfsstat4>(&mut &buf[..]).is_err());
}

#[test]
fn test_nfsstat_as_error() {
    assert_eq!(nfsstat4::NFS4ERR_STALE_CLIENTID.to_string(), "NFS4ERR_STALE_CLIENTID");
    assert!(nfsstat4::NFS4_OK.bumps_seqid());
    assert!(nfsstat4::NFS4ERR_SHARE_DENIED.bumps_seqid());
    assert!(!nfsstat4::NFS4ERR_BAD_SEQID.bumps_seqid());

    let err = anyhow::Error::from(nfsstat4::NFS4ERR_GRACE).context("open during grace");
    assert_eq!(err.downcast_ref::<nfsstat4>(), Some(&nfsstat4::NFS4ERR_GRACE));
}

#[test]
fn test_session_structs_bijection() {
    let mut ctx = Context::default();

    ctx.check(&channel_attrs4 {
        ca_headerpadsize: 0,
        ca_maxrequestsize: 1049088,
        ca_maxresponsesize: 1049088,
        ca_maxresponsesize_cached: 8192,
        ca_maxoperations: 64,
        ca_maxrequests: 64,
        ca_rdma_ird: vec![],
    });
    ctx.check(&channel_attrs4 {
        ca_rdma_ird: vec![4],
        ..Default::default()
    });
    ctx.check_multi(&[
        client_owner4 {
            co_verifier: [7; 8],
            co_ownerid: b"Linux NFSv4.1 host".to_vec(),
        },
        client_owner4 {
            co_verifier: [0; 8],
            co_ownerid: vec![],
        },
    ]);
}

#[test]
fn test_non_zero_padding_rejected() {
    let buf = [0, 0, 0, 1, 0xaa, 0, 0, 1];
    assert!(deserialize::<Vec<u8>>(&mut &buf[..]).is_err());

    let buf = [0, 0, 0, 1, 0xaa, 0, 0, 0];
    assert_eq!(deserialize::<Vec<u8>>(&mut &buf[..]).expect("cannot deserialize"), vec![0xaa]);
}

#[test]
fn test_length_prefixed_arrays() {
    let mut ctx = Context::default();
    ctx.check_multi(&[Vec::<u32>::new(), vec![0u32], vec![1, u32::MAX, 7]]);

    let mut buf = Vec::new();
    vec![5u32, 6].serialize(&mut buf).expect("cannot serialize");
    assert_eq!(buf, [0, 0, 0, 2, 0, 0, 0, 5, 0, 0, 0, 6]);

    // the prefix promises more items than follow
    assert!(deserialize::<Vec<u32>>(&mut &buf[..8]).is_err());
    assert!(deserialize::<Vec<u8>>(&mut &[0u8, 0, 0, 3, 1, 2][..]).is_err());
}
