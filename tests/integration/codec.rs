use rand::Rng;

use fsal::wire::{SHORT_WIRE_KEY_LEN, WIRE_KEY_LEN};
use fsal::{FsalError, NfsStatus, WireKey};

use crate::helpers::TestExport;

/// Test 1: Arbitrary keys survive encode then decode.
#[test]
fn test_random_keys_round_trip() {
    let mut rng = rand::thread_rng();
    for _ in 0..500 {
        let key = WireKey::new(rng.gen(), rng.gen(), rng.gen());
        let mut buf = [0u8; 64];
        let n = key.encode(&mut buf).unwrap();
        assert_eq!(n, WIRE_KEY_LEN);
        assert_eq!(WireKey::decode(&buf[..n]).unwrap(), key);
    }
}

/// Test 2: Every length other than the short and full forms is rejected.
#[test]
fn test_decode_rejects_other_lengths() {
    let buf = [0x5au8; 64];
    for len in 0..buf.len() {
        let result = WireKey::decode(&buf[..len]);
        if len == SHORT_WIRE_KEY_LEN || len == WIRE_KEY_LEN {
            assert!(result.is_ok(), "length {} should decode", len);
        } else {
            let err = result.unwrap_err();
            assert!(matches!(err, FsalError::BadHandle { len: l } if l == len));
            assert_eq!(err.status(), NfsStatus::Badhandle);
        }
    }
}

/// Test 3: A short output buffer is left untouched.
#[test]
fn test_encode_too_small_writes_nothing() {
    let key = WireKey::new(7, 8, 9);
    let mut buf = [0xeeu8; WIRE_KEY_LEN - 1];
    let err = key.encode(&mut buf).unwrap_err();
    assert_eq!(err.status(), NfsStatus::Toosmall);
    assert!(buf.iter().all(|&b| b == 0xee));
}

/// Test 4: A handle's wire form turns back into a handle for the same object.
#[test]
fn test_handle_to_wire_and_back() {
    let t = TestExport::new();
    let file = t.file("/dir/f", b"abc");
    let mut wire = [0u8; 32];
    let n = file.handle_to_wire(&mut wire).unwrap();
    assert_eq!(n, WIRE_KEY_LEN);
    assert_eq!(t.export.extract_handle(&wire[..n]).unwrap(), WIRE_KEY_LEN);

    let again = t.export.create_handle(&wire[..n]).unwrap();
    assert_eq!(again.handle_to_key(), file.handle_to_key());
    assert_eq!(again.getattr().unwrap().size, 3);

    // The short form names the same inode.
    let short = file.handle_to_key().inode.to_le_bytes();
    let by_inode = t.export.create_handle(&short).unwrap();
    assert_eq!(by_inode.vino(), file.vino());
}

/// Test 5: Malformed wire handles are refused before touching the backend.
#[test]
fn test_create_handle_validates_length() {
    let t = TestExport::new();
    let before = t.cluster.outstanding_refs();
    let err = t.export.create_handle(&[0u8; 12]).unwrap_err();
    assert_eq!(err.status(), NfsStatus::Badhandle);
    assert!(t.export.extract_handle(&[1u8; 3]).is_err());
    assert_eq!(t.cluster.outstanding_refs(), before);
}

/// Test 6: A handle for an inode the backend does not know is stale.
#[test]
fn test_create_handle_for_missing_inode_is_stale() {
    let t = TestExport::new();
    let key = WireKey::new(999_999, 0, 1);
    let err = t.export.create_handle(&key.to_bytes()).unwrap_err();
    assert_eq!(err.status(), NfsStatus::Stale);
}
