use roltdb::DB;
use tempfile::tempdir;

#[test]
fn put_commit_reopen_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("put.db");

    {
        let db = DB::open(&path).unwrap();
        let utx = db.update().unwrap();
        utx.user_bucket_mut().put(b"ABC", b"123").unwrap();
        utx.user_bucket_mut().put(b"!@#$%^&*(", b"999888777").unwrap();
        utx.commit().unwrap();
    }

    let db = DB::open(&path).unwrap();
    let vtx = db.view();
    assert_eq!(vtx.user_bucket().get(b"ABC").unwrap().unwrap(), b"123");
    assert_eq!(
        vtx.user_bucket().get(b"!@#$%^&*(").unwrap().unwrap(),
        b"999888777"
    );
}

#[test]
fn delete_removes_key_but_leaves_siblings() {
    let dir = tempdir().unwrap();
    let db = DB::open(dir.path().join("put.db")).unwrap();

    let utx = db.update().unwrap();
    utx.user_bucket_mut().put(b"k1", b"v1").unwrap();
    utx.user_bucket_mut().put(b"k2", b"v2").unwrap();
    utx.commit().unwrap();

    let utx = db.update().unwrap();
    utx.user_bucket_mut().delete(b"k1").unwrap();
    utx.commit().unwrap();

    let vtx = db.view();
    assert_eq!(vtx.user_bucket().get(b"k1").unwrap(), None);
    assert_eq!(vtx.user_bucket().get(b"k2").unwrap().unwrap(), b"v2");
}

#[test]
fn put_overwrite_then_delete_returns_to_empty() {
    let dir = tempdir().unwrap();
    let db = DB::open(dir.path().join("put.db")).unwrap();
    let key = vec![7u8; 4096];
    let v1 = vec![1u8; 1024 * 1024];
    let v2 = vec![2u8; 1024 * 1024];

    let utx = db.update().unwrap();
    utx.user_bucket_mut().put(&key, &v1).unwrap();
    assert_eq!(utx.user_bucket().get(&key).unwrap().unwrap(), v1);
    utx.user_bucket_mut().put(&key, &v2).unwrap();
    assert_eq!(utx.user_bucket().get(&key).unwrap().unwrap(), v2);
    utx.user_bucket_mut().delete(&key).unwrap();
    assert_eq!(utx.user_bucket().get(&key).unwrap(), None);
    utx.commit().unwrap();

    let vtx = db.view();
    assert_eq!(vtx.user_bucket().get(&key).unwrap(), None);
}

#[test]
fn nested_buckets_hold_independent_contents() {
    let dir = tempdir().unwrap();
    let db = DB::open(dir.path().join("put.db")).unwrap();

    let utx = db.update().unwrap();
    {
        let root = utx.user_bucket_mut();
        let sub1 = root.bucket_mut(b"sub1").unwrap();
        sub1.put(b"sub1_key1", b"sub1_value1").unwrap();
        sub1.put(b"sub1_key2", b"sub1_value2").unwrap();
        let sub2 = root.bucket_mut(b"sub2").unwrap();
        sub2.put(b"sub2_key1", b"sub2_value1").unwrap();
    }
    utx.commit().unwrap();

    let vtx = db.view();
    let sub1 = vtx.user_bucket().bucket(b"sub1").unwrap();
    assert_eq!(sub1.get(b"sub1_key1").unwrap().unwrap(), b"sub1_value1");
    assert_eq!(sub1.get(b"sub1_key2").unwrap().unwrap(), b"sub1_value2");
    let sub2 = vtx.user_bucket().bucket(b"sub2").unwrap();
    assert_eq!(sub2.get(b"sub2_key1").unwrap().unwrap(), b"sub2_value1");
}

#[test]
fn rollback_discards_the_whole_transaction() {
    let dir = tempdir().unwrap();
    let db = DB::open(dir.path().join("put.db")).unwrap();

    let utx = db.update().unwrap();
    utx.user_bucket_mut().put(b"k", b"v").unwrap();
    utx.commit().unwrap();

    let utx = db.update().unwrap();
    utx.user_bucket_mut().put(b"k", b"v2").unwrap();
    utx.user_bucket_mut().put(b"other", b"x").unwrap();
    utx.rollback().unwrap();

    let vtx = db.view();
    assert_eq!(vtx.user_bucket().get(b"k").unwrap().unwrap(), b"v");
    assert_eq!(vtx.user_bucket().get(b"other").unwrap(), None);
}

#[test]
fn many_ordered_keys_survive_reopen_in_sorted_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("put.db");

    {
        let db = DB::open(&path).unwrap();
        let utx = db.update().unwrap();
        for i in 0u32..2000 {
            let k = i.to_be_bytes();
            utx.user_bucket_mut().put(&k, &k).unwrap();
        }
        utx.commit().unwrap();
    }

    let db = DB::open(&path).unwrap();
    let vtx = db.view();
    let bucket = vtx.user_bucket();
    let mut cursor = bucket.cursor();
    cursor.first(bucket.root()).unwrap();
    let mut count = 0u32;
    let mut prev: Option<Vec<u8>> = None;
    while let Some((k, v, _)) = cursor.current() {
        if let Some(p) = &prev {
            assert!(p.as_slice() < k, "keys must come back in sorted order");
        }
        assert_eq!(k, v);
        prev = Some(k.to_vec());
        count += 1;
        if !cursor.next().unwrap() {
            break;
        }
    }
    assert_eq!(count, 2000);
}
