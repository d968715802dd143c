use std::time::Duration;

use common::{config_with_ttl, random_str};
use rust_kv_lock::{
    lock::LockManager,
    store::{EtcdStore, LockStore},
};
mod common;

#[tokio::test]
#[ignore = "requires etcd on localhost:2379"]
async fn set_if_absent_should_not_overwrite_existing_key() {
    let store = EtcdStore::new(common::get_etcd_client().await);
    let lock_name = random_str(10);
    let ttl = Duration::from_secs(10);

    assert!(store.set_if_absent(&lock_name, "a", ttl).await.expect("etcd is up"));
    assert!(!store.set_if_absent(&lock_name, "b", ttl).await.expect("etcd is up"));
    assert!(!store.compare_and_delete(&lock_name, "b").await.expect("etcd is up"));
    assert!(store.compare_and_delete(&lock_name, "a").await.expect("etcd is up"));
    assert!(!store.refresh_ttl(&lock_name, ttl).await.expect("etcd is up"));
}

#[tokio::test]
#[ignore = "requires etcd on localhost:2379"]
async fn key_should_expire_with_its_lease() {
    let store = EtcdStore::new(common::get_etcd_client().await);
    let lock_name = random_str(10);

    assert!(store
        .set_if_absent(&lock_name, "a", Duration::from_secs(2))
        .await
        .expect("etcd is up"));
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(store
        .set_if_absent(&lock_name, "b", Duration::from_secs(2))
        .await
        .expect("etcd is up"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires etcd on localhost:2379"]
async fn lock_lease_should_be_automatically_refreshed() {
    let mut etcd = common::get_etcd_client().await;
    let store = EtcdStore::new(etcd.clone());
    let lock_man = LockManager::new(store, config_with_ttl(Duration::from_secs(3)))
        .expect("valid config");
    let lock_name = random_str(10);

    let managed_lock = lock_man.try_lock(&lock_name).await.expect("failed to lock");
    tokio::time::sleep(Duration::from_secs(7)).await;

    let get_response = etcd.get(lock_name.as_str(), None).await.expect("etcd is up");
    assert_eq!(get_response.count(), 1);
    assert!(managed_lock.is_renewing());
    assert!(managed_lock.release().await.expect("etcd is up"));

    let get_response = etcd.get(lock_name.as_str(), None).await.expect("etcd is up");
    assert_eq!(get_response.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires etcd on localhost:2379"]
async fn test_lock() {
    let store = EtcdStore::new(common::get_etcd_client().await);
    store.ping().await.expect("etcd is up");
    let lock_man = LockManager::new(store, config_with_ttl(Duration::from_secs(3)))
        .expect("valid config");
    let lock_name = random_str(10);

    let lock = lock_man.lock(&lock_name).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(6)).await;
        lock.release().await.expect("etcd is up");
    });

    let lock2 = lock_man.lock(&lock_name).await;
    assert!(lock2.release().await.expect("etcd is up"));
}
