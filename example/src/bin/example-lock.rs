use core::time::Duration;

use rust_kv_lock::{
    config::LockConfig,
    lock::LockManager,
    logging,
    store::EtcdStore,
};

#[tokio::main]
async fn main() {
    let _logging = logging::init_from_env().expect("failed to install logging");
    let store = EtcdStore::connect(["http://localhost:2379"])
        .await
        .expect("failed to connect to etcd");

    let config = LockConfig {
        ttl_ms: 3_000,
        ..LockConfig::from_env("KVLOCK").expect("invalid lock config")
    };
    let lock_manager = LockManager::new(store, config)
        .expect("invalid lock config")
        .with_span(tracing::info_span!("example"));

    let lock_name = "example-lock";

    let my_managed_lock = lock_manager.lock(lock_name).await;

    let lock_manager2 = lock_manager.clone();
    let h = tokio::spawn(async move {
        let lock = lock_manager2.lock(lock_name).await;
        println!("Lock acquired in task 2!");
        lock.release().await.expect("failed to release lock in task 2");
    });

    println!("Lock acquired in main task!");

    println!("Sleeping for 5 second...");
    for i in 1..=5 {
        println!("{}...", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Releasing managed lock!");
    let released = my_managed_lock
        .release()
        .await
        .expect("failed to release lock");
    println!("Released while still owner: {released}");

    println!("Waiting for task 2 to acquire lock...");
    h.await.expect("task 2 failed to acquire lock");
    println!("Finished!");
}
