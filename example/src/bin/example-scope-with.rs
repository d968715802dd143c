use core::time::Duration;

use rust_kv_lock::{config::LockConfig, lock::LockManager, logging, store::EtcdStore};

#[tokio::main]
async fn main() {
    let logging = logging::init("info").expect("failed to install logging");
    let mut etcd = etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd");

    let config = LockConfig {
        ttl_ms: 3_000,
        ..Default::default()
    };
    let lock_manager =
        LockManager::new(EtcdStore::new(etcd.clone()), config).expect("invalid lock config");

    let lock_name = "example-lock";

    let my_managed_lock = lock_manager
        .try_lock(lock_name)
        .await
        .expect("failed to lock");

    // Show refreshes of the lease.
    logging
        .set_filter("rust_kv_lock=trace")
        .expect("invalid filter");

    let h = tokio::spawn(async move {
        println!("Lock acquired in subtask!");
        // If you need to run something as long as the lock is held, you can use `scope` method.
        let result = my_managed_lock
            .scope(async move {
                let now = tokio::time::Instant::now();
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    println!("Subtask is still running after {:?}", now.elapsed());
                }
            })
            .await;
        println!("Scope exited: {result:?}");
        my_managed_lock.release().await
    });

    println!("Press Ctrl-C to delete the lock key and abort `scope` loop");
    let _ = tokio::signal::ctrl_c().await;

    // You don't want to drop the key manually like this, this is just for demonstration purposes.
    etcd.delete(lock_name, None)
        .await
        .expect("failed to delete lock key");

    let released = h.await.expect("subtask panicked");
    println!("Released while still owner: {released:?}");

    println!("Finished!");
}
