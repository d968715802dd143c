use {
    super::{LockStore, StoreError},
    crate::retry::is_transient,
    etcd_client::{
        Compare, CompareOp, DeleteOptions, PutOptions, Txn, TxnOp, TxnOpResponse,
    },
    futures::StreamExt,
    std::time::Duration,
    tracing::{trace, warn},
};

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        if is_transient(&err) {
            StoreError::unavailable(err)
        } else {
            StoreError::rejected(err)
        }
    }
}

///
/// [`LockStore`] on top of etcd.
///
/// Time-to-live is carried by an etcd lease attached to the key, so the key disappears with its lease.
/// Lease TTLs have second granularity: durations are rounded up to the next second.
///
/// Refreshing sends one keep-alive for the key's lease, which resets it to the TTL it was granted with.
///
#[derive(Clone)]
pub struct EtcdStore {
    etcd: etcd_client::Client,
}

impl EtcdStore {
    pub fn new(etcd: etcd_client::Client) -> Self {
        Self { etcd }
    }

    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(
        endpoints: S,
    ) -> Result<Self, etcd_client::Error> {
        let etcd = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self::new(etcd))
    }

    pub fn client(&self) -> &etcd_client::Client {
        &self.etcd
    }

    async fn revoke_quietly(&self, lease_id: i64) {
        let mut etcd = self.etcd.clone();
        if let Err(e) = etcd.lease_revoke(lease_id).await {
            warn!("failed to revoke lease {lease_id:?}, it will expire on its own: {e:?}");
        }
    }
}

fn lease_ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl LockStore for EtcdStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut etcd = self.etcd.clone();
        let lease_id = etcd.lease_grant(lease_ttl_secs(ttl), None).await?.id();
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let txn_resp = match etcd.txn(txn).await {
            Ok(resp) => resp,
            Err(e) => {
                self.revoke_quietly(lease_id).await;
                return Err(e.into());
            }
        };
        if !txn_resp.succeeded() {
            self.revoke_quietly(lease_id).await;
        }
        Ok(txn_resp.succeeded())
    }

    async fn refresh_ttl(&self, key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        let mut etcd = self.etcd.clone();
        let get_resp = etcd.get(key, None).await?;
        let lease_id = match get_resp.kvs().first().map(|kv| kv.lease()) {
            Some(lease_id) if lease_id != 0 => lease_id,
            _ => return Ok(false),
        };
        let (mut keeper, mut keep_alive_resp_stream) = etcd.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        match keep_alive_resp_stream.next().await {
            Some(Ok(keep_alive_resp)) => {
                trace!(
                    "keep alive lease {lease_id:?} of {key}, ttl: {}",
                    keep_alive_resp.ttl()
                );
                Ok(keep_alive_resp.ttl() > 0)
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(StoreError::unavailable(format!(
                "keep alive stream for lease {lease_id:?} ended"
            ))),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut etcd = self.etcd.clone();
        let txn = Txn::new()
            .when(vec![Compare::value(key, CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::delete(
                key,
                Some(DeleteOptions::new().with_prev_key()),
            )]);
        let txn_resp = etcd.txn(txn).await?;
        if !txn_resp.succeeded() {
            return Ok(false);
        }
        let lease_ids = txn_resp
            .op_responses()
            .into_iter()
            .filter_map(|op| match op {
                TxnOpResponse::Delete(del) => Some(del),
                _ => None,
            })
            .flat_map(|del| del.prev_kvs().iter().map(|kv| kv.lease()).collect::<Vec<_>>())
            .filter(|lease_id| *lease_id != 0)
            .collect::<Vec<_>>();
        for lease_id in lease_ids {
            self.revoke_quietly(lease_id).await;
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut etcd = self.etcd.clone();
        etcd.status().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_ttl_should_round_up_to_whole_seconds() {
        assert_eq!(lease_ttl_secs(Duration::from_secs(30)), 30);
        assert_eq!(lease_ttl_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(lease_ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(lease_ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn grpc_errors_should_map_to_store_errors() {
        let unavailable = etcd_client::Error::GRpcStatus(tonic::Status::unavailable("down"));
        assert!(matches!(
            StoreError::from(unavailable),
            StoreError::Unavailable(_)
        ));

        let denied = etcd_client::Error::GRpcStatus(tonic::Status::permission_denied("nope"));
        assert!(matches!(StoreError::from(denied), StoreError::Rejected(_)));
    }
}
