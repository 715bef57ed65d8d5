use async_trait::async_trait;
use cid::Cid;
use color_eyre::{eyre::WrapErr, Result};
use tokio_util::sync::CancellationToken;

use crate::net::{new_probe_swarm, GraphsyncClient, PeerAddr};
use crate::types::{RetrievalResult, Task};
use crate::worker::Probe;

/// Legacy DAG-transfer path: dial the provider's announced addresses
/// directly, no endpoint negotiation.
pub struct GraphsyncProbe;

#[async_trait]
impl Probe for GraphsyncProbe {
    async fn do_work(
        &self,
        task: &Task,
        shutdown: &CancellationToken,
    ) -> Result<RetrievalResult> {
        let mut swarm = new_probe_swarm()?;

        let (peer_id, addrs) = task.provider.peer_addr()?;
        let target = PeerAddr { peer_id, addrs };
        let content_cid: Cid = task
            .content
            .cid
            .parse()
            .wrap_err("failed to parse content cid")?;

        let client = GraphsyncClient::new(task.timeout);
        client
            .retrieve(&mut swarm, &target, content_cid, shutdown)
            .await
    }
}
