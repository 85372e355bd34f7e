use std::net::SocketAddr;

use clap::Args;
use common::prelude::{ProtocolError, Suite, TcpEgress};
use common::relay::Relay as RelayNode;
use tracing::Instrument;

use super::node::{NodeArgs, NodeError};
use crate::process::{self, utils};

#[derive(Args, Debug, Clone)]
pub struct Relay {
    #[command(flatten)]
    pub node: NodeArgs,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Relay {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let loaded = self.node.load(ctx)?;
        loaded.check_relay()?;
        let config = loaded.config.clone();
        let _guards = self.node.init_logging("relay", &config);

        let (graceful_waiter, shutdown_tx, shutdown_rx) =
            utils::graceful_shutdown_blocker().map_err(ProtocolError::from)?;
        let span = tracing::info_span!("prifi", role = "relay", id = loaded.identity.id);

        let (egress_tx, egress_rx) = flume::unbounded();
        let (replies_tx, replies_rx) = flume::unbounded();
        let relay = RelayNode::bind(
            Suite,
            loaded.identity.listen_addr()?,
            loaded.group.roster(),
            config.clone(),
        )
        .await?
        .with_egress(egress_tx, replies_rx)
        .with_span(&span);

        let exit = SocketAddr::from(([127, 0, 0, 1], config.socks_server_port));
        let egress = TcpEgress::new(exit, config.cell_size_down, replies_tx);
        let egress_task =
            tokio::spawn(egress.run(egress_rx, shutdown_rx.clone()).instrument(span.clone()));

        let reports = relay.run(shutdown_rx).await;

        // The relay also returns on its own once a run reaches the reporting limit.
        let _ = shutdown_tx.send(());
        graceful_waiter.abort();
        process::join_with_timeout(vec![egress_task]).await;

        let decoded: u64 = reports.iter().map(|r| r.decoded_rounds as u64).sum();
        Ok(format!(
            "relay stopped after {} protocol runs and {} decoded rounds",
            reports.len(),
            decoded
        ))
    }
}
