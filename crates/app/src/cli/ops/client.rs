use std::net::SocketAddr;

use clap::Args;
use common::client::Client as ClientNode;
use common::prelude::{ProtocolError, Role, Suite, TcpIngress};
use tracing::Instrument;

use super::node::{NodeArgs, NodeError};
use crate::process::utils;

#[derive(Args, Debug, Clone)]
pub struct Client {
    #[command(flatten)]
    pub node: NodeArgs,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Client {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let loaded = self.node.load(ctx)?;
        loaded.check_member(Role::Client)?;
        let config = loaded.config.clone();
        let _guards = self.node.init_logging("client", &config);

        let (graceful_waiter, _shutdown_tx, shutdown_rx) =
            utils::graceful_shutdown_blocker().map_err(ProtocolError::from)?;
        let span = tracing::info_span!("prifi", role = "client", id = loaded.identity.id);

        let (downstream_tx, downstream_rx) = flume::unbounded();
        let client = ClientNode::new(
            Suite,
            loaded.group.relay_addr()?,
            loaded.identity.id,
            loaded.secret,
            config.clone(),
        )?
        .with_downstream(downstream_tx)
        .with_span(&span);
        let status = client.handle();

        let listen = SocketAddr::from(([127, 0, 0, 1], config.socks_client_port));
        let ingress = TcpIngress::bind(listen, config.cell_size_up, client.upstream())
            .await
            .map_err(ProtocolError::from)?;
        tracing::info!(parent: &span, "accepting local streams on {}", listen);

        tokio::join!(
            client.run(shutdown_rx.clone()),
            ingress.run(downstream_rx, shutdown_rx).instrument(span.clone())
        );
        let _ = graceful_waiter.await;

        let status = status.status();
        Ok(format!(
            "client {} stopped after {} setups and {} cells",
            loaded.identity.id, status.setups, status.cells_sent
        ))
    }
}
