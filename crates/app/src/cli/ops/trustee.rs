use clap::Args;
use common::prelude::{ProtocolError, Role, Suite};
use common::trustee::Trustee as TrusteeNode;

use super::node::{NodeArgs, NodeError};
use crate::process::utils;

#[derive(Args, Debug, Clone)]
pub struct Trustee {
    #[command(flatten)]
    pub node: NodeArgs,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Trustee {
    type Error = NodeError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let loaded = self.node.load(ctx)?;
        loaded.check_member(Role::Trustee)?;
        let config = loaded.config.clone();
        let _guards = self.node.init_logging("trustee", &config);

        let (graceful_waiter, _shutdown_tx, shutdown_rx) =
            utils::graceful_shutdown_blocker().map_err(ProtocolError::from)?;
        let span = tracing::info_span!("prifi", role = "trustee", id = loaded.identity.id);

        let trustee = TrusteeNode::new(
            Suite,
            loaded.group.relay_addr()?,
            loaded.identity.id,
            loaded.secret,
            config,
        )?
        .with_span(&span);
        let status = trustee.handle();

        trustee.run(shutdown_rx).await;
        let _ = graceful_waiter.await;

        let status = status.status();
        Ok(format!(
            "trustee {} stopped after {} setups and {} cells",
            loaded.identity.id, status.setups, status.cells_sent
        ))
    }
}
