use std::path::PathBuf;

use clap::Args;
use common::prelude::{ErrorKind, ProtocolError};

use crate::cli::op::ExitStatus;
use crate::process::{self, utils};
use crate::state::{self, StateError, CONFIG_FILE_NAME};

/// Connects the local ingress straight to the egress, without DC-net.
#[derive(Args, Debug, Clone)]
pub struct Sockstest {
    /// Protocol configuration (defaults to <config dir>/prifi.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for log files, overriding LogDir
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SockstestError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ExitStatus for SockstestError {
    fn exit_code(&self) -> i32 {
        match self {
            SockstestError::State(_) => ErrorKind::ConfigInvalid.exit_code(),
            SockstestError::Protocol(e) => e.kind().exit_code(),
        }
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Sockstest {
    type Error = SockstestError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let path = state::resolve(self.config.as_deref(), ctx.config_path.clone(), CONFIG_FILE_NAME)?;
        let config = state::load_config(&path, self.config.is_some())?;
        let log_dir = self
            .log_dir
            .clone()
            .or_else(|| config.log_dir.as_ref().map(PathBuf::from));
        let _guards = process::init_logging("sockstest", &config.log_level, log_dir.as_deref());

        let (graceful_waiter, _shutdown_tx, shutdown_rx) =
            utils::graceful_shutdown_blocker().map_err(ProtocolError::from)?;
        common::socks::sockstest(&config, shutdown_rx).await?;
        let _ = graceful_waiter.await;

        Ok("sockstest stopped".to_string())
    }
}
