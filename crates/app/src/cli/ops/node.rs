//! Arguments and loading shared by the relay, client and trustee commands.

use std::path::PathBuf;

use clap::Args;
use common::prelude::{ErrorKind, PrifiConfig, ProtocolError, Role, SecretKey};

use crate::cli::op::{ExitStatus, OpContext};
use crate::process;
use crate::state::{
    self, GroupFile, IdentityFile, StateError, CONFIG_FILE_NAME, GROUP_FILE_NAME,
    IDENTITY_FILE_NAME,
};

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Identity file written by `gen-id` (defaults to <config dir>/identity.toml)
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Group file naming the relay and the roster (defaults to <config dir>/group.toml)
    #[arg(long)]
    pub group: Option<PathBuf>,

    /// Protocol configuration (defaults to <config dir>/prifi.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for log files, overriding LogDir
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("node {id} is not listed as a {role} with this key in the group file")]
    NotInGroup { id: u32, role: Role },

    #[error("the group file names a different relay key")]
    NotTheRelay,
}

impl ExitStatus for NodeError {
    fn exit_code(&self) -> i32 {
        match self {
            NodeError::Protocol(e) => e.kind().exit_code(),
            _ => ErrorKind::ConfigInvalid.exit_code(),
        }
    }
}

pub struct Loaded {
    pub identity: IdentityFile,
    pub secret: SecretKey,
    pub group: GroupFile,
    pub config: PrifiConfig,
}

impl Loaded {
    /// Checks the identity against the roster entry for `role`.
    pub fn check_member(&self, role: Role) -> Result<(), NodeError> {
        let roster = self.group.roster();
        match roster.lookup(self.identity.id) {
            Some((listed, pk)) if listed == role && *pk == self.identity.public => Ok(()),
            _ => Err(NodeError::NotInGroup {
                id: self.identity.id,
                role,
            }),
        }
    }

    pub fn check_relay(&self) -> Result<(), NodeError> {
        if self.group.relay.public_key != self.identity.public {
            return Err(NodeError::NotTheRelay);
        }
        Ok(())
    }
}

impl NodeArgs {
    pub fn load(&self, ctx: &OpContext) -> Result<Loaded, NodeError> {
        let identity_path = state::resolve(
            self.identity.as_deref(),
            ctx.config_path.clone(),
            IDENTITY_FILE_NAME,
        )?;
        let group_path =
            state::resolve(self.group.as_deref(), ctx.config_path.clone(), GROUP_FILE_NAME)?;
        let config_path =
            state::resolve(self.config.as_deref(), ctx.config_path.clone(), CONFIG_FILE_NAME)?;

        let identity = IdentityFile::load(&identity_path)?;
        let secret = identity.secret_key()?;
        let group = GroupFile::load(&group_path)?;
        let config = state::load_config(&config_path, self.config.is_some())?;
        Ok(Loaded {
            identity,
            secret,
            group,
            config,
        })
    }

    pub fn init_logging(
        &self,
        role: &str,
        config: &PrifiConfig,
    ) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
        let log_dir = self
            .log_dir
            .clone()
            .or_else(|| config.log_dir.as_ref().map(PathBuf::from));
        process::init_logging(role, &config.log_level, log_dir.as_deref())
    }
}
