use std::path::PathBuf;

use clap::Args;
use common::prelude::ErrorKind;

use crate::cli::op::ExitStatus;
use crate::state::{self, IdentityFile, StateError, IDENTITY_FILE_NAME};

/// Generates a keypair and writes it with the node's listen address.
#[derive(Args, Debug, Clone)]
pub struct GenId {
    /// Roster id of the node
    #[arg(long)]
    pub id: u32,

    /// Listen address, e.g. 0.0.0.0:7000
    #[arg(long)]
    pub address: String,

    /// Output file (defaults to <config dir>/identity.toml)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum GenIdError {
    #[error("gen-id failed: {0}")]
    State(#[from] StateError),
}

impl ExitStatus for GenIdError {
    fn exit_code(&self) -> i32 {
        ErrorKind::ConfigInvalid.exit_code()
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for GenId {
    type Error = GenIdError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let path = state::resolve(self.out.as_deref(), ctx.config_path.clone(), IDENTITY_FILE_NAME)?;
        let identity = IdentityFile::generate(self.id, &self.address)?;
        identity.save(&path)?;

        Ok(format!(
            "Wrote identity of node {} to {}\n\
             - Address: {}\n\
             - Public key: {}",
            identity.id,
            path.display(),
            identity.address,
            identity.public.to_hex()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::op::{Op, OpContext};

    #[tokio::test]
    async fn test_gen_id_writes_into_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = OpContext::new(Some(dir.path().to_path_buf()));
        let op = GenId {
            id: 7,
            address: "127.0.0.1:7007".to_string(),
            out: None,
        };
        let output = op.execute(&ctx).await.unwrap();

        let identity = IdentityFile::load(&dir.path().join(IDENTITY_FILE_NAME)).unwrap();
        assert_eq!(identity.id, 7);
        assert!(output.contains(&identity.public.to_hex()));

        let again = op.execute(&ctx).await.unwrap_err();
        assert_eq!(again.exit_code(), 1);
    }
}
