use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::api::HttpApi;
use crate::config::AgentConfig;
use crate::formula::{pack_directory, FormulaRunner};

/// Process exit code when the formula script itself exited non-zero.
pub const EXIT_SCRIPT_FAILED: i32 = 2;
/// Process exit code when the pipeline stopped before the script ran to completion.
pub const EXIT_FATAL: i32 = 1;

/// Run one formula package and map the outcome to a process exit code.
pub async fn formula_run(cfg: &AgentConfig, uuid: String, key: Option<String>) -> anyhow::Result<i32> {
    let api = HttpApi::new(cfg).context("building API client")?;
    let runner = FormulaRunner::new(cfg, Arc::new(api));
    match runner.run(&uuid, key.as_deref()).await {
        // the runner logs every outcome itself
        Ok(true) => Ok(0),
        Ok(false) => Ok(EXIT_SCRIPT_FAILED),
        Err(e) => {
            eprintln!("formula {uuid}: {e}");
            Ok(EXIT_FATAL)
        }
    }
}

/// Package a directory containing main.py into an encrypted formula archive and
/// print what the API server needs to serve it.
pub async fn formula_pack(dir: PathBuf, uuid: Option<String>, out: Option<PathBuf>) -> anyhow::Result<()> {
    let uuid = uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let out_dir = out.unwrap_or_else(|| PathBuf::from("."));
    let packed = {
        let uuid = uuid.clone();
        tokio::task::spawn_blocking(move || pack_directory(&dir, &uuid, &out_dir))
            .await
            .context("pack task panicked")??
    };
    info!(uuid = %packed.uuid, path = %packed.encrypted_path.display(), "formula packed");
    println!("uuid:     {}", packed.uuid);
    println!("archive:  {}", packed.encrypted_path.display());
    println!("checksum: {}", packed.checksum);
    println!("key:      {}", packed.key);
    Ok(())
}
