//! Formula execution: verify -> decrypt -> unpack -> register -> execute.
//!
//! Every stage's output is the next stage's precondition, so stages run strictly
//! in order and any stage error ends the run. Only a non-zero exit of the
//! formula script itself is reported as a soft failure (`Ok(false)`).

pub mod pack;
pub mod record;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use base64::Engine;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::{ApiError, FormulaApi};
use crate::config::AgentConfig;
use common::{RegisterRequest, VerifyRequest, ARCHIVE_EXT, ENCRYPTED_ARCHIVE_EXT, FORMULA_ENTRY_SCRIPT};

pub use pack::pack_directory;
pub use record::{RunRecord, RunState};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum FormulaError {
    #[error("invalid package id {0:?}")]
    InvalidPackageId(String),
    #[error("package archive not found at {0}")]
    ArchiveMissing(PathBuf),
    #[error("failed to checksum {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("verification rejected: {0}")]
    Verify(#[source] ApiError),
    #[error("decryption failed: {0}")]
    Decrypt(#[source] anyhow::Error),
    #[error("unpack failed: {0}")]
    Unpack(#[source] anyhow::Error),
    #[error("expected formula directory {0} is missing after unpack")]
    MissingDirectory(PathBuf),
    #[error("expected entry script {0} is missing after unpack")]
    MissingEntryScript(PathBuf),
    #[error("registration rejected: {0}")]
    Register(#[source] ApiError),
    #[error("failed to launch {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },
}

impl FormulaError {
    /// The stage the run was in when this error ended it.
    pub fn stage(&self) -> RunState {
        match self {
            FormulaError::InvalidPackageId(_) => RunState::Start,
            FormulaError::Checksum { .. } | FormulaError::Verify(_) => RunState::Verifying,
            FormulaError::ArchiveMissing(_) | FormulaError::Decrypt(_) => RunState::Decrypting,
            FormulaError::Unpack(_)
            | FormulaError::MissingDirectory(_)
            | FormulaError::MissingEntryScript(_) => RunState::Unpacking,
            FormulaError::Register(_) => RunState::Registering,
            FormulaError::Spawn { .. } => RunState::Executing,
        }
    }
}

/// Filesystem locations of one package, all namespaced by its UUID.
#[derive(Debug, Clone)]
pub struct PackagePaths {
    pub encrypted: PathBuf,
    pub archive: PathBuf,
    pub extracted: PathBuf,
    pub entry: PathBuf,
}

impl PackagePaths {
    pub fn new(base: &Path, uuid: &str) -> Result<Self, FormulaError> {
        let valid = !uuid.is_empty()
            && uuid != "."
            && uuid != ".."
            && uuid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(FormulaError::InvalidPackageId(uuid.to_string()));
        }
        let extracted = base.join(uuid);
        Ok(Self {
            encrypted: base.join(format!("{uuid}.{ENCRYPTED_ARCHIVE_EXT}")),
            archive: base.join(format!("{uuid}.{ARCHIVE_EXT}")),
            entry: extracted.join(FORMULA_ENTRY_SCRIPT),
            extracted,
        })
    }
}

/// Removes staged plaintext when dropped; the encrypted archive goes too once the
/// script has run.
struct Staging<'a> {
    paths: &'a PackagePaths,
    executed: bool,
}

impl Drop for Staging<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.paths.archive);
        let _ = std::fs::remove_dir_all(&self.paths.extracted);
        if self.executed {
            let _ = std::fs::remove_file(&self.paths.encrypted);
        }
    }
}

pub struct FormulaRunner {
    api: Arc<dyn FormulaApi>,
    formula_dir: PathBuf,
    host_uuid: String,
    api_url: String,
    api_token: Option<String>,
    interpreter: String,
}

impl FormulaRunner {
    pub fn new(cfg: &AgentConfig, api: Arc<dyn FormulaApi>) -> Self {
        Self {
            api,
            formula_dir: cfg.formula_dir.clone(),
            host_uuid: cfg.host_id(),
            api_url: cfg.api_url.clone(),
            api_token: cfg.api_token.clone(),
            interpreter: cfg.interpreter.clone(),
        }
    }

    pub fn paths(&self, uuid: &str) -> Result<PackagePaths, FormulaError> {
        PackagePaths::new(&self.formula_dir, uuid)
    }

    /// Run one package. `Ok(true)` when the script exited 0, `Ok(false)` when it
    /// exited non-zero, `Err` for any failure that stopped the pipeline earlier.
    ///
    /// A supplied `decryption_key` skips verification and registration; the caller
    /// is trusted to have vetted it.
    pub async fn run(&self, uuid: &str, decryption_key: Option<&str>) -> Result<bool, FormulaError> {
        Ok(self.run_record(uuid, decryption_key).await?.succeeded())
    }

    pub async fn run_record(
        &self,
        uuid: &str,
        decryption_key: Option<&str>,
    ) -> Result<RunRecord, FormulaError> {
        let mut record = RunRecord::new(uuid, &self.host_uuid);
        match self.drive(&mut record, decryption_key).await {
            Ok(()) => Ok(record),
            Err(e) => {
                record.advance(RunState::Failed);
                error!(uuid = %uuid, stage = ?e.stage(), error = %e, "formula run failed");
                Err(e)
            }
        }
    }

    async fn drive(&self, record: &mut RunRecord, supplied_key: Option<&str>) -> Result<(), FormulaError> {
        let paths = self.paths(&record.package_uuid)?;
        let uuid = record.package_uuid.clone();

        let key = match supplied_key {
            Some(key) => {
                info!(uuid = %uuid, "decryption key supplied; skipping verification");
                key.to_string()
            }
            None => {
                record.advance(RunState::Verifying);
                record.needs_registration = true;
                self.verify(&paths, &uuid).await?
            }
        };

        record.advance(RunState::Decrypting);
        if !paths.encrypted.is_file() {
            return Err(FormulaError::ArchiveMissing(paths.encrypted.clone()));
        }
        {
            let (src, dest) = (paths.encrypted.clone(), paths.archive.clone());
            blocking(move || common::decrypt_file(&key, &src, &dest))
                .await
                .map_err(FormulaError::Decrypt)?;
        }
        let mut staging = Staging {
            paths: &paths,
            executed: false,
        };
        info!(uuid = %uuid, archive = %paths.archive.display(), "package decrypted");

        record.advance(RunState::Unpacking);
        {
            let (archive, base, stale, id) = (
                paths.archive.clone(),
                self.formula_dir.clone(),
                paths.extracted.clone(),
                uuid.clone(),
            );
            blocking(move || unpack(&archive, &base, &id, &stale))
                .await
                .map_err(FormulaError::Unpack)?;
        }
        if !paths.extracted.is_dir() {
            return Err(FormulaError::MissingDirectory(paths.extracted.clone()));
        }
        if !paths.entry.is_file() {
            return Err(FormulaError::MissingEntryScript(paths.entry.clone()));
        }

        if record.needs_registration {
            record.advance(RunState::Registering);
            let req = RegisterRequest {
                formula: uuid.clone(),
                sys_uuid: self.host_uuid.clone(),
            };
            self.api.register(&req).await.map_err(FormulaError::Register)?;
            record.registered = true;
            info!(uuid = %uuid, "run registered");
        }

        record.advance(RunState::Executing);
        let output = self.spawn_script(&paths).await?;
        staging.executed = true;

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout_b64 = base64::engine::general_purpose::STANDARD.encode(&output.stdout);
        record.finish(code, stdout_b64, &stderr);
        record.advance(RunState::Done);

        if code == 0 {
            info!(uuid = %uuid, "formula completed");
        } else {
            warn!(uuid = %uuid, exit_code = code, stderr = %stderr.trim_end(), "formula script failed");
        }
        Ok(())
    }

    async fn verify(&self, paths: &PackagePaths, uuid: &str) -> Result<String, FormulaError> {
        if !paths.encrypted.is_file() {
            return Err(FormulaError::ArchiveMissing(paths.encrypted.clone()));
        }
        let src = paths.encrypted.clone();
        let checksum = blocking(move || common::sha256_file(&src))
            .await
            .map_err(|source| FormulaError::Checksum {
                path: paths.encrypted.clone(),
                source,
            })?;
        let req = VerifyRequest {
            formula: uuid.to_string(),
            checksum,
            sys_uuid: self.host_uuid.clone(),
        };
        let key = self.api.verify(&req).await.map_err(FormulaError::Verify)?;
        info!(uuid = %uuid, "package verified");
        Ok(key)
    }

    async fn spawn_script(&self, paths: &PackagePaths) -> Result<std::process::Output, FormulaError> {
        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg(&paths.entry).arg(&self.api_url);
        if let Some(token) = &self.api_token {
            cmd.arg(token);
        }
        cmd.current_dir(&paths.extracted)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        info!(script = %paths.entry.display(), interpreter = %self.interpreter, "executing formula");
        cmd.output().await.map_err(|source| FormulaError::Spawn {
            interpreter: self.interpreter.clone(),
            source,
        })
    }
}

/// Extract a gzip tarball into `base`. Every entry must live under `<uuid>/` and be a
/// plain file or directory; anything else fails the unpack.
fn unpack(archive: &Path, base: &Path, uuid: &str, stale: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    if stale.exists() {
        std::fs::remove_dir_all(stale)
            .with_context(|| format!("removing stale {}", stale.display()))?;
    }
    let file =
        std::fs::File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    for entry in tar
        .entries()
        .with_context(|| format!("reading {}", archive.display()))?
    {
        let mut entry = entry.with_context(|| format!("reading {}", archive.display()))?;
        let path = entry.path().context("archive entry path")?.into_owned();
        if !within_package(&path, uuid) {
            anyhow::bail!("archive entry {} is outside {uuid}/", path.display());
        }
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            anyhow::bail!("archive entry {} is a link", path.display());
        }
        entry
            .unpack_in(base)
            .with_context(|| format!("extracting {}", path.display()))?;
    }
    Ok(())
}

fn within_package(path: &Path, uuid: &str) -> bool {
    use std::path::Component;
    let mut parts = path.components().filter(|c| !matches!(c, Component::CurDir));
    let rooted = matches!(parts.next(), Some(Component::Normal(first)) if first.to_str() == Some(uuid));
    rooted && parts.all(|c| matches!(c, Component::Normal(_)))
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("blocking task failed: {e}"))?
}
