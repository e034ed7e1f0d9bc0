use std::path::{Path, PathBuf};

use anyhow::Context;

use common::{ENCRYPTED_ARCHIVE_EXT, FORMULA_ENTRY_SCRIPT};

/// What `pack_directory` produced: the encrypted archive plus the values the
/// API server needs to hand it out later.
#[derive(Clone)]
pub struct PackedFormula {
    pub uuid: String,
    pub encrypted_path: PathBuf,
    pub key: String,
    pub checksum: String,
}

impl std::fmt::Debug for PackedFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackedFormula")
            .field("uuid", &self.uuid)
            .field("encrypted_path", &self.encrypted_path)
            .field("key", &"<redacted>")
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Build `<out_dir>/<uuid>.tar.gz.enc` from a directory holding `main.py`.
/// Layout inside the archive:
///   <uuid>/main.py   (required)
///   <uuid>/...       (any other files in the directory)
pub fn pack_directory(dir: &Path, uuid: &str, out_dir: &Path) -> anyhow::Result<PackedFormula> {
    if !dir.is_dir() {
        anyhow::bail!("formula pack: {} is not a directory", dir.display());
    }
    if !dir.join(FORMULA_ENTRY_SCRIPT).is_file() {
        anyhow::bail!("{FORMULA_ENTRY_SCRIPT} not found in {}", dir.display());
    }

    let mut tar_gz = Vec::new();
    {
        let enc = flate2::write::GzEncoder::new(&mut tar_gz, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        builder
            .append_dir_all(uuid, dir)
            .with_context(|| format!("archiving {}", dir.display()))?;
        builder
            .into_inner()
            .context("finish tar")?
            .finish()
            .context("finish gzip")?;
    }

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let key = common::generate_key();
    let sealed = common::encrypt_bytes(&key, &tar_gz)?;
    let encrypted_path = out_dir.join(format!("{uuid}.{ENCRYPTED_ARCHIVE_EXT}"));
    std::fs::write(&encrypted_path, &sealed)
        .with_context(|| format!("writing {}", encrypted_path.display()))?;

    Ok(PackedFormula {
        uuid: uuid.to_string(),
        checksum: common::sha256_hex(&sealed),
        encrypted_path,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_requires_entry_script() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("README"), "no entry").unwrap();
        let err = pack_directory(src.path(), "pkg-1", out.path()).unwrap_err();
        assert!(err.to_string().contains("main.py"));
    }

    #[test]
    fn packed_archive_checksum_matches_file() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("main.py"), "print('hi')\n").unwrap();
        let packed = pack_directory(src.path(), "pkg-1", out.path()).unwrap();
        assert_eq!(packed.encrypted_path, out.path().join("pkg-1.tar.gz.enc"));
        assert_eq!(
            common::sha256_file(&packed.encrypted_path).unwrap(),
            packed.checksum
        );
    }
}
