use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use lockstep_core::report::{ArtifactComparison, ArtifactSide};
use sha2::{Digest, Sha256};

use crate::config::ArtifactPaths;

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn describe(path: &Path) -> Result<ArtifactSide> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("open artifact: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("read artifact: {}", path.display()))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok(ArtifactSide {
        path: path.display().to_string(),
        size_bytes: size,
        sha256: hex_lower(&hasher.finalize()),
    })
}

/// Deletes output files left behind by an earlier run so the comparison only
/// ever sees what this run wrote. Missing files are fine.
pub fn remove_stale(paths: &ArtifactPaths) -> Result<()> {
    for path in [&paths.reference, &paths.candidate] {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale artifact"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove stale artifact: {}", path.display()))
            }
        }
    }
    Ok(())
}

/// Sizes and digests of the two output files.
pub fn compare(paths: &ArtifactPaths) -> Result<ArtifactComparison> {
    let reference = describe(&paths.reference)?;
    let candidate = describe(&paths.candidate)?;
    let size_delta = candidate.size_bytes as i64 - reference.size_bytes as i64;
    Ok(ArtifactComparison {
        sizes_match: size_delta == 0,
        digests_match: reference.sha256 == candidate.sha256,
        size_delta,
        reference,
        candidate,
    })
}
