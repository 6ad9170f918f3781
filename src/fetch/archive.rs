use anyhow::{bail, Context, Result};
use std::io::{Cursor, Read};
use tracing::{debug, warn};
use zip::ZipArchive;

/// Decompress the first `.csv` member of an in-memory ZIP as text.
///
/// At most `max_bytes` of decompressed data are accepted; anything bigger is
/// rejected rather than truncated. Invalid UTF-8 is replaced, not fatal.
pub fn read_single_csv(zip_bytes: &[u8], max_bytes: u64) -> Result<String> {
    let mut archive =
        ZipArchive::new(Cursor::new(zip_bytes)).context("failed to read ZIP archive")?;

    let index = (0..archive.len())
        .find(|&i| {
            archive
                .name_for_index(i)
                .map(|n| n.to_lowercase().ends_with(".csv"))
                .unwrap_or(false)
        })
        .context("archive holds no .csv member")?;

    let members = archive.len();
    let entry = archive
        .by_index(index)
        .with_context(|| format!("failed to access ZIP entry #{}", index))?;
    let name = entry.name().to_string();
    if !entry.is_file() {
        bail!("{} is not a regular file", name);
    }
    if entry.size() > max_bytes {
        bail!(
            "{} declares {} bytes, over the {} byte limit",
            name,
            entry.size(),
            max_bytes
        );
    }
    if members > 1 {
        warn!(members, member = %name, "archive has several members; reading the first csv");
    }

    // declared sizes can lie, so cap what we actually inflate
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .take(max_bytes + 1)
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to decompress {}", name))?;
    if buf.len() as u64 > max_bytes {
        bail!("{} inflates past the {} byte limit", name, max_bytes);
    }

    debug!(member = %name, bytes = buf.len(), "decompressed report");
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
