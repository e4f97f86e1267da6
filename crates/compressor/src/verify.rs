//! Output verification.
//!
//! A transcode that exits cleanly can still leave a truncated or empty file
//! behind. Before an output is handed to the user it must be non-empty,
//! carry the right container signature and run about as long as the source.

use crate::config::Container;
use crate::error::CompressError;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// EBML magic that opens every Matroska file
const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Identify the container from the first bytes of a file
pub fn sniff_container(header: &[u8]) -> Option<Container> {
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return Some(Container::Mp4);
    }
    if header.starts_with(&EBML_MAGIC) {
        return Some(Container::Mkv);
    }
    None
}

/// Check that `path` exists, is non-empty and is a `expected` file.
///
/// Returns the file size.
pub fn check_output(path: &Path, expected: Container) -> Result<u64, CompressError> {
    let size = std::fs::metadata(path)
        .map_err(|e| {
            CompressError::VerificationFailed(format!(
                "output {} is missing: {}",
                path.display(),
                e
            ))
        })?
        .len();

    if size == 0 {
        return Err(CompressError::VerificationFailed(format!(
            "output {} is empty",
            path.display()
        )));
    }

    let mut header = [0u8; 12];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut header))
        .map_err(|e| CompressError::io(format!("reading {}", path.display()), &e))?;

    match sniff_container(&header[..read]) {
        Some(found) if found == expected => Ok(size),
        Some(found) => Err(CompressError::VerificationFailed(format!(
            "output is {} but {} was planned",
            found.extension(),
            expected.extension()
        ))),
        None => Err(CompressError::VerificationFailed(format!(
            "output {} has no recognizable {} header",
            path.display(),
            expected.extension()
        ))),
    }
}

/// Check the output duration is within `tolerance` (a fraction) of the source.
///
/// A source with unknown duration skips the check.
pub fn check_duration(
    source_ms: u64,
    output_ms: u64,
    tolerance: f64,
) -> Result<(), CompressError> {
    if source_ms == 0 {
        return Ok(());
    }

    let drift = (source_ms as f64 - output_ms as f64).abs() / source_ms as f64;
    if drift > tolerance {
        return Err(CompressError::VerificationFailed(format!(
            "output runs {}ms but source runs {}ms ({:.1}% off)",
            output_ms,
            source_ms,
            drift * 100.0
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MP4_HEADER: &[u8] = b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00";

    #[test]
    fn test_sniff_container() {
        assert_eq!(sniff_container(MP4_HEADER), Some(Container::Mp4));
        assert_eq!(
            sniff_container(&[0x1A, 0x45, 0xDF, 0xA3, 0x01, 0x00]),
            Some(Container::Mkv)
        );
        assert_eq!(sniff_container(b"RIFF\x00\x00\x00\x00AVI "), None);
        assert_eq!(sniff_container(b"ftyp"), None);
        assert_eq!(sniff_container(&[]), None);
    }

    #[test]
    fn test_check_output_accepts_matching_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.mp4");
        fs::write(&path, MP4_HEADER).unwrap();

        assert_eq!(
            check_output(&path, Container::Mp4).unwrap(),
            MP4_HEADER.len() as u64
        );
    }

    #[test]
    fn test_check_output_rejects_empty_and_mismatched() {
        let dir = TempDir::new().unwrap();

        let empty = dir.path().join("empty.mp4");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            check_output(&empty, Container::Mp4),
            Err(CompressError::VerificationFailed(_))
        ));

        let mp4 = dir.path().join("out.mkv");
        fs::write(&mp4, MP4_HEADER).unwrap();
        assert!(matches!(
            check_output(&mp4, Container::Mkv),
            Err(CompressError::VerificationFailed(_))
        ));

        let missing = dir.path().join("missing.mp4");
        assert!(matches!(
            check_output(&missing, Container::Mp4),
            Err(CompressError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_check_duration_tolerance() {
        assert!(check_duration(120_000, 119_900, 0.01).is_ok());
        assert!(check_duration(120_000, 121_200, 0.01).is_ok());
        assert!(check_duration(120_000, 60_000, 0.01).is_err());
        assert!(check_duration(0, 5_000, 0.01).is_ok());
    }
}
