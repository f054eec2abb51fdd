//! Single-member extraction from zip containers.
//!
//! Some variants publish each day as a zip bundle holding several rasters; only
//! the member whose name contains the variant's identifier (`liquid.tif` for
//! the late run) is kept.

use crate::error::{HarvestError, Result};
use std::io::{Cursor, Read};
use tracing::debug;

/// Name of the first member containing `member`, if any.
pub fn find_member(names: &[String], member: &str) -> Option<String> {
    names.iter().find(|n| n.contains(member)).cloned()
}

/// Return the bytes of the first member of `container` whose name contains
/// `member`. `url` is only used for error context.
pub fn extract_member(url: &str, container: &[u8], member: &str) -> Result<Vec<u8>> {
    let container_error = |source| HarvestError::Container {
        url: url.to_string(),
        source,
    };
    let mut archive = zip::ZipArchive::new(Cursor::new(container)).map_err(container_error)?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    debug!(%url, members = ?names, "Opened container");

    let Some(name) = find_member(&names, member) else {
        return Err(HarvestError::MissingMember {
            url: url.to_string(),
            member: member.to_string(),
        });
    };
    let mut file = archive.by_name(&name).map_err(container_error)?;
    let mut bytes = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut bytes)
        .map_err(|e| container_error(zip::result::ZipError::Io(e)))?;
    Ok(bytes)
}

/// [`extract_member`] on the blocking pool; decompression is CPU work.
pub async fn extract_member_blocking(
    url: String,
    container: Vec<u8>,
    member: String,
) -> Result<Vec<u8>> {
    let context = url.clone();
    tokio::task::spawn_blocking(move || extract_member(&url, &container, &member))
        .await
        .map_err(|e| HarvestError::Container {
            url: context,
            source: zip::result::ZipError::Io(std::io::Error::other(e)),
        })?
}


#[cfg(test)]
mod tests {
    use super::fixtures::zip_with;
    use super::*;

    #[test]
    fn test_extracts_matching_member_byte_for_byte() {
        let raster = b"II*\x00 liquid precipitation raster".to_vec();
        let zip = zip_with(&[
            ("3B-DAY-L.GIS.IMERG.20240101.V07B.total.tif", b"total"),
            ("3B-DAY-L.GIS.IMERG.20240101.V07B.liquid.tif", &raster),
            ("3B-DAY-L.GIS.IMERG.20240101.V07B.tfw", b"world"),
        ]);
        let out = extract_member("u", &zip, "liquid.tif").unwrap();
        assert_eq!(out, raster);
    }

    #[test]
    fn test_missing_member_is_reported() {
        let zip = zip_with(&[("readme.txt", b"hello")]);
        let err = extract_member("u", &zip, "liquid.tif").unwrap_err();
        assert!(matches!(err, HarvestError::MissingMember { .. }));
    }

    #[test]
    fn test_garbage_is_container_error() {
        let err = extract_member("u", b"not a zip", "liquid.tif").unwrap_err();
        assert!(matches!(err, HarvestError::Container { .. }));
    }

    #[test]
    fn test_find_member_takes_first_match() {
        let names = vec!["a.liquid.tif".to_string(), "b.liquid.tif".to_string()];
        assert_eq!(find_member(&names, "liquid.tif").as_deref(), Some("a.liquid.tif"));
        assert_eq!(find_member(&names, "total.tif"), None);
    }

    #[tokio::test]
    async fn test_blocking_wrapper() {
        let zip = zip_with(&[("x.liquid.tif", b"data")]);
        let out = extract_member_blocking("u".to_string(), zip, "liquid.tif".to_string())
            .await
            .unwrap();
        assert_eq!(out, b"data");
    }
}
