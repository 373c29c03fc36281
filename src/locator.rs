//! Backup locator encoding and name validation
//!
//! A locator is a destination endpoint URL carrying the owning volume and
//! backup name as query parameters. The codec is pure; no I/O happens here.

use crate::{Error, Result};
use url::Url;

/// Maximum accepted length for volume and backup names
pub const MAX_NAME_LEN: usize = 200;

const VOLUME_PARAM: &str = "volume";
const BACKUP_PARAM: &str = "backup";

/// Name rule shared by volumes and backups: non-empty, bounded length,
/// ASCII alphanumerics plus `-`, `_` and `.` only. Path separators, query
/// characters and control characters never validate.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn checked_name(name: &str) -> Result<String> {
    if validate_name(name) {
        Ok(name.to_string())
    } else {
        Err(Error::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Embed backup and volume identity as query parameters on `dest_url`.
///
/// Both names must pass [`validate_name`].
pub fn encode_backup_locator(backup_name: &str, volume_name: &str, dest_url: &str) -> Result<String> {
    checked_name(backup_name)?;
    checked_name(volume_name)?;

    let mut url = Url::parse(dest_url).map_err(|e| Error::InvalidLocator {
        locator: dest_url.to_string(),
        reason: e.to_string(),
    })?;
    url.query_pairs_mut()
        .append_pair(VOLUME_PARAM, volume_name)
        .append_pair(BACKUP_PARAM, backup_name);
    Ok(url.to_string())
}

/// Parse a locator back into `(backup_name, volume_name)`.
///
/// Fails with [`Error::InvalidLocator`] when the URL does not parse or a
/// parameter is missing, and [`Error::InvalidName`] when a recovered name
/// fails validation.
pub fn decode_backup_locator(locator: &str) -> Result<(String, String)> {
    let url = Url::parse(locator).map_err(|e| Error::InvalidLocator {
        locator: locator.to_string(),
        reason: e.to_string(),
    })?;

    let mut volume = None;
    let mut backup = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            VOLUME_PARAM => volume = Some(value.into_owned()),
            BACKUP_PARAM => backup = Some(value.into_owned()),
            _ => {}
        }
    }

    let volume = volume.ok_or_else(|| Error::InvalidLocator {
        locator: locator.to_string(),
        reason: format!("missing {} parameter", VOLUME_PARAM),
    })?;
    let backup = backup.ok_or_else(|| Error::InvalidLocator {
        locator: locator.to_string(),
        reason: format!("missing {} parameter", BACKUP_PARAM),
    })?;

    Ok((checked_name(&backup)?, checked_name(&volume)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("vol1"));
        assert!(validate_name("backup-2024_01.full"));

        assert!(!validate_name(""));
        assert!(!validate_name("a/b"));
        assert!(!validate_name("a?b"));
        assert!(!validate_name("a b"));
        assert!(!validate_name(&"x".repeat(MAX_NAME_LEN + 1)));
    }

    #[test]
    fn test_locator_round_trip() {
        let locator = encode_backup_locator("backup1", "vol1", "s3://bucket@region/path").unwrap();
        let (backup, volume) = decode_backup_locator(&locator).unwrap();

        assert_eq!(backup, "backup1");
        assert_eq!(volume, "vol1");
    }

    #[test]
    fn test_encode_rejects_invalid_names() {
        let err = encode_backup_locator("bad/name", "vol1", "nfs://host/export").unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));

        let err = encode_backup_locator("backup1", "", "nfs://host/export").unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
    }

    #[test]
    fn test_decode_rejects_malformed_url() {
        let err = decode_backup_locator("not a url").unwrap_err();
        assert!(matches!(err, Error::InvalidLocator { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_params() {
        let err = decode_backup_locator("s3://bucket/path?volume=vol1").unwrap_err();
        assert!(matches!(err, Error::InvalidLocator { .. }));

        let err = decode_backup_locator("s3://bucket/path?backup=b1").unwrap_err();
        assert!(matches!(err, Error::InvalidLocator { .. }));
    }

    #[test]
    fn test_decode_revalidates_names() {
        let err = decode_backup_locator("s3://bucket/path?volume=a%2Fb&backup=b1").unwrap_err();
        assert!(matches!(err, Error::InvalidName { .. }));
    }
}
