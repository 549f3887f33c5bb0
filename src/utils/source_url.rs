use crate::error::{DownloadError, DownloadResult};
use url::Url;

const ACCEPTED_HOSTS: &[&str] = &["youtube.com", "youtu.be"];

/// Accepts http(s) YouTube watch and short links
pub fn validate_source_url(input: &str) -> DownloadResult<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::InvalidUrl("empty URL".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", trimmed, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(DownloadError::InvalidUrl(trimmed.to_string()));
    }

    let host = url
        .host_str()
        .map(|h| h.to_lowercase())
        .ok_or_else(|| DownloadError::InvalidUrl(trimmed.to_string()))?;

    let accepted = ACCEPTED_HOSTS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{}", d)));

    if accepted {
        Ok(url)
    } else {
        Err(DownloadError::InvalidUrl(trimmed.to_string()))
    }
}
