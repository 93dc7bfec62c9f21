//! Request validation done on the host before any worker I/O.

use regex::Regex;
use url::Url;

use crate::error::{SupervisorError, SupervisorResult};
use crate::models::DownloadOptions;

/// Normalize a presumed http(s) source URL.
///
/// Normalization rules:
/// - Only accepts http/https
/// - Removes URL fragments (`#...`), they are not meaningful for downloads
/// - Removes default ports (80 for http, 443 for https)
/// - Scheme and host come back lowercased from `Url` parsing
pub fn normalize_source_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    url.host_str()?;

    url.set_fragment(None);

    let is_default_port = matches!(
        (url.scheme(), url.port()),
        ("http", Some(80)) | ("https", Some(443))
    );
    if is_default_port {
        let _ = url.set_port(None);
    }

    Some(url.to_string())
}

/// Parse `HH:MM:SS` into seconds. Minutes and seconds must be below 60.
pub fn parse_clock(value: &str) -> Option<u64> {
    let re = Regex::new(r"^(\d{1,2}):(\d{2}):(\d{2})$").ok()?;
    let caps = re.captures(value.trim())?;

    let hours: u64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: u64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: u64 = caps.get(3)?.as_str().parse().ok()?;
    if minutes >= 60 || seconds >= 60 {
        return None;
    }

    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Validate and normalize a metadata request URL.
pub fn validate_source_url(url: &str) -> SupervisorResult<String> {
    normalize_source_url(url).ok_or_else(|| {
        SupervisorError::InvalidRequest(format!("not an http(s) URL: {:?}", url.trim()))
    })
}

/// Validate download options in place. The URL is replaced by its normalized form
/// and blank optional fields are dropped.
pub fn validate_download(options: &mut DownloadOptions) -> SupervisorResult<()> {
    options.url = validate_source_url(&options.url)?;

    options.output_dir = options.output_dir.trim().to_string();
    if options.output_dir.is_empty() {
        return Err(SupervisorError::InvalidRequest(
            "output directory is required".to_string(),
        ));
    }

    for field in [
        &mut options.format,
        &mut options.quality,
        &mut options.start_time,
        &mut options.end_time,
    ] {
        if field.as_deref().map(str::trim).is_some_and(str::is_empty) {
            *field = None;
        }
    }

    let start = clock_field("start time", options.start_time.as_deref())?;
    let end = clock_field("end time", options.end_time.as_deref())?;
    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Err(SupervisorError::InvalidRequest(
                "start time must be before end time".to_string(),
            ));
        }
    }

    Ok(())
}

fn clock_field(name: &str, value: Option<&str>) -> SupervisorResult<Option<u64>> {
    match value {
        None => Ok(None),
        Some(raw) => parse_clock(raw).map(Some).ok_or_else(|| {
            SupervisorError::InvalidRequest(format!("{name} must be HH:MM:SS, got {raw:?}"))
        }),
    }
}
