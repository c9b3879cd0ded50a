use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::ErrorCode;
use crate::mission::MissionRecord;
use crate::net::{DownloadRequest, HeadResponse, NetClient};
use crate::volume::VolumeProbe;

/// What the probe needs to know about a mission.
#[derive(Debug, Clone)]
pub struct ProbeInput {
    pub url: String,
    pub cookie: String,
    pub user_agent: String,
    /// Caller-supplied file name; empty means "discover it".
    pub name: String,
    pub location: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// URL after manual redirect resolution.
    pub url: String,
    /// Final location when the request was redirected at any point.
    pub redirect_url: Option<String>,
    pub length: u64,
    pub name: String,
    pub fallback: bool,
}

pub struct ResourceProbe {
    net: Arc<dyn NetClient>,
    volume: Arc<dyn VolumeProbe>,
    config: EngineConfig,
}

impl ResourceProbe {
    pub fn new(net: Arc<dyn NetClient>, volume: Arc<dyn VolumeProbe>, config: EngineConfig) -> Self {
        Self {
            net,
            volume,
            config,
        }
    }

    /// Resolve redirects, detect partial-content support, and discover the
    /// length and name of the resource.
    pub fn probe(&self, input: &ProbeInput) -> Result<ProbeOutcome, ErrorCode> {
        let (url, redirected) = self.resolve_redirects(input)?;

        let mut req = DownloadRequest::new(url.clone(), input.user_agent.clone());
        req.cookie = input.cookie.clone();
        req.range = Some((0, None));
        req.no_cache = true;
        req.timeout = Some(Duration::from_secs(self.config.range_probe_timeout_secs));
        let resp = self.net.head(&req).map_err(|err| {
            warn!("range probe of {} failed: {}", url, err);
            ErrorCode::Unknown
        })?;

        let fallback = match resp.status_code {
            404 => return Err(ErrorCode::NotFound),
            206 => false,
            200..=299 => true,
            status => {
                warn!("range probe of {} answered {}", url, status);
                return Err(ErrorCode::Unknown);
            }
        };

        let redirect_url = if !resp.final_url.is_empty() && resp.final_url != url {
            Some(resp.final_url.clone())
        } else if redirected {
            Some(url.clone())
        } else {
            None
        };

        let mut name = input.name.trim().to_string();
        if name.is_empty() {
            if let Some(found) = resp
                .content_disposition
                .as_deref()
                .and_then(name_from_content_disposition)
            {
                name = found;
            }
        }

        let length = resp.content_length.unwrap_or(0);
        if length == 0 {
            return Err(ErrorCode::LengthUnsupported);
        }
        if let Some(available) = self.volume.available_bytes(&input.location) {
            if length >= available {
                warn!(
                    "{} needs {} bytes but only {} are free",
                    url, length, available
                );
                return Err(ErrorCode::NoSpace);
            }
        }

        if name.is_empty() {
            let source = redirect_url.as_deref().unwrap_or(&url);
            name = name_from_url(
                source,
                &self.config.placeholder_name,
                &self.config.default_extension,
            );
        }

        info!(
            "probed {}: {} bytes, name {}, {}",
            url,
            length,
            name,
            if fallback { "single stream" } else { "ranged" }
        );
        Ok(ProbeOutcome {
            url,
            redirect_url,
            length,
            name,
            fallback,
        })
    }

    /// Follow redirects by hand. Returns the final URL and whether any hop
    /// was taken.
    fn resolve_redirects(&self, input: &ProbeInput) -> Result<(String, bool), ErrorCode> {
        let mut url = input.url.clone();
        for hop in 0..=self.config.max_redirects {
            let mut req = DownloadRequest::new(url.clone(), input.user_agent.clone());
            req.cookie = input.cookie.clone();
            req.follow_redirects = false;
            req.timeout = Some(Duration::from_secs(self.config.redirect_probe_timeout_secs));
            let resp = self.net.head(&req).map_err(|err| {
                warn!("probe of {} failed: {}", url, err);
                ErrorCode::Unknown
            })?;

            match resp.status_code {
                404 => return Err(ErrorCode::NotFound),
                300 | 301 | 302 | 303 | 307 | 308 => {
                    let next = redirect_target(&url, &resp).ok_or(ErrorCode::Unknown)?;
                    debug!("{} redirects to {}", url, next);
                    url = next;
                }
                _ => return Ok((url, hop > 0)),
            }
        }
        warn!(
            "{} exceeded {} redirects",
            input.url, self.config.max_redirects
        );
        Err(ErrorCode::Unknown)
    }
}

fn redirect_target(base: &str, resp: &HeadResponse) -> Option<String> {
    let location = resp.location.as_deref()?.trim();
    if location.is_empty() {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(location).ok().map(|url| url.to_string()),
        Err(_) => Some(location.to_string()),
    }
}

/// File name from a `Content-Disposition` header. `filename=` wins over
/// `filename*=`; the first usable segment is taken.
pub fn name_from_content_disposition(value: &str) -> Option<String> {
    let mut extended: Option<String> = None;
    for part in value.split(';') {
        let part = part.trim();
        let lower = part.to_ascii_lowercase();
        if lower.starts_with("filename=") {
            let raw = part.split_once('=')?.1.trim().trim_matches('"');
            let name = sanitize_name(raw);
            if !name.is_empty() {
                return Some(name);
            }
        } else if lower.starts_with("filename*=") && extended.is_none() {
            let raw = part.split_once('=')?.1.trim().trim_matches('"');
            let encoded = match raw.find("''") {
                Some(idx) => &raw[idx + 2..],
                None => raw,
            };
            let name = sanitize_name(&percent_decode(encoded));
            if !name.is_empty() {
                extended = Some(name);
            }
        }
    }
    extended
}

/// File name from the last path segment of `url`, with `.ext` appended when
/// the segment has no extension and `placeholder` used when it is empty.
pub fn name_from_url(url: &str, placeholder: &str, extension: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or("");
    let without_query = without_fragment.split('?').next().unwrap_or("");
    let path = match without_query.find("://") {
        Some(idx) => {
            let rest = &without_query[idx + 3..];
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("")
        }
        None => without_query,
    };
    let segment = path.rsplit('/').next().unwrap_or("");
    let mut name = sanitize_name(&percent_decode(segment));
    if name.is_empty() {
        name = placeholder.to_string();
    }
    if !name.contains('.') {
        name.push('.');
        name.push_str(extension);
    }
    name
}

/// A mission already in the registry that downloads the same resource under
/// the same name. `url` is the address the new mission resolved to.
pub fn matches_existing(existing: &MissionRecord, name: &str, url: &str) -> bool {
    if !existing.has_init || existing.name != name {
        return false;
    }
    let url = url.trim();
    existing.origin_url.trim() == url
        || (!existing.redirect_url.is_empty() && existing.redirect_url == url)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
            {
                out.push((hi << 4) | lo);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Strip path separators and control characters; keep everything else,
/// including non-ASCII letters.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    cleaned.trim().trim_matches('.').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_prefers_plain_filename() {
        assert_eq!(
            name_from_content_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            name_from_content_disposition(
                "attachment; filename=plain.txt; filename*=UTF-8''fancy%20name.txt"
            ),
            Some("plain.txt".to_string())
        );
        assert_eq!(
            name_from_content_disposition("attachment; filename*=UTF-8''%E6%96%87%E4%BB%B6.zip"),
            Some("文件.zip".to_string())
        );
        assert_eq!(name_from_content_disposition("inline"), None);
    }

    #[test]
    fn url_names_strip_query_and_decode() {
        assert_eq!(
            name_from_url("http://host/dir/movie%20clip.mp4?token=1#frag", "unknown-file", "ext"),
            "movie clip.mp4"
        );
        assert_eq!(
            name_from_url("http://host/download", "unknown-file", "ext"),
            "download.ext"
        );
        assert_eq!(
            name_from_url("http://host/", "unknown-file", "ext"),
            "unknown-file.ext"
        );
        assert_eq!(
            name_from_url("http://host", "unknown-file", "ext"),
            "unknown-file.ext"
        );
    }

    #[test]
    fn duplicate_detection_matches_origin_or_redirect() {
        let mut record = MissionRecord::new(
            "http://a.example/file.bin".to_string(),
            "/tmp".to_string(),
            1024,
            2,
            "ua".to_string(),
        );
        record.name = "file.bin".to_string();
        assert!(!matches_existing(&record, "file.bin", "http://a.example/file.bin"));

        record.has_init = true;
        assert!(matches_existing(&record, "file.bin", " http://a.example/file.bin "));
        assert!(!matches_existing(&record, "other.bin", "http://a.example/file.bin"));
        assert!(!matches_existing(&record, "file.bin", "http://cdn.example/file.bin"));

        record.redirect_url = "http://cdn.example/file.bin".to_string();
        assert!(matches_existing(&record, "file.bin", "http://cdn.example/file.bin"));
    }
}
