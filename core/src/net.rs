use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, COOKIE,
    LOCATION, PRAGMA, RANGE, REFERER, USER_AGENT,
};
use reqwest::redirect::Policy;

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub cookie: String,
    pub user_agent: String,
    /// Inclusive byte range; `None` end means open-ended (`bytes=a-`).
    pub range: Option<(u64, Option<u64>)>,
    pub follow_redirects: bool,
    pub no_cache: bool,
    pub timeout: Option<Duration>,
}

impl DownloadRequest {
    pub fn new(url: String, user_agent: String) -> Self {
        Self {
            url,
            cookie: String::new(),
            user_agent,
            range: None,
            follow_redirects: true,
            no_cache: false,
            timeout: None,
        }
    }

    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(start, end)| match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HeadResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub content_disposition: Option<String>,
    pub location: Option<String>,
    /// URL the response came from after any followed redirects.
    pub final_url: String,
}

pub struct BodyResponse {
    pub status_code: u16,
    pub body: Box<dyn Read + Send>,
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &DownloadRequest) -> CoreResult<HeadResponse>;
    fn get_stream(&self, req: &DownloadRequest) -> CoreResult<BodyResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    follow: Client,
    no_follow: Client,
}

impl ReqwestNetClient {
    pub fn new(config: &EngineConfig) -> CoreResult<Self> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let follow = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .redirect(Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let no_follow = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .redirect(Policy::none())
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { follow, no_follow })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if !req.user_agent.is_empty() {
            headers.insert(USER_AGENT, header_value(&req.user_agent)?);
        }
        if !req.cookie.trim().is_empty() {
            headers.insert(COOKIE, header_value(req.cookie.trim())?);
        }
        headers.insert(REFERER, header_value(&req.url)?);
        if req.no_cache {
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
        if let Some(range) = req.range_header() {
            headers.insert(RANGE, header_value(&range)?);
        }
        Ok(headers)
    }

    fn build(&self, req: &DownloadRequest, head: bool) -> CoreResult<RequestBuilder> {
        let client = if req.follow_redirects {
            &self.follow
        } else {
            &self.no_follow
        };
        let mut request = if head {
            client.head(&req.url)
        } else {
            client.get(&req.url)
        };
        request = request.headers(self.request_headers(req)?);
        if let Some(timeout) = req.timeout {
            request = request.timeout(timeout);
        }
        Ok(request)
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &DownloadRequest) -> CoreResult<HeadResponse> {
        let resp = self
            .build(req, true)?
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        let status = resp.status();
        let headers = resp.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let content_disposition = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let location = headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(HeadResponse {
            status_code: status.as_u16(),
            content_length,
            content_disposition,
            location,
            final_url: resp.url().to_string(),
        })
    }

    fn get_stream(&self, req: &DownloadRequest) -> CoreResult<BodyResponse> {
        let resp = self
            .build(req, false)?
            .send()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(BodyResponse {
            status_code: resp.status().as_u16(),
            body: Box::new(resp),
        })
    }
}

fn header_value(value: &str) -> CoreResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| CoreError::Network(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_formats_closed_and_open_ranges() {
        let mut req = DownloadRequest::new("http://example.com/a".into(), "ua".into());
        assert_eq!(req.range_header(), None);
        req.range = Some((0, None));
        assert_eq!(req.range_header().as_deref(), Some("bytes=0-"));
        req.range = Some((1000, Some(1999)));
        assert_eq!(req.range_header().as_deref(), Some("bytes=1000-1999"));
    }
}
