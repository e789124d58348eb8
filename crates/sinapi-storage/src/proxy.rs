use async_trait::async_trait;

use crate::fetch::{FetchError, HttpFetcher};

/// Supplies candidate proxy endpoints for the download fallback path.
#[async_trait]
pub trait ProxySource: Send + Sync {
    async fn proxies(&self, http: &HttpFetcher) -> Result<Vec<String>, FetchError>;
}

/// Fetches a plain-text `host:port` list from a public URL.
#[derive(Debug, Clone)]
pub struct PublicListProxySource {
    pub list_url: String,
}

impl PublicListProxySource {
    pub fn new(list_url: impl Into<String>) -> Self {
        Self {
            list_url: list_url.into(),
        }
    }
}

#[async_trait]
impl ProxySource for PublicListProxySource {
    async fn proxies(&self, http: &HttpFetcher) -> Result<Vec<String>, FetchError> {
        let text = http.fetch_text(&self.list_url).await?;
        Ok(parse_proxy_list(&text))
    }
}

/// Fixed list, for tests and for operators who maintain their own proxies.
#[derive(Debug, Clone, Default)]
pub struct StaticProxySource {
    pub endpoints: Vec<String>,
}

impl StaticProxySource {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ProxySource for StaticProxySource {
    async fn proxies(&self, _http: &HttpFetcher) -> Result<Vec<String>, FetchError> {
        Ok(self.endpoints.clone())
    }
}

/// One endpoint per line; `#` comments and blanks skipped. Bare `host:port`
/// entries get an `http://` scheme.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            if line.contains("://") {
                Some(line.to_string())
            } else if line.contains(':') {
                Some(format!("http://{line}"))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_list_parsing_normalizes_entries() {
        let text = "# updated hourly\n10.0.0.1:8080\n\n  socks5://10.0.0.2:1080 \nnot-a-proxy\n";
        assert_eq!(
            parse_proxy_list(text),
            vec![
                "http://10.0.0.1:8080".to_string(),
                "socks5://10.0.0.2:1080".to_string()
            ]
        );
    }
}
