//! Proxy auto-config templates served to local clients.

use tokio::sync::RwLock;

use crate::tunnel::control::{self, PAC_HOST, PAC_UPDATE_HOST};
use crate::tunnel::{ControlError, RoundTrip};

/// Placeholder replaced by the local bind address.
const PLACEHOLDER: &str = "{{.}}";

/// PAC script with a local-address placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacTemplate {
    source: String,
}

impl PacTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn parse(bytes: Vec<u8>) -> Result<Self, ControlError> {
        String::from_utf8(bytes)
            .map(Self::new)
            .map_err(|_| ControlError::InvalidPac)
    }

    /// Render with `local_addr` (e.g. `127.0.0.1:7777`).
    pub fn render(&self, local_addr: &str) -> String {
        self.source
            .replace(PLACEHOLDER, local_addr)
            .replace("{{ . }}", local_addr)
    }
}

/// Fetch the endpoint's PAC template. `update` asks the endpoint to
/// rebuild it first.
pub async fn fetch_pac<R: RoundTrip>(rt: &R, update: bool) -> Result<PacTemplate, ControlError> {
    let host = if update { PAC_UPDATE_HOST } else { PAC_HOST };
    let body = control::fetch(rt, http::Method::GET, host).await?;
    PacTemplate::parse(body)
}

/// Template shared by every session of a client.
#[derive(Debug, Default)]
pub struct PacCache {
    template: RwLock<Option<PacTemplate>>,
}

impl PacCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(template: PacTemplate) -> Self {
        Self {
            template: RwLock::new(Some(template)),
        }
    }

    pub async fn store(&self, template: PacTemplate) {
        *self.template.write().await = Some(template);
    }

    pub async fn render(&self, local_addr: &str) -> Option<String> {
        self.template
            .read()
            .await
            .as_ref()
            .map(|t| t.render(local_addr))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_every_placeholder() {
        let tpl = PacTemplate::new(
            "function FindProxyForURL(url, host) { return \"PROXY {{.}}; PROXY {{ . }}\"; }",
        );
        assert_eq!(
            tpl.render("127.0.0.1:7777"),
            "function FindProxyForURL(url, host) { return \"PROXY 127.0.0.1:7777; PROXY 127.0.0.1:7777\"; }"
        );
    }

    #[test]
    fn non_utf8_template_is_rejected() {
        assert!(matches!(
            PacTemplate::parse(vec![0xff, 0xfe]),
            Err(ControlError::InvalidPac)
        ));
    }

    #[tokio::test]
    async fn empty_cache_renders_nothing() {
        let cache = PacCache::new();
        assert!(cache.render("127.0.0.1:1").await.is_none());
        cache.store(PacTemplate::new("{{.}}")).await;
        assert_eq!(cache.render("127.0.0.1:1").await.unwrap(), "127.0.0.1:1");
    }
}
