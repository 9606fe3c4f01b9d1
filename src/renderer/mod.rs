use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("renderer process failed: {0}")]
    ProcessError(String),
    #[error("renderer timed out after {0}s")]
    Timeout(u64),
    #[error("failed to parse renderer JSON output: {0}")]
    ParseError(String),
    #[error("renderer script reported error: {0}")]
    ScriptError(String),
}

/// A single link extracted by the JS renderer.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RenderedLink {
    pub url: String,
    pub anchor_text: String,
    pub rel: String,
}

/// Full output of a rendered page — the body after JS execution plus
/// whatever links the headless browser saw in the final DOM.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub links: Vec<RenderedLink>,
    pub status_code: u16,
}

#[derive(Debug, serde::Deserialize)]
struct RenderOutput {
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    links: Option<Vec<RenderedLink>>,
    #[serde(default)]
    error: Option<String>,
}

/// Headless Chromium renderer, following the teacher's `LighthouseRunner`
/// pattern (lighthouse/mod.rs) of a semaphore-bounded subprocess call with a
/// hard timeout.
#[derive(Clone)]
pub struct JsRenderer {
    semaphore: Arc<Semaphore>,
    timeout_secs: u64,
    script_path: String,
}

impl JsRenderer {
    pub fn new(max_concurrent: usize, script_path: String) -> Self {
        JsRenderer {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            timeout_secs: 20,
            script_path,
        }
    }

    /// Render a page via headless Chromium, returning the post-JS DOM HTML
    /// and the links it contains. Only used under the `thorough` crawl
    /// mode's rendered-fetch policy — most pages are fetched statically.
    pub async fn render(&self, url: &str) -> Result<RenderedPage, RendererError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| RendererError::ProcessError(e.to_string()))?;

        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            tokio::process::Command::new("node")
                .arg(&self.script_path)
                .arg(url)
                .output(),
        )
        .await
        .map_err(|_| RendererError::Timeout(self.timeout_secs))?
        .map_err(|e| RendererError::ProcessError(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        let parsed: RenderOutput = serde_json::from_str(&stdout)
            .map_err(|e| RendererError::ParseError(format!("{}: {}", e, stdout)))?;

        if let Some(err) = parsed.error {
            return Err(RendererError::ScriptError(err));
        }

        Ok(RenderedPage {
            html: parsed.html.unwrap_or_default(),
            links: parsed.links.unwrap_or_default(),
            status_code: parsed.status_code.unwrap_or(200),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_output() {
        let json = r#"{"html":"<html></html>","status_code":200,"links":[{"url":"https://example.com/page","anchor_text":"Page","rel":""}]}"#;
        let parsed: RenderOutput = serde_json::from_str(json).unwrap();
        let links = parsed.links.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url, "https://example.com/page");
        assert_eq!(parsed.html.unwrap(), "<html></html>");
    }

    #[test]
    fn test_parse_error_output() {
        let json = r#"{"error":"Navigation timeout"}"#;
        let parsed: RenderOutput = serde_json::from_str(json).unwrap();
        assert!(parsed.links.is_none());
        assert_eq!(parsed.error.unwrap(), "Navigation timeout");
    }

    #[test]
    fn test_parse_empty_links() {
        let json = r#"{"links":[]}"#;
        let parsed: RenderOutput = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.links.unwrap().len(), 0);
    }

    #[test]
    fn test_parse_invalid_json() {
        let json = "not json at all";
        let result = serde_json::from_str::<RenderOutput>(json);
        assert!(result.is_err());
    }
}
