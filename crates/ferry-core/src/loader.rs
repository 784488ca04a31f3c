//! Loader script block injected into served pages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LoaderUrlError;
use crate::html::escape_attr;
use crate::loader_url::LoaderUrlOptions;

/// Default value of the `data-provider` marker attribute.
pub const DEFAULT_PROVIDER: &str = "sitecues";

/// Configuration for the injected `<script>` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderScript {
    /// Value of the `data-provider` attribute identifying our tag.
    pub provider: String,
    /// Always emitted first.
    pub site_id: String,
    /// URL of the client library.
    pub script_url: String,
    /// Additional `config` keys, emitted after `siteId` in key order.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl LoaderScript {
    /// Creates a loader for `site_id` pointing at `script_url`.
    pub fn new(site_id: impl Into<String>, script_url: impl Into<String>) -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            site_id: site_id.into(),
            script_url: script_url.into(),
            settings: BTreeMap::new(),
        }
    }

    /// Creates a loader whose script URL is the canonical one for `options`.
    pub fn from_options(options: &LoaderUrlOptions) -> Result<Self, LoaderUrlError> {
        Ok(Self::new(options.site_id.clone(), options.format()?))
    }

    /// Adds a `config` key.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Renders the `<script>` element.
    pub fn render(&self) -> String {
        let mut lines = vec![
            "var sitecues = window.sitecues = window.sitecues || {};".to_string(),
            "sitecues.config = sitecues.config || {};".to_string(),
            format!("sitecues.config.siteId = {};", js_string(&self.site_id)),
            format!("sitecues.config.scriptUrl = {};", js_string(&self.script_url)),
        ];
        for (key, value) in &self.settings {
            if key == "siteId" || key == "scriptUrl" {
                continue;
            }
            lines.push(format!(
                "sitecues.config[{}] = {};",
                js_string(key),
                js_string(value)
            ));
        }
        lines.push(
            "(function () { var script = document.createElement('script'); \
             script.src = sitecues.config.scriptUrl; script.async = true; \
             (document.head || document.documentElement).appendChild(script); }());"
                .to_string(),
        );

        format!(
            "<script data-provider=\"{}\">\n{}\n</script>",
            escape_attr(&self.provider),
            lines.join("\n")
        )
    }
}

/// JSON string literal that is safe inside a `<script>` element.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace("</", "<\\/")
}
