use crate::error::{NotifyError, Result};
use crate::utils::redact_sensitive_json;
use crate::NotificationChannel;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Factory for [`NotificationChannel`] instances from JSON configuration.
///
/// Each plugin is registered in the [`ChannelRegistry`] under its `name()`,
/// which matches the stored channel type.
pub trait ChannelPlugin: Send + Sync {
    /// Returns the plugin type name (e.g., `"email"`, `"dingtalk"`).
    fn name(&self) -> &str;

    /// Checks the config before any network call is attempted.
    fn validate_config(&self, config: &Value) -> Result<()>;

    /// Creates a channel from a validated config. `instance_id` is the
    /// channel record id.
    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>>;

    /// Returns a copy of `config` safe to log.
    fn redact_config(&self, config: &Value) -> Value {
        redact_sensitive_json(config)
    }
}

/// Deserializes a plugin config, mapping failures to [`NotifyError::InvalidConfig`].
pub(crate) fn parse_config<T: DeserializeOwned>(plugin: &str, config: &Value) -> Result<T> {
    serde_json::from_value(config.clone())
        .map_err(|e| NotifyError::InvalidConfig(format!("{plugin}: {e}")))
}

/// Fails with [`NotifyError::InvalidConfig`] unless `url` is an http(s) URL.
pub(crate) fn require_http_url(plugin: &str, field: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(NotifyError::InvalidConfig(format!(
            "{plugin}: {field} must be an http(s) URL, got '{url}'"
        )))
    }
}

/// Channel plugins keyed by the stored channel type name.
///
/// ```
/// use mailmon_notify::plugin::ChannelRegistry;
///
/// let registry = ChannelRegistry::default();
/// assert!(registry.has_plugin("slack"));
/// assert!(registry.has_plugin("sms"));
/// assert!(!registry.has_plugin("pager"));
/// ```
pub struct ChannelRegistry {
    by_type: BTreeMap<String, Box<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    /// A registry with no plugins; [`ChannelRegistry::default`] carries
    /// the builtin ones.
    pub fn empty() -> Self {
        Self {
            by_type: BTreeMap::new(),
        }
    }

    /// Adds `plugin`. A later plugin with the same name wins.
    pub fn register(&mut self, plugin: Box<dyn ChannelPlugin>) {
        self.by_type.insert(plugin.name().to_owned(), plugin);
    }

    fn lookup(&self, type_name: &str) -> Result<&dyn ChannelPlugin> {
        self.get_plugin(type_name)
            .ok_or_else(|| NotifyError::UnknownChannelType(type_name.to_owned()))
    }

    /// Builds a sender for one channel record. The config is validated first.
    pub fn create_channel(
        &self,
        type_name: &str,
        instance_id: &str,
        config: &Value,
    ) -> Result<Box<dyn NotificationChannel>> {
        let plugin = self.lookup(type_name)?;
        plugin.validate_config(config)?;
        plugin.create_channel(instance_id, config)
    }

    pub fn get_plugin(&self, type_name: &str) -> Option<&dyn ChannelPlugin> {
        self.by_type.get(type_name).map(|p| p.as_ref())
    }

    pub fn has_plugin(&self, type_name: &str) -> bool {
        self.by_type.contains_key(type_name)
    }

    /// Registered type names in lexical order.
    pub fn plugin_names(&self) -> Vec<&str> {
        self.by_type.keys().map(String::as_str).collect()
    }

    /// Redacts `config` with the plugin's rules, or the generic rules if
    /// the type is unknown.
    pub fn redact_config(&self, type_name: &str, config: &Value) -> Value {
        self.lookup(type_name)
            .map(|plugin| plugin.redact_config(config))
            .unwrap_or_else(|_| redact_sensitive_json(config))
    }

    /// Registers webhook, slack, email, sms and dingtalk.
    pub fn with_builtin_plugins(mut self) -> Self {
        use crate::channels::{dingtalk, email, slack, sms, webhook};
        self.register(Box::new(webhook::WebhookPlugin));
        self.register(Box::new(slack::SlackPlugin));
        self.register(Box::new(email::EmailPlugin));
        self.register(Box::new(sms::SmsPlugin));
        self.register(Box::new(dingtalk::DingTalkPlugin));
        self
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::empty().with_builtin_plugins()
    }
}
