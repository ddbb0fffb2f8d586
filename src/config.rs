use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::providers::{MailgunSettings, ProviderSettings, SendGridSettings, SmtpSettings},
    models::{
        monitoring::{AlertThresholds, MonitoringConfig},
        retry::RetryConfig,
        throttler::ThrottlerConfig,
    },
    services::{executor::ExecutorConfig, sweep::SweepConfig},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,

    #[serde(default = "defaults::throttler_name")]
    pub throttler_name: String,
    pub throttler_max_concurrent: Option<u32>,
    pub throttler_min_time_ms: Option<u64>,
    pub throttler_reservoir: Option<u32>,
    pub throttler_reservoir_refresh_amount: Option<u32>,
    pub throttler_reservoir_refresh_interval_ms: Option<u64>,
    pub throttler_max_wait_ms: Option<u64>,
    pub throttler_lease_ttl_ms: Option<u64>,
    pub throttler_drain_timeout_ms: Option<u64>,

    pub monitor_check_interval_ms: Option<u64>,
    pub alert_error_rate: Option<f64>,
    pub alert_drop_rate: Option<f64>,
    pub alert_queue_size: Option<u64>,
    pub alert_webhook_url: Option<String>,

    #[serde(default = "defaults::max_emails_per_day")]
    pub max_emails_per_day: u64,
    #[serde(default = "defaults::max_emails_per_minute")]
    pub max_emails_per_minute: u64,
    #[serde(default = "defaults::node_max_retries")]
    pub node_max_retries: u32,
    #[serde(default = "defaults::reschedule_delay_seconds")]
    pub reschedule_delay_seconds: u64,
    #[serde(default = "defaults::require_throttler")]
    pub require_throttler: bool,

    #[serde(default = "defaults::node_timeout_seconds")]
    pub node_timeout_seconds: u64,
    #[serde(default = "defaults::sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    pub from_address: Option<String>,
    pub smtp_host: Option<String>,
    #[serde(default = "defaults::smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_secure: bool,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub sendgrid_api_key: Option<String>,
    #[serde(default = "defaults::sendgrid_base_url")]
    pub sendgrid_base_url: String,
    pub mailgun_api_key: Option<String>,
    pub mailgun_domain: Option<String>,
    #[serde(default = "defaults::mailgun_base_url")]
    pub mailgun_base_url: String,

    #[serde(default = "defaults::max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "defaults::initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "defaults::max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "defaults::retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "defaults::server_port")]
    pub server_port: u16,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()
    }

    pub fn from_pairs<I>(pairs: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter::<_, Self>(pairs)
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?
            .validate()
    }

    fn validate(self) -> Result<Self, Error> {
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow!("SWEEP_INTERVAL_SECONDS must be greater than zero"));
        }
        if self.reschedule_delay_seconds == 0 {
            return Err(anyhow!("RESCHEDULE_DELAY_SECONDS must be greater than zero"));
        }
        Ok(self)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn throttler_config(&self) -> ThrottlerConfig {
        let base = ThrottlerConfig::default();
        ThrottlerConfig {
            max_concurrent: self.throttler_max_concurrent.unwrap_or(base.max_concurrent),
            min_time_ms: self.throttler_min_time_ms.unwrap_or(base.min_time_ms),
            reservoir: self.throttler_reservoir.unwrap_or(base.reservoir),
            reservoir_refresh_amount: self
                .throttler_reservoir_refresh_amount
                .unwrap_or(base.reservoir_refresh_amount),
            reservoir_refresh_interval_ms: self
                .throttler_reservoir_refresh_interval_ms
                .unwrap_or(base.reservoir_refresh_interval_ms),
            max_wait_ms: self.throttler_max_wait_ms.unwrap_or(base.max_wait_ms),
            lease_ttl_ms: self.throttler_lease_ttl_ms.unwrap_or(base.lease_ttl_ms),
            drain_timeout_ms: self
                .throttler_drain_timeout_ms
                .unwrap_or(base.drain_timeout_ms),
        }
    }

    pub fn monitoring_config(&self) -> MonitoringConfig {
        let base = MonitoringConfig::default();
        MonitoringConfig {
            alert_thresholds: AlertThresholds {
                error_rate: self
                    .alert_error_rate
                    .unwrap_or(base.alert_thresholds.error_rate),
                queue_size: self
                    .alert_queue_size
                    .unwrap_or(base.alert_thresholds.queue_size),
                drop_rate: self
                    .alert_drop_rate
                    .unwrap_or(base.alert_thresholds.drop_rate),
            },
            check_interval_ms: self
                .monitor_check_interval_ms
                .unwrap_or(base.check_interval_ms),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_per_day: self.max_emails_per_day,
            max_per_minute: self.max_emails_per_minute,
            max_retries: self.node_max_retries,
            reschedule_delay: Duration::from_secs(self.reschedule_delay_seconds),
            require_throttler: self.require_throttler,
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            deadline: Duration::from_secs(self.node_timeout_seconds),
            interval: Duration::from_secs(self.sweep_interval_seconds),
        }
    }

    /// Picks the provider the same way the dashboard does: SMTP first, then
    /// SendGrid, then Mailgun.
    pub fn provider_settings(&self) -> Result<ProviderSettings, Error> {
        let from_address = self.from_address.clone();

        if let Some(host) = &self.smtp_host {
            let from_address =
                from_address.ok_or_else(|| anyhow!("FROM_ADDRESS must be set for SMTP"))?;
            return Ok(ProviderSettings::Smtp(SmtpSettings {
                host: host.clone(),
                port: self.smtp_port,
                secure: self.smtp_secure,
                user: self
                    .smtp_user
                    .clone()
                    .ok_or_else(|| anyhow!("SMTP_USER must be set"))?,
                pass: self
                    .smtp_pass
                    .clone()
                    .ok_or_else(|| anyhow!("SMTP_PASS must be set"))?,
                from_address,
            }));
        }

        if let Some(api_key) = &self.sendgrid_api_key {
            return Ok(ProviderSettings::SendGrid(SendGridSettings {
                api_key: api_key.clone(),
                base_url: self.sendgrid_base_url.clone(),
                from_address: from_address
                    .ok_or_else(|| anyhow!("FROM_ADDRESS must be set for SendGrid"))?,
            }));
        }

        if let Some(api_key) = &self.mailgun_api_key {
            return Ok(ProviderSettings::Mailgun(MailgunSettings {
                api_key: api_key.clone(),
                domain: self
                    .mailgun_domain
                    .clone()
                    .ok_or_else(|| anyhow!("MAILGUN_DOMAIN must be set"))?,
                base_url: self.mailgun_base_url.clone(),
                from_address: from_address
                    .ok_or_else(|| anyhow!("FROM_ADDRESS must be set for Mailgun"))?,
            }));
        }

        Err(anyhow!("No email provider configured"))
    }
}

mod defaults {
    pub fn throttler_name() -> String {
        "email".to_string()
    }

    pub const fn max_emails_per_day() -> u64 {
        250
    }

    pub const fn max_emails_per_minute() -> u64 {
        60
    }

    pub const fn node_max_retries() -> u32 {
        5
    }

    pub const fn reschedule_delay_seconds() -> u64 {
        60
    }

    pub const fn require_throttler() -> bool {
        true
    }

    pub const fn node_timeout_seconds() -> u64 {
        3600
    }

    pub const fn sweep_interval_seconds() -> u64 {
        60
    }

    pub const fn smtp_port() -> u16 {
        587
    }

    pub fn sendgrid_base_url() -> String {
        "https://api.sendgrid.com".to_string()
    }

    pub fn mailgun_base_url() -> String {
        "https://api.mailgun.net".to_string()
    }

    pub const fn max_retry_attempts() -> u32 {
        5
    }

    pub const fn initial_retry_delay_ms() -> u64 {
        50
    }

    pub const fn max_retry_delay_ms() -> u64 {
        2000
    }

    pub const fn retry_backoff_multiplier() -> u64 {
        2
    }

    pub const fn server_port() -> u16 {
        8080
    }
}
