//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default WhatsApp Cloud API base URL.
pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// Hourly, on the hour (cron with seconds field).
pub const DEFAULT_DRIP_CRON: &str = "0 0 * * * *";

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct FunnelConfig {
    pub whatsapp: WhatsAppConfig,
    pub content: ContentConfig,
    pub drip: DripConfig,
    /// HTTP port for the webhook and analytics routes.
    pub port: u16,
    pub db_path: PathBuf,
    /// How often the deferred-command loop checks for due commands.
    pub deferred_poll_interval: Duration,
    /// Gap between paced messages of one reply.
    pub presentation_delay: Duration,
}

impl FunnelConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let whatsapp = WhatsAppConfig::from_env()?;
        let content = ContentConfig::from_env();
        let drip = DripConfig::from_env()?;

        let port = env_parse("FUNNEL_PORT", 3000u16)?;
        let db_path = PathBuf::from(env_or("FUNNEL_DB_PATH", "./data/funnel.db"));
        let deferred_poll_interval =
            Duration::from_millis(env_parse("FUNNEL_DEFERRED_POLL_MS", 500u64)?);
        let presentation_delay =
            Duration::from_millis(env_parse("FUNNEL_PRESENTATION_DELAY_MS", 2000u64)?);

        Ok(Self {
            whatsapp,
            content,
            drip,
            port,
            db_path,
            deferred_poll_interval,
            presentation_delay,
        })
    }
}

/// WhatsApp Cloud API credentials.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_base: String,
    pub phone_number_id: String,
    pub access_token: SecretString,
    /// Shared secret for the webhook subscription handshake.
    pub verify_token: String,
}

impl WhatsAppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_base: env_or("WHATSAPP_API_BASE", DEFAULT_API_BASE),
            phone_number_id: env_required("PHONE_NUMBER_ID")?,
            access_token: SecretString::from(env_required("META_ACCESS_TOKEN")?),
            verify_token: env_required("VERIFY_TOKEN")?,
        })
    }
}

/// Links embedded in scripted content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentConfig {
    pub onboarding_video_url: String,
    pub registration_url: String,
    pub cyber_clinic_pdf_url: String,
    pub roi_pdf_url: String,
    pub cost_plan_pdf_url: String,
    pub smart_calendar_demo_url: String,
    pub calendly_url: String,
    pub referral_base_url: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            onboarding_video_url: "https://youtu.be/example".to_string(),
            registration_url: "https://angill.pk/doctor-register".to_string(),
            cyber_clinic_pdf_url: "https://example.com/brochure.pdf".to_string(),
            roi_pdf_url: "https://example.com/roi.pdf".to_string(),
            cost_plan_pdf_url: "https://example.com/cost.pdf".to_string(),
            smart_calendar_demo_url: "https://youtu.be/demo".to_string(),
            calendly_url: "https://calendly.com/angill-clinic/demo".to_string(),
            referral_base_url: "https://angill.pk/join".to_string(),
        }
    }
}

impl ContentConfig {
    /// Defaults overridden by whichever URL variables are set.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            onboarding_video_url: env_or("ONBOARDING_VIDEO_URL", &d.onboarding_video_url),
            registration_url: env_or("REGISTRATION_URL", &d.registration_url),
            cyber_clinic_pdf_url: env_or("CYBER_CLINIC_PDF_URL", &d.cyber_clinic_pdf_url),
            roi_pdf_url: env_or("ROI_PDF_URL", &d.roi_pdf_url),
            cost_plan_pdf_url: env_or("COST_PLAN_PDF_URL", &d.cost_plan_pdf_url),
            smart_calendar_demo_url: env_or("SMART_CALENDAR_DEMO_URL", &d.smart_calendar_demo_url),
            calendly_url: env_or("CALENDLY_URL", &d.calendly_url),
            referral_base_url: env_or("REFERRAL_BASE_URL", &d.referral_base_url),
        }
    }
}

/// Drip follow-up scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DripConfig {
    pub enabled: bool,
    /// Cron expression (with seconds) for the tick.
    pub schedule: String,
    /// Maximum contacts picked up per tick.
    pub batch_limit: usize,
}

impl Default for DripConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: DEFAULT_DRIP_CRON.to_string(),
            batch_limit: 500,
        }
    }
}

impl DripConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let schedule = env_or("FUNNEL_DRIP_CRON", &d.schedule);
        cron::Schedule::try_from(schedule.as_str()).map_err(|e| ConfigError::InvalidValue {
            key: "FUNNEL_DRIP_CRON".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            enabled: env_parse("FUNNEL_DRIP_ENABLED", d.enabled)?,
            schedule,
            batch_limit: env_parse("FUNNEL_DRIP_BATCH_LIMIT", d.batch_limit)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}
