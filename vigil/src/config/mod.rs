//! Process configuration from the environment.
//!
//! Values come from `VIGIL_*` variables (plus `FFMPEG_PATH` / `RCLONE_PATH`),
//! optionally loaded from a `.env` file. Everything has a default except the
//! credentials of the external services.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::alerts::DEFAULT_HISTORY_CAP;
use crate::capture::{FallbackSettings, FfmpegCaptureSettings};
use crate::pipeline::PipelineConfig;
use crate::services::vision::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::services::{RcloneSettings, VisionSettings};
use crate::session::SessionConfig;
use crate::watcher::WatcherConfig;
use crate::{Error, Result};

/// Vision service settings as configured.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Object store settings as configured.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub remote: Option<String>,
    pub public_url_base: Option<String>,
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub chunk_duration: Duration,
    pub ffmpeg_path: String,
    pub rclone_path: String,
    pub watcher: WatcherConfig,
    pub stop_grace: Duration,
    pub stop_timeout: Duration,
    pub finalize_timeout: Duration,
    pub fallback: FallbackSettings,
    pub pipeline: PipelineConfig,
    /// How long shutdown waits for in-flight chunks.
    pub drain_timeout: Duration,
    pub alert_history_cap: usize,
    pub vision: VisionConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let pipeline_defaults = PipelineConfig::default();

        let config = Self {
            database_url: env
                .string("VIGIL_DATABASE_URL")
                .or_else(|| env.string("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite:vigil.db?mode=rwc".to_string()),
            log_dir: env.string("VIGIL_LOG_DIR").unwrap_or_else(|| "logs".into()).into(),
            recordings_dir: env
                .string("VIGIL_RECORDINGS_DIR")
                .unwrap_or_else(|| "recordings".into())
                .into(),
            chunk_duration: Duration::from_secs(env.parse("VIGIL_CHUNK_DURATION_SECS", 600u64)?),
            ffmpeg_path: env.string("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".into()),
            rclone_path: env.string("RCLONE_PATH").unwrap_or_else(|| "rclone".into()),
            watcher: WatcherConfig {
                poll_interval: Duration::from_millis(env.parse("VIGIL_WATCH_POLL_MS", 1000u64)?),
                stable_polls: env.parse("VIGIL_STABLE_POLLS", 2u32)?,
                ..WatcherConfig::default()
            },
            stop_grace: Duration::from_secs(env.parse("VIGIL_STOP_GRACE_SECS", 5u64)?),
            stop_timeout: Duration::from_secs(env.parse("VIGIL_STOP_TIMEOUT_SECS", 10u64)?),
            finalize_timeout: Duration::from_secs(
                env.parse("VIGIL_FINALIZE_TIMEOUT_SECS", 120u64)?,
            ),
            fallback: FallbackSettings {
                max_read_failures: env.parse("VIGIL_FALLBACK_MAX_READ_FAILURES", 5u32)?,
                reconnect_delay: Duration::from_millis(
                    env.parse("VIGIL_FALLBACK_RECONNECT_MS", 1000u64)?,
                ),
            },
            pipeline: PipelineConfig {
                preprompt: env
                    .string("VIGIL_PREPROMPT")
                    .unwrap_or_else(|| pipeline_defaults.preprompt.clone()),
                sampling_fps: env.parse("VIGIL_ANALYSIS_FPS", pipeline_defaults.sampling_fps)?,
                stage_timeout: Duration::from_secs(env.parse(
                    "VIGIL_STAGE_TIMEOUT_SECS",
                    pipeline_defaults.stage_timeout.as_secs(),
                )?),
                channel_capacity: env
                    .parse("VIGIL_CHANNEL_CAPACITY", pipeline_defaults.channel_capacity)?,
                ..pipeline_defaults
            },
            drain_timeout: Duration::from_secs(env.parse("VIGIL_DRAIN_TIMEOUT_SECS", 600u64)?),
            alert_history_cap: env.parse("VIGIL_ALERT_HISTORY_CAP", DEFAULT_HISTORY_CAP)?,
            vision: VisionConfig {
                base_url: env
                    .string("VIGIL_VISION_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                model: env
                    .string("VIGIL_VISION_MODEL")
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                api_key: lookup("VIGIL_VISION_API_KEY"),
            },
            store: StoreConfig {
                remote: env.string("VIGIL_STORE_REMOTE"),
                public_url_base: env.string("VIGIL_PUBLIC_URL_BASE"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.watcher.validate()?;
        if self.chunk_duration.is_zero() {
            return Err(Error::config("VIGIL_CHUNK_DURATION_SECS must be greater than zero"));
        }
        if self.pipeline.sampling_fps == 0 {
            return Err(Error::config("VIGIL_ANALYSIS_FPS must be greater than zero"));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(Error::config("VIGIL_CHANNEL_CAPACITY must be greater than zero"));
        }
        if self.pipeline.stage_timeout.is_zero() {
            return Err(Error::config("VIGIL_STAGE_TIMEOUT_SECS must be greater than zero"));
        }
        if self.alert_history_cap == 0 {
            return Err(Error::config("VIGIL_ALERT_HISTORY_CAP must be greater than zero"));
        }
        if matches!(&self.vision.api_key, Some(key) if key.trim().is_empty()) {
            return Err(Error::config("VIGIL_VISION_API_KEY is set but empty"));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            output_dir: self.recordings_dir.clone(),
            chunk_duration: self.chunk_duration,
            watcher: self.watcher.clone(),
            stop_timeout: self.stop_timeout,
        }
    }

    pub fn ffmpeg_settings(&self) -> FfmpegCaptureSettings {
        FfmpegCaptureSettings {
            binary_path: self.ffmpeg_path.clone(),
            stop_grace: self.stop_grace,
            extension: self.watcher.extension.clone(),
            ..FfmpegCaptureSettings::default()
        }
    }

    /// Vision client settings; the API key is required.
    pub fn vision_settings(&self) -> Result<VisionSettings> {
        let api_key = self
            .vision
            .api_key
            .clone()
            .ok_or_else(|| Error::config("VIGIL_VISION_API_KEY is required for analysis"))?;
        Ok(VisionSettings {
            base_url: self.vision.base_url.clone(),
            model: self.vision.model.clone(),
            api_key,
            timeout: self.pipeline.stage_timeout,
        })
    }

    /// Object store settings; remote and public URL base are required.
    pub fn rclone_settings(&self) -> Result<RcloneSettings> {
        let remote = self
            .store
            .remote
            .clone()
            .ok_or_else(|| Error::config("VIGIL_STORE_REMOTE is required for uploads"))?;
        let public_url_base = self
            .store
            .public_url_base
            .clone()
            .ok_or_else(|| Error::config("VIGIL_PUBLIC_URL_BASE is required for uploads"))?;

        let mut settings = RcloneSettings::new(remote, public_url_base);
        settings.binary_path = self.rclone_path.clone();
        settings.timeout = self.pipeline.stage_timeout;
        Ok(settings)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty trimmed value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("invalid {key}={raw}: {e}"))),
            None => Ok(default),
        }
    }
}
