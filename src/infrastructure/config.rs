use crate::domain::resample::MAX_BUCKETS;
use crate::domain::template::TemplateSlot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const GRAPH_DEFAULT_HOURS: f64 = 24.0;
pub const GRAPH_DEFAULT_POINTS_PER_HOUR: f64 = 2.0;
/// Ten years
pub const GRAPH_MAX_HOURS: f64 = 87_600.0;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    pub influx: InfluxSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub templates: TemplateSettings,
    #[serde(default)]
    pub graph: GraphCardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds between host ticks
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfluxSettings {
    pub host: String,
    pub token: String,
    pub database: String,
    pub retention_policy: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionSettings {
    #[serde(default = "default_user")]
    pub user: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            user: default_user(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplateSettings {
    /// How often live templates are re-evaluated
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Standard,
    Compact,
}

impl DisplayMode {
    /// Pixel height the polyline is projected into
    pub fn plot_height(&self) -> f64 {
        match self {
            DisplayMode::Standard => 80.0,
            DisplayMode::Compact => 40.0,
        }
    }

    /// Plot height plus the margin the renderer reserves around it
    pub fn graph_height(&self) -> f64 {
        match self {
            DisplayMode::Standard => self.plot_height() + 12.0,
            DisplayMode::Compact => self.plot_height() + 8.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphMode {
    #[default]
    Fill,
    Line,
}

/// Card configuration driving one graph tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphCardConfig {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default = "default_hours_to_show")]
    pub hours_to_show: f64,
    #[serde(default = "default_points_per_hour")]
    pub points_per_hour: f64,
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub graph_mode: GraphMode,
    #[serde(default)]
    pub graph_color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub icon_color: Option<String>,
    #[serde(default)]
    pub badge_color: Option<String>,
    #[serde(default)]
    pub badge_icon: Option<String>,
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

impl Default for GraphCardConfig {
    fn default() -> Self {
        Self {
            entity: None,
            hours_to_show: GRAPH_DEFAULT_HOURS,
            points_per_hour: GRAPH_DEFAULT_POINTS_PER_HOUR,
            display_mode: DisplayMode::default(),
            graph_mode: GraphMode::default(),
            graph_color: None,
            icon: None,
            icon_color: None,
            badge_color: None,
            badge_icon: None,
            primary: None,
            secondary: None,
            picture: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidCardConfig {
    #[error("hours_to_show and points_per_hour must be positive")]
    NonPositive,
    #[error("hours_to_show {0} exceeds the maximum of {max}", max = GRAPH_MAX_HOURS)]
    LookbackTooLong(f64),
    #[error("{0} points exceed the maximum of {max}", max = MAX_BUCKETS)]
    TooManyPoints(f64),
}

impl GraphCardConfig {
    /// Reject ranges the widget cannot fetch or resample
    pub fn validate(&self) -> Result<(), InvalidCardConfig> {
        let (hours, resolution) = (self.hours_to_show, self.points_per_hour);
        if !(hours.is_finite() && resolution.is_finite() && hours > 0.0 && resolution > 0.0) {
            return Err(InvalidCardConfig::NonPositive);
        }
        if hours > GRAPH_MAX_HOURS {
            return Err(InvalidCardConfig::LookbackTooLong(hours));
        }
        let points = (hours * resolution).ceil();
        if points > MAX_BUCKETS as f64 {
            return Err(InvalidCardConfig::TooManyPoints(points));
        }
        Ok(())
    }

    /// Raw configured value of a template slot
    pub fn expression(&self, slot: TemplateSlot) -> Option<&str> {
        let value = match slot {
            TemplateSlot::Icon => &self.icon,
            TemplateSlot::IconColor => &self.icon_color,
            TemplateSlot::BadgeColor => &self.badge_color,
            TemplateSlot::BadgeIcon => &self.badge_icon,
            TemplateSlot::Primary => &self.primary,
            TemplateSlot::Secondary => &self.secondary,
            TemplateSlot::Picture => &self.picture,
        };
        value.as_deref()
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_tick_secs() -> u64 {
    10
}

fn default_measurement() -> String {
    "state".to_string()
}

fn default_user() -> String {
    "dashboard".to_string()
}

fn default_refresh_secs() -> u64 {
    30
}

fn default_hours_to_show() -> f64 {
    GRAPH_DEFAULT_HOURS
}

fn default_points_per_hour() -> f64 {
    GRAPH_DEFAULT_POINTS_PER_HOUR
}

/// Load `config/graph.*`, overridden by `GRAPH__SECTION__KEY` environment variables
pub fn load_app_config() -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/graph"))
        .add_source(
            config::Environment::with_prefix("GRAPH")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Replace template variables in a query string
pub fn prepare_query(query: &str, vars: &HashMap<String, String>) -> String {
    let mut result = query.to_string();
    for (key, value) in vars {
        let placeholder = format!("${{{}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}
