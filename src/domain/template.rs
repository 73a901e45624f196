// Template slot domain model
use serde::{Deserialize, Serialize};

/// Marker that turns a slot value into a live expression
pub const EXPRESSION_MARKER: char = '{';

/// The fixed set of display fields that may carry a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSlot {
    Icon,
    IconColor,
    BadgeColor,
    BadgeIcon,
    Primary,
    Secondary,
    Picture,
}

impl TemplateSlot {
    pub const ALL: [TemplateSlot; 7] = [
        TemplateSlot::Icon,
        TemplateSlot::IconColor,
        TemplateSlot::BadgeColor,
        TemplateSlot::BadgeIcon,
        TemplateSlot::Primary,
        TemplateSlot::Secondary,
        TemplateSlot::Picture,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            TemplateSlot::Icon => "icon",
            TemplateSlot::IconColor => "icon_color",
            TemplateSlot::BadgeColor => "badge_color",
            TemplateSlot::BadgeIcon => "badge_icon",
            TemplateSlot::Primary => "primary",
            TemplateSlot::Secondary => "secondary",
            TemplateSlot::Picture => "picture",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.key() == key)
    }
}

impl std::fmt::Display for TemplateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Whether a raw slot value must be evaluated rather than shown as-is
pub fn is_live_expression(raw: &str) -> bool {
    raw.contains(EXPRESSION_MARKER)
}
