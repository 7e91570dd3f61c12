//! Routing rules loaded from configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::Stage;

/// Vendor stage search settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorRules {
    /// Field holding the requested vendor categories
    #[serde(rename = "categories-field")]
    pub categories_field: String,

    /// Results for category `c` are written to `<prefix>.c`
    #[serde(rename = "results-prefix")]
    pub results_prefix: String,

    /// Field used as the region filter
    #[serde(rename = "region-field")]
    pub region_field: String,

    #[serde(rename = "top-k")]
    pub top_k: usize,

    /// Whether a failed category search fails the whole fan-out
    pub required: bool,
}

impl Default for VendorRules {
    fn default() -> Self {
        Self {
            categories_field: "vendor.categories".to_string(),
            results_prefix: "vendor.results".to_string(),
            region_field: "preferences.region".to_string(),
            top_k: 5,
            required: true,
        }
    }
}

/// Completion notification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyRules {
    #[serde(rename = "recipient-field")]
    pub recipient_field: String,

    pub message: String,
}

impl Default for NotifyRules {
    fn default() -> Self {
        Self {
            recipient_field: "email".to_string(),
            message: "Your wedding plan is ready: budget and vendor shortlist are waiting for you.".to_string(),
        }
    }
}

/// Everything the router needs besides the instance itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterRules {
    /// Signal intent to owning stage; matched case-insensitively
    pub intents: BTreeMap<String, Stage>,

    /// Fields a stage must fill before the flow moves on
    #[serde(rename = "required-fields")]
    pub required_fields: BTreeMap<Stage, Vec<String>>,

    /// Collection read before onboarding starts; `None` skips the prefetch
    #[serde(rename = "profile-collection")]
    pub profile_collection: Option<String>,

    /// Collection each stage's fields are persisted to when it finishes
    #[serde(rename = "persist-collections")]
    pub persist_collections: BTreeMap<Stage, String>,

    pub vendor: VendorRules,

    pub notify: NotifyRules,
}

impl Default for RouterRules {
    fn default() -> Self {
        let intents = [
            ("onboarding", Stage::Onboarding),
            ("profile", Stage::Onboarding),
            ("preference", Stage::Preferences),
            ("preferences", Stage::Preferences),
            ("budget", Stage::Budget),
            ("vendor", Stage::Vendor),
            ("vendors", Stage::Vendor),
        ]
        .into_iter()
        .map(|(intent, stage)| (intent.to_string(), stage))
        .collect();

        let required_fields = [
            (Stage::Onboarding, vec!["display_name", "email", "wedding_date"]),
            (
                Stage::Preferences,
                vec!["preferences.region", "preferences.culture", "preferences.guest_count"],
            ),
            (Stage::Budget, vec!["budget.total"]),
            (Stage::Vendor, vec!["vendor.shortlist"]),
        ]
        .into_iter()
        .map(|(stage, fields)| (stage, fields.into_iter().map(String::from).collect()))
        .collect();

        let persist_collections = [
            (Stage::Onboarding, "users"),
            (Stage::Preferences, "users"),
            (Stage::Budget, "budget_items"),
        ]
        .into_iter()
        .map(|(stage, collection)| (stage, collection.to_string()))
        .collect();

        Self {
            intents,
            required_fields,
            profile_collection: Some("users".to_string()),
            persist_collections,
            vendor: VendorRules::default(),
            notify: NotifyRules::default(),
        }
    }
}

impl RouterRules {
    /// Stage owning an intent; `None` for missing or unknown intents
    pub fn classify(&self, intent: Option<&str>) -> Option<Stage> {
        let intent = intent?.trim().to_ascii_lowercase();
        self.intents.get(&intent).copied()
    }

    pub fn required_for(&self, stage: Stage) -> &[String] {
        self.required_fields.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }
}
