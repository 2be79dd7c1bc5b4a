//! Provider record shapes and their mapping to canonical flat records
//!
//! Each provider hands back its own JSON shape. The mapping here is the only
//! place that knows those shapes; everything downstream sees a flat
//! `column -> json value` map.

use crate::normalize::exact_i64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Flat record keyed by provider field name
pub type CanonicalRecord = Map<String, Json>;

/// Which provider family a source belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Ga4,
    SearchConsole,
    Ads,
    SocialAds,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provider::Ga4 => "ga4",
            Provider::SearchConsole => "search_console",
            Provider::Ads => "ads",
            Provider::SocialAds => "social_ads",
        };
        f.write_str(s)
    }
}

/// Web analytics report row. Dimension and metric names arrive flat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ga4Record {
    #[serde(flatten)]
    pub fields: Map<String, Json>,
}

/// Search analytics row: `keys` holds the requested dimensions in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchConsoleRecord {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(rename = "_dataset", default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Json>,
}

/// Paid search row with nested resource objects (`campaign`, `ad_group`,
/// `segments`, `metrics`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdsRecord {
    #[serde(default)]
    pub segments: Map<String, Json>,
    #[serde(default)]
    pub metrics: Map<String, Json>,
    #[serde(flatten)]
    pub fields: Map<String, Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialAction {
    pub action_type: String,
    pub value: Json,
}

/// Social ads insights row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialAdsRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<SocialAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_values: Option<Vec<SocialAction>>,
    #[serde(flatten)]
    pub fields: Map<String, Json>,
}

/// A raw record as returned by one provider
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Ga4(Ga4Record),
    SearchConsole(SearchConsoleRecord),
    Ads(AdsRecord),
    SocialAds(SocialAdsRecord),
}

/// Nested ads fields whose flattened name differs from `{object}_{field}`
const ADS_RENAMES: &[(&str, &str)] = &[
    ("campaign_advertising_channel_type", "campaign_type"),
    ("ad_group_ad_ad_id", "ad_id"),
    ("ad_group_criterion_criterion_id", "keyword_id"),
    ("ad_group_criterion_keyword_text", "keyword_text"),
    ("ad_group_criterion_keyword_match_type", "match_type"),
];

const INSTALL_ACTIONS: &[&str] = &["mobile_app_install", "omni_app_install", "app_install"];

impl SourceRecord {
    /// Wrap a decoded JSON object in the variant for `provider`.
    pub fn from_json(provider: Provider, value: Json) -> serde_json::Result<Self> {
        Ok(match provider {
            Provider::Ga4 => SourceRecord::Ga4(serde_json::from_value(value)?),
            Provider::SearchConsole => SourceRecord::SearchConsole(serde_json::from_value(value)?),
            Provider::Ads => SourceRecord::Ads(serde_json::from_value(value)?),
            Provider::SocialAds => SourceRecord::SocialAds(serde_json::from_value(value)?),
        })
    }

    pub fn provider(&self) -> Provider {
        match self {
            SourceRecord::Ga4(_) => Provider::Ga4,
            SourceRecord::SearchConsole(_) => Provider::SearchConsole,
            SourceRecord::Ads(_) => Provider::Ads,
            SourceRecord::SocialAds(_) => Provider::SocialAds,
        }
    }

    /// Flatten to canonical field names.
    ///
    /// `dimensions` names the search console `keys` entries in order; other
    /// providers ignore it.
    pub fn into_canonical(self, dimensions: &[&str]) -> CanonicalRecord {
        match self {
            SourceRecord::Ga4(r) => r.fields,
            SourceRecord::SearchConsole(r) => search_console_canonical(r, dimensions),
            SourceRecord::Ads(r) => ads_canonical(r),
            SourceRecord::SocialAds(r) => social_canonical(r),
        }
    }
}

fn search_console_canonical(record: SearchConsoleRecord, dimensions: &[&str]) -> CanonicalRecord {
    let mut out = record.fields;
    for (name, key) in dimensions.iter().zip(record.keys) {
        out.entry(name.to_string()).or_insert(Json::String(key));
    }
    if let Some(dataset) = record.dataset {
        out.insert("_dataset".to_string(), Json::String(dataset));
    }
    out
}

fn ads_canonical(record: AdsRecord) -> CanonicalRecord {
    let mut out = Map::new();

    for (key, value) in record.fields {
        match value {
            Json::Object(inner) => flatten_into(&mut out, &key, inner),
            other => {
                out.insert(key, other);
            },
        }
    }
    // segments and metrics are unprefixed: segments.date -> date
    for (key, value) in record.segments.into_iter().chain(record.metrics) {
        out.insert(key, value);
    }

    for (from, to) in ADS_RENAMES {
        if let Some(value) = out.remove(*from) {
            out.entry(to.to_string()).or_insert(value);
        }
    }

    // A resource given only by name still yields its numeric id.
    let derived: Vec<(String, i64)> = out
        .iter()
        .filter_map(|(key, value)| {
            let entity = key.strip_suffix("_resource_name")?;
            let id_key = format!("{}_id", entity);
            let missing = out.get(&id_key).map_or(true, Json::is_null);
            let id = resource_id(value.as_str()?)?;
            missing.then_some((id_key, id))
        })
        .collect();
    for (key, id) in derived {
        out.insert(key, Json::from(id));
    }

    out
}

fn flatten_into(out: &mut CanonicalRecord, prefix: &str, inner: Map<String, Json>) {
    for (key, value) in inner {
        let name = format!("{}_{}", prefix, key);
        match value {
            Json::Object(nested) => flatten_into(out, &name, nested),
            other => {
                out.insert(name, other);
            },
        }
    }
}

/// `customers/1/campaigns/101` -> 101
fn resource_id(resource_name: &str) -> Option<i64> {
    resource_name.rsplit('/').next()?.parse().ok()
}

fn social_canonical(record: SocialAdsRecord) -> CanonicalRecord {
    let mut out = record.fields;

    if !out.contains_key("date") {
        if let Some(start) = out.get("date_start").cloned() {
            out.insert("date".to_string(), start);
        }
    }

    // An absent actions list means the provider reported none at all, which is
    // not the same as a reported zero.
    if let Some(actions) = record.actions {
        // Counts that are not whole numbers pass through untouched for the
        // normalizer to reject.
        let count = |types: &[&str]| -> Json {
            let found = types
                .iter()
                .find_map(|t| actions.iter().find(|a| a.action_type == *t));
            match found {
                None => Json::from(0),
                Some(a) => json_number(&a.value)
                    .and_then(exact_i64)
                    .map_or_else(|| a.value.clone(), Json::from),
            }
        };
        out.insert("link_clicks".to_string(), count(&["link_click"]));
        out.insert("app_installs".to_string(), count(INSTALL_ACTIONS));
        out.insert("purchases".to_string(), count(&["purchase"]));
        out.insert("leads".to_string(), count(&["lead"]));
    }
    if let Some(values) = record.action_values {
        let purchase_value = values
            .iter()
            .find(|a| a.action_type == "purchase")
            .and_then(|a| json_number(&a.value))
            .unwrap_or(0.0);
        out.insert("purchase_value".to_string(), Json::from(purchase_value));
    }

    out
}

fn json_number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
