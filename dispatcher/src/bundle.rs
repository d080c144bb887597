//! The rule bundle: the JSON value stored in the KV under
//! `{host}{path}` keys, decoded once per request into a canonical
//! in-memory form.
//!
//! Bundles are written by an external control surface and evolve ahead
//! of this service, so decoding is forward-compatible: unknown fields
//! are ignored, and every flag field accepts either a scalar or a list
//! (scalars decode as a list of one).

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderMode {
    Hosted,
    Proxy,
    Redirect,
}

impl FolderMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FolderMode::Hosted => "hosted",
            FolderMode::Proxy => "proxy",
            FolderMode::Redirect => "redirect",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Num(serde_json::Number),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Num(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Scalar),
    Many(Vec<Scalar>),
}

/// Decodes `"US"`, `123`, or `["US", "CA"]` into a list of strings.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(match value {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s.into_string()],
        Some(OneOrMany::Many(list)) => list.into_iter().map(Scalar::into_string).collect(),
    })
}

/// Decodes a map whose values may be strings, numbers, or booleans.
fn scalar_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, String>, D::Error> {
    let value = Option::<HashMap<String, Scalar>>::deserialize(deserializer)?;
    Ok(value
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect())
}

/// Half-open window on fractional UTC hours (`start <= h < end`).
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

/// One conjunction of targeting predicates. A missing field is "don't
/// care"; a list value matches when any element matches.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlagSet {
    #[serde(deserialize_with = "one_or_many")]
    pub country: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub region: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub city: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub continent: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub asn: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub colo: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub ip: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub org: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub language: Vec<String>,
    pub time: Option<TimeWindow>,
    #[serde(deserialize_with = "one_or_many")]
    pub device: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub browser: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub os: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub brand: Vec<String>,
    #[serde(deserialize_with = "scalar_map")]
    pub params: HashMap<String, String>,
}

impl FlagSet {
    pub fn is_empty(&self) -> bool {
        self.country.is_empty()
            && self.region.is_empty()
            && self.city.is_empty()
            && self.continent.is_empty()
            && self.asn.is_empty()
            && self.colo.is_empty()
            && self.ip.is_empty()
            && self.org.is_empty()
            && self.language.is_empty()
            && self.time.is_none()
            && self.device.is_empty()
            && self.browser.is_empty()
            && self.os.is_empty()
            && self.brand.is_empty()
            && self.params.is_empty()
    }
}

/// Deny lists evaluated before matching. Any hit short-circuits to the
/// safe page.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockSet {
    #[serde(deserialize_with = "one_or_many")]
    pub ips: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub orgs: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub hostnames: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub cities: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub countries: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub devices: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub browsers: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub oses: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditAction {
    SetText,
    SetHtml,
    SetCss,
    SetAttribute,
    Remove,
}

/// One DOM edit applied by the modifications action.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomEdit {
    pub selector: String,
    pub action: EditAction,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl DomEdit {
    pub fn value_str(&self) -> &str {
        self.value.as_str().unwrap_or("")
    }

    /// `setAttribute` carries `{name, value}`.
    pub fn attribute(&self) -> Option<(&str, &str)> {
        let name = self.value.get("name")?.as_str()?;
        let value = self.value.get("value")?.as_str().unwrap_or("");
        Some((name, value))
    }
}

/// A weighted in-rule destination; realizes one of the three delivery
/// targets when selected.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleDestination {
    pub folder: Option<String>,
    pub proxy_url: Option<String>,
    pub redirect_url: Option<String>,
    /// Shorthand used by older bundles; equivalent to `redirectUrl`.
    pub url: Option<String>,
    pub weight: Option<u32>,
}

impl RuleDestination {
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_url.as_deref().or(self.url.as_deref())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedClickDest {
    /// Destination id resolved through the destination cache.
    pub id: Option<String>,
    /// Inline URL, used as-is.
    pub url: Option<String>,
    pub weight: Option<u32>,
}

/// Weighted default landing entry on the bundle.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedLanding {
    pub folder: String,
    pub mode: Option<FolderMode>,
    pub weight: Option<u32>,
}

/// Weighted default offer entry: a destination id served as a redirect.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedOffer {
    pub id: String,
    pub weight: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    /// Legacy single conjunction; ignored when `groups` is non-empty.
    pub flags: Option<FlagSet>,
    /// Disjunction of conjunctions.
    pub groups: Vec<FlagSet>,
    pub weight: Option<u32>,
    #[serde(deserialize_with = "scalar_map")]
    pub variables: HashMap<String, String>,

    // Primary action: exactly one is expected.
    pub folder: Option<String>,
    pub proxy_url: Option<String>,
    pub redirect_url: Option<String>,
    pub modifications: Vec<DomEdit>,
    pub destinations: Vec<RuleDestination>,

    // Click-out action, orthogonal to the primary.
    pub click_url: Option<String>,
    pub click_destinations: Vec<WeightedClickDest>,
}

/// The primary delivery action a rule realizes.
#[derive(Debug)]
pub enum RuleAction<'a> {
    Folder(&'a str),
    Proxy(&'a str),
    Redirect(&'a str),
    Modifications(&'a [DomEdit]),
    Destinations(&'a [RuleDestination]),
}

impl Rule {
    pub const DEFAULT_WEIGHT: u32 = 100;

    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(Self::DEFAULT_WEIGHT)
    }

    pub fn action(&self) -> Option<RuleAction<'_>> {
        if let Some(folder) = &self.folder {
            return Some(RuleAction::Folder(folder));
        }
        if let Some(url) = &self.proxy_url {
            return Some(RuleAction::Proxy(url));
        }
        if let Some(url) = &self.redirect_url {
            return Some(RuleAction::Redirect(url));
        }
        if !self.modifications.is_empty() {
            return Some(RuleAction::Modifications(&self.modifications));
        }
        if !self.destinations.is_empty() {
            return Some(RuleAction::Destinations(&self.destinations));
        }
        None
    }

    pub fn has_click_action(&self) -> bool {
        self.click_url.is_some() || !self.click_destinations.is_empty()
    }
}

/// KV value keyed by `{host}{path}`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleBundle {
    /// Campaign UUID carried into every event.
    pub id: String,
    pub name: Option<String>,
    pub site_name: Option<String>,
    pub rules: Vec<Rule>,
    pub default_folder: Option<String>,
    pub destination_id: Option<String>,
    pub default_folder_mode: Option<FolderMode>,
    pub default_destinations: Vec<WeightedLanding>,
    pub default_offers: Vec<WeightedOffer>,
    #[serde(deserialize_with = "scalar_map")]
    pub variables: HashMap<String, String>,
    pub blocks: Option<BlockSet>,
}

impl RuleBundle {
    pub fn decode(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_flags_decode_as_single_element_lists() {
        let bundle = RuleBundle::decode(&json!({
            "id": "c1",
            "rules": [{
                "flags": {"country": "US", "asn": 13335, "device": ["mobile", "tablet"]},
                "folder": "lp-a/"
            }]
        }))
        .unwrap();

        let flags = bundle.rules[0].flags.as_ref().unwrap();
        assert_eq!(flags.country, vec!["US"]);
        assert_eq!(flags.asn, vec!["13335"]);
        assert_eq!(flags.device, vec!["mobile", "tablet"]);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let bundle = RuleBundle::decode(&json!({
            "id": "c1",
            "futureFeature": {"nested": true},
            "rules": [{"redirectUrl": "https://off.example/", "experimental": 1}]
        }))
        .unwrap();

        assert_eq!(bundle.id, "c1");
        assert!(matches!(
            bundle.rules[0].action(),
            Some(RuleAction::Redirect("https://off.example/"))
        ));
    }

    #[test]
    fn action_precedence_is_folder_first() {
        let rule: Rule = serde_json::from_value(json!({
            "folder": "lp/",
            "redirectUrl": "https://off.example/"
        }))
        .unwrap();
        assert!(matches!(rule.action(), Some(RuleAction::Folder("lp/"))));
    }

    #[test]
    fn default_weight_is_one_hundred() {
        let rule = Rule::default();
        assert_eq!(rule.effective_weight(), 100);
    }

    #[test]
    fn set_attribute_edit_exposes_name_and_value() {
        let edit: DomEdit = serde_json::from_value(json!({
            "selector": "#cta",
            "action": "setAttribute",
            "value": {"name": "href", "value": "/go"}
        }))
        .unwrap();
        assert_eq!(edit.attribute(), Some(("href", "/go")));
    }

    #[test]
    fn variables_accept_numbers() {
        let bundle = RuleBundle::decode(&json!({
            "id": "c1",
            "variables": {"discount": 20, "label": "sale"}
        }))
        .unwrap();
        assert_eq!(bundle.variables["discount"], "20");
        assert_eq!(bundle.variables["label"], "sale");
    }
}
