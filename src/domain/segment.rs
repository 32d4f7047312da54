//! Audience rules and the pure filter that applies them to a subscriber list.

use super::Subscriber;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

/// A named, reusable rule set.
#[derive(Clone, Debug, Serialize)]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub rule: SegmentRule,
    pub subscriber_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Segment {
    pub fn new(new: NewSegment) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: new.name.trim().to_owned(),
            rule: new.rule,
            subscriber_count: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewSegment {
    #[serde(default)]
    pub name: String,
    pub rule: SegmentRule,
}

/// Either a condition group or the legacy source/tag inclusion shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SegmentRule {
    Conditions(ConditionGroup),
    Simple(SimpleRule),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default, rename = "match")]
    pub match_mode: MatchMode,
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: SegmentField,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentField {
    Email,
    Source,
    Tags,
    SubscribedAt,
    LastOpenedAt,
    LastClickedAt,
    EmailsReceived,
    BounceCount,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    Before,
    After,
    IsSet,
    IsNotSet,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimpleRule {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Narrows `subscribers` to those matching `rule`. No rule keeps everyone.
pub fn filter(subscribers: Vec<Subscriber>, rule: Option<&SegmentRule>) -> Vec<Subscriber> {
    match rule {
        None => subscribers,
        Some(rule) => subscribers
            .into_iter()
            .filter(|subscriber| rule.matches(subscriber))
            .collect(),
    }
}

impl SegmentRule {
    pub fn matches(&self, subscriber: &Subscriber) -> bool {
        match self {
            SegmentRule::Conditions(group) => group.matches(subscriber),
            SegmentRule::Simple(rule) => rule.matches(subscriber),
        }
    }
}

impl ConditionGroup {
    fn matches(&self, subscriber: &Subscriber) -> bool {
        let mut recognized = self
            .conditions
            .iter()
            .filter(|c| c.is_recognized())
            .peekable();

        if recognized.peek().is_none() {
            return true;
        }

        match self.match_mode {
            MatchMode::All => recognized.all(|c| c.matches(subscriber)),
            MatchMode::Any => recognized.any(|c| c.matches(subscriber)),
        }
    }
}

impl SimpleRule {
    fn matches(&self, subscriber: &Subscriber) -> bool {
        let source_ok = self.sources.is_empty()
            || subscriber.source.as_deref().is_some_and(|source| {
                self.sources.iter().any(|s| s.eq_ignore_ascii_case(source))
            });

        let tags_ok = self.tags.is_empty()
            || self
                .tags
                .iter()
                .any(|wanted| subscriber.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)));

        source_ok && tags_ok
    }
}

enum FieldValue<'a> {
    Text(Option<&'a str>),
    List(&'a [String]),
    Number(f64),
    Timestamp(Option<OffsetDateTime>),
}

impl Condition {
    fn is_recognized(&self) -> bool {
        self.field != SegmentField::Unknown && self.operator != Operator::Unknown
    }

    fn matches(&self, subscriber: &Subscriber) -> bool {
        let field = match self.field {
            SegmentField::Email => FieldValue::Text(Some(&subscriber.email)),
            SegmentField::Source => FieldValue::Text(subscriber.source.as_deref()),
            SegmentField::Tags => FieldValue::List(&subscriber.tags),
            SegmentField::SubscribedAt => FieldValue::Timestamp(Some(subscriber.subscribed_at)),
            SegmentField::LastOpenedAt => FieldValue::Timestamp(subscriber.last_opened_at),
            SegmentField::LastClickedAt => FieldValue::Timestamp(subscriber.last_clicked_at),
            SegmentField::EmailsReceived => FieldValue::Number(subscriber.emails_received as f64),
            SegmentField::BounceCount => FieldValue::Number(f64::from(subscriber.bounce_count)),
            SegmentField::Unknown => return false,
        };

        match field {
            FieldValue::Text(text) => self.matches_text(text),
            FieldValue::List(items) => self.matches_list(items),
            FieldValue::Number(number) => self.matches_number(number),
            FieldValue::Timestamp(at) => self.matches_timestamp(at),
        }
    }

    fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.to_lowercase(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn matches_text(&self, text: Option<&str>) -> bool {
        let wanted = self.value_text();
        let actual = text.map(str::to_lowercase);

        match (self.operator, actual) {
            (Operator::IsSet, actual) => actual.is_some_and(|a| !a.is_empty()),
            (Operator::IsNotSet, actual) => actual.map_or(true, |a| a.is_empty()),
            (Operator::NotEquals, None) | (Operator::NotContains, None) => true,
            (_, None) => false,
            (Operator::Equals, Some(a)) => a == wanted,
            (Operator::NotEquals, Some(a)) => a != wanted,
            (Operator::Contains, Some(a)) => a.contains(&wanted),
            (Operator::NotContains, Some(a)) => !a.contains(&wanted),
            (Operator::StartsWith, Some(a)) => a.starts_with(&wanted),
            (Operator::EndsWith, Some(a)) => a.ends_with(&wanted),
            _ => false,
        }
    }

    fn matches_list(&self, items: &[String]) -> bool {
        let wanted = self.value_text();
        let has = || items.iter().any(|item| item.to_lowercase() == wanted);

        match self.operator {
            Operator::Contains | Operator::Equals => has(),
            Operator::NotContains | Operator::NotEquals => !has(),
            Operator::IsSet => !items.is_empty(),
            Operator::IsNotSet => items.is_empty(),
            _ => false,
        }
    }

    fn matches_number(&self, number: f64) -> bool {
        let wanted = match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        let Some(wanted) = wanted else {
            return false;
        };

        match self.operator {
            Operator::Equals => number == wanted,
            Operator::NotEquals => number != wanted,
            Operator::GreaterThan => number > wanted,
            Operator::LessThan => number < wanted,
            _ => false,
        }
    }

    fn matches_timestamp(&self, at: Option<OffsetDateTime>) -> bool {
        match self.operator {
            Operator::IsSet => return at.is_some(),
            Operator::IsNotSet => return at.is_none(),
            _ => {}
        }

        let wanted = match &self.value {
            Value::String(s) => OffsetDateTime::parse(s, &Rfc3339).ok(),
            _ => None,
        };

        match (self.operator, at, wanted) {
            (Operator::Before, Some(at), Some(wanted)) => at < wanted,
            (Operator::After, Some(at), Some(wanted)) => at > wanted,
            _ => false,
        }
    }
}
