use crate::model::{Amount, EntityRef, ReferenceKind, TempId};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

/// Whether money came in or went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Income,
    Expense,
}

serde_plain::derive_display_from_serialize!(TransactionType);
serde_plain::derive_fromstr_from_deserialize!(TransactionType);

/// The fields of a transaction, without an identity. This is what gets sent to the server on
/// create and what a queued create stores as its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransactionDraft {
    pub amount: Amount,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub date: NaiveDate,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<EntityRef>,
    /// Links the transaction to the recurring rule that generated it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<i64>,
}

impl TransactionDraft {
    /// Checks the rules the server would enforce anyway, so that a write that can never succeed
    /// is rejected immediately instead of occupying a queue slot.
    pub fn validate(&self) -> Result<(), String> {
        if !self.amount.is_positive() {
            return Err(format!(
                "amount must be greater than zero, got {}",
                self.amount
            ));
        }
        match (self.kind, &self.category) {
            (TransactionType::Expense, None) => {
                Err("an expense requires a category".to_string())
            }
            (TransactionType::Income, Some(_)) => {
                Err("an income cannot have a category".to_string())
            }
            _ => Ok(()),
        }
    }

    /// The reference entities this draft points at.
    pub fn references(&self) -> impl Iterator<Item = (ReferenceKind, &EntityRef)> {
        [
            (ReferenceKind::Category, self.category.as_ref()),
            (ReferenceKind::Source, self.source.as_ref()),
            (ReferenceKind::Target, self.target.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, r)| r.map(|r| (kind, r)))
    }

    pub(crate) fn references_mut(&mut self) -> impl Iterator<Item = &mut EntityRef> {
        [&mut self.category, &mut self.source, &mut self.target]
            .into_iter()
            .filter_map(|r| r.as_mut())
    }

    /// Applies the set fields of `patch` on top of this draft.
    pub fn apply(&mut self, patch: &TransactionPatch) {
        if let Some(amount) = patch.amount {
            self.amount = amount;
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(date) = patch.date {
            self.date = date;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(category) = &patch.category {
            self.category = category.clone();
        }
        if let Some(source) = &patch.source {
            self.source = source.clone();
        }
        if let Some(target) = &patch.target {
            self.target = target.clone();
        }
        if let Some(recurrence) = patch.recurrence {
            self.recurrence = recurrence;
        }
    }
}

/// A transaction with its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Transaction {
    pub id: EntityRef,
    #[serde(flatten)]
    pub fields: TransactionDraft,
}

impl Transaction {
    pub fn new(id: impl Into<EntityRef>, fields: TransactionDraft) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// True when the id or any reference still holds `tmp`.
    pub fn mentions(&self, tmp: &TempId) -> bool {
        self.id.temp() == Some(tmp) || self.fields.references().any(|(_, r)| r.temp() == Some(tmp))
    }

    /// Rewrites the id and every reference holding `tmp` to `server_id`.
    pub(crate) fn resolve(&mut self, tmp: &TempId, server_id: i64) -> bool {
        let mut changed = self.id.resolve(tmp, server_id);
        for r in self.fields.references_mut() {
            changed |= r.resolve(tmp, server_id);
        }
        changed
    }

    /// Case-insensitive match of the listing's search text against the description.
    pub fn matches(&self, params: &ListParams) -> bool {
        if let Some(kind) = params.kind {
            if self.fields.kind != kind {
                return false;
            }
        }
        let needle = params.search.trim().to_lowercase();
        needle.is_empty() || self.fields.description.to_lowercase().contains(&needle)
    }
}

/// A partial update. Unset fields are left alone. The reference fields distinguish between "leave
/// alone" (`None`) and "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransactionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub category: Option<Option<EntityRef>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub source: Option<Option<EntityRef>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub target: Option<Option<EntityRef>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub recurrence: Option<Option<i64>>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self == &TransactionPatch::default()
    }

    /// Folds a later patch into this one; fields set in `later` win.
    pub fn merge(&mut self, later: &TransactionPatch) {
        if later.amount.is_some() {
            self.amount = later.amount;
        }
        if later.kind.is_some() {
            self.kind = later.kind;
        }
        if later.date.is_some() {
            self.date = later.date;
        }
        if later.description.is_some() {
            self.description = later.description.clone();
        }
        if later.category.is_some() {
            self.category = later.category.clone();
        }
        if later.source.is_some() {
            self.source = later.source.clone();
        }
        if later.target.is_some() {
            self.target = later.target.clone();
        }
        if later.recurrence.is_some() {
            self.recurrence = later.recurrence;
        }
    }

    pub fn references(&self) -> impl Iterator<Item = (ReferenceKind, &EntityRef)> {
        [
            (ReferenceKind::Category, self.category.as_ref()),
            (ReferenceKind::Source, self.source.as_ref()),
            (ReferenceKind::Target, self.target.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, r)| r.and_then(|r| r.as_ref()).map(|r| (kind, r)))
    }

    pub(crate) fn references_mut(&mut self) -> impl Iterator<Item = &mut EntityRef> {
        [&mut self.category, &mut self.source, &mut self.target]
            .into_iter()
            .filter_map(|r| r.as_mut().and_then(|r| r.as_mut()))
    }
}

/// Deserializes a present field (even `null`) as `Some(..)`, so that an explicit `null` means
/// "clear" and an absent field means "leave alone".
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Parameters of a paginated transaction listing. Used verbatim as part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ListParams {
    pub limit: u32,
    pub offset: u32,
    #[serde(default)]
    pub search: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionType>,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 25,
            offset: 0,
            search: String::new(),
            kind: None,
        }
    }
}

impl ListParams {
    pub fn page(limit: u32, offset: u32) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }

    /// The cache key of this listing. No normalization is applied: `"Coffee"` and `"coffee"` are
    /// different keys.
    pub fn cache_key(&self) -> String {
        let kind = self.kind.map(|k| k.to_string()).unwrap_or_default();
        format!(
            "search={}&offset={}&limit={}&type={}",
            self.search, self.offset, self.limit, kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn expense(amount: &str, category: Option<EntityRef>) -> TransactionDraft {
        TransactionDraft {
            amount: Amount::from_str(amount).unwrap(),
            kind: TransactionType::Expense,
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            description: "Lunch".to_string(),
            category,
            source: None,
            target: None,
            recurrence: None,
        }
    }

    #[test]
    fn test_validate_amount_and_category_rules() {
        assert!(expense("12.50", Some(EntityRef::Confirmed(1))).validate().is_ok());
        assert!(expense("0", Some(EntityRef::Confirmed(1))).validate().is_err());
        assert!(expense("-4", Some(EntityRef::Confirmed(1))).validate().is_err());
        let err = expense("4", None).validate().unwrap_err();
        assert!(err.contains("category"));

        let mut income = expense("100", None);
        income.kind = TransactionType::Income;
        assert!(income.validate().is_ok());
        income.category = Some(EntityRef::Confirmed(2));
        assert!(income.validate().is_err());
    }

    #[test]
    fn test_patch_applies_and_clears() {
        let mut draft = expense("10", Some(EntityRef::Confirmed(1)));
        let patch = TransactionPatch {
            kind: Some(TransactionType::Income),
            category: Some(None),
            description: Some("Refund".to_string()),
            ..Default::default()
        };
        draft.apply(&patch);
        assert_eq!(draft.kind, TransactionType::Income);
        assert_eq!(draft.category, None);
        assert_eq!(draft.description, "Refund");
        assert!(draft.validate().is_ok());
    }

    #[test]
    fn test_patch_merge_later_wins() {
        let mut first = TransactionPatch {
            amount: Some(Amount::from_str("5").unwrap()),
            description: Some("a".to_string()),
            ..Default::default()
        };
        let later = TransactionPatch {
            description: Some("b".to_string()),
            ..Default::default()
        };
        first.merge(&later);
        assert_eq!(first.amount, Some(Amount::from_str("5").unwrap()));
        assert_eq!(first.description.as_deref(), Some("b"));
        assert!(TransactionPatch::default().is_empty());
    }

    #[test]
    fn test_patch_null_means_clear() {
        let patch: TransactionPatch = serde_json::from_str(r#"{"category": null}"#).unwrap();
        assert_eq!(patch.category, Some(None));
        let patch: TransactionPatch = serde_json::from_str("{}").unwrap();
        assert_eq!(patch.category, None);
        let json = serde_json::to_string(&TransactionPatch {
            category: Some(None),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, r#"{"category":null}"#);
    }

    #[test]
    fn test_resolve_rewrites_id_and_references() {
        let tmp_cat = TempId::fixed("cat");
        let tmp_tx = TempId::fixed("tx");
        let mut tx = Transaction::new(
            EntityRef::Temp(tmp_tx.clone()),
            expense("3", Some(EntityRef::Temp(tmp_cat.clone()))),
        );
        assert!(tx.mentions(&tmp_cat));
        assert!(tx.resolve(&tmp_cat, 40));
        assert!(!tx.mentions(&tmp_cat));
        assert_eq!(tx.fields.category, Some(EntityRef::Confirmed(40)));
        assert!(tx.resolve(&tmp_tx, 917));
        assert_eq!(tx.id, EntityRef::Confirmed(917));
    }

    #[test]
    fn test_transaction_json_shape() {
        let tx = Transaction::new(917, expense("50", Some(EntityRef::Confirmed(3))));
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["id"], 917);
        assert_eq!(json["type"], "expense");
        assert_eq!(json["amount"], "50.00");
        assert_eq!(json["date"], "2025-03-14");
        assert!(json.get("source").is_none());
    }

    #[test]
    fn test_cache_key_is_verbatim() {
        let mut a = ListParams::page(20, 40);
        a.search = "Coffee".to_string();
        let mut b = a.clone();
        b.search = "coffee".to_string();
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "search=Coffee&offset=40&limit=20&type=");
    }
}
