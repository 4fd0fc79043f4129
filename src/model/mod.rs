//! Types that represent the core data model, such as `Transaction` and `ReferenceEntity`.
mod amount;
mod ids;
mod profile;
mod reference;
mod transaction;

pub use amount::{Amount, AmountError};
pub use ids::{EntityKind, EntityRef, TempId};
pub use profile::UserProfile;
pub use reference::{name_key, ReferenceEntity, ReferenceKind};
pub use transaction::{
    ListParams, Transaction, TransactionDraft, TransactionPatch, TransactionType,
};
