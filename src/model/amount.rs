//! Amount type for monetary values entered with or without a dollar sign and commas.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// A monetary amount.
///
/// The engine only stores the numeric value. Input such as `"$1,250.00"` is accepted and
/// normalized; output never carries a currency symbol, so the serialized form is stable across
/// locales.
///
/// ```
/// # use fintrack_sync::model::Amount;
/// # use std::str::FromStr;
/// let a = Amount::from_str("$1,250.5").unwrap();
/// assert_eq!(a.to_string(), "1250.50");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(Decimal);

impl Amount {
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Transactions require a strictly positive amount; the direction comes from the type.
    pub fn is_positive(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_positive()
    }
}

/// An error that can occur when parsing strings into `Amount` values.
pub struct AmountError {
    input: String,
    source: rust_decimal::Error,
}

impl Debug for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "AmountError({:?}, {:?})", self.input, self.source)
    }
}

impl Display for AmountError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid amount: {}", self.input, self.source)
    }
}

impl Error for AmountError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let digits = rest.strip_prefix('$').unwrap_or(rest).replace(',', "");
        let value = Decimal::from_str(&digits).map_err(|source| AmountError {
            input: s.to_string(),
            source,
        })?;
        Ok(Amount(if negative { -value } else { value }))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut value = self.0;
        if value.scale() < 2 {
            value.rescale(2);
        }
        write!(f, "{value}")
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // APIs disagree on whether money is a JSON number or a string.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }
        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        };
        Amount::from_str(&text).map_err(serde::de::Error::custom)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_plain_and_formatted() {
        assert_eq!(Amount::from_str("50").unwrap().value(), dec("50"));
        assert_eq!(Amount::from_str(" $50.25 ").unwrap().value(), dec("50.25"));
        assert_eq!(
            Amount::from_str("$1,234,567.89").unwrap().value(),
            dec("1234567.89")
        );
        assert_eq!(Amount::from_str("-$60,000.00").unwrap().value(), dec("-60000"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = Amount::from_str("fifty").unwrap_err();
        assert!(err.to_string().contains("fifty"));
        assert!(Amount::from_str("").is_err());
    }

    #[test]
    fn test_display_pads_to_cents() {
        assert_eq!(Amount::from_str("50").unwrap().to_string(), "50.00");
        assert_eq!(Amount::from_str("0.5").unwrap().to_string(), "0.50");
        assert_eq!(Amount::from_str("1.125").unwrap().to_string(), "1.125");
    }

    #[test]
    fn test_is_positive() {
        assert!(Amount::from_str("0.01").unwrap().is_positive());
        assert!(!Amount::from_str("0").unwrap().is_positive());
        assert!(!Amount::from_str("-3").unwrap().is_positive());
    }

    #[test]
    fn test_deserialize_string_or_number() {
        let a: Amount = serde_json::from_str("\"$12.00\"").unwrap();
        let b: Amount = serde_json::from_str("12").unwrap();
        assert_eq!(a.value(), b.value());
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"12.00\"");
    }
}
