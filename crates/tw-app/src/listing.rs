//! Trade listing payload and its view bindings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tw_core::{ListingItem, ListingState};
use tw_pipeline::{PipelineBuilder, PipelineResult};
use tw_view::QuickFilterMatcher;

/// One marketplace offer as delivered by a search tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeListing {
    /// Item name.
    pub item: String,
    /// Account name of the seller.
    pub seller: String,
    pub price: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// When the marketplace indexed the offer.
    pub indexed_at: DateTime<Utc>,
}

fn default_currency() -> String {
    "chaos".to_string()
}

/// Register `price`, `indexed_at`, `item` and `seller` in both directions.
///
/// Text keys compare case-insensitively.
pub fn register_sort_keys(builder: &mut PipelineBuilder<TradeListing>) -> PipelineResult<()> {
    builder
        .register_sort_key_both("price", |i: &ListingItem<TradeListing>| i.payload.price)?
        .register_sort_key_both("indexed_at", |i: &ListingItem<TradeListing>| {
            i.payload.indexed_at
        })?
        .register_sort_key_both("item", |i: &ListingItem<TradeListing>| {
            i.payload.item.to_lowercase()
        })?
        .register_sort_key_both("seller", |i: &ListingItem<TradeListing>| {
            i.payload.seller.to_lowercase()
        })?;
    Ok(())
}

/// Case-insensitive substring match on item name, seller and currency.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingTextMatcher;

impl QuickFilterMatcher<TradeListing> for ListingTextMatcher {
    fn matches(&self, text: &str, item: &ListingItem<TradeListing>) -> bool {
        let needle = text.to_lowercase();
        let listing = &item.payload;
        [&listing.item, &listing.seller, &listing.currency]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// Flat, serializable view of one page row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingRow {
    pub id: String,
    pub state: ListingState,
    pub item: String,
    pub seller: String,
    pub price: Decimal,
    pub currency: String,
    pub indexed_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
}

impl From<&ListingItem<TradeListing>> for ListingRow {
    fn from(item: &ListingItem<TradeListing>) -> Self {
        let listing = &item.payload;
        Self {
            id: item.id.to_string(),
            state: item.state,
            item: listing.item.clone(),
            seller: listing.seller.clone(),
            price: listing.price,
            currency: listing.currency.clone(),
            indexed_at: listing.indexed_at,
            first_seen_at: item.first_seen_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tw_core::ListingId;

    fn listing(item: &str, seller: &str) -> ListingItem<TradeListing> {
        ListingItem::new(
            ListingId::new("x").unwrap(),
            TradeListing {
                item: item.to_string(),
                seller: seller.to_string(),
                price: dec!(12.5),
                currency: default_currency(),
                indexed_at: Utc::now(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_matcher_is_case_insensitive() {
        let item = listing("Headhunter Leather Belt", "ExileTrader");
        assert!(ListingTextMatcher.matches("headhunter", &item));
        assert!(ListingTextMatcher.matches("EXILE", &item));
        assert!(ListingTextMatcher.matches("chaos", &item));
        assert!(!ListingTextMatcher.matches("mirror", &item));
    }

    #[test]
    fn test_currency_defaults_when_absent() {
        let listing: TradeListing = serde_json::from_str(
            r#"{"item":"Tabula Rasa","seller":"a","price":"3","indexed_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(listing.currency, "chaos");
        assert_eq!(listing.price, dec!(3));
    }

    #[test]
    fn test_sort_keys_registered_once() {
        let mut builder = PipelineBuilder::new(Default::default());
        register_sort_keys(&mut builder).unwrap();
        assert!(register_sort_keys(&mut builder).is_err());
    }
}
