use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// Order Aggregate
// ============================================================================
//
// Wire shape of one order event on the inbound topic. The same struct is what
// gets persisted across orders/deliveries/payments/items and what the cache
// holds, so a cached value is always a fully materialized order.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Order {
    pub order_uid: String,
    pub track_number: String,
    pub entry: String,
    pub delivery: Delivery,
    pub payment: Payment,
    #[serde(default)]
    pub items: Vec<Item>,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    pub sm_id: i32,
    pub date_created: DateTime<Utc>,
    pub oof_shard: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Delivery {
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Payment {
    /// Equal to the order uid by producer convention, not enforced here.
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub amount: i32,
    /// Unix seconds.
    pub payment_dt: i64,
    pub bank: String,
    pub delivery_cost: i32,
    pub goods_total: i32,
    pub custom_fee: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Item {
    pub chrt_id: i64,
    pub track_number: String,
    pub price: i32,
    pub rid: String,
    pub name: String,
    /// Discount, percent.
    pub sale: i32,
    pub size: String,
    pub total_price: i32,
    pub nm_id: i64,
    pub brand: String,
    pub status: i32,
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed order payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid order data: {field} - {message}")]
    Invalid { field: &'static str, message: String },
}

impl Order {
    /// Decode a raw stream payload and check the invariants the store relies on.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let order: Order = serde_json::from_slice(payload)?;
        order.validate()?;
        Ok(order)
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.order_uid.trim().is_empty() {
            return Err(DecodeError::Invalid {
                field: "order_uid",
                message: "must not be empty".to_string(),
            });
        }

        if self.track_number.trim().is_empty() {
            return Err(DecodeError::Invalid {
                field: "track_number",
                message: "must not be empty".to_string(),
            });
        }

        // Postgres TEXT cannot store NUL
        let nul_field = self
            .text_fields()
            .find_map(|(field, value)| value.contains('\0').then_some(field));
        if let Some(field) = nul_field {
            return Err(DecodeError::Invalid {
                field,
                message: "contains a NUL character".to_string(),
            });
        }

        // items are keyed by (order_uid, chrt_id)
        let mut seen = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if !seen.insert(item.chrt_id) {
                return Err(DecodeError::Invalid {
                    field: "items",
                    message: format!("duplicate chrt_id {}", item.chrt_id),
                });
            }
        }

        Ok(())
    }

    fn text_fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        let d = &self.delivery;
        let p = &self.payment;
        let scalar = [
            ("order_uid", self.order_uid.as_str()),
            ("track_number", self.track_number.as_str()),
            ("entry", self.entry.as_str()),
            ("locale", self.locale.as_str()),
            ("internal_signature", self.internal_signature.as_str()),
            ("customer_id", self.customer_id.as_str()),
            ("delivery_service", self.delivery_service.as_str()),
            ("shardkey", self.shardkey.as_str()),
            ("oof_shard", self.oof_shard.as_str()),
            ("delivery", d.name.as_str()),
            ("delivery", d.phone.as_str()),
            ("delivery", d.zip.as_str()),
            ("delivery", d.city.as_str()),
            ("delivery", d.address.as_str()),
            ("delivery", d.region.as_str()),
            ("delivery", d.email.as_str()),
            ("payment", p.transaction.as_str()),
            ("payment", p.request_id.as_str()),
            ("payment", p.currency.as_str()),
            ("payment", p.provider.as_str()),
            ("payment", p.bank.as_str()),
        ];
        let items = self.items.iter().flat_map(|i| {
            [&i.track_number, &i.rid, &i.name, &i.size, &i.brand].map(|v| ("items", v.as_str()))
        });
        scalar.into_iter().chain(items)
    }
}

// ============================================================================
// Test Fixtures
// ============================================================================


// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "order_uid": "b563feb7b2b84b6test",
        "track_number": "WBILMTESTTRACK",
        "entry": "WBIL",
        "delivery": {
            "name": "Test Testov", "phone": "+9720000000", "zip": "2639809",
            "city": "Kiryat Mozkin", "address": "Ploshad Mira 15",
            "region": "Kraiot", "email": "test@gmail.com"
        },
        "payment": {
            "transaction": "b563feb7b2b84b6test", "request_id": "", "currency": "USD",
            "provider": "wbpay", "amount": 1817, "payment_dt": 1637907727,
            "bank": "alpha", "delivery_cost": 1500, "goods_total": 317, "custom_fee": 0
        },
        "items": [{
            "chrt_id": 9934930, "track_number": "WBILMTESTTRACK", "price": 453,
            "rid": "ab4219087a764ae0btest", "name": "Mascaras", "sale": 30, "size": "0",
            "total_price": 317, "nm_id": 2389212, "brand": "Vivienne Sabo", "status": 202
        }],
        "locale": "en",
        "internal_signature": "",
        "customer_id": "test",
        "delivery_service": "meest",
        "shardkey": "9",
        "sm_id": 99,
        "date_created": "2021-11-26T06:22:19Z",
        "oof_shard": "1"
    }"#;

    #[test]
    fn test_decode_valid_payload() {
        let order = Order::decode(SAMPLE.as_bytes()).unwrap();

        assert_eq!(order.order_uid, "b563feb7b2b84b6test");
        assert_eq!(order.delivery.city, "Kiryat Mozkin");
        assert_eq!(order.payment.amount, 1817);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].chrt_id, 9934930);
        assert_eq!(order.date_created.to_rfc3339(), "2021-11-26T06:22:19+00:00");
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let result = Order::decode(br#"{"invalid": json}"#);
        assert!(matches!(result, Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_decode_rejects_missing_nested_object() {
        let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
        value.as_object_mut().unwrap().remove("payment");
        let payload = serde_json::to_vec(&value).unwrap();

        assert!(matches!(Order::decode(&payload), Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_missing_items_defaults_to_empty() {
        let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
        value.as_object_mut().unwrap().remove("items");
        let payload = serde_json::to_vec(&value).unwrap();

        let order = Order::decode(&payload).unwrap();
        assert!(order.items.is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_uid() {
        let mut order = fixtures::order("uid-1");
        order.order_uid = "  ".to_string();

        match order.validate() {
            Err(DecodeError::Invalid { field, .. }) => assert_eq!(field, "order_uid"),
            other => panic!("expected invalid order_uid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_duplicate_chrt_id() {
        let mut order = fixtures::order("uid-1");
        let duplicate = order.items[0].clone();
        order.items.push(duplicate);

        match order.validate() {
            Err(DecodeError::Invalid { field, message }) => {
                assert_eq!(field, "items");
                assert!(message.contains("9934930"));
            }
            other => panic!("expected duplicate item error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_nul_character() {
        let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
        value["delivery"]["name"] = serde_json::Value::String("Test\u{0}Testov".to_string());
        let payload = serde_json::to_vec(&value).unwrap();
        assert!(String::from_utf8_lossy(&payload).contains("\\u0000"));

        match Order::decode(&payload) {
            Err(DecodeError::Invalid { field, .. }) => assert_eq!(field, "delivery"),
            other => panic!("expected NUL rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_checks_item_text() {
        let mut order = fixtures::order("uid-1");
        order.items[0].brand = "Vivienne\0Sabo".to_string();

        assert!(matches!(
            order.validate(),
            Err(DecodeError::Invalid { field: "items", .. })
        ));
    }

    #[test]
    fn test_serialization_roundtrip_preserves_order() {
        let order = fixtures::order("uid-roundtrip");
        let json = serde_json::to_vec(&order).unwrap();
        assert_eq!(Order::decode(&json).unwrap(), order);
    }
}
