use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{Delivery, Item, Order, Payment};

use super::StoreError;

// ============================================================================
// Table Rows
// ============================================================================
//
// One struct per table. Related rows carry their owning order_uid so a page
// of orders can be reassembled from a single batched query per table.
//
// ============================================================================

#[derive(sqlx::FromRow, Debug, Clone)]
pub(crate) struct OrderRow {
    pub order_uid: String,
    pub track_number: String,
    pub entry: String,
    pub locale: String,
    pub internal_signature: String,
    pub customer_id: String,
    pub delivery_service: String,
    pub shardkey: String,
    pub sm_id: i32,
    pub date_created: DateTime<Utc>,
    pub oof_shard: String,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub(crate) struct DeliveryRow {
    pub order_uid: String,
    pub name: String,
    pub phone: String,
    pub zip: String,
    pub city: String,
    pub address: String,
    pub region: String,
    pub email: String,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub(crate) struct PaymentRow {
    pub order_uid: String,
    pub transaction: String,
    pub request_id: String,
    pub currency: String,
    pub provider: String,
    pub amount: i32,
    pub payment_dt: i64,
    pub bank: String,
    pub delivery_cost: i32,
    pub goods_total: i32,
    pub custom_fee: i32,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub(crate) struct ItemRow {
    pub order_uid: String,
    pub chrt_id: i64,
    pub track_number: String,
    pub price: i32,
    pub rid: String,
    pub name: String,
    pub sale: i32,
    pub size: String,
    pub total_price: i32,
    pub nm_id: i64,
    pub brand: String,
    pub status: i32,
}

/// Rows of the three child tables for one batch of orders
#[derive(Debug, Default)]
pub(crate) struct RelatedRows {
    pub deliveries: Vec<DeliveryRow>,
    pub payments: Vec<PaymentRow>,
    pub items: Vec<ItemRow>,
}

impl From<DeliveryRow> for Delivery {
    fn from(r: DeliveryRow) -> Self {
        Delivery {
            name: r.name,
            phone: r.phone,
            zip: r.zip,
            city: r.city,
            address: r.address,
            region: r.region,
            email: r.email,
        }
    }
}

impl From<PaymentRow> for Payment {
    fn from(r: PaymentRow) -> Self {
        Payment {
            transaction: r.transaction,
            request_id: r.request_id,
            currency: r.currency,
            provider: r.provider,
            amount: r.amount,
            payment_dt: r.payment_dt,
            bank: r.bank,
            delivery_cost: r.delivery_cost,
            goods_total: r.goods_total,
            custom_fee: r.custom_fee,
        }
    }
}

impl From<ItemRow> for Item {
    fn from(r: ItemRow) -> Self {
        Item {
            chrt_id: r.chrt_id,
            track_number: r.track_number,
            price: r.price,
            rid: r.rid,
            name: r.name,
            sale: r.sale,
            size: r.size,
            total_price: r.total_price,
            nm_id: r.nm_id,
            brand: r.brand,
            status: r.status,
        }
    }
}

/// Reassemble orders from their rows, keeping the order of `orders`.
///
/// Every order must have exactly one delivery and one payment row; the write
/// path guarantees that, so a gap means the tables were changed out of band.
pub(crate) fn assemble_orders(
    orders: Vec<OrderRow>,
    related: RelatedRows,
) -> Result<Vec<Order>, StoreError> {
    let mut deliveries: HashMap<String, DeliveryRow> = related
        .deliveries
        .into_iter()
        .map(|d| (d.order_uid.clone(), d))
        .collect();

    let mut payments: HashMap<String, PaymentRow> = related
        .payments
        .into_iter()
        .map(|p| (p.order_uid.clone(), p))
        .collect();

    let mut items: HashMap<String, Vec<Item>> = HashMap::new();
    for row in related.items {
        items.entry(row.order_uid.clone()).or_default().push(row.into());
    }

    orders
        .into_iter()
        .map(|o| {
            let delivery = deliveries
                .remove(&o.order_uid)
                .ok_or_else(|| StoreError::MissingRelation {
                    order_uid: o.order_uid.clone(),
                    table: "deliveries",
                })?;
            let payment = payments
                .remove(&o.order_uid)
                .ok_or_else(|| StoreError::MissingRelation {
                    order_uid: o.order_uid.clone(),
                    table: "payments",
                })?;

            Ok(Order {
                items: items.remove(&o.order_uid).unwrap_or_default(),
                delivery: delivery.into(),
                payment: payment.into(),
                order_uid: o.order_uid,
                track_number: o.track_number,
                entry: o.entry,
                locale: o.locale,
                internal_signature: o.internal_signature,
                customer_id: o.customer_id,
                delivery_service: o.delivery_service,
                shardkey: o.shardkey,
                sm_id: o.sm_id,
                date_created: o.date_created,
                oof_shard: o.oof_shard,
            })
        })
        .collect()
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::fixtures;

    /// Split an order into the rows the write path would produce
    pub(crate) fn rows_of(order: &Order) -> (OrderRow, DeliveryRow, PaymentRow, Vec<ItemRow>) {
        let uid = order.order_uid.clone();
        let d = &order.delivery;
        let p = &order.payment;

        (
            OrderRow {
                order_uid: uid.clone(),
                track_number: order.track_number.clone(),
                entry: order.entry.clone(),
                locale: order.locale.clone(),
                internal_signature: order.internal_signature.clone(),
                customer_id: order.customer_id.clone(),
                delivery_service: order.delivery_service.clone(),
                shardkey: order.shardkey.clone(),
                sm_id: order.sm_id,
                date_created: order.date_created,
                oof_shard: order.oof_shard.clone(),
            },
            DeliveryRow {
                order_uid: uid.clone(),
                name: d.name.clone(),
                phone: d.phone.clone(),
                zip: d.zip.clone(),
                city: d.city.clone(),
                address: d.address.clone(),
                region: d.region.clone(),
                email: d.email.clone(),
            },
            PaymentRow {
                order_uid: uid.clone(),
                transaction: p.transaction.clone(),
                request_id: p.request_id.clone(),
                currency: p.currency.clone(),
                provider: p.provider.clone(),
                amount: p.amount,
                payment_dt: p.payment_dt,
                bank: p.bank.clone(),
                delivery_cost: p.delivery_cost,
                goods_total: p.goods_total,
                custom_fee: p.custom_fee,
            },
            order
                .items
                .iter()
                .map(|i| ItemRow {
                    order_uid: uid.clone(),
                    chrt_id: i.chrt_id,
                    track_number: i.track_number.clone(),
                    price: i.price,
                    rid: i.rid.clone(),
                    name: i.name.clone(),
                    sale: i.sale,
                    size: i.size.clone(),
                    total_price: i.total_price,
                    nm_id: i.nm_id,
                    brand: i.brand.clone(),
                    status: i.status,
                })
                .collect(),
        )
    }

    #[test]
    fn test_assemble_matches_rows_to_owners() {
        let mut first = fixtures::order("uid-1");
        first.delivery.city = "Haifa".to_string();
        let mut second = fixtures::order("uid-2");
        second.items.push(Item {
            chrt_id: 1,
            ..second.items[0].clone()
        });

        let (o1, d1, p1, i1) = rows_of(&first);
        let (o2, d2, p2, i2) = rows_of(&second);

        // child rows arrive in arbitrary order
        let related = RelatedRows {
            deliveries: vec![d2, d1],
            payments: vec![p1, p2],
            items: i2.into_iter().chain(i1).collect(),
        };

        let orders = assemble_orders(vec![o2, o1], related).unwrap();

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0], second);
        assert_eq!(orders[1], first);
        assert_eq!(orders[1].delivery.city, "Haifa");
        assert_eq!(orders[0].items.len(), 2);
    }

    #[test]
    fn test_assemble_order_without_items() {
        let mut order = fixtures::order("uid-empty");
        order.items.clear();
        let (o, d, p, _) = rows_of(&order);

        let related = RelatedRows {
            deliveries: vec![d],
            payments: vec![p],
            items: vec![],
        };

        let orders = assemble_orders(vec![o], related).unwrap();
        assert!(orders[0].items.is_empty());
    }

    #[test]
    fn test_assemble_reports_missing_payment() {
        let order = fixtures::order("uid-broken");
        let (o, d, _, items) = rows_of(&order);

        let related = RelatedRows {
            deliveries: vec![d],
            payments: vec![],
            items,
        };

        match assemble_orders(vec![o], related) {
            Err(StoreError::MissingRelation { order_uid, table }) => {
                assert_eq!(order_uid, "uid-broken");
                assert_eq!(table, "payments");
            }
            other => panic!("expected missing relation, got {:?}", other),
        }
    }

    #[test]
    fn test_assemble_empty_page() {
        let orders = assemble_orders(vec![], RelatedRows::default()).unwrap();
        assert!(orders.is_empty());
    }
}
